// src/tool_call.rs
//
// Tool-call detection for chat messages.
//
// Two shapes are recognised:
// - structured invocations carried next to the text (`tool_calls[].function.name`,
//   or content parts of type `tool_use` / `tool_call` with a `name`)
// - tagged invocations embedded in the text:
//   `<tool_result><execute-command>...</execute-command></tool_result>`
//   where the first inner tag names the tool. `<str-replace>` results are
//   file edits echoed back and never count as a tool call.

use regex::Regex;
use serde_json::Value;

const TOOL_RESULT_PATTERN: &str = r"(?s)<tool_result>(.*?)</tool_result>";
const INNER_TAG_PATTERN: &str = r"<([a-zA-Z0-9\-_]+)>";
const IGNORED_RESULT_PREFIX: &str = "<str-replace>";

/// One `<tool_result>` segment that names a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedResult<'a> {
    pub tool: &'a str,
    /// Segment body, surrounding whitespace removed
    pub body: &'a str,
}

/// Holds the compiled patterns; build once and share across workers
#[derive(Debug, Clone)]
pub struct ToolCallScanner {
    tool_result: Regex,
    inner_tag: Regex,
}

impl Default for ToolCallScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallScanner {
    pub fn new() -> Self {
        Self {
            tool_result: Regex::new(TOOL_RESULT_PATTERN).expect("tool_result pattern is valid"),
            inner_tag: Regex::new(INNER_TAG_PATTERN).expect("inner tag pattern is valid"),
        }
    }

    /// Every `<tool_result>` segment in `text` that names a tool, in order
    pub fn tagged_results<'a>(&self, text: &'a str) -> Vec<TaggedResult<'a>> {
        self.tool_result
            .captures_iter(text)
            .filter_map(|caps| {
                let body = caps.get(1)?.as_str().trim();
                if body.starts_with(IGNORED_RESULT_PREFIX) {
                    return None;
                }
                let tool = self.inner_tag.captures(body)?.get(1)?.as_str();
                Some(TaggedResult { tool, body })
            })
            .collect()
    }

    /// Tool named by the first qualifying `<tool_result>` segment
    pub fn tagged_type(&self, text: &str) -> Option<String> {
        self.tagged_results(text).first().map(|r| r.tool.to_string())
    }

    /// Classify one message: structured invocation first, then tagged text
    pub fn classify(&self, message: &Value, text: &str) -> Option<String> {
        structured_type(message).or_else(|| self.tagged_type(text))
    }
}

/// Content part that carries a structured tool invocation
pub fn is_invocation_part(part: &Value) -> bool {
    matches!(part.get("type").and_then(Value::as_str), Some("tool_use" | "tool_call"))
}

/// Name of the first structured tool invocation on a message
pub fn structured_type(message: &Value) -> Option<String> {
    let from_tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find_map(|call| {
            call.get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| call.get("name"))
                .and_then(Value::as_str)
        });
    if let Some(name) = from_tool_calls.filter(|n| !n.is_empty()) {
        return Some(name.to_string());
    }

    message
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|part| is_invocation_part(part))
        .find_map(|part| part.get("name").and_then(Value::as_str))
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}
