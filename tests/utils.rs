// tests/utils.rs

// Integration tests for crate-level helpers

use agent_trace_stats::glob_to_regex;
use regex::Regex;

/// Tests that '*' in a glob becomes '.*' in the regex, and is correctly anchored.
#[test]
fn test_glob_to_regex() {
    let glob = "*foo*";
    let re_str = glob_to_regex(glob);
    assert_eq!(re_str, "^.*foo.*$");

    let re = Regex::new(&re_str).unwrap();
    assert!(re.is_match("foobar"));
    assert!(!re.is_match("barbaz"));
}

/// Dots and other metacharacters in a trace file glob stay literal.
#[test]
fn test_trace_file_glob_is_literal_outside_star() {
    let re = Regex::new(&glob_to_regex("*_chat_completion.json")).unwrap();
    assert!(re.is_match("abc_chat_completion.json"));
    assert!(!re.is_match("abc_chat_completionXjson"));
    assert!(!re.is_match("abc_chat_completion.json.gz"));
}
