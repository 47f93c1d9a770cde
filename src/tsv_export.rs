//! TSV export for machine-readable per-conversation statistics

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::prompt_stats::ConversationStats;

/// TSV exporter for analyzer results
pub struct TsvExporter {
    path: PathBuf,
}

impl TsvExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One line per conversation, sorted by tool-call share (highest first)
    pub fn export_conversations(&self, conversations: &[ConversationStats]) -> Result<()> {
        let f = File::create(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        let mut f = BufWriter::new(f);

        writeln!(
            f,
            "conversation_id\ttotal_tokens\ttool_tokens\ttool_calls\ttool_share_pct\tdominant_tool_type"
        )?;

        let mut rows: Vec<&ConversationStats> = conversations.iter().collect();
        rows.sort_by(|a, b| {
            b.tool_share_pct
                .unwrap_or(-1.0)
                .total_cmp(&a.tool_share_pct.unwrap_or(-1.0))
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });

        for c in rows {
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}\t{}",
                sanitize(&c.conversation_id),
                c.total_tokens,
                c.tool_tokens,
                c.tool_calls,
                c.tool_share_pct.map(|p| format!("{:.2}", p)).unwrap_or_default(),
                c.dominant_tool_type.as_deref().map(sanitize).unwrap_or_default(),
            )?;
        }
        f.flush()?;
        Ok(())
    }
}

// Tabs and newlines would break the row layout
fn sanitize(field: &str) -> String {
    field.replace(['\t', '\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn conv(id: &str, total: u64, tool: u64, dominant: Option<&str>) -> ConversationStats {
        ConversationStats {
            conversation_id: id.to_string(),
            total_tokens: total,
            tool_tokens: tool,
            tool_calls: u64::from(tool > 0),
            tool_share_pct: (total > 0).then(|| tool as f64 / total as f64 * 100.0),
            dominant_tool_type: dominant.map(str::to_string),
        }
    }

    #[test]
    fn test_export_sorted_by_share() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conversations.tsv");
        let exporter = TsvExporter::new(&path);
        exporter
            .export_conversations(&[
                conv("a/low.json", 100, 10, Some("web-search")),
                conv("b/empty.json", 0, 0, None),
                conv("c/high.json", 100, 90, Some("execute-command")),
            ])
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("conversation_id\t"));
        assert_eq!(lines[1], "c/high.json\t100\t90\t1\t90.00\texecute-command");
        assert!(lines[3].starts_with("b/empty.json\t0\t0\t0\t\t"));
    }
}
