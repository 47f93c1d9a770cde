// src/tracker.rs
//
// Per-item outcome tracking shared by every stage.
//
// Each stage feeds one `ItemTracker` as items complete. Nothing is dropped
// silently: at the end `attempted == succeeded + already_present + skipped + failed`
// and the summary lists the first few problems verbatim.

use serde::Serialize;
use tracing::warn;

use crate::constants::MAX_LOGGED_FAILURES;
use crate::error::PipelineError;

/// One skipped or failed item
#[derive(Debug, Clone, Serialize)]
pub struct ItemProblem {
    pub item: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemTracker {
    stage: &'static str,
    succeeded: u64,
    already_present: u64,
    skipped: Vec<ItemProblem>,
    failed: Vec<ItemProblem>,
}

/// Reconciliation numbers printed at the end of a stage
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: &'static str,
    pub attempted: u64,
    pub succeeded: u64,
    pub already_present: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl ItemTracker {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            succeeded: 0,
            already_present: 0,
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    /// Output already existed from an earlier run; counts as success
    pub fn record_already_present(&mut self) {
        self.already_present += 1;
    }

    /// Item had nothing to process (no matching object, no messages)
    pub fn record_skipped(&mut self, item: impl Into<String>, reason: impl Into<String>) {
        let problem = ItemProblem { item: item.into(), reason: reason.into() };
        warn!("[{}] skipped {}: {}", self.stage, problem.item, problem.reason);
        self.skipped.push(problem);
    }

    /// Item was attempted and errored
    pub fn record_failure(&mut self, item: impl Into<String>, error: impl Into<String>) {
        let problem = ItemProblem { item: item.into(), reason: error.into() };
        warn!("[{}] failed {}: {}", self.stage, problem.item, problem.reason);
        self.failed.push(problem);
    }

    pub fn skipped(&self) -> &[ItemProblem] {
        &self.skipped
    }

    pub fn failures(&self) -> &[ItemProblem] {
        &self.failed
    }

    pub fn summary(&self) -> StageSummary {
        let skipped = self.skipped.len() as u64;
        let failed = self.failed.len() as u64;
        StageSummary {
            stage: self.stage,
            attempted: self.succeeded + self.already_present + skipped + failed,
            succeeded: self.succeeded,
            already_present: self.already_present,
            skipped,
            failed,
        }
    }

    /// Fail the stage when items were attempted and none got through.
    /// Partial failures are reported but do not change the exit code.
    pub fn ensure_progress(&self) -> Result<(), PipelineError> {
        let s = self.summary();
        if s.attempted > 0 && s.succeeded + s.already_present == 0 {
            return Err(PipelineError::NothingSucceeded {
                stage: self.stage,
                attempted: s.attempted,
            });
        }
        Ok(())
    }

    /// Human-readable block listing the first problems of each kind
    pub fn format_problems(&self) -> String {
        let mut out = String::new();
        for (title, list) in [("Skipped", &self.skipped), ("Failed", &self.failed)] {
            if list.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{} ({}):\n", title, list.len()));
            for p in list.iter().take(MAX_LOGGED_FAILURES) {
                out.push_str(&format!("  {}  ({})\n", p.item, p.reason));
            }
            if list.len() > MAX_LOGGED_FAILURES {
                out.push_str(&format!("  ... and {} more\n", list.len() - MAX_LOGGED_FAILURES));
            }
        }
        out
    }
}
