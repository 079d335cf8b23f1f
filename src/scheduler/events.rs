//! Events published by the scheduler

use tokio::sync::mpsc;

/// Aggregate counts reported with the completion event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Non-decreasing per item, `fraction` in `[0, 1]`
    Progress { filename: String, fraction: f64 },
    ItemComplete {
        filename: String,
        success: bool,
        error: Option<String>,
    },
    /// Fires once per run, after every item reached a terminal state
    AllComplete(RunSummary),
}

pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;
