pub mod chart;
pub mod relational;
pub mod tabular;

use crate::sandbox::{ExecutionResult, FailureKind};

/// What a worker run left behind: a user-facing summary, the raw execution
/// result for the chart decision, and the failure kind when the snippet did
/// not succeed. Worker faults never surface as errors; only infrastructure
/// failures do, and those are raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutcome {
    pub summary: String,
    pub result: Option<ExecutionResult>,
    pub error: Option<FailureKind>,
}

impl WorkerOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub(crate) fn failure_summary(kind: FailureKind, diagnostic: &str) -> String {
    match kind {
        FailureKind::Validation => format!("the request was rejected: {diagnostic}"),
        FailureKind::Execution => format!("the computation failed: {diagnostic}"),
        FailureKind::Timeout => format!("the computation was aborted: {diagnostic}"),
    }
}
