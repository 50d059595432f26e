use super::tabular::summarize_value;
use super::{failure_summary, WorkerOutcome};
use crate::config::ExecutionLimits;
use crate::sandbox::{self, CancelFlag};
use crate::session::{ActiveWorker, SessionState, SnippetKind, StoredQuery};
use crate::sources::SourceKind;

/// Runs a SQL snippet against the session's relational source. SQL results
/// alone never imply charting: `pending_chart` is set only when the caller
/// reports that the classification explicitly asked for a visualization.
pub fn run_relational(
    state: &mut SessionState,
    snippet: &str,
    chart_requested: bool,
    limits: &ExecutionLimits,
    cancel: &CancelFlag,
    now: i64,
) -> WorkerOutcome {
    let Some(handle) = state.source_of_kind(SourceKind::Relational).cloned() else {
        return WorkerOutcome {
            summary: "no relational source is registered for this session".to_string(),
            result: None,
            error: Some(crate::sandbox::FailureKind::Validation),
        };
    };

    let result = sandbox::execute(snippet, &handle, SnippetKind::Sql, limits, cancel);
    match result.failure_kind() {
        None => {
            let summary = result
                .value
                .as_ref()
                .map(|v| summarize_value(v, result.truncated))
                .unwrap_or_else(|| "query produced no result".to_string());
            state.last_query = Some(StoredQuery {
                text: snippet.to_string(),
                kind: SnippetKind::Sql,
            });
            state.active_worker = ActiveWorker::Relational;
            state.pending_chart = chart_requested;
            state.updated_at = now;
            WorkerOutcome {
                summary,
                result: Some(result),
                error: None,
            }
        }
        Some(kind) => WorkerOutcome {
            summary: failure_summary(kind, &result.diagnostic),
            result: Some(result),
            error: Some(kind),
        },
    }
}
