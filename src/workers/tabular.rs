use super::{failure_summary, WorkerOutcome};
use crate::config::ExecutionLimits;
use crate::sandbox::{self, CancelFlag, ExecutionValue};
use crate::session::{ActiveWorker, SessionState, SnippetKind, StoredQuery};
use crate::sources::SourceKind;

const SUMMARY_PREVIEW_ROWS: usize = 10;

pub(crate) fn summarize_value(value: &ExecutionValue, truncated: bool) -> String {
    let mut summary = match value {
        ExecutionValue::Scalar(scalar) => scalar.render(),
        ExecutionValue::Table(table) => {
            format!(
                "{} row(s):\n{}",
                table.rows.len(),
                table.render_preview(SUMMARY_PREVIEW_ROWS)
            )
        }
        ExecutionValue::Plot(spec) => format!(
            "prepared {} chart data over {} ({} row(s))",
            spec.kind,
            spec.label_column,
            spec.table.rows.len()
        ),
    };
    if truncated {
        summary.push_str("\n(result truncated)");
    }
    summary
}

/// Runs a pipeline snippet against the session's tabular source. Success
/// records the snippet as the last query and flags a pending chart when the
/// snippet produced a plotting object; failure leaves routing state alone.
pub fn run_tabular(
    state: &mut SessionState,
    snippet: &str,
    limits: &ExecutionLimits,
    cancel: &CancelFlag,
    now: i64,
) -> WorkerOutcome {
    let Some(handle) = state.source_of_kind(SourceKind::Tabular).cloned() else {
        return WorkerOutcome {
            summary: "no tabular source is registered for this session".to_string(),
            result: None,
            error: Some(crate::sandbox::FailureKind::Validation),
        };
    };

    let result = sandbox::execute(snippet, &handle, SnippetKind::Code, limits, cancel);
    match result.failure_kind() {
        None => {
            let value = result.value.as_ref();
            let summary = value
                .map(|v| summarize_value(v, result.truncated))
                .unwrap_or_else(|| "execution produced no result".to_string());
            state.last_query = Some(StoredQuery {
                text: snippet.to_string(),
                kind: SnippetKind::Code,
            });
            state.active_worker = ActiveWorker::Tabular;
            state.pending_chart = matches!(value, Some(ExecutionValue::Plot(_)));
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
