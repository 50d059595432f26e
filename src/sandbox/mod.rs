pub mod frame;
pub mod script;
pub mod sql;

use crate::config::ExecutionLimits;
use crate::session::SnippetKind;
use crate::sources::SourceHandle;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

/// Shared cancellation flag threaded from the engine into blocking work.
pub type CancelFlag = Arc<AtomicBool>;

pub fn new_cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Value::Text(t) => t.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Caps the row count in place, reporting whether anything was dropped.
    pub fn truncate_rows(&mut self, max_rows: usize) -> bool {
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            return true;
        }
        false
    }

    pub fn render_preview(&self, max_rows: usize) -> String {
        let mut out = self.columns.join(" | ");
        for row in self.rows.iter().take(max_rows) {
            let line: Vec<String> = row.iter().map(Value::render).collect();
            out.push('\n');
            out.push_str(&line.join(" | "));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Line,
    Scatter,
    Pie,
    Histogram,
}

impl ChartKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bar" => Some(ChartKind::Bar),
            "line" => Some(ChartKind::Line),
            "scatter" => Some(ChartKind::Scatter),
            "pie" => Some(ChartKind::Pie),
            "histogram" => Some(ChartKind::Histogram),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChartKind::Bar => write!(f, "bar"),
            ChartKind::Line => write!(f, "line"),
            ChartKind::Scatter => write!(f, "scatter"),
            ChartKind::Pie => write!(f, "pie"),
            ChartKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// A plotting request produced by a snippet: the data to draw plus the
/// column roles. Rendering happens later in the chart worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlotSpec {
    pub kind: ChartKind,
    pub label_column: String,
    pub value_column: String,
    pub table: Table,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionValue {
    Table(Table),
    Scalar(Value),
    Plot(PlotSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Execution,
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Execution => write!(f, "execution"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Success,
    Failure(FailureKind),
}

/// Outcome of one sandbox invocation. Snippet faults are always folded into
/// this record; `execute` never returns an error to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub value: Option<ExecutionValue>,
    pub diagnostic: String,
    pub elapsed_ms: u64,
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.status {
            ExecutionStatus::Failure(kind) => Some(kind),
            ExecutionStatus::Success => None,
        }
    }

    fn success(value: ExecutionValue, elapsed_ms: u64, truncated: bool) -> Self {
        Self {
            status: ExecutionStatus::Success,
            value: Some(value),
            diagnostic: String::new(),
            elapsed_ms,
            truncated,
        }
    }

    fn failure(kind: FailureKind, diagnostic: String, elapsed_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Failure(kind),
            value: None,
            diagnostic,
            elapsed_ms,
            truncated: false,
        }
    }
}

/// Internal failure carrier used by the script and sql backends before the
/// elapsed time is known.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxFailure {
    pub kind: FailureKind,
    pub diagnostic: String,
}

impl SandboxFailure {
    pub fn validation(diagnostic: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Validation,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn execution(diagnostic: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn timeout(diagnostic: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            diagnostic: diagnostic.into(),
        }
    }
}

fn truncate_diagnostic(mut diagnostic: String, max_chars: usize) -> String {
    if diagnostic.chars().count() > max_chars {
        diagnostic = diagnostic.chars().take(max_chars).collect();
        diagnostic.push_str(" [truncated]");
    }
    diagnostic
}

fn cap_value(value: ExecutionValue, max_rows: usize) -> (ExecutionValue, bool) {
    match value {
        ExecutionValue::Table(mut table) => {
            let truncated = table.truncate_rows(max_rows);
            (ExecutionValue::Table(table), truncated)
        }
        ExecutionValue::Plot(mut spec) => {
            let truncated = spec.table.truncate_rows(max_rows);
            (ExecutionValue::Plot(spec), truncated)
        }
        scalar => (scalar, false),
    }
}

/// Runs a generated snippet against a bound source with a wall-clock bound.
/// Pipeline scripts run against an in-memory frame loaded from the tabular
/// handle; SQL runs read-only against the relational handle. Every fault is
/// reported through the returned record.
pub fn execute(
    snippet: &str,
    handle: &SourceHandle,
    kind: SnippetKind,
    limits: &ExecutionLimits,
    cancel: &CancelFlag,
) -> ExecutionResult {
    let started = Instant::now();
    let deadline = started + limits.timeout();

    let outcome = match (kind, handle) {
        (SnippetKind::Code, SourceHandle::Tabular { path, .. }) => {
            script::run_script(snippet, path, limits, deadline, cancel)
        }
        (SnippetKind::Sql, SourceHandle::Relational { path }) => {
            sql::run_sql(snippet, path, limits, deadline, cancel)
        }
        (SnippetKind::Code, SourceHandle::Relational { .. }) => Err(SandboxFailure::validation(
            "pipeline snippets require a tabular source",
        )),
        (SnippetKind::Sql, SourceHandle::Tabular { .. }) => Err(SandboxFailure::validation(
            "sql snippets require a relational source",
        )),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok((value, loaded_truncated)) => {
            let (value, capped) = cap_value(value, limits.max_result_rows);
            ExecutionResult::success(value, elapsed_ms, loaded_truncated || capped)
        }
        Err(failure) => ExecutionResult::failure(
            failure.kind,
            truncate_diagnostic(failure.diagnostic, limits.max_diagnostic_chars),
            elapsed_ms,
        ),
    }
}
