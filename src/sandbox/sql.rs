use super::{CancelFlag, ExecutionValue, SandboxFailure, Table, Value};
use crate::config::ExecutionLimits;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const RESULT_POLL: Duration = Duration::from_millis(10);
const INTERRUPT_DRAIN: Duration = Duration::from_secs(5);

/// Statements that mutate schema or data, rejected before anything touches
/// the database. The leading-keyword check already blocks plain mutating
/// statements; this scan also catches `WITH ... DELETE` style compounds.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "attach", "detach", "vacuum",
    "reindex", "pragma",
];

pub fn vet_read_only(sql: &str) -> Result<(), String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err("empty sql statement".to_string());
    }
    if trimmed.contains(';') {
        return Err("only a single sql statement is allowed".to_string());
    }
    let lowered = trimmed.to_ascii_lowercase();
    let first = lowered
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches('(');
    if first != "select" && first != "with" {
        return Err(format!(
            "statement must be a read-only query, got `{first}`"
        ));
    }
    // String literals are skipped so values like 'update' pass; doubled
    // quotes inside a literal toggle twice and land back inside it.
    let mut word = String::new();
    let mut in_literal = false;
    for ch in lowered.chars().chain(std::iter::once(' ')) {
        if ch == '\'' {
            if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                return Err(format!("statement contains forbidden keyword `{word}`"));
            }
            word.clear();
            in_literal = !in_literal;
            continue;
        }
        if in_literal {
            continue;
        }
        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
            return Err(format!("statement contains forbidden keyword `{word}`"));
        }
        word.clear();
    }
    Ok(())
}

fn cell_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i as f64),
        ValueRef::Real(r) => Value::Number(r),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(format!("<blob {} bytes>", b.len())),
    }
}

fn query_to_table(
    db_path: &Path,
    sql: &str,
    max_rows: usize,
    handle_tx: &mpsc::Sender<rusqlite::InterruptHandle>,
) -> Result<(Table, bool), SandboxFailure> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|err| SandboxFailure::execution(format!("sqlite open failed: {err}")))?;
    let _ = handle_tx.send(conn.get_interrupt_handle());

    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| SandboxFailure::validation(format!("sql did not compile: {err}")))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut out_rows = Vec::new();
    let mut truncated = false;
    let mut rows = stmt
        .query([])
        .map_err(|err| SandboxFailure::execution(format!("sql query failed: {err}")))?;
    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(err) => {
                return Err(SandboxFailure::execution(format!(
                    "sql execution failed: {err}"
                )))
            }
        };
        if out_rows.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut cells = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            let value = row
                .get_ref(idx)
                .map_err(|err| SandboxFailure::execution(format!("sql row read failed: {err}")))?;
            cells.push(cell_from_ref(value));
        }
        out_rows.push(cells);
    }

    Ok((
        Table {
            columns,
            rows: out_rows,
        },
        truncated,
    ))
}

/// Runs a vetted read-only statement on a worker thread. The caller polls for
/// the result and fires sqlite's interrupt handle when the deadline or the
/// cancel flag trips, then joins the worker so no execution leaks past the
/// returned `Timeout`.
pub fn run_sql(
    snippet: &str,
    db_path: &Path,
    limits: &ExecutionLimits,
    deadline: Instant,
    cancel: &CancelFlag,
) -> Result<(ExecutionValue, bool), SandboxFailure> {
    vet_read_only(snippet).map_err(SandboxFailure::validation)?;

    let (handle_tx, handle_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();
    let sql = snippet.to_string();
    let path = db_path.to_path_buf();
    let max_rows = limits.max_frame_rows;

    let worker = thread::Builder::new()
        .name("sandbox-sql".to_string())
        .spawn(move || {
            let outcome = query_to_table(&path, &sql, max_rows, &handle_tx);
            let _ = result_tx.send(outcome);
        })
        .map_err(|err| SandboxFailure::execution(format!("sql worker spawn failed: {err}")))?;

    let mut interrupt = None;
    loop {
        if interrupt.is_none() {
            interrupt = handle_rx.try_recv().ok();
        }
        match result_rx.recv_timeout(RESULT_POLL) {
            Ok(outcome) => {
                let _ = worker.join();
                return outcome.map(|(table, truncated)| (ExecutionValue::Table(table), truncated));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let cancelled = cancel.load(Ordering::Relaxed);
                if cancelled || Instant::now() >= deadline {
                    if let Some(handle) = &interrupt {
                        handle.interrupt();
                    }
                    let _ = result_rx.recv_timeout(INTERRUPT_DRAIN);
                    let _ = worker.join();
                    return Err(if cancelled {
                        SandboxFailure::timeout("execution cancelled")
                    } else {
                        SandboxFailure::timeout("sql execution deadline exceeded")
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                return Err(SandboxFailure::execution(
                    "sql worker exited without a result",
                ));
            }
        }
    }
}
