use super::{SandboxFailure, Table, Value};
use std::path::Path;

/// In-memory representation of a CSV source, loaded fresh for each sandbox
/// call so concurrent executions never share mutable state.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub table: Table,
    /// Set when the source file held more rows than the load ceiling.
    pub truncated: bool,
}

fn parse_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => Value::Number(n),
        _ => Value::Text(trimmed.to_string()),
    }
}

pub fn load_frame(path: &Path, max_rows: usize) -> Result<Frame, SandboxFailure> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|err| {
            SandboxFailure::validation(format!(
                "failed to open csv source {}: {err}",
                path.display()
            ))
        })?;

    let columns: Vec<String> = reader
        .headers()
        .map_err(|err| {
            SandboxFailure::validation(format!(
                "failed to read csv header {}: {err}",
                path.display()
            ))
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    let mut truncated = false;
    for record in reader.records() {
        let record = record.map_err(|err| {
            SandboxFailure::execution(format!("csv record error in {}: {err}", path.display()))
        })?;
        if rows.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut row: Vec<Value> = record.iter().map(parse_cell).collect();
        // Ragged rows are padded so every row matches the header width.
        row.resize(columns.len(), Value::Null);
        rows.push(row);
    }

    Ok(Frame {
        table: Table { columns, rows },
        truncated,
    })
}
