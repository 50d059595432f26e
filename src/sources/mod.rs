use crate::shared::fs_atomic::canonicalize_existing;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Tabular,
    Relational,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Tabular => write!(f, "tabular"),
            SourceKind::Relational => write!(f, "relational"),
        }
    }
}

/// Handle to an uploaded data source. Identity is the canonical path; the
/// schema summary is refreshed on re-registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SourceHandle {
    #[serde(rename = "tabular")]
    Tabular { path: PathBuf, columns: Vec<String> },
    #[serde(rename = "relational")]
    Relational { path: PathBuf },
}

impl SourceHandle {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceHandle::Tabular { .. } => SourceKind::Tabular,
            SourceHandle::Relational { .. } => SourceKind::Relational,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            SourceHandle::Tabular { path, .. } => path,
            SourceHandle::Relational { path } => path,
        }
    }

    pub fn display_name(&self) -> String {
        self.path()
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("source")
            .to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source file not readable at {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv source {path} is malformed: {reason}")]
    MalformedCsv { path: String, reason: String },
    #[error("csv source {path} has no columns")]
    EmptyCsvHeader { path: String },
    #[error("sqlite source {path} failed to open: {source}")]
    SqliteOpen {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Validates the file on disk and produces a handle. Canonicalizes the path
/// so repeated registrations of the same logical file collapse to one handle.
pub fn register_source(kind: SourceKind, path: &Path) -> Result<SourceHandle, SourceError> {
    let canonical = canonicalize_existing(path).map_err(|source| SourceError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    match kind {
        SourceKind::Tabular => {
            let columns = read_csv_columns(&canonical)?;
            Ok(SourceHandle::Tabular {
                path: canonical,
                columns,
            })
        }
        SourceKind::Relational => {
            validate_sqlite(&canonical)?;
            Ok(SourceHandle::Relational { path: canonical })
        }
    }
}

fn read_csv_columns(path: &Path) -> Result<Vec<String>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|err| SourceError::MalformedCsv {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
    let headers = reader
        .headers()
        .map_err(|err| SourceError::MalformedCsv {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
    let columns: Vec<String> = headers
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    if columns.is_empty() {
        return Err(SourceError::EmptyCsvHeader {
            path: path.display().to_string(),
        });
    }
    Ok(columns)
}

fn validate_sqlite(path: &Path) -> Result<(), SourceError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(
        |source| SourceError::SqliteOpen {
            path: path.display().to_string(),
            source,
        },
    )?;
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|source| SourceError::SqliteOpen {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}
