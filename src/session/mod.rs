pub mod store;

use crate::shared::ids::{ArtifactId, SessionId};
use crate::sources::{SourceHandle, SourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveWorker {
    #[default]
    None,
    Tabular,
    Relational,
    Chart,
}

impl std::fmt::Display for ActiveWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActiveWorker::None => write!(f, "none"),
            ActiveWorker::Tabular => write!(f, "tabular"),
            ActiveWorker::Relational => write!(f, "relational"),
            ActiveWorker::Chart => write!(f, "chart"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetKind {
    Code,
    Sql,
}

/// The last executed snippet, retained so a follow-up chart request can
/// re-derive its result set without a fresh classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQuery {
    pub text: String,
    pub kind: SnippetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Router,
    Worker,
    Chart,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
    #[serde(default)]
    pub artifact: Option<ArtifactId>,
    pub at: i64,
}

impl HistoryEntry {
    pub fn new(role: HistoryRole, text: impl Into<String>, at: i64) -> Self {
        Self {
            role,
            text: text.into(),
            artifact: None,
            at,
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactId) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// The single mutable record for one conversation. Mutated only while the
/// owning session is checked out by the engine; a pre-turn clone serves as
/// the rollback snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: SessionId,
    /// Registered sources keyed by canonical path.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceHandle>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub active_worker: ActiveWorker,
    #[serde(default)]
    pub last_query: Option<StoredQuery>,
    #[serde(default)]
    pub pending_chart: bool,
    pub updated_at: i64,
}

impl SessionState {
    pub fn new(session_id: SessionId, now: i64) -> Self {
        Self {
            session_id,
            sources: BTreeMap::new(),
            history: Vec::new(),
            active_worker: ActiveWorker::None,
            last_query: None,
            pending_chart: false,
            updated_at: now,
        }
    }

    /// Idempotent registration: the same canonical path updates the stored
    /// handle in place instead of duplicating it.
    pub fn register_source(&mut self, handle: SourceHandle, now: i64) -> bool {
        let key = handle.path().display().to_string();
        let inserted = self.sources.insert(key, handle).is_none();
        self.updated_at = now;
        inserted
    }

    pub fn source_of_kind(&self, kind: SourceKind) -> Option<&SourceHandle> {
        self.sources.values().find(|h| h.kind() == kind)
    }

    pub fn append_history(&mut self, entry: HistoryEntry) {
        self.updated_at = entry.at;
        self.history.push(entry);
    }

    /// Terminal (assistant) entries, one per completed turn.
    pub fn terminal_entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history
            .iter()
            .filter(|entry| entry.role == HistoryRole::Assistant)
    }
}
