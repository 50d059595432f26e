use crate::sandbox::ChartKind;
use crate::session::SessionState;
use crate::sources::SourceKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    TabularQuery,
    RelationalQuery,
    General,
    Unroutable,
}

impl Intent {
    /// Unknown labels from a collaborator map to `Unroutable`, never to
    /// undefined behavior.
    pub fn from_label(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tabular_query" => Intent::TabularQuery,
            "relational_query" => Intent::RelationalQuery,
            "general" => Intent::General,
            _ => Intent::Unroutable,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::TabularQuery => write!(f, "tabular_query"),
            Intent::RelationalQuery => write!(f, "relational_query"),
            Intent::General => write!(f, "general"),
            Intent::Unroutable => write!(f, "unroutable"),
        }
    }
}

/// Output of the external classification call: an intent, optionally an
/// already-generated snippet to execute, and an optional chart hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub intent: Intent,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub chart_hint: Option<ChartKind>,
}

impl Classification {
    pub fn general() -> Self {
        Self {
            intent: Intent::General,
            snippet: None,
            chart_hint: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("inference collaborator returned an unusable response: {0}")]
    BadResponse(String),
}

/// Boundary to the possibly-slow, possibly-failing classification
/// collaborator. The engine only sees this trait.
pub trait IntentClassifier {
    fn classify(
        &self,
        text: &str,
        state: &SessionState,
    ) -> Result<Classification, InferenceError>;
}

const RELATIONAL_WORDS: &[&str] = &["sql", "database", "table", "query"];

const CHART_WORDS: &[(&str, ChartKind)] = &[
    ("histogram", ChartKind::Histogram),
    ("bar", ChartKind::Bar),
    ("line", ChartKind::Line),
    ("scatter", ChartKind::Scatter),
    ("pie", ChartKind::Pie),
];

const GENERIC_CHART_WORDS: &[&str] = &["plot", "chart", "graph", "visualize", "draw"];

fn tokenize(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

pub fn detect_chart_hint(text: &str) -> Option<ChartKind> {
    let tokens = tokenize(text);
    for (word, kind) in CHART_WORDS {
        if tokens.iter().any(|t| t == word) {
            return Some(*kind);
        }
    }
    if tokens
        .iter()
        .any(|t| GENERIC_CHART_WORDS.contains(&t.as_str()))
    {
        return Some(ChartKind::Bar);
    }
    None
}

/// Keyword-scored fallback classifier. Mirrors the routing rules the
/// supervising prompt encodes: relational keywords plus a registered
/// database win, otherwise a registered CSV implies a tabular question.
/// It never fabricates snippets; callers relying on it get intent and
/// chart hints only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalClassifier;

impl IntentClassifier for LexicalClassifier {
    fn classify(
        &self,
        text: &str,
        state: &SessionState,
    ) -> Result<Classification, InferenceError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(Classification::general());
        }

        let chart_hint = detect_chart_hint(text);
        let has_relational = state.source_of_kind(SourceKind::Relational).is_some();
        let has_tabular = state.source_of_kind(SourceKind::Tabular).is_some();

        // A chart follow-up sticks with whichever worker produced the data.
        if chart_hint.is_some() && state.last_query.is_some() {
            let intent = match state.active_worker {
                crate::session::ActiveWorker::Relational => Intent::RelationalQuery,
                _ => Intent::TabularQuery,
            };
            return Ok(Classification {
                intent,
                snippet: None,
                chart_hint,
            });
        }

        let wants_relational = tokens
            .iter()
            .any(|t| RELATIONAL_WORDS.contains(&t.as_str()));
        let intent = if has_relational && wants_relational {
            Intent::RelationalQuery
        } else if has_tabular {
            Intent::TabularQuery
        } else {
            Intent::General
        };

        Ok(Classification {
            intent,
            snippet: None,
            chart_hint,
        })
    }
}
