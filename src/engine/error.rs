use crate::artifacts::ArtifactStoreError;
use crate::inference::InferenceError;
use crate::routing::RoutingError;
use crate::sandbox::FailureKind;
use crate::session::store::SessionStoreError;
use crate::sources::SourceError;
use serde::{Deserialize, Serialize};

/// User-facing classification of a failed or degraded turn. Everything but
/// `Infrastructure` is reported inside a completed turn; `Infrastructure`
/// aborts the turn and rolls the session back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    Validation,
    Execution,
    Timeout,
    ChartRender,
    Infrastructure,
}

impl From<FailureKind> for TurnErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Validation => TurnErrorKind::Validation,
            FailureKind::Execution => TurnErrorKind::Execution,
            FailureKind::Timeout => TurnErrorKind::Timeout,
        }
    }
}

impl std::fmt::Display for TurnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnErrorKind::Validation => write!(f, "validation"),
            TurnErrorKind::Execution => write!(f, "execution"),
            TurnErrorKind::Timeout => write!(f, "timeout"),
            TurnErrorKind::ChartRender => write!(f, "chart_render"),
            TurnErrorKind::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session store failure: {0}")]
    SessionStore(#[from] SessionStoreError),
    #[error("artifact store failure: {0}")]
    ArtifactStore(#[from] ArtifactStoreError),
    #[error("inference failure: {0}")]
    Inference(#[from] InferenceError),
    #[error("source registration failed: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("turn id generation failed: {0}")]
    TurnId(String),
}
