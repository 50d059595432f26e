use crate::inference::{Classification, Intent};
use crate::sandbox::{ExecutionResult, ExecutionValue};
use crate::session::{ActiveWorker, SessionState, SnippetKind, StoredQuery};
use crate::sources::SourceKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Tabular,
    Relational,
    Chart,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Tabular => write!(f, "tabular"),
            WorkerKind::Relational => write!(f, "relational"),
            WorkerKind::Chart => write!(f, "chart"),
        }
    }
}

/// Router states for one conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Idle,
    RoutingDecision,
    WorkerRunning(WorkerKind),
    ChartDecision,
    ChartRunning,
    Done,
    Failed,
}

impl RouterState {
    pub fn can_transition_to(self, next: Self) -> bool {
        // A fatal infrastructure fault may fail the turn from any live state.
        if next == RouterState::Failed && !self.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (RouterState::Idle, RouterState::RoutingDecision)
                | (RouterState::RoutingDecision, RouterState::WorkerRunning(_))
                | (RouterState::RoutingDecision, RouterState::Done)
                | (RouterState::WorkerRunning(_), RouterState::ChartDecision)
                | (RouterState::ChartDecision, RouterState::ChartRunning)
                | (RouterState::ChartDecision, RouterState::Done)
                | (RouterState::ChartRunning, RouterState::Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RouterState::Done | RouterState::Failed)
    }
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterState::Idle => write!(f, "idle"),
            RouterState::RoutingDecision => write!(f, "routing_decision"),
            RouterState::WorkerRunning(kind) => write!(f, "worker_running({kind})"),
            RouterState::ChartDecision => write!(f, "chart_decision"),
            RouterState::ChartRunning => write!(f, "chart_running"),
            RouterState::Done => write!(f, "done"),
            RouterState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("router transition `{from}` -> `{to}` is invalid")]
    InvalidTransition { from: RouterState, to: RouterState },
}

/// Enforces the transition table while the engine drives a turn.
#[derive(Debug)]
pub struct TurnMachine {
    state: RouterState,
}

impl TurnMachine {
    pub fn new() -> Self {
        Self {
            state: RouterState::Idle,
        }
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn advance(&mut self, next: RouterState) -> Result<RouterState, RoutingError> {
        if !self.state.can_transition_to(next) {
            return Err(RoutingError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(next)
    }
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// What the router decided to do with the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Run the worker on a freshly generated snippet.
    RunWorker { kind: WorkerKind, snippet: String },
    /// Re-execute the stored query for a chart follow-up without re-deriving
    /// intent through the original worker.
    ReuseLastQuery { kind: WorkerKind, query: StoredQuery },
    /// General conversation, nothing to execute.
    Finish,
    /// A chart was requested but no reusable prior result exists; the turn
    /// completes as a no-op instead of failing.
    NothingToChart,
    /// The turn cannot be routed; reason is surfaced to the user.
    Reject { reason: String },
}

fn worker_for_intent(intent: Intent) -> Option<(WorkerKind, SourceKind, SnippetKind)> {
    match intent {
        Intent::TabularQuery => Some((WorkerKind::Tabular, SourceKind::Tabular, SnippetKind::Code)),
        Intent::RelationalQuery => Some((
            WorkerKind::Relational,
            SourceKind::Relational,
            SnippetKind::Sql,
        )),
        Intent::General | Intent::Unroutable => None,
    }
}

fn active_worker_matches(active: ActiveWorker, kind: WorkerKind) -> bool {
    matches!(
        (active, kind),
        (ActiveWorker::Tabular, WorkerKind::Tabular)
            | (ActiveWorker::Relational, WorkerKind::Relational)
    )
}

pub fn decide_route(state: &SessionState, classification: &Classification) -> RouteDecision {
    match classification.intent {
        Intent::General => RouteDecision::Finish,
        Intent::Unroutable => RouteDecision::Reject {
            reason: "the question could not be routed to a data worker".to_string(),
        },
        intent => {
            let Some((kind, source_kind, snippet_kind)) = worker_for_intent(intent) else {
                return RouteDecision::Reject {
                    reason: "the question could not be routed to a data worker".to_string(),
                };
            };
            if state.source_of_kind(source_kind).is_none() {
                return RouteDecision::Reject {
                    reason: format!("no {source_kind} source is registered for this session"),
                };
            }
            if let Some(snippet) = classification.snippet.as_ref().filter(|s| !s.trim().is_empty())
            {
                return RouteDecision::RunWorker {
                    kind,
                    snippet: snippet.clone(),
                };
            }
            // Continuity tie-break: a snippetless chart follow-up against the
            // same worker reuses the stored query. A chart request with no
            // reusable result degrades to a no-op rather than an error.
            if classification.chart_hint.is_some() {
                if active_worker_matches(state.active_worker, kind) {
                    if let Some(query) = state
                        .last_query
                        .as_ref()
                        .filter(|q| q.kind == snippet_kind)
                    {
                        return RouteDecision::ReuseLastQuery {
                            kind,
                            query: query.clone(),
                        };
                    }
                }
                return RouteDecision::NothingToChart;
            }
            RouteDecision::Reject {
                reason: "no executable snippet was generated for the question".to_string(),
            }
        }
    }
}

/// ChartDecision outcome: chart only when a chart is pending and the prior
/// execution produced non-empty tabular data. A chart request with no prior
/// result degrades to a no-op.
pub fn should_chart(state: &SessionState, prior: Option<&ExecutionResult>) -> bool {
    if !state.pending_chart {
        return false;
    }
    let Some(result) = prior.filter(|r| r.is_success()) else {
        return false;
    };
    match result.value.as_ref() {
        Some(ExecutionValue::Table(table)) => !table.is_empty(),
        Some(ExecutionValue::Plot(spec)) => !spec.table.is_empty(),
        _ => false,
    }
}
