pub mod error;

pub use error::{EngineError, TurnErrorKind};

use crate::artifacts::ArtifactStore;
use crate::config::EngineSettings;
use crate::inference::{Classification, IntentClassifier};
use crate::routing::{
    decide_route, should_chart, RouteDecision, RouterState, TurnMachine, WorkerKind,
};
use crate::sandbox::{self, new_cancel_flag, CancelFlag};
use crate::session::store::SessionStore;
use crate::session::{HistoryEntry, HistoryRole, SessionState, SnippetKind, StoredQuery};
use crate::shared::ids::{generate_turn_id, ArtifactId, SessionId, TurnId};
use crate::shared::logging::log_engine_event;
use crate::shared::now_secs;
use crate::sources::{self, SourceHandle, SourceKind};
use crate::workers::chart::run_chart;
use crate::workers::relational::run_relational;
use crate::workers::tabular::run_tabular;
use crate::workers::WorkerOutcome;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// What one conversational turn produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub summary: String,
    pub artifact_refs: Vec<ArtifactId>,
    pub state: SessionState,
    pub error: Option<TurnErrorKind>,
}

/// Drives conversational turns: routing, worker execution, chart rendering,
/// and session persistence. Turns within one session are serialized through
/// a checked-out per-session lock; sessions share nothing mutable beyond the
/// artifact store.
pub struct Engine {
    settings: EngineSettings,
    sessions: SessionStore,
    artifacts: ArtifactStore,
    locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        let sessions = SessionStore::new(&settings.sessions_root());
        let artifacts = ArtifactStore::new(&settings.artifacts_root());
        Self {
            settings,
            sessions,
            artifacts,
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Fetches the session slot lock without holding the registry lock
    /// across any blocking work. Slots no one else holds are evicted here,
    /// keeping the registry bounded by the number of in-flight sessions.
    fn checkout(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut registry = lock_unpoisoned(&self.locks);
        registry.retain(|_, slot| Arc::strong_count(slot) > 1);
        registry
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load_or_create(
        &self,
        session_id: &SessionId,
        now: i64,
    ) -> Result<SessionState, EngineError> {
        Ok(self
            .sessions
            .load(session_id)?
            .unwrap_or_else(|| SessionState::new(session_id.clone(), now)))
    }

    pub fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionState>, EngineError> {
        Ok(self.sessions.load(session_id)?)
    }

    /// Idempotent by canonical path: re-registering the same file refreshes
    /// the handle's metadata without duplicating it.
    pub fn register_source(
        &self,
        session_id: &SessionId,
        kind: SourceKind,
        path: &Path,
    ) -> Result<SourceHandle, EngineError> {
        let slot = self.checkout(session_id);
        let _turn = lock_unpoisoned(&slot);
        let now = now_secs();
        let mut state = self.load_or_create(session_id, now)?;
        let handle = sources::register_source(kind, path)?;
        let inserted = state.register_source(handle.clone(), now);
        self.sessions.save(&state)?;
        log_engine_event(
            &self.settings.state_root,
            &format!(
                "session={session_id} source {} `{}` ({})",
                if inserted { "registered" } else { "refreshed" },
                handle.display_name(),
                kind
            ),
        );
        Ok(handle)
    }

    pub fn artifact_bytes(&self, artifact_id: &ArtifactId) -> Result<Vec<u8>, EngineError> {
        Ok(self.artifacts.get(artifact_id)?)
    }

    pub fn handle_turn(
        &self,
        session_id: &SessionId,
        user_text: &str,
        classifier: &dyn IntentClassifier,
    ) -> Result<TurnOutcome, EngineError> {
        self.handle_turn_with_cancel(session_id, user_text, classifier, &new_cancel_flag())
    }

    /// Processes one turn. Worker and chart faults are folded into the
    /// returned outcome; only infrastructure failures escape, after rolling
    /// the session back to its pre-turn snapshot with just the failure
    /// recorded in history.
    pub fn handle_turn_with_cancel(
        &self,
        session_id: &SessionId,
        user_text: &str,
        classifier: &dyn IntentClassifier,
        cancel: &CancelFlag,
    ) -> Result<TurnOutcome, EngineError> {
        let slot = self.checkout(session_id);
        let _turn = lock_unpoisoned(&slot);

        let now = now_secs();
        let turn_id = generate_turn_id(now).map_err(EngineError::TurnId)?;
        let mut state = self.load_or_create(session_id, now)?;
        let snapshot = state.clone();

        match self.drive_turn(&mut state, user_text, classifier, cancel, now) {
            Ok((summary, artifact_refs, error)) => {
                self.sessions.save(&state)?;
                log_engine_event(
                    &self.settings.state_root,
                    &format!(
                        "session={session_id} turn={turn_id} completed error={}",
                        error.map(|e| e.to_string()).unwrap_or_else(|| "none".into())
                    ),
                );
                Ok(TurnOutcome {
                    turn_id,
                    summary,
                    artifact_refs,
                    state,
                    error,
                })
            }
            Err(err) => {
                let mut rolled_back = snapshot;
                rolled_back.append_history(HistoryEntry::new(
                    HistoryRole::Assistant,
                    format!("turn aborted: {err}"),
                    now,
                ));
                // Best effort: a broken session store must not mask the
                // original failure.
                let _ = self.sessions.save(&rolled_back);
                log_engine_event(
                    &self.settings.state_root,
                    &format!("session={session_id} turn={turn_id} aborted: {err}"),
                );
                Err(err)
            }
        }
    }

    fn drive_turn(
        &self,
        state: &mut SessionState,
        user_text: &str,
        classifier: &dyn IntentClassifier,
        cancel: &CancelFlag,
        now: i64,
    ) -> Result<(String, Vec<ArtifactId>, Option<TurnErrorKind>), EngineError> {
        let mut machine = TurnMachine::new();
        state.append_history(HistoryEntry::new(HistoryRole::User, user_text, now));
        machine.advance(RouterState::RoutingDecision)?;

        let classification = classifier.classify(user_text, state)?;
        let decision = decide_route(state, &classification);
        state.append_history(HistoryEntry::new(
            HistoryRole::Router,
            format!(
                "intent={} route={}",
                classification.intent,
                describe_decision(&decision)
            ),
            now,
        ));

        match decision {
            RouteDecision::Finish => {
                machine.advance(RouterState::Done)?;
                state.pending_chart = false;
                let summary =
                    "no data question detected; nothing was executed".to_string();
                state.append_history(HistoryEntry::new(HistoryRole::Assistant, &*summary, now));
                Ok((summary, Vec::new(), None))
            }
            RouteDecision::NothingToChart => {
                machine.advance(RouterState::Done)?;
                state.pending_chart = false;
                let summary =
                    "a chart was requested but there is no prior result to chart".to_string();
                state.append_history(HistoryEntry::new(HistoryRole::Assistant, &*summary, now));
                Ok((summary, Vec::new(), None))
            }
            RouteDecision::Reject { reason } => {
                machine.advance(RouterState::Failed)?;
                state.pending_chart = false;
                state.append_history(HistoryEntry::new(HistoryRole::Assistant, &*reason, now));
                Ok((reason, Vec::new(), Some(TurnErrorKind::Validation)))
            }
            RouteDecision::RunWorker { kind, snippet } => {
                machine.advance(RouterState::WorkerRunning(kind))?;
                let outcome = self.run_worker(state, kind, &snippet, &classification, cancel, now);
                state.append_history(HistoryEntry::new(
                    HistoryRole::Worker,
                    outcome.summary.clone(),
                    now,
                ));
                machine.advance(RouterState::ChartDecision)?;
                self.finish_turn(state, &mut machine, outcome, &classification, now)
            }
            RouteDecision::ReuseLastQuery { kind, query } => {
                machine.advance(RouterState::WorkerRunning(kind))?;
                let outcome = self.reuse_stored_query(state, &query, cancel, now);
                state.append_history(HistoryEntry::new(
                    HistoryRole::Worker,
                    outcome.summary.clone(),
                    now,
                ));
                machine.advance(RouterState::ChartDecision)?;
                self.finish_turn(state, &mut machine, outcome, &classification, now)
            }
        }
    }

    fn run_worker(
        &self,
        state: &mut SessionState,
        kind: WorkerKind,
        snippet: &str,
        classification: &Classification,
        cancel: &CancelFlag,
        now: i64,
    ) -> WorkerOutcome {
        let limits = &self.settings.execution;
        match kind {
            WorkerKind::Tabular => run_tabular(state, snippet, limits, cancel, now),
            WorkerKind::Relational => run_relational(
                state,
                snippet,
                classification.chart_hint.is_some(),
                limits,
                cancel,
                now,
            ),
            // The router never schedules the chart worker here; it runs only
            // out of ChartDecision.
            WorkerKind::Chart => WorkerOutcome {
                summary: "chart worker cannot run from routing".to_string(),
                result: None,
                error: Some(crate::sandbox::FailureKind::Validation),
            },
        }
    }

    /// The "now chart that" path: re-executes the stored query to re-derive
    /// its result set without touching `lastQuery` or `activeWorker`.
    fn reuse_stored_query(
        &self,
        state: &mut SessionState,
        query: &StoredQuery,
        cancel: &CancelFlag,
        now: i64,
    ) -> WorkerOutcome {
        let source_kind = match query.kind {
            SnippetKind::Code => SourceKind::Tabular,
            SnippetKind::Sql => SourceKind::Relational,
        };
        let Some(handle) = state.source_of_kind(source_kind).cloned() else {
            return WorkerOutcome {
                summary: format!("no {source_kind} source is registered for this session"),
                result: None,
                error: Some(crate::sandbox::FailureKind::Validation),
            };
        };

        let mut result = sandbox::execute(
            &query.text,
            &handle,
            query.kind,
            &self.settings.execution,
            cancel,
        );
        // A pipeline ending in `pick(...)` answered with a scalar; charting
        // needs the table it was picked from, so re-run without the pick.
        if query.kind == SnippetKind::Code
            && matches!(result.value, Some(sandbox::ExecutionValue::Scalar(_)))
        {
            if let Some(stripped) = sandbox::script::strip_terminal_pick(&query.text) {
                let rederived = sandbox::execute(
                    &stripped,
                    &handle,
                    SnippetKind::Code,
                    &self.settings.execution,
                    cancel,
                );
                if rederived.is_success() {
                    result = rederived;
                }
            }
        }
        match result.failure_kind() {
            None => {
                state.pending_chart = true;
                state.updated_at = now;
                WorkerOutcome {
                    summary: "reused the stored query result".to_string(),
                    result: Some(result),
                    error: None,
                }
            }
            Some(kind) => WorkerOutcome {
                summary: crate::workers::failure_summary(kind, &result.diagnostic),
                result: Some(result),
                error: Some(kind),
            },
        }
    }

    fn finish_turn(
        &self,
        state: &mut SessionState,
        machine: &mut TurnMachine,
        outcome: WorkerOutcome,
        classification: &Classification,
        now: i64,
    ) -> Result<(String, Vec<ArtifactId>, Option<TurnErrorKind>), EngineError> {
        let mut summary = outcome.summary.clone();
        let mut artifact_refs = Vec::new();
        let mut error = outcome.error.map(TurnErrorKind::from);

        if should_chart(state, outcome.result.as_ref()) {
            machine.advance(RouterState::ChartRunning)?;
            if let Some(prior) = outcome.result.as_ref() {
                let chart = run_chart(
                    state,
                    prior,
                    classification.chart_hint,
                    &self.artifacts,
                    now,
                )?;
                let mut entry =
                    HistoryEntry::new(HistoryRole::Chart, chart.summary.clone(), now);
                if let Some(artifact_id) = chart.artifact.clone() {
                    artifact_refs.push(artifact_id.clone());
                    entry = entry.with_artifact(artifact_id);
                }
                state.append_history(entry);
                if chart.failed {
                    error = error.or(Some(TurnErrorKind::ChartRender));
                }
                summary = format!("{summary}\n{}", chart.summary);
            }
        }

        // A turn that ends without charting drops the pending flag.
        state.pending_chart = false;
        machine.advance(RouterState::Done)?;
        state.append_history(HistoryEntry::new(HistoryRole::Assistant, &*summary, now));
        Ok((summary, artifact_refs, error))
    }
}

fn describe_decision(decision: &RouteDecision) -> String {
    match decision {
        RouteDecision::RunWorker { kind, .. } => format!("worker({kind})"),
        RouteDecision::ReuseLastQuery { kind, .. } => format!("reuse({kind})"),
        RouteDecision::Finish => "finish".to_string(),
        RouteDecision::NothingToChart => "noop".to_string(),
        RouteDecision::Reject { .. } => "reject".to_string(),
    }
}
