use datapilot::config::EngineSettings;
use datapilot::engine::{Engine, TurnErrorKind};
use datapilot::inference::{
    Classification, Intent, IntentClassifier, InferenceError,
};
use datapilot::sandbox::ChartKind;
use datapilot::session::{HistoryRole, SessionState};
use datapilot::shared::ids::SessionId;
use datapilot::sources::SourceKind;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::tempdir;

/// Replays a fixed sequence of classifications, one per turn.
struct ScriptedClassifier {
    queue: Mutex<VecDeque<Classification>>,
}

impl ScriptedClassifier {
    fn new(replies: Vec<Classification>) -> Self {
        Self {
            queue: Mutex::new(replies.into()),
        }
    }
}

impl IntentClassifier for ScriptedClassifier {
    fn classify(
        &self,
        _text: &str,
        _state: &SessionState,
    ) -> Result<Classification, InferenceError> {
        self.queue
            .lock()
            .expect("queue lock")
            .pop_front()
            .ok_or_else(|| InferenceError::BadResponse("script exhausted".to_string()))
    }
}

struct FailingClassifier;

impl IntentClassifier for FailingClassifier {
    fn classify(
        &self,
        _text: &str,
        _state: &SessionState,
    ) -> Result<Classification, InferenceError> {
        Err(InferenceError::Unavailable("collaborator offline".to_string()))
    }
}

fn tabular(snippet: Option<&str>, chart_hint: Option<ChartKind>) -> Classification {
    Classification {
        intent: Intent::TabularQuery,
        snippet: snippet.map(|s| s.to_string()),
        chart_hint,
    }
}

fn new_engine(temp: &std::path::Path) -> Engine {
    Engine::new(EngineSettings::new(temp.join("state")))
}

fn write_sales_csv(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("sales.csv");
    fs::write(
        &path,
        "region,revenue\nWest,120\nEast,80\nWest,30\nNorth,95\n",
    )
    .expect("write csv");
    path
}

fn seed_orders_db(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("orders.db");
    let conn = rusqlite::Connection::open(&path).expect("create db");
    conn.execute_batch(
        "CREATE TABLE orders (region TEXT, revenue REAL);
         INSERT INTO orders VALUES ('West', 120.0), ('East', 80.0);",
    )
    .expect("seed");
    path
}

const TOP_REGION_PIPELINE: &str =
    "group_by(region) | sum(revenue) | sort_desc(sum_revenue) | head(1) | pick(region)";

#[test]
fn tabular_turn_answers_with_a_scalar() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t1").expect("id");
    let csv = write_sales_csv(temp.path());
    engine
        .register_source(&session, SourceKind::Tabular, &csv)
        .expect("register");

    let classifier =
        ScriptedClassifier::new(vec![tabular(Some(TOP_REGION_PIPELINE), None)]);
    let outcome = engine
        .handle_turn(&session, "which region had the highest revenue", &classifier)
        .expect("turn");

    assert_eq!(outcome.summary, "West");
    assert!(outcome.error.is_none());
    assert!(outcome.artifact_refs.is_empty());
    assert!(!outcome.state.pending_chart);
    assert_eq!(
        outcome.state.last_query.as_ref().map(|q| q.text.as_str()),
        Some(TOP_REGION_PIPELINE)
    );

    // The persisted record matches what the caller was handed.
    let reloaded = engine
        .load_session(&session)
        .expect("load")
        .expect("session exists");
    assert_eq!(reloaded, outcome.state);
    assert_eq!(reloaded.terminal_entries().count(), 1);
}

#[test]
fn chart_follow_up_reuses_the_stored_query_and_stores_an_artifact() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t2").expect("id");
    let csv = write_sales_csv(temp.path());
    engine
        .register_source(&session, SourceKind::Tabular, &csv)
        .expect("register");

    let classifier = ScriptedClassifier::new(vec![
        tabular(Some(TOP_REGION_PIPELINE), None),
        tabular(None, Some(ChartKind::Bar)),
    ]);
    engine
        .handle_turn(&session, "which region had the highest revenue", &classifier)
        .expect("first turn");
    let outcome = engine
        .handle_turn(&session, "now show that as a bar chart", &classifier)
        .expect("second turn");

    assert!(outcome.error.is_none(), "summary: {}", outcome.summary);
    assert_eq!(outcome.artifact_refs.len(), 1);
    let artifact_id = &outcome.artifact_refs[0];

    let svg = engine.artifact_bytes(artifact_id).expect("artifact bytes");
    let svg = String::from_utf8(svg).expect("utf8 svg");
    assert!(svg.contains("<rect"));
    assert!(svg.contains("West"));

    // The chart entry carries the artifact reference; the stored query and
    // worker continuity are untouched by the follow-up.
    let chart_entry = outcome
        .state
        .history
        .iter()
        .find(|e| e.role == HistoryRole::Chart)
        .expect("chart entry");
    assert_eq!(chart_entry.artifact.as_ref(), Some(artifact_id));
    assert_eq!(
        outcome.state.last_query.as_ref().map(|q| q.text.as_str()),
        Some(TOP_REGION_PIPELINE)
    );
    assert!(!outcome.state.pending_chart);
    assert_eq!(outcome.state.terminal_entries().count(), 2);
}

#[test]
fn general_turn_executes_nothing() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t3").expect("id");

    let classifier = ScriptedClassifier::new(vec![Classification::general()]);
    let outcome = engine
        .handle_turn(&session, "hello there", &classifier)
        .expect("turn");

    assert!(outcome.error.is_none());
    assert!(outcome.state.last_query.is_none());
    assert!(outcome.summary.contains("nothing was executed"));
}

#[test]
fn mutating_sql_is_rejected_and_session_state_is_untouched() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t4").expect("id");
    let db = seed_orders_db(temp.path());
    engine
        .register_source(&session, SourceKind::Relational, &db)
        .expect("register");

    let classifier = ScriptedClassifier::new(vec![Classification {
        intent: Intent::RelationalQuery,
        snippet: Some("DROP TABLE orders".to_string()),
        chart_hint: None,
    }]);
    let outcome = engine
        .handle_turn(&session, "drop the orders table", &classifier)
        .expect("turn");

    assert_eq!(outcome.error, Some(TurnErrorKind::Validation));
    assert!(outcome.state.last_query.is_none());

    let conn = rusqlite::Connection::open(&db).expect("open db");
    let count: i64 = conn
        .query_row("SELECT count(*) FROM orders", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 2);
}

#[test]
fn chart_request_before_any_data_completes_as_a_noop() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t9").expect("id");
    let csv = write_sales_csv(temp.path());
    engine
        .register_source(&session, SourceKind::Tabular, &csv)
        .expect("register");

    let classifier = ScriptedClassifier::new(vec![tabular(None, Some(ChartKind::Bar))]);
    let outcome = engine
        .handle_turn(&session, "show me a bar chart", &classifier)
        .expect("turn");

    assert!(outcome.error.is_none(), "summary: {}", outcome.summary);
    assert!(outcome.artifact_refs.is_empty());
    assert!(outcome.summary.contains("no prior result"));
    assert!(outcome.state.last_query.is_none());
    assert!(!outcome.state.pending_chart);
    assert_eq!(outcome.state.terminal_entries().count(), 1);
}

#[test]
fn missing_source_rejection_fails_the_turn_cleanly() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t5").expect("id");

    let classifier = ScriptedClassifier::new(vec![tabular(Some("count()"), None)]);
    let outcome = engine
        .handle_turn(&session, "how many rows", &classifier)
        .expect("turn");

    assert_eq!(outcome.error, Some(TurnErrorKind::Validation));
    assert!(outcome.summary.contains("no tabular source"));
}

#[test]
fn classifier_outage_rolls_the_session_back() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t6").expect("id");
    let csv = write_sales_csv(temp.path());
    engine
        .register_source(&session, SourceKind::Tabular, &csv)
        .expect("register");
    let before = engine
        .load_session(&session)
        .expect("load")
        .expect("session exists");

    let err = engine
        .handle_turn(&session, "which region had the highest revenue", &FailingClassifier)
        .expect_err("turn must fail");
    assert!(err.to_string().contains("collaborator offline"));

    // Everything but the abort record matches the pre-turn snapshot.
    let after = engine
        .load_session(&session)
        .expect("load")
        .expect("session exists");
    assert_eq!(after.history.len(), before.history.len() + 1);
    let last = after.history.last().expect("abort entry");
    assert_eq!(last.role, HistoryRole::Assistant);
    assert!(last.text.starts_with("turn aborted:"));
    assert_eq!(after.sources, before.sources);
    assert_eq!(after.last_query, before.last_query);
    assert_eq!(after.active_worker, before.active_worker);
}

#[test]
fn artifact_store_failure_rolls_the_session_back() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t8").expect("id");
    let csv = write_sales_csv(temp.path());
    engine
        .register_source(&session, SourceKind::Tabular, &csv)
        .expect("register");

    let classifier = ScriptedClassifier::new(vec![
        tabular(Some(TOP_REGION_PIPELINE), None),
        tabular(None, Some(ChartKind::Bar)),
    ]);
    engine
        .handle_turn(&session, "which region had the highest revenue", &classifier)
        .expect("first turn");
    let before = engine
        .load_session(&session)
        .expect("load")
        .expect("session exists");

    // A plain file where the artifact root should be makes every put fail.
    fs::write(temp.path().join("state").join("artifacts"), b"in the way")
        .expect("block artifact root");

    let err = engine
        .handle_turn(&session, "now show that as a bar chart", &classifier)
        .expect_err("chart turn must fail");
    assert!(err.to_string().contains("artifact store"));

    let after = engine
        .load_session(&session)
        .expect("load")
        .expect("session exists");
    assert_eq!(after.history.len(), before.history.len() + 1);
    assert!(after
        .history
        .last()
        .expect("abort entry")
        .text
        .starts_with("turn aborted:"));
    assert_eq!(after.last_query, before.last_query);
    assert_eq!(after.active_worker, before.active_worker);
    assert_eq!(after.pending_chart, before.pending_chart);
}

#[test]
fn each_turn_appends_exactly_one_terminal_entry() {
    let temp = tempdir().expect("tempdir");
    let engine = new_engine(temp.path());
    let session = SessionId::parse("sess-t7").expect("id");
    let csv = write_sales_csv(temp.path());
    engine
        .register_source(&session, SourceKind::Tabular, &csv)
        .expect("register");

    let classifier = ScriptedClassifier::new(vec![
        tabular(Some("count()"), None),
        Classification::general(),
        tabular(Some("sum(revenue)"), None),
    ]);
    for text in ["how many rows", "thanks", "total revenue"] {
        engine.handle_turn(&session, text, &classifier).expect("turn");
    }

    let state = engine
        .load_session(&session)
        .expect("load")
        .expect("session exists");
    assert_eq!(state.terminal_entries().count(), 3);
}
