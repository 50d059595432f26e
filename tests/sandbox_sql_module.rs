use datapilot::config::ExecutionLimits;
use datapilot::sandbox::{self, new_cancel_flag, ExecutionValue, FailureKind, Value};
use datapilot::session::SnippetKind;
use datapilot::sources::{register_source, SourceKind};
use std::path::PathBuf;
use std::time::Instant;
use tempfile::tempdir;

fn seed_northwind(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("northwind.db");
    let conn = rusqlite::Connection::open(&path).expect("create db");
    conn.execute_batch(
        "CREATE TABLE orders (region TEXT, revenue REAL);
         INSERT INTO orders VALUES ('West', 120.0), ('East', 80.0), ('West', 30.0);",
    )
    .expect("seed");
    path
}

#[test]
fn select_returns_rows_as_a_table() {
    let temp = tempdir().expect("tempdir");
    let path = seed_northwind(temp.path());
    let handle = register_source(SourceKind::Relational, &path).expect("register");

    let result = sandbox::execute(
        "SELECT region, sum(revenue) AS total FROM orders GROUP BY region ORDER BY total DESC",
        &handle,
        SnippetKind::Sql,
        &ExecutionLimits::default(),
        &new_cancel_flag(),
    );
    assert!(result.is_success(), "diagnostic: {}", result.diagnostic);
    match result.value {
        Some(ExecutionValue::Table(table)) => {
            assert_eq!(table.columns, vec!["region".to_string(), "total".to_string()]);
            assert_eq!(table.rows.len(), 2);
            assert_eq!(table.rows[0][0], Value::Text("West".to_string()));
            assert_eq!(table.rows[0][1], Value::Number(150.0));
        }
        other => panic!("expected table, got {other:?}"),
    }
}

#[test]
fn mutating_statement_is_rejected_before_execution() {
    let temp = tempdir().expect("tempdir");
    let path = seed_northwind(temp.path());
    let handle = register_source(SourceKind::Relational, &path).expect("register");

    let result = sandbox::execute(
        "DROP TABLE orders",
        &handle,
        SnippetKind::Sql,
        &ExecutionLimits::default(),
        &new_cancel_flag(),
    );
    assert_eq!(result.failure_kind(), Some(FailureKind::Validation));

    // The table is still there.
    let conn = rusqlite::Connection::open(&path).expect("open db");
    let count: i64 = conn
        .query_row("SELECT count(*) FROM orders", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 3);
}

#[test]
fn sql_syntax_error_is_a_validation_failure() {
    let temp = tempdir().expect("tempdir");
    let path = seed_northwind(temp.path());
    let handle = register_source(SourceKind::Relational, &path).expect("register");

    let result = sandbox::execute(
        "SELECT not even sql (",
        &handle,
        SnippetKind::Sql,
        &ExecutionLimits::default(),
        &new_cancel_flag(),
    );
    assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
}

#[test]
fn unbounded_query_times_out_within_the_deadline() {
    let temp = tempdir().expect("tempdir");
    let path = seed_northwind(temp.path());
    let handle = register_source(SourceKind::Relational, &path).expect("register");

    let limits = ExecutionLimits {
        timeout_ms: 300,
        ..ExecutionLimits::default()
    };
    let started = Instant::now();
    let result = sandbox::execute(
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
         SELECT count(*) FROM c",
        &handle,
        SnippetKind::Sql,
        &limits,
        &new_cancel_flag(),
    );
    let elapsed = started.elapsed();

    assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
    assert!(
        elapsed.as_millis() < 5_000,
        "query should be interrupted promptly, took {elapsed:?}"
    );
}

#[test]
fn oversized_result_set_is_truncated() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("wide.db");
    let conn = rusqlite::Connection::open(&path).expect("create db");
    conn.execute_batch("CREATE TABLE t (n INTEGER)").expect("create");
    for i in 0..100 {
        conn.execute("INSERT INTO t VALUES (?1)", [i]).expect("insert");
    }
    drop(conn);
    let handle = register_source(SourceKind::Relational, &path).expect("register");

    let limits = ExecutionLimits {
        max_result_rows: 25,
        ..ExecutionLimits::default()
    };
    let result = sandbox::execute(
        "SELECT n FROM t",
        &handle,
        SnippetKind::Sql,
        &limits,
        &new_cancel_flag(),
    );
    assert!(result.is_success());
    assert!(result.truncated);
    match result.value {
        Some(ExecutionValue::Table(table)) => assert_eq!(table.rows.len(), 25),
        other => panic!("expected table, got {other:?}"),
    }
}
