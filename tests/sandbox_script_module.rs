use datapilot::config::ExecutionLimits;
use datapilot::sandbox::script::{run_script, strip_terminal_pick};
use datapilot::sandbox::{
    self, new_cancel_flag, ChartKind, ExecutionValue, FailureKind, Value,
};
use datapilot::session::SnippetKind;
use datapilot::sources::{register_source, SourceKind};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn write_sales_csv(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("sales.csv");
    fs::write(
        &path,
        "region,revenue\nWest,120\nEast,80\nWest,30\nNorth,95\n",
    )
    .expect("write csv");
    path
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

#[test]
fn group_and_pick_yields_the_top_region() {
    let temp = tempdir().expect("tempdir");
    let path = write_sales_csv(temp.path());
    let limits = ExecutionLimits::default();

    let (value, truncated) = run_script(
        "group_by(region) | sum(revenue) | sort_desc(sum_revenue) | head(1) | pick(region)",
        &path,
        &limits,
        far_deadline(),
        &new_cancel_flag(),
    )
    .expect("script should succeed");

    assert!(!truncated);
    assert_eq!(value, ExecutionValue::Scalar(Value::Text("West".to_string())));
}

#[test]
fn filter_and_count_produce_a_scalar() {
    let temp = tempdir().expect("tempdir");
    let path = write_sales_csv(temp.path());
    let limits = ExecutionLimits::default();

    let (value, _) = run_script(
        "filter(revenue, >=, 90) | count()",
        &path,
        &limits,
        far_deadline(),
        &new_cancel_flag(),
    )
    .expect("script should succeed");
    assert_eq!(value, ExecutionValue::Scalar(Value::Number(2.0)));
}

#[test]
fn plot_pipeline_produces_a_plot_spec() {
    let temp = tempdir().expect("tempdir");
    let path = write_sales_csv(temp.path());
    let limits = ExecutionLimits::default();

    let (value, _) = run_script(
        "group_by(region) | sum(revenue) | plot(bar, region, sum_revenue)",
        &path,
        &limits,
        far_deadline(),
        &new_cancel_flag(),
    )
    .expect("script should succeed");

    match value {
        ExecutionValue::Plot(spec) => {
            assert_eq!(spec.kind, ChartKind::Bar);
            assert_eq!(spec.label_column, "region");
            assert_eq!(spec.table.rows.len(), 3);
        }
        other => panic!("expected plot, got {other:?}"),
    }
}

#[test]
fn unknown_operation_is_a_validation_failure() {
    let temp = tempdir().expect("tempdir");
    let path = write_sales_csv(temp.path());
    let limits = ExecutionLimits::default();

    let err = run_script(
        "shell(ls)",
        &path,
        &limits,
        far_deadline(),
        &new_cancel_flag(),
    )
    .expect_err("must fail");
    assert_eq!(err.kind, FailureKind::Validation);
}

#[test]
fn unknown_column_is_an_execution_failure() {
    let temp = tempdir().expect("tempdir");
    let path = write_sales_csv(temp.path());
    let limits = ExecutionLimits::default();

    let err = run_script(
        "sum(profit)",
        &path,
        &limits,
        far_deadline(),
        &new_cancel_flag(),
    )
    .expect_err("must fail");
    assert_eq!(err.kind, FailureKind::Execution);
}

#[test]
fn expired_deadline_reports_timeout() {
    let temp = tempdir().expect("tempdir");
    let path = write_sales_csv(temp.path());
    let limits = ExecutionLimits::default();

    let err = run_script(
        "count()",
        &path,
        &limits,
        Instant::now(),
        &new_cancel_flag(),
    )
    .expect_err("must time out");
    assert_eq!(err.kind, FailureKind::Timeout);
}

#[test]
fn cancel_flag_aborts_execution() {
    let temp = tempdir().expect("tempdir");
    let path = write_sales_csv(temp.path());
    let limits = ExecutionLimits::default();
    let cancel = new_cancel_flag();
    cancel.store(true, Ordering::Relaxed);

    let err = run_script("count()", &path, &limits, far_deadline(), &cancel)
        .expect_err("must cancel");
    assert_eq!(err.kind, FailureKind::Timeout);
    assert!(err.diagnostic.contains("cancelled"));
}

#[test]
fn execute_caps_result_rows_and_sets_truncated() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("big.csv");
    let mut raw = String::from("n\n");
    for i in 0..50 {
        raw.push_str(&format!("{i}\n"));
    }
    fs::write(&path, raw).expect("write csv");

    let handle = register_source(SourceKind::Tabular, &path).expect("register");
    let limits = ExecutionLimits {
        max_result_rows: 10,
        ..ExecutionLimits::default()
    };
    let result = sandbox::execute(
        "sort_asc(n)",
        &handle,
        SnippetKind::Code,
        &limits,
        &new_cancel_flag(),
    );
    assert!(result.is_success());
    assert!(result.truncated);
    match result.value {
        Some(ExecutionValue::Table(table)) => assert_eq!(table.rows.len(), 10),
        other => panic!("expected table, got {other:?}"),
    }
}

#[test]
fn strip_terminal_pick_recovers_the_underlying_pipeline() {
    assert_eq!(
        strip_terminal_pick("group_by(region) | sum(revenue) | pick(region)").as_deref(),
        Some("group_by(region) | sum(revenue)")
    );
    assert!(strip_terminal_pick("group_by(region) | sum(revenue)").is_none());
    assert!(strip_terminal_pick("pick(region)").is_none());
}
