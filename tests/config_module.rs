use datapilot::config::{EngineSettings, ExecutionLimits};
use std::fs;
use tempfile::tempdir;

#[test]
fn settings_load_from_yaml_with_defaults() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("settings.yaml");
    fs::write(&path, "state_root: /var/lib/datapilot\n").expect("write yaml");

    let settings = EngineSettings::from_path(&path).expect("load");
    assert_eq!(settings.state_root.to_str(), Some("/var/lib/datapilot"));
    assert_eq!(settings.execution, ExecutionLimits::default());
    assert_eq!(settings.execution.timeout_ms, 10_000);
}

#[test]
fn execution_limits_can_be_overridden() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("settings.yaml");
    fs::write(
        &path,
        "state_root: /var/lib/datapilot\nexecution:\n  timeout_ms: 500\n  max_result_rows: 50\n",
    )
    .expect("write yaml");

    let settings = EngineSettings::from_path(&path).expect("load");
    assert_eq!(settings.execution.timeout_ms, 500);
    assert_eq!(settings.execution.max_result_rows, 50);
    // Unset fields keep their defaults.
    assert_eq!(settings.execution.max_frame_rows, 100_000);
}

#[test]
fn zero_timeout_is_rejected() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("settings.yaml");
    fs::write(
        &path,
        "state_root: /var/lib/datapilot\nexecution:\n  timeout_ms: 0\n",
    )
    .expect("write yaml");
    assert!(EngineSettings::from_path(&path).is_err());
}

#[test]
fn frame_cap_below_result_cap_is_rejected() {
    let settings = EngineSettings {
        state_root: "/var/lib/datapilot".into(),
        execution: ExecutionLimits {
            max_result_rows: 500,
            max_frame_rows: 100,
            ..ExecutionLimits::default()
        },
    };
    assert!(settings.validate().is_err());
}

#[test]
fn unknown_fields_are_rejected() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("settings.yaml");
    fs::write(
        &path,
        "state_root: /var/lib/datapilot\nturbo_mode: true\n",
    )
    .expect("write yaml");
    assert!(EngineSettings::from_path(&path).is_err());
}

#[test]
fn state_subdirectories_hang_off_the_root() {
    let settings = EngineSettings::new("/srv/dp");
    assert_eq!(settings.sessions_root().to_str(), Some("/srv/dp/sessions"));
    assert_eq!(settings.artifacts_root().to_str(), Some("/srv/dp/artifacts"));
}
