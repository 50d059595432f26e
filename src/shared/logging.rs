use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn engine_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/engine.log")
}

pub fn append_engine_log_line(state_root: &Path, line: &str) -> std::io::Result<()> {
    let path = engine_log_path(state_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{} {line}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
}

/// Best-effort variant used on paths where logging must never mask the
/// original failure.
pub fn log_engine_event(state_root: &Path, line: &str) {
    let _ = append_engine_log_line(state_root, line);
}
