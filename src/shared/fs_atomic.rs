use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn canonicalize_existing(path: &Path) -> Result<PathBuf, std::io::Error> {
    fs::canonicalize(path)
}

fn scratch_name(label: &str) -> String {
    format!(
        ".{}.tmp-{}-{}",
        label,
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    )
}

pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let label = path.file_name().and_then(|v| v.to_str()).unwrap_or("state");
    let tmp_path = parent.join(scratch_name(label));

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(parent)?;
    Ok(())
}

/// Allocates a scratch directory next to `target` so a later `rename` commit
/// stays on the same filesystem.
pub fn stage_dir_for(target: &Path) -> std::io::Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let label = target
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("stage");
    let stage = parent.join(scratch_name(label));
    fs::create_dir_all(&stage)?;
    Ok(stage)
}

/// Commits a fully-written stage directory into place. Fails if `target`
/// already exists; callers treat that as an idempotent hit and discard the
/// stage instead.
pub fn commit_stage_dir(stage: &Path, target: &Path) -> std::io::Result<()> {
    fs::rename(stage, target)?;
    if let Some(parent) = target.parent() {
        sync_parent_dir(parent)?;
    }
    Ok(())
}

pub fn discard_stage_dir(stage: &Path) {
    let _ = fs::remove_dir_all(stage);
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}
