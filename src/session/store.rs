use super::SessionState;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::SessionId;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed persistence for session records, one JSON document per
/// session under `<root>/sessions`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn session_path(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    pub fn load(&self, session_id: &SessionId) -> Result<Option<SessionState>, SessionStoreError> {
        let path = self.session_path(session_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SessionStoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let state = serde_json::from_str(&raw).map_err(|source| SessionStoreError::Json {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &SessionState) -> Result<(), SessionStoreError> {
        let path = self.session_path(&state.session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SessionStoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let raw =
            serde_json::to_vec_pretty(state).map_err(|source| SessionStoreError::Json {
                path: path.display().to_string(),
                source,
            })?;
        atomic_write_file(&path, &raw).map_err(|source| SessionStoreError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}
