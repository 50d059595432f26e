use crate::sandbox::ChartKind;
use crate::session::ActiveWorker;
use crate::shared::fs_atomic::{commit_stage_dir, discard_stage_dir, stage_dir_for};
use crate::shared::ids::ArtifactId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const PAYLOAD_FILE: &str = "payload.svg";
const METADATA_FILE: &str = "artifact.json";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactStoreError {
    #[error("artifact `{artifact_id}` not found")]
    UnknownArtifact { artifact_id: String },
    #[error("artifact io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact metadata error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("artifact id error: {0}")]
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub artifact_id: ArtifactId,
    pub created_at: i64,
    pub worker: ActiveWorker,
    pub chart_kind: ChartKind,
    pub payload_file: String,
}

/// Durable, id-addressed chart storage. One directory per artifact, committed
/// with a single rename so a `put` is observed fully or not at all. Ids are
/// derived from payload plus identity metadata, which makes retried renders
/// of the same chart collapse onto one stored copy.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn derive_artifact_id(
    payload: &[u8],
    worker: ActiveWorker,
    chart_kind: ChartKind,
) -> Result<ArtifactId, ArtifactStoreError> {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update([0]);
    hasher.update(worker.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(chart_kind.to_string().as_bytes());
    let digest = hasher.finalize();
    let raw = format!("art-{}", &to_hex(&digest)[..32]);
    ArtifactId::parse(&raw).map_err(ArtifactStoreError::Id)
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn artifact_dir(&self, artifact_id: &ArtifactId) -> PathBuf {
        self.root.join(artifact_id.as_str())
    }

    /// All-or-nothing store of a chart payload. Re-putting an identical
    /// payload+metadata pair returns the existing id without rewriting.
    pub fn put(
        &self,
        payload: &[u8],
        worker: ActiveWorker,
        chart_kind: ChartKind,
        now: i64,
    ) -> Result<ArtifactId, ArtifactStoreError> {
        let artifact_id = derive_artifact_id(payload, worker, chart_kind)?;
        let target = self.artifact_dir(&artifact_id);
        if target.exists() {
            return Ok(artifact_id);
        }

        fs::create_dir_all(&self.root).map_err(|source| ArtifactStoreError::Io {
            path: self.root.display().to_string(),
            source,
        })?;

        let metadata = ArtifactMetadata {
            artifact_id: artifact_id.clone(),
            created_at: now,
            worker,
            chart_kind,
            payload_file: PAYLOAD_FILE.to_string(),
        };
        let metadata_raw =
            serde_json::to_vec_pretty(&metadata).map_err(|source| ArtifactStoreError::Json {
                path: target.display().to_string(),
                source,
            })?;

        let stage = stage_dir_for(&target).map_err(|source| ArtifactStoreError::Io {
            path: target.display().to_string(),
            source,
        })?;
        let staged = (|| -> std::io::Result<()> {
            fs::write(stage.join(PAYLOAD_FILE), payload)?;
            fs::write(stage.join(METADATA_FILE), &metadata_raw)?;
            Ok(())
        })();
        if let Err(source) = staged {
            discard_stage_dir(&stage);
            return Err(ArtifactStoreError::Io {
                path: stage.display().to_string(),
                source,
            });
        }

        match commit_stage_dir(&stage, &target) {
            Ok(()) => Ok(artifact_id),
            // A concurrent identical put winning the rename is still success.
            Err(_) if target.exists() => {
                discard_stage_dir(&stage);
                Ok(artifact_id)
            }
            Err(source) => {
                discard_stage_dir(&stage);
                Err(ArtifactStoreError::Io {
                    path: target.display().to_string(),
                    source,
                })
            }
        }
    }

    pub fn get(&self, artifact_id: &ArtifactId) -> Result<Vec<u8>, ArtifactStoreError> {
        let metadata = self.metadata(artifact_id)?;
        let path = self.artifact_dir(artifact_id).join(&metadata.payload_file);
        fs::read(&path).map_err(|source| ArtifactStoreError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn metadata(
        &self,
        artifact_id: &ArtifactId,
    ) -> Result<ArtifactMetadata, ArtifactStoreError> {
        let path = self.artifact_dir(artifact_id).join(METADATA_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ArtifactStoreError::UnknownArtifact {
                    artifact_id: artifact_id.to_string(),
                })
            }
            Err(source) => {
                return Err(ArtifactStoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| ArtifactStoreError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    /// Artifact ids in creation order, optionally filtered by source worker.
    pub fn list(
        &self,
        worker_filter: Option<ActiveWorker>,
    ) -> Result<Vec<ArtifactId>, ArtifactStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ArtifactStoreError::Io {
                    path: self.root.display().to_string(),
                    source,
                })
            }
        };

        let mut records: Vec<ArtifactMetadata> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ArtifactStoreError::Io {
                path: self.root.display().to_string(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Scratch directories from in-flight puts are not listed.
            if name.starts_with('.') {
                continue;
            }
            let Ok(artifact_id) = ArtifactId::parse(name) else {
                continue;
            };
            let metadata = self.metadata(&artifact_id)?;
            if let Some(filter) = worker_filter {
                if metadata.worker != filter {
                    continue;
                }
            }
            records.push(metadata);
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.artifact_id.cmp(&b.artifact_id))
        });
        Ok(records.into_iter().map(|m| m.artifact_id).collect())
    }
}
