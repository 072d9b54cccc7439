//! Versioned model store
//!
//! Keeps published global model versions in memory and, when a checkpoint
//! directory is configured, writes one JSON checkpoint per round keyed by
//! round id. The latest published version is the sole source of truth on
//! restart; in-flight round state is never persisted.
//!
//! A version is only considered published after the checkpoint write
//! succeeds, so a storage failure never advances the model version.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fedlink_common::config::StoreConfig;
use fedlink_common::types::{ModelVersion, RoundId};

use crate::{FlError, GlobalModel};

/// One durable checkpoint: the model published at the end of a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoundCheckpoint {
    round_id: RoundId,
    model: GlobalModel,
}

/// Store statistics for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of versions held in memory
    pub num_versions: usize,
    /// Latest published version
    pub latest_version: ModelVersion,
    /// Whether checkpoints are written durably
    pub durable: bool,
}

/// Versioned storage for the global model and its round checkpoints.
pub struct ModelStore {
    config: StoreConfig,
    versions: BTreeMap<u64, GlobalModel>,
    latest: ModelVersion,
}

impl ModelStore {
    /// Creates a store holding the given initial model (version 0).
    ///
    /// The initial model is not checkpointed; only round publications are.
    pub fn new(config: StoreConfig, initial: GlobalModel) -> Self {
        let mut versions = BTreeMap::new();
        let latest = initial.version;
        versions.insert(initial.version.value(), initial);
        Self {
            config,
            versions,
            latest,
        }
    }

    /// Recovers the newest checkpoint from the configured directory, or
    /// falls back to a fresh version-0 model of the given dimension.
    pub fn recover(config: StoreConfig, dimension: usize) -> Self {
        let recovered = config
            .checkpoint_dir
            .as_deref()
            .and_then(Self::read_latest_checkpoint);

        match recovered {
            Some(model) => {
                info!(
                    "recovered global model {} from checkpoint",
                    model.version
                );
                Self::new(config, model)
            }
            None => {
                debug!("no checkpoint found, starting from version 0");
                Self::new(config, GlobalModel::initial(dimension))
            }
        }
    }

    /// Publishes a model for a completed round.
    ///
    /// Writes the checkpoint first when a directory is configured; the
    /// in-memory version advances only after the write succeeds, so a
    /// failure leaves the previous version authoritative and the caller
    /// retries with backoff.
    pub fn publish(&mut self, model: GlobalModel, round_id: RoundId) -> Result<(), FlError> {
        if model.version.value() != self.latest.value() + 1 {
            return Err(FlError::Storage(format!(
                "non-sequential publish: latest is {}, got {}",
                self.latest, model.version
            )));
        }

        if let Some(dir) = self.config.checkpoint_dir.clone() {
            self.write_checkpoint(&dir, &model, round_id)?;
        }

        self.latest = model.version;
        self.versions.insert(model.version.value(), model);
        self.prune();
        Ok(())
    }

    /// Returns the latest published model.
    pub fn latest(&self) -> &GlobalModel {
        // The constructor always inserts the initial model.
        &self.versions[&self.latest.value()]
    }

    /// Returns the latest published version number.
    pub fn latest_version(&self) -> ModelVersion {
        self.latest
    }

    /// Retrieves a specific version, if it is still retained.
    pub fn get(&self, version: ModelVersion) -> Option<&GlobalModel> {
        self.versions.get(&version.value())
    }

    /// Lists retained versions in ascending order.
    pub fn list_versions(&self) -> Vec<ModelVersion> {
        self.versions.keys().map(|v| ModelVersion::new(*v)).collect()
    }

    /// Returns store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            num_versions: self.versions.len(),
            latest_version: self.latest,
            durable: self.config.checkpoint_dir.is_some(),
        }
    }

    fn prune(&mut self) {
        while self.versions.len() > self.config.max_versions.max(1) {
            let oldest = *self.versions.keys().next().unwrap_or(&0);
            if oldest == self.latest.value() {
                break;
            }
            self.versions.remove(&oldest);
        }
    }

    fn checkpoint_path(dir: &Path, round_id: RoundId) -> PathBuf {
        dir.join(format!("checkpoint-r{:08}.json", round_id.value()))
    }

    fn write_checkpoint(
        &self,
        dir: &Path,
        model: &GlobalModel,
        round_id: RoundId,
    ) -> Result<(), FlError> {
        fs::create_dir_all(dir)
            .map_err(|e| FlError::Storage(format!("create {}: {e}", dir.display())))?;

        let checkpoint = RoundCheckpoint {
            round_id,
            model: model.clone(),
        };
        let bytes = serde_json::to_vec(&checkpoint)
            .map_err(|e| FlError::Storage(format!("encode checkpoint: {e}")))?;

        // Write-then-rename so a crash never leaves a truncated checkpoint.
        let path = Self::checkpoint_path(dir, round_id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .map_err(|e| FlError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| FlError::Storage(format!("rename {}: {e}", path.display())))?;

        debug!("checkpoint for {} written to {}", round_id, path.display());
        Ok(())
    }

    fn read_latest_checkpoint(dir: &Path) -> Option<GlobalModel> {
        let entries = fs::read_dir(dir).ok()?;
        let mut best: Option<GlobalModel> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("skipping unreadable checkpoint {}: {e}", path.display());
                    continue;
                }
            };
            let checkpoint: RoundCheckpoint = match serde_json::from_slice(&bytes) {
                Ok(c) => c,
                Err(e) => {
                    warn!("skipping corrupt checkpoint {}: {e}", path.display());
                    continue;
                }
            };
            let replace = best
                .as_ref()
                .map_or(true, |b| checkpoint.model.version > b.version);
            if replace {
                best = Some(checkpoint.model);
            }
        }
        best
    }
}
