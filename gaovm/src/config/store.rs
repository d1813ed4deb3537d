//! The config store: current and pending configuration on disk.
//!
//! Two documents live under the state directory: `config.json` (what the
//! driver runs with) and `pending_config.json` (a validated next
//! configuration staged until the next start). Invariant: current is always
//! valid or absent; pending, when present, is valid and differs from current
//! in at least one restart-required field. All writes go through the atomic
//! writer, so a crash mid-update never corrupts either document.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::model::{
    deep_merge, restart_required, validate_config, validate_patch, ConfigError, VmConfig,
};
use crate::events::EventFn;
use crate::persist::{read_json, write_json_atomic, PersistError};

pub const CURRENT_FILE: &str = "config.json";
pub const PENDING_FILE: &str = "pending_config.json";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The submitted document failed validation; maps to invalid-params at
    /// the RPC boundary.
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    /// A persisted document no longer validates. This is a durability
    /// failure, not a caller error.
    #[error("corrupt config in {path}: {error}")]
    Corrupt {
        path: String,
        #[source]
        error: ConfigError,
    },
}

/// Result of a set or patch operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOutcome {
    /// Whether the change landed in the current config (as opposed to being
    /// staged as pending).
    pub applied: bool,
    pub restart_required: bool,
    pub pending_replaced: bool,
    pub current: VmConfig,
    pub pending: Option<VmConfig>,
}

pub struct ConfigStore {
    current_path: PathBuf,
    pending_path: PathBuf,
    emit: EventFn,
}

impl ConfigStore {
    pub fn new(state_dir: &Path, emit: EventFn) -> ConfigStore {
        ConfigStore {
            current_path: state_dir.join(CURRENT_FILE),
            pending_path: state_dir.join(PENDING_FILE),
            emit,
        }
    }

    async fn load(&self, path: &Path) -> Result<Option<VmConfig>, StoreError> {
        match read_json::<Value>(path).await? {
            None => Ok(None),
            Some(value) => {
                let config = validate_config(&value).map_err(|error| StoreError::Corrupt {
                    path: path.display().to_string(),
                    error,
                })?;
                Ok(Some(config))
            }
        }
    }

    /// The current configuration; the hard-coded default when none has been
    /// written yet.
    pub async fn get_current(&self) -> Result<VmConfig, StoreError> {
        Ok(self.load(&self.current_path).await?.unwrap_or_default())
    }

    pub async fn get_pending(&self) -> Result<Option<VmConfig>, StoreError> {
        self.load(&self.pending_path).await
    }

    /// Replace the whole configuration. When the VM is running and the diff
    /// touches a restart-required field, the document is staged as pending
    /// instead and current stays untouched.
    pub async fn set_config(
        &self,
        next: &Value,
        is_running: bool,
    ) -> Result<SetOutcome, StoreError> {
        let next_cfg = validate_config(next)?;
        let current = self.get_current().await?;
        let needs_restart = restart_required(&current, &next_cfg);

        if is_running && needs_restart {
            let replaced = self.get_pending().await?.is_some();
            write_json_atomic(&self.pending_path, &next_cfg.to_value()).await?;
            (self.emit)(
                if replaced {
                    "pending_config_replaced"
                } else {
                    "pending_config_written"
                },
                json!({ "pending": next_cfg.to_value() }),
            );
            return Ok(SetOutcome {
                applied: false,
                restart_required: true,
                pending_replaced: replaced,
                current,
                pending: Some(next_cfg),
            });
        }

        write_json_atomic(&self.current_path, &next_cfg.to_value()).await?;
        if !is_running {
            self.remove_pending().await?;
        }
        (self.emit)("config.updated", json!({ "current": next_cfg.to_value() }));
        let pending = self.get_pending().await?;
        Ok(SetOutcome {
            applied: true,
            restart_required: needs_restart,
            pending_replaced: false,
            current: next_cfg,
            pending,
        })
    }

    /// Apply a sparse patch. The merge base is the pending document when the
    /// VM is running and one exists (so successive staged edits compose),
    /// otherwise current.
    pub async fn patch_config(
        &self,
        patch: &Value,
        is_running: bool,
    ) -> Result<SetOutcome, StoreError> {
        validate_patch(patch)?;
        let base = if is_running {
            match self.get_pending().await? {
                Some(pending) => pending,
                None => self.get_current().await?,
            }
        } else {
            self.get_current().await?
        };
        let merged = deep_merge(&base.to_value(), patch);
        self.set_config(&merged, is_running).await
    }

    /// Promote pending to current, if one exists. Invoked on the
    /// stopped→start transition. The rename is the atomic promote-and-delete
    /// in one step.
    pub async fn activate_pending_if_present(&self) -> Result<bool, StoreError> {
        let pending = match self.get_pending().await? {
            Some(pending) => pending,
            None => return Ok(false),
        };
        tokio::fs::rename(&self.pending_path, &self.current_path)
            .await
            .map_err(|error| PersistError::Io {
                context: format!(
                    "could not activate {} over {}",
                    self.pending_path.display(),
                    self.current_path.display()
                ),
                error,
            })?;
        (self.emit)("config.pending_applied", json!({ "current": pending.to_value() }));
        debug!("pending configuration activated");
        Ok(true)
    }

    pub async fn has_pending(&self) -> Result<bool, StoreError> {
        Ok(self.get_pending().await?.is_some())
    }

    async fn remove_pending(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.pending_path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StoreError::Persist(PersistError::Io {
                context: format!("could not remove {}", self.pending_path.display()),
                error,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::VmConfig;
    use std::sync::{Arc, Mutex};

    fn recording_store(dir: &Path) -> (ConfigStore, Arc<Mutex<Vec<(String, Value)>>>) {
        let events: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let emit: EventFn = Arc::new(move |kind, payload| {
            sink.lock().unwrap().push((kind.to_owned(), payload));
        });
        (ConfigStore::new(dir, emit), events)
    }

    fn kinds(events: &Arc<Mutex<Vec<(String, Value)>>>) -> Vec<String> {
        events.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
    }

    #[tokio::test]
    async fn missing_current_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = recording_store(dir.path());
        assert_eq!(store.get_current().await.unwrap(), VmConfig::default());
        assert!(store.get_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_while_stopped_applies_directly() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events) = recording_store(dir.path());

        let mut next = VmConfig::default().to_value();
        next["cpu"] = json!(4);
        let outcome = store.set_config(&next, false).await.unwrap();
        assert!(outcome.applied);
        assert!(outcome.restart_required);
        assert_eq!(outcome.current.cpu, 4);
        assert!(outcome.pending.is_none());
        assert_eq!(store.get_current().await.unwrap().cpu, 4);
        assert_eq!(kinds(&events), vec!["config.updated"]);
    }

    #[tokio::test]
    async fn restart_required_set_while_running_stages_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events) = recording_store(dir.path());

        let mut next = VmConfig::default().to_value();
        next["graphics"]["enabled"] = json!(false);
        let outcome = store.set_config(&next, true).await.unwrap();
        assert!(!outcome.applied);
        assert!(outcome.restart_required);
        assert!(!outcome.pending_replaced);
        assert_eq!(outcome.current, VmConfig::default());
        assert!(!outcome.pending.as_ref().unwrap().graphics.enabled);

        // Current on disk is untouched, pending matches the submission.
        assert_eq!(store.get_current().await.unwrap(), VmConfig::default());
        assert!(!store.get_pending().await.unwrap().unwrap().graphics.enabled);
        assert_eq!(kinds(&events), vec!["pending_config_written"]);

        // A second staged change replaces the pending document.
        next["cpu"] = json!(6);
        let outcome = store.set_config(&next, true).await.unwrap();
        assert!(outcome.pending_replaced);
        assert_eq!(
            kinds(&events),
            vec!["pending_config_written", "pending_config_replaced"]
        );
    }

    #[tokio::test]
    async fn live_applyable_change_while_running_lands_in_current() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events) = recording_store(dir.path());

        let outcome = store
            .patch_config(&json!({"disk": {"sizeMiB": 16384}}), true)
            .await
            .unwrap();
        assert!(outcome.applied);
        assert!(!outcome.restart_required);
        assert_eq!(outcome.current.disk.size_mib, Some(16384));
        assert_eq!(kinds(&events), vec!["config.updated"]);
    }

    #[tokio::test]
    async fn patch_base_is_pending_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = recording_store(dir.path());

        store
            .patch_config(&json!({"cpu": 4}), true)
            .await
            .unwrap();
        // Second patch must see cpu=4 from pending, not cpu=2 from current.
        let outcome = store
            .patch_config(&json!({"memory": 4294967296u64}), true)
            .await
            .unwrap();
        let pending = outcome.pending.unwrap();
        assert_eq!(pending.cpu, 4);
        assert_eq!(pending.memory, 4294967296);
    }

    #[tokio::test]
    async fn patch_while_stopped_clears_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = recording_store(dir.path());

        store.patch_config(&json!({"cpu": 4}), true).await.unwrap();
        assert!(store.has_pending().await.unwrap());

        let outcome = store.patch_config(&json!({"cpu": 8}), false).await.unwrap();
        assert!(outcome.applied);
        assert!(!store.has_pending().await.unwrap());
        assert_eq!(store.get_current().await.unwrap().cpu, 8);
    }

    #[tokio::test]
    async fn invalid_patch_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events) = recording_store(dir.path());

        let err = store.patch_config(&json!({"cpu": 0}), false).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(err.to_string(), "cpu must be an integer >= 1");
        assert!(kinds(&events).is_empty());
        assert!(!dir.path().join(CURRENT_FILE).exists());
    }

    #[tokio::test]
    async fn activation_promotes_pending_and_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events) = recording_store(dir.path());

        assert!(!store.activate_pending_if_present().await.unwrap());

        store.patch_config(&json!({"cpu": 4}), true).await.unwrap();
        assert!(store.activate_pending_if_present().await.unwrap());
        assert_eq!(store.get_current().await.unwrap().cpu, 4);
        assert!(!dir.path().join(PENDING_FILE).exists());
        assert_eq!(
            kinds(&events),
            vec!["pending_config_written", "config.pending_applied"]
        );
    }

    #[tokio::test]
    async fn corrupt_current_is_a_durability_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = recording_store(dir.path());
        std::fs::write(dir.path().join(CURRENT_FILE), b"{\"cpu\": 0}").unwrap();
        assert!(matches!(
            store.get_current().await.unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }
}
