//! Per-machine settings documents.
//!
//! A settings file is a JSON envelope carrying the machine UUID and either the
//! plain [`MachineSettings`] or a base64 payload sealed by a crypto context.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use vmkeeper_protocol::MachineState;

use crate::crypto::{CryptoContext, Keyring};
use crate::error::{MachineError, Result};
use crate::machine::aggregates::{HardwareProfile, Identity, MediumAttachment, Peripherals, StorageController};
use crate::machine::snapshot::Snapshot;

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("cannot decrypt {path}: {message}")]
    Password { path: PathBuf, message: String },
}

impl LoadError {
    pub fn is_password(&self) -> bool {
        matches!(self, Self::Password { .. })
    }
}

impl From<LoadError> for MachineError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Io { path, source } => {
                MachineError::io(format!("reading settings {}", path.display()), source)
            }
            LoadError::Parse { .. } => MachineError::InvalidArgument(e.to_string()),
            LoadError::Password { .. } => MachineError::Crypto(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedPayload {
    cipher: String,
    key_id: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsDocument {
    /// Version 0 = legacy files without this field; version 1 = current.
    #[serde(default)]
    schema_version: u32,
    machine_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    machine: Option<MachineSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted: Option<EncryptedPayload>,
}

/// Everything persisted about one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSettings {
    pub identity: Identity,
    pub hardware: HardwareProfile,
    #[serde(default)]
    pub controllers: Vec<StorageController>,
    #[serde(default)]
    pub attachments: Vec<MediumAttachment>,
    pub peripherals: Peripherals,
    pub state: MachineState,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    pub last_state_change: DateTime<Utc>,
    #[serde(default)]
    pub current_snapshot: Option<Uuid>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// Folder for differencing images, relative to the settings file.
    #[serde(default = "default_snapshot_folder")]
    pub snapshot_folder: PathBuf,
    #[serde(default)]
    pub current_state_modified: bool,
}

fn default_snapshot_folder() -> PathBuf {
    PathBuf::from("Snapshots")
}

impl MachineSettings {
    /// The lifecycle state a freshly loaded record starts in. A VM process
    /// never survives the manager, so online and transient states become
    /// aborted ones.
    pub fn normalized_state(&self) -> MachineState {
        let has_file = self.state_file.is_some();
        match self.state {
            s if s.is_online_or_transient() => {
                if has_file {
                    MachineState::AbortedSaved
                } else {
                    MachineState::Aborted
                }
            }
            MachineState::Saved | MachineState::AbortedSaved if !has_file => MachineState::PoweredOff,
            s => s,
        }
    }

    /// Write the document atomically (temp file + rename), owner-only.
    pub async fn write(&self, path: &Path, crypto: Option<&dyn CryptoContext>) -> Result<()> {
        let (machine, encrypted) = match crypto {
            None => (Some(self.clone()), None),
            Some(ctx) => {
                let plain = serde_json::to_vec(self)
                    .map_err(|e| MachineError::Internal(format!("serializing settings: {}", e)))?;
                let sealed = ctx.save(&plain).map_err(|e| MachineError::Crypto(e.to_string()))?;
                let payload = EncryptedPayload {
                    cipher: ctx.cipher().to_string(),
                    key_id: ctx.key_id().to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(sealed),
                };
                (None, Some(payload))
            }
        };
        let doc = SettingsDocument {
            schema_version: SETTINGS_SCHEMA_VERSION,
            machine_id: self.identity.id,
            machine,
            encrypted,
        };
        let data = serde_json::to_string_pretty(&doc)
            .map_err(|e| MachineError::Internal(format!("serializing settings: {}", e)))?;

        write_atomic(path, data.as_bytes()).await?;
        debug!(machine_id = %self.identity.id, path = %path.display(), "settings written");
        Ok(())
    }
}

/// Write `data` to `<path>.tmp`, rename over `path`, restrict to 0600.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MachineError::io(format!("creating folder {}", parent.display()), e))?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| MachineError::io(format!("writing temp file {}", tmp_path.display()), e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| MachineError::io(format!("renaming temp file to {}", path.display()), e))?;

    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await.ok();
    Ok(())
}

async fn read_document(path: &Path) -> std::result::Result<SettingsDocument, LoadError> {
    let data = tokio::fs::read_to_string(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: SettingsDocument = serde_json::from_str(&data).map_err(|e| LoadError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if doc.schema_version > SETTINGS_SCHEMA_VERSION {
        warn!(
            version = doc.schema_version,
            path = %path.display(),
            "settings file has newer schema version than supported (1), some fields may be lost"
        );
    }
    Ok(doc)
}

/// Machine UUID recorded in a settings file, readable even when the payload
/// is encrypted.
pub async fn read_machine_id(path: &Path) -> std::result::Result<Uuid, LoadError> {
    Ok(read_document(path).await?.machine_id)
}

/// A successfully loaded document and the context that opened it.
pub struct LoadedSettings {
    pub settings: MachineSettings,
    pub crypto: Option<Box<dyn CryptoContext>>,
}

/// Load a settings file, opening encrypted payloads through `keys`.
pub async fn load_config(path: &Path, keys: Option<&Keyring>) -> std::result::Result<LoadedSettings, LoadError> {
    let doc = read_document(path).await?;
    let password_error = |message: String| LoadError::Password {
        path: path.to_path_buf(),
        message,
    };
    let parse_error = |message: String| LoadError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let (settings, crypto) = match (doc.machine, doc.encrypted) {
        (Some(settings), None) => (settings, None),
        (None, Some(payload)) => {
            let keys = keys.ok_or_else(|| {
                password_error(format!("settings are encrypted with key '{}'", payload.key_id))
            })?;
            let ctx = keys
                .context_for(&payload.cipher, &payload.key_id)
                .map_err(|e| password_error(e.to_string()))?;
            let sealed = base64::engine::general_purpose::STANDARD
                .decode(payload.data.as_bytes())
                .map_err(|e| parse_error(format!("invalid encrypted payload: {}", e)))?;
            let plain = ctx.load(&sealed).map_err(|e| password_error(e.to_string()))?;
            let settings: MachineSettings =
                serde_json::from_slice(&plain).map_err(|e| parse_error(e.to_string()))?;
            (settings, Some(ctx))
        }
        (Some(_), Some(_)) => {
            return Err(parse_error("both plain and encrypted settings present".into()));
        }
        (None, None) => return Err(parse_error("no machine settings present".into())),
    };

    if settings.identity.id != doc.machine_id {
        return Err(parse_error(format!(
            "machine id {} does not match envelope id {}",
            settings.identity.id, doc.machine_id
        )));
    }
    Ok(LoadedSettings { settings, crypto })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::{XorProvider, TEST_KEY_ID};
    use crate::crypto::CryptoProvider;
    use crate::machine::aggregates::ConfigAggregates;
    use std::sync::Arc;

    fn sample() -> MachineSettings {
        let values = ConfigAggregates::defaults(Uuid::new_v4(), "web01", "Ubuntu_64")
            .values()
            .unwrap();
        MachineSettings {
            identity: values.identity,
            hardware: values.hardware,
            controllers: values.controllers,
            attachments: values.attachments,
            peripherals: values.peripherals,
            state: MachineState::PoweredOff,
            state_file: None,
            last_state_change: Utc::now(),
            current_snapshot: None,
            snapshots: Vec::new(),
            snapshot_folder: default_snapshot_folder(),
            current_state_modified: false,
        }
    }

    #[tokio::test]
    async fn plain_roundtrip_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web01").join("web01.json");
        let settings = sample();
        settings.write(&path, None).await.unwrap();

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("tmp").exists());

        let loaded = load_config(&path, None).await.unwrap();
        assert_eq!(loaded.settings, settings);
        assert!(loaded.crypto.is_none());
        assert_eq!(read_machine_id(&path).await.unwrap(), settings.identity.id);
    }

    #[tokio::test]
    async fn encrypted_settings_need_the_right_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let settings = sample();
        let ctx = XorProvider.create_context("xor", "hunter2").unwrap();
        settings.write(&path, Some(ctx.as_ref())).await.unwrap();

        // Without a keyring the machine id is still readable.
        let err = load_config(&path, None).await.err().unwrap();
        assert!(err.is_password());
        assert_eq!(read_machine_id(&path).await.unwrap(), settings.identity.id);

        let keyring = Keyring::new(Arc::new(XorProvider));
        keyring.add_password(TEST_KEY_ID, "wrong");
        let err = load_config(&path, Some(&keyring)).await.err().unwrap();
        assert!(err.is_password());
        assert!(err.to_string().contains("incorrect"));

        keyring.add_password(TEST_KEY_ID, "hunter2");
        let loaded = load_config(&path, Some(&keyring)).await.unwrap();
        assert_eq!(loaded.settings, settings);
        assert!(loaded.crypto.is_some());
    }

    #[tokio::test]
    async fn missing_and_corrupt_files_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(load_config(&missing, None).await, Err(LoadError::Io { .. })));

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert!(matches!(load_config(&corrupt, None).await, Err(LoadError::Parse { .. })));
    }

    #[test]
    fn online_states_normalize_on_load() {
        let mut s = sample();
        s.state = MachineState::Running;
        assert_eq!(s.normalized_state(), MachineState::Aborted);
        s.state = MachineState::Restoring;
        s.state_file = Some(PathBuf::from("/vm/Snapshots/x.sav"));
        assert_eq!(s.normalized_state(), MachineState::AbortedSaved);
        s.state = MachineState::Saved;
        assert_eq!(s.normalized_state(), MachineState::Saved);
        s.state_file = None;
        assert_eq!(s.normalized_state(), MachineState::PoweredOff);
    }

    #[test]
    fn legacy_document_without_schema_version() {
        let settings = sample();
        let json = serde_json::json!({
            "machine_id": settings.identity.id,
            "machine": settings,
        });
        let doc: SettingsDocument = serde_json::from_value(json).unwrap();
        assert_eq!(doc.schema_version, 0);
        assert_eq!(doc.machine.unwrap().snapshot_folder, PathBuf::from("Snapshots"));
    }
}
