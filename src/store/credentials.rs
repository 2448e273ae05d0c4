use super::error::{Result, StoreError};
use super::{read_json, sanitize_filename, write_json};
use crate::types::contact::AccountIdentity;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

const CREDS_FILE: &str = "creds.json";

/// Authentication material for the session.
///
/// Only `registered` and `me` are interpreted here; the rest of the
/// transport's key material is kept verbatim in `material`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<AccountIdentity>,
    #[serde(flatten)]
    pub material: Map<String, Value>,
}

/// A partial credential change emitted by the transport (`creds.update`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<AccountIdentity>,
    #[serde(flatten)]
    pub material: Map<String, Value>,
}

impl Credentials {
    pub fn apply(&mut self, update: CredentialsUpdate) {
        if let Some(registered) = update.registered {
            self.registered = registered;
        }
        if let Some(me) = update.me {
            self.me = Some(me);
        }
        self.material.extend(update.material);
    }
}

/// Directory-backed credential persistence.
///
/// `creds.json` holds the [`Credentials`]; every other key (pre-keys,
/// sessions, sender keys, ...) lives in its own `<category>-<id>.json` file.
/// All writes are serialized so the file on disk always reflects the most
/// recent in-memory state.
pub struct CredentialStore {
    dir: PathBuf,
    creds: RwLock<Credentials>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let creds = match read_json::<Credentials>(&dir.join(CREDS_FILE)).await {
            Ok(Some(creds)) => {
                debug!(
                    target: "Store/Creds",
                    "Loaded credentials from {} (registered: {})",
                    dir.display(),
                    creds.registered
                );
                creds
            }
            Ok(None) => {
                info!(target: "Store/Creds", "No stored credentials in {}, starting unregistered", dir.display());
                Credentials::default()
            }
            Err(StoreError::Corrupt { path, reason }) => {
                warn!(target: "Store/Creds", "Ignoring unreadable credentials at {path}: {reason}");
                Credentials::default()
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            dir,
            creds: RwLock::new(creds),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn snapshot(&self) -> Credentials {
        self.creds.read().await.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.creds.read().await.registered
    }

    /// Merges `update` into the stored credentials and persists them before
    /// returning.
    pub async fn apply_update(&self, update: CredentialsUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut creds = self.creds.write().await;
            creds.apply(update);
            creds.clone()
        };
        write_json(&self.dir.join(CREDS_FILE), &snapshot).await?;
        debug!(target: "Store/Creds", "Credentials persisted");
        Ok(())
    }

    fn key_path(&self, category: &str, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_filename(&format!("{category}-{id}"))))
    }

    pub async fn read_key(&self, category: &str, id: &str) -> Result<Option<Value>> {
        match read_json(&self.key_path(category, id)).await {
            Err(StoreError::Corrupt { path, reason }) => {
                warn!(target: "Store/Creds", "Ignoring unreadable key file {path}: {reason}");
                Ok(None)
            }
            other => other,
        }
    }

    /// Stores a key, or removes it when `value` is `None`.
    pub async fn write_key(&self, category: &str, id: &str, value: Option<&Value>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.key_path(category, id);
        match value {
            Some(value) => write_json(&path, value).await,
            None => match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::Io(e)),
            },
        }
    }

    /// Drops all stored credentials and keys, returning to the unregistered state.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
            }
        }
        *self.creds.write().await = Credentials::default();
        info!(target: "Store/Creds", "Cleared credentials in {}", self.dir.display());
        Ok(())
    }
}
