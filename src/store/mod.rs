pub mod credentials;
pub mod error;
pub mod metadata;

pub use credentials::{CredentialStore, Credentials, CredentialsUpdate};
pub use error::StoreError;
pub use metadata::MetadataCache;

use error::{Result, StoreError as Error};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Reads a JSON document. A missing file is `Ok(None)`; unparseable content
/// is reported as [`StoreError::Corrupt`] so callers can decide to start fresh.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Writes a JSON document through a sibling temp file and a rename, so a
/// reader never observes a half-written file.
pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub(crate) fn sanitize_filename(key: &str) -> String {
    key.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-', "_")
}
