//! JSON file persistence
//!
//! Each record lives in its own JSON document under the data directory.
//! Writes create the directory (mode 0700) on demand, write a sibling
//! temporary file with mode 0600, and rename it over the final path, so a
//! reader never observes a partially written document.

use std::{
    fs,
    io::{ErrorKind, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use davbridge_core::{
    domain::{AdminCredential, SessionToken, StoreError},
    ports::{AdminCredentialStore, TokenStore},
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// File name of the persisted session token
pub const TOKEN_FILE: &str = "tokens.json";

/// File name of the persisted admin credential
pub const ADMIN_PASSWORD_FILE: &str = "admin_password.json";

/// A single JSON document of type `T` at a fixed path
#[derive(Debug, Clone)]
pub struct JsonFile<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonFile<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document; a missing file yields `Ok(None)`
    pub fn read(&self) -> Result<Option<T>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let record = serde_json::from_slice(&bytes)?;
        Ok(Some(record))
    }

    /// Atomically replaces the document with `record`
    pub fn write(&self, record: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec(record)?;

        if let Some(parent) = self.path.parent() {
            create_private_dir(parent).map_err(|e| StoreError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let result = write_private(&tmp, &json).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(self.io_error(e));
        }

        debug!(path = %self.path.display(), "Wrote JSON document");
        Ok(())
    }

    /// Deletes the document; a missing file is not an error
    pub fn remove(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed JSON document");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // The mode only applies on creation; tighten a leftover temp file too.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

// ============================================================================
// FileTokenStore
// ============================================================================

/// [`TokenStore`] backed by `tokens.json` in the data directory
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    file: JsonFile<SessionToken>,
}

impl FileTokenStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file: JsonFile::new(data_dir.join(TOKEN_FILE)),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        self.file.read()
    }

    fn store(&self, token: &SessionToken) -> Result<(), StoreError> {
        self.file.write(token)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.file.remove()
    }
}

// ============================================================================
// FileAdminCredentialStore
// ============================================================================

/// [`AdminCredentialStore`] backed by `admin_password.json` in the data directory
#[derive(Debug, Clone)]
pub struct FileAdminCredentialStore {
    file: JsonFile<AdminCredential>,
}

impl FileAdminCredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file: JsonFile::new(data_dir.join(ADMIN_PASSWORD_FILE)),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl AdminCredentialStore for FileAdminCredentialStore {
    fn load(&self) -> Result<Option<AdminCredential>, StoreError> {
        self.file.read()
    }

    fn store(&self, credential: &AdminCredential) -> Result<(), StoreError> {
        self.file.write(credential)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.file.remove()
    }
}
