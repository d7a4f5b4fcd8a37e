//! Drive session over a local directory
//!
//! Implements [`DriveSession`] with `tokio::fs`. Drive paths are
//! `/`-separated and resolved below the session root; any path that would
//! leave the root, directly or through a symlink, is rejected.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Utc};
use davbridge_core::{
    domain::BackendError,
    ports::{DriveSession, EntryInfo},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// An open session on a local directory
#[derive(Debug)]
pub struct LocalDrive {
    account: String,
    root: PathBuf,
    ctx: CancellationToken,
}

impl LocalDrive {
    /// Opens `root` for `account`
    ///
    /// The root must exist and be a directory.
    pub async fn open(
        account: impl Into<String>,
        root: &Path,
        ctx: CancellationToken,
    ) -> Result<Self, BackendError> {
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| BackendError::Other(format!("drive root {}: {e}", root.display())))?;
        let metadata = tokio::fs::metadata(&root)
            .await
            .map_err(|e| BackendError::Other(format!("drive root {}: {e}", root.display())))?;
        if !metadata.is_dir() {
            return Err(BackendError::Other(format!(
                "drive root {} is not a directory",
                root.display()
            )));
        }

        Ok(Self {
            account: account.into(),
            root,
            ctx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a drive path to a filesystem path below the root
    async fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        if self.ctx.is_cancelled() {
            return Err(BackendError::Closed);
        }

        let mut resolved = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(name)), None) => resolved.push(name),
                _ => return Err(BackendError::InvalidPath(path.to_string())),
            }
        }

        let canonical = tokio::fs::canonicalize(&resolved)
            .await
            .map_err(|e| io_error(path, e))?;
        if !canonical.starts_with(&self.root) {
            debug!(path, "Rejected path escaping the drive root");
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        Ok(canonical)
    }

    /// Runs `op` unless the session is closed first
    async fn guarded<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        tokio::select! {
            result = op => result,
            _ = self.ctx.cancelled() => Err(BackendError::Closed),
        }
    }
}

#[async_trait::async_trait]
impl DriveSession for LocalDrive {
    fn account(&self) -> &str {
        &self.account
    }

    #[instrument(skip(self))]
    async fn stat(&self, path: &str) -> Result<EntryInfo, BackendError> {
        self.guarded(async {
            let full = self.resolve(path).await?;
            let metadata = tokio::fs::metadata(&full)
                .await
                .map_err(|e| io_error(path, e))?;
            let name = full
                .strip_prefix(&self.root)
                .ok()
                .and_then(|rel| rel.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(entry(name, &metadata))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list(&self, path: &str) -> Result<Vec<EntryInfo>, BackendError> {
        self.guarded(async {
            let full = self.resolve(path).await?;
            if !full.is_dir() {
                return Err(BackendError::InvalidPath(path.to_string()));
            }
            let mut dir = tokio::fs::read_dir(&full)
                .await
                .map_err(|e| io_error(path, e))?;

            let mut entries = Vec::new();
            while let Some(child) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
                // Follows symlinks; dangling ones are skipped
                let Ok(metadata) = tokio::fs::metadata(child.path()).await else {
                    continue;
                };
                entries.push(entry(
                    child.file_name().to_string_lossy().into_owned(),
                    &metadata,
                ));
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            debug!(count = entries.len(), "Listed folder");
            Ok(entries)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        self.guarded(async {
            let full = self.resolve(path).await?;
            if full.is_dir() {
                return Err(BackendError::InvalidPath(path.to_string()));
            }
            let data = tokio::fs::read(&full).await.map_err(|e| io_error(path, e))?;
            debug!(bytes = data.len(), "File read complete");
            Ok(data)
        })
        .await
    }
}

fn entry(name: String, metadata: &std::fs::Metadata) -> EntryInfo {
    let modified = metadata.modified().ok().and_then(|st| {
        st.duration_since(std::time::UNIX_EPOCH)
            .ok()
            .and_then(|dur| DateTime::<Utc>::from_timestamp(dur.as_secs() as i64, dur.subsec_nanos()))
    });
    let is_dir = metadata.is_dir();
    EntryInfo {
        name,
        is_dir,
        size: if is_dir { 0 } else { metadata.len() },
        modified,
    }
}

fn io_error(path: &str, e: std::io::Error) -> BackendError {
    match e.kind() {
        ErrorKind::NotFound => BackendError::NotFound(path.to_string()),
        _ => BackendError::Other(format!("{path}: {e}")),
    }
}
