//! Destination file management.
//!
//! A [`FileTarget`] owns the destination handle for one transfer. It is sized
//! to the final length before the first write, so block workers only ever
//! overwrite space that already exists and never race on the file length.
//! Writes are positional (`pwrite` on unix, `seek_write` on windows) and run
//! on the blocking pool, which lets any number of workers share one handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::error::{DownloadError, EngineError};

/// Destination file opened for offset-addressed writes.
#[derive(Debug, Clone)]
pub struct FileTarget {
    file: Arc<File>,
    path: PathBuf,
    final_size: u64,
}

impl FileTarget {
    /// Opens the destination, applying the overwrite policy.
    ///
    /// Creates or truncates the file and reserves `final_size` bytes. When
    /// `overwrite` is false and the path exists, nothing is touched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Conflict`] if the path exists and `overwrite`
    /// is false, or [`EngineError::Io`] if the file cannot be created or sized.
    #[instrument(level = "debug", fields(path = %path.display()))]
    pub async fn open(path: &Path, final_size: u64, overwrite: bool) -> Result<Self, EngineError> {
        let owned = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || -> Result<File, EngineError> {
            let mut options = OpenOptions::new();
            options.write(true);
            if overwrite {
                options.create(true).truncate(true);
            } else {
                // Atomic existence check: fails with AlreadyExists instead of clobbering.
                options.create_new(true);
            }
            let file = options.open(&owned).map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    EngineError::Conflict {
                        path: owned.clone(),
                    }
                } else {
                    EngineError::io(owned.clone(), e)
                }
            })?;
            file.set_len(final_size)
                .map_err(|e| EngineError::io(owned.clone(), e))?;
            Ok(file)
        })
        .await
        .map_err(|e| EngineError::io(path, io::Error::other(e)))??;

        debug!(final_size, "destination opened");
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            final_size,
        })
    }

    /// Destination path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size reserved for the transfer.
    #[must_use]
    pub fn final_size(&self) -> u64 {
        self.final_size
    }

    /// Writes `bytes` at `offset` without touching any other region.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the write fails.
    pub async fn write_at<B>(&self, offset: u64, bytes: B) -> Result<(), DownloadError>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || write_all_at(&file, bytes.as_ref(), offset))
            .await
            .map_err(io::Error::other)
            .and_then(|result| result)
            .map_err(|e| DownloadError::io(self.path.clone(), e))
    }

    /// Discards all written bytes and re-reserves the final size.
    ///
    /// Used when a single stream restarts from byte zero.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the file cannot be resized.
    pub async fn reset(&self) -> Result<(), DownloadError> {
        let file = Arc::clone(&self.file);
        let final_size = self.final_size;
        tokio::task::spawn_blocking(move || {
            file.set_len(0)?;
            file.set_len(final_size)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|result| result)
        .map_err(|e| DownloadError::io(self.path.clone(), e))
    }

    /// Current on-disk length.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if metadata cannot be read.
    pub async fn len_on_disk(&self) -> Result<u64, EngineError> {
        tokio::fs::metadata(&self.path)
            .await
            .map(|meta| meta.len())
            .map_err(|e| EngineError::io(self.path.clone(), e))
    }

    /// Flushes file contents and releases the handle.
    ///
    /// Consumes the target, so it can run at most once; partially written
    /// files stay on disk.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] if syncing fails.
    pub async fn close(self) -> Result<(), EngineError> {
        let Self { file, path, .. } = self;
        let sync_path = path.clone();
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|e| EngineError::io(sync_path, io::Error::other(e)))?
            .map_err(|e| EngineError::io(path.clone(), e))?;
        debug!(path = %path.display(), "destination closed");
        Ok(())
    }

    /// Closes the target after a failed run, keeping the original error.
    pub(crate) async fn close_after_failure(self) {
        let path = self.path.clone();
        if let Err(e) = self.close().await {
            warn!(path = %path.display(), error = %e, "failed to close destination after error");
        }
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Creates the parent directory of `path` if it is missing.
///
/// # Errors
///
/// Returns [`EngineError::Io`] if the directory cannot be created.
pub async fn ensure_parent_dir(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::io(parent, e))?;
    }
    Ok(())
}
