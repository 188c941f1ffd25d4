//! Scoped on-disk artifacts owned by a single run

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::sanitize_filename;

/// Longest file name most filesystems accept
const MAX_NAME_BYTES: usize = 255;
const MAX_EXTENSION_BYTES: usize = 16;

/// Creates uniquely named files in one directory
#[derive(Debug, Clone)]
pub struct TempFileManager {
    dir: PathBuf,
}

impl TempFileManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if missing
    pub async fn ensure_dir(&self) -> Result<()> {
        if tokio::fs::metadata(&self.dir).await.is_err() {
            tokio::fs::create_dir_all(&self.dir).await?;
            tracing::info!("Created upload directory {}", self.dir.display());
        }
        Ok(())
    }

    /// Write `bytes` to a fresh file named after the submission time and the
    /// sanitized original name
    pub async fn create(&self, bytes: &[u8], original_name: &str) -> Result<TempFile> {
        self.ensure_dir().await?;

        let name = unique_name(original_name);
        let path = self.dir.join(&name);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| Error::internal(format!("Failed to create {}: {}", path.display(), e)))?;

        // From here on the guard owns the path, so a failed write is cleaned up
        let guard = TempFile::new(path);
        file.write_all(bytes).await?;
        file.flush().await?;

        tracing::debug!("Temp file created: {} ({} bytes)", guard.path().display(), bytes.len());
        Ok(guard)
    }

    /// Delete the artifact; a file that is already gone counts as released
    pub async fn release(&self, handle: TempFile) -> Result<()> {
        handle.release().await
    }
}

fn unique_name(original_name: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let nonce = Uuid::new_v4().simple().to_string();
    let prefix = format!("{}_{}_", millis, &nonce[..8]);
    let name = fit_name(
        &sanitize_filename(original_name),
        MAX_NAME_BYTES.saturating_sub(prefix.len()),
    );
    format!("{}{}", prefix, name)
}

/// Shorten `name` to at most `budget` bytes on a char boundary, keeping a
/// short extension
fn fit_name(name: &str, budget: usize) -> String {
    if name.len() <= budget {
        return name.to_string();
    }

    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 && name.len() - i <= MAX_EXTENSION_BYTES && name.len() - i < budget => {
            name.split_at(i)
        }
        _ => (name, ""),
    };

    let mut out = String::with_capacity(budget);
    for c in stem.chars() {
        if out.len() + c.len_utf8() + ext.len() > budget {
            break;
        }
        out.push(c);
    }
    out.push_str(ext);
    out
}

/// Handle to one temp file; deleting it on drop if never released
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    released: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the guard and hand back the path; the file stays on disk
    pub fn keep(mut self) -> PathBuf {
        self.released = true;
        std::mem::take(&mut self.path)
    }

    /// Delete the file; idempotent with respect to "not found"
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!("Temp file released: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::error!("Failed to delete temp file {}: {}", self.path.display(), e);
                Err(Error::Io(e))
            }
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::warn!(
                "Temp file {} released by drop guard",
                self.path.display()
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                "Drop guard failed to delete {}: {} (left for the sweeper)",
                self.path.display(),
                e
            ),
        }
    }
}
