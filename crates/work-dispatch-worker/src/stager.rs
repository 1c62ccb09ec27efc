use crate::error::StageError;
use crate::store::Content;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Name prefix of every staged file, so leftovers can be recognised
pub const STAGED_PREFIX: &str = "wd-stage-";

const DEFAULT_SUFFIX: &str = ".data";

type InUse = Arc<Mutex<HashSet<PathBuf>>>;

/// Copies streamed content into local temporary files for units that can
/// only work from a path.
///
/// Clones share the record of files still in use.
#[derive(Debug, Clone)]
pub struct ResourceStager {
    dir: PathBuf,
    in_use: InUse,
}

impl ResourceStager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ResourceStager {
            dir: dir.into(),
            in_use: InUse::default(),
        }
    }

    /// Stage into the system temp directory
    pub fn temp() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `path` is a staged file some unit may still be reading
    pub fn is_in_use(&self, path: &Path) -> bool {
        self.in_use.lock().contains(path)
    }

    /// Write `content` to a fresh file in the staging directory.
    ///
    /// The file is removed when the returned resource is closed or dropped,
    /// and also if copying fails part way.
    pub async fn materialize(&self, mut content: Content) -> Result<StagedResource, StageError> {
        let suffix = suffix_for(content.file_name.as_deref());
        let named = tempfile::Builder::new()
            .prefix(STAGED_PREFIX)
            .suffix(&suffix)
            .tempfile_in(&self.dir)?;
        let (file, path) = named.into_parts();
        self.in_use.lock().insert(path.to_path_buf());
        let mut staged = StagedResource {
            path: Some(path),
            len: 0,
            in_use: self.in_use.clone(),
        };

        let mut file = tokio::fs::File::from_std(file);
        staged.len = tokio::io::copy(&mut content.reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;

        debug!("Staged {} bytes to {}", staged.len, staged.path().display());
        Ok(staged)
    }
}

/// Extension of `file_name` as a temp file suffix, else `.data`
fn suffix_for(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

/// A local copy of some content, deleted on close or drop
#[derive(Debug)]
pub struct StagedResource {
    path: Option<TempPath>,
    len: u64,
    in_use: InUse,
}

impl StagedResource {
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete the file now. A failed delete is logged, never returned.
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(path) = self.path.take() {
            let staged_path = path.to_path_buf();
            match path.close() {
                Ok(()) => debug!("Removed staged file {}", staged_path.display()),
                Err(e) => warn!("Could not delete staged file {}: {}", staged_path.display(), e),
            }
            self.in_use.lock().remove(&staged_path);
        }
    }
}

impl Drop for StagedResource {
    fn drop(&mut self) {
        self.remove();
    }
}
