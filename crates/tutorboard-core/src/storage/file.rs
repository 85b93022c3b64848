//! File-based snapshot storage.

use super::{BoxFuture, SnapshotStorage, StorageError, StorageResult};
use std::fs;
use std::path::PathBuf;

const EXTENSION: &str = "loro";

/// Stores each session snapshot as a `.loro` file in one directory.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    /// Create a new file storage with the given base directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self { base_path })
    }

    /// Create file storage in the default location.
    ///
    /// On Linux: `~/.local/share/tutorboard/sessions/`
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;
        Self::new(base.join("tutorboard").join("sessions"))
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        // Sanitize ID to be safe for filenames
        let safe_id: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.{}", safe_id, EXTENSION))
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }
}

impl SnapshotStorage for FileStorage {
    fn save(&self, id: &str, snapshot: &[u8]) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.snapshot_path(id);
        let snapshot = snapshot.to_vec();
        Box::pin(async move {
            // Write then rename so a crash never leaves a torn snapshot
            let tmp = path.with_extension(format!("{}.tmp", EXTENSION));
            fs::write(&tmp, &snapshot).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", tmp.display(), e))
            })?;
            fs::rename(&tmp, &path).map_err(|e| {
                StorageError::Io(format!("Failed to replace {}: {}", path.display(), e))
            })
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        let path = self.snapshot_path(id);
        let id = id.to_string();
        Box::pin(async move {
            if !path.exists() {
                return Err(StorageError::NotFound(id));
            }
            fs::read(&path)
                .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.snapshot_path(id);
        Box::pin(async move {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
                })?;
            }
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let entries = fs::read_dir(&base_path)
                .map_err(|e| StorageError::Io(format!("Failed to read directory: {}", e)))?;

            let mut ids = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == EXTENSION) {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.push(stem.to_string());
                    }
                }
            }
            Ok(ids)
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let path = self.snapshot_path(id);
        Box::pin(async move { Ok(path.exists()) })
    }
}
