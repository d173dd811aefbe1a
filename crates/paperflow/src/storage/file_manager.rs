//! Backing-file folder and path generation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Owns the folder where file-backed artifacts live.
#[derive(Debug)]
pub struct FileStorageManager {
    folder: PathBuf,
    /// The folder did not exist before this manager created it.
    created: bool,
}

impl FileStorageManager {
    /// Use `folder` for backing files, creating it if needed.
    pub fn new(folder: impl Into<PathBuf>) -> io::Result<Self> {
        let folder = folder.into();
        let created = !folder.exists();
        fs::create_dir_all(&folder)?;
        debug!("[Storage] Backing files in {}", folder.display());
        Ok(Self { folder, created })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// A fresh, unused path with the given extension.
    pub fn next_file_path(&self, extension: &str) -> PathBuf {
        self.folder
            .join(format!("{}.{}", Uuid::new_v4().simple(), extension))
    }

    /// Remove the folder if this manager created it and nothing is left.
    pub fn cleanup(&self) {
        if !self.created {
            return;
        }
        let empty = match fs::read_dir(&self.folder) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => return,
        };
        if empty {
            if let Err(e) = fs::remove_dir(&self.folder) {
                warn!(
                    "[Storage] Could not remove {}: {}",
                    self.folder.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_file_paths_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileStorageManager::new(dir.path()).unwrap();
        let a = manager.next_file_path("png");
        let b = manager.next_file_path("png");
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir.path()));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("png"));
    }

    #[test]
    fn cleanup_removes_only_created_empty_folders() {
        let dir = tempfile::tempdir().unwrap();

        let existing = FileStorageManager::new(dir.path()).unwrap();
        existing.cleanup();
        assert!(dir.path().exists());

        let nested = dir.path().join("backing");
        let created = FileStorageManager::new(&nested).unwrap();
        fs::write(created.next_file_path("jpg"), b"x").unwrap();
        created.cleanup();
        assert!(nested.exists());

        for entry in fs::read_dir(&nested).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        created.cleanup();
        assert!(!nested.exists());
    }
}
