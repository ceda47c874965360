// src/storage.rs
use std::collections::HashSet;
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::model::Lang;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Py,
}

impl FileType {
    pub fn of(lang: Lang) -> Option<Self> {
        match lang {
            Lang::Python => Some(FileType::Py),
            Lang::JavaScript => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Py => "py",
        }
    }
}

/// Scratch directory `<base>/<scope>/<id>.<ext>` for file-based execution.
#[derive(Debug)]
pub struct TempFileStorage {
    root: PathBuf,
    to_delete: Mutex<HashSet<PathBuf>>,
}

impl TempFileStorage {
    /// Creates the scope directory, replacing a plain file in its way.
    pub fn open(base: &Path, scope: &str) -> io::Result<Self> {
        let root = base.join(scope);
        if root.exists() && !root.is_dir() {
            std::fs::remove_file(&root)?;
        }
        std::fs::create_dir_all(&root)?;
        let root = std::path::absolute(&root)?;
        Ok(Self { root, to_delete: Mutex::new(HashSet::new()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, id: impl Display, file_type: FileType) -> PathBuf {
        self.root.join(format!("{}.{}", id, file_type.extension()))
    }

    pub fn save(&self, id: impl Display, content: &str, file_type: FileType) -> io::Result<PathBuf> {
        let path = self.path_of(id, file_type);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn resolve(&self, id: impl Display, file_type: FileType) -> io::Result<PathBuf> {
        let path = self.path_of(id, file_type);
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("file {} doesn't exist", path.display()),
            ));
        }
        Ok(path)
    }

    pub fn delete(&self, id: impl Display, file_type: FileType) -> io::Result<PathBuf> {
        let path = self.resolve(id, file_type)?;
        std::fs::remove_file(&path)?;
        Ok(path)
    }

    /// Marks an existing file for the next [`purge_scheduled`](Self::purge_scheduled) pass.
    pub fn schedule_deletion(&self, id: impl Display, file_type: FileType) {
        if let Ok(path) = self.resolve(id, file_type) {
            self.to_delete.lock().unwrap_or_else(PoisonError::into_inner).insert(path);
        }
    }

    /// Deletes scheduled files; paths that fail to delete stay scheduled.
    pub fn purge_scheduled(&self) -> usize {
        let pending: Vec<PathBuf> = self
            .to_delete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        let mut purged = 0;
        for path in pending {
            let removed = match std::fs::remove_file(&path) {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => true,
                Err(e) => {
                    log::debug!("Failed to delete {}: {}", path.display(), e);
                    false
                }
            };
            if removed {
                self.to_delete.lock().unwrap_or_else(PoisonError::into_inner).remove(&path);
                purged += 1;
            }
        }
        purged
    }

    pub fn scheduled(&self) -> usize {
        self.to_delete.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
