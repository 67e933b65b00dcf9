//! Unlink-on-drop guard for reconstruction temp files.
//!
//! Reconstruction always writes into a temp file beside the destination
//! and renames it into place on success. The guard covers every failure
//! path in between; it is defused only once the rename has committed.

use std::path::{Path, PathBuf};

pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call after the rename commits; the temp no longer exists under
    /// this name and must not be removed.
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_drop_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("victim.tmp");
        std::fs::write(&path, b"scratch").unwrap();
        {
            let _guard = TempFileGuard::new(&path);
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_defuse_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keeper.tmp");
        std::fs::write(&path, b"scratch").unwrap();
        let guard = TempFileGuard::new(&path);
        guard.defuse();
        assert!(path.exists());
    }

    #[test]
    fn test_drop_on_missing_file_is_quiet() {
        let tmp = TempDir::new().unwrap();
        let _guard = TempFileGuard::new(tmp.path().join("never-created.tmp"));
    }
}
