//! Source-tree lister: turns a directory walk into the ordered SrcFile
//! list a sync round is built from.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use filetime::FileTime;
use tracing::warn;
use walkdir::WalkDir;

use crate::proto::SrcFile;

pub struct SrcFileLister {
    pub root: PathBuf,
    /// Include directory entries so empty directories materialize on the
    /// receiver. When off, directories arrive only implicitly through
    /// their children's paths.
    pub include_empty_dirs: bool,
}

impl SrcFileLister {
    pub fn new(root: impl Into<PathBuf>, include_empty_dirs: bool) -> Self {
        Self {
            root: root.into(),
            include_empty_dirs,
        }
    }

    /// Lists the whole tree in deterministic (name-sorted) order. The
    /// root itself is never listed.
    pub fn list(&self) -> Result<Vec<SrcFile>> {
        self.list_under(&self.root)
    }

    /// Lists the subtree rooted at `path`, which must live inside the
    /// lister's root. Entries that vanish mid-walk are skipped with a
    /// warning; monitor mode races against editors all the time.
    pub fn list_under(&self, path: &Path) -> Result<Vec<SrcFile>> {
        let mut list = Vec::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) {
                        warn!("skipping vanished entry: {e}");
                        continue;
                    }
                    return Err(e).context("walk failed");
                }
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping unreadable entry {}: {e}", entry.path().display());
                    continue;
                }
            };
            if let Some(f) = self.entry(entry.path(), &meta)? {
                list.push(f);
            }
        }
        Ok(list)
    }

    /// Stats a single path and appends it. A path that no longer exists
    /// is skipped with a warning.
    pub fn add_path(&self, list: &mut Vec<SrcFile>, path: &Path) -> Result<()> {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("skipping vanished path {}", path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat {}", path.display()))
            }
        };
        if let Some(f) = self.entry(path, &meta)? {
            list.push(f);
        }
        Ok(())
    }

    fn entry(&self, path: &Path, meta: &Metadata) -> Result<Option<SrcFile>> {
        let rel = path
            .strip_prefix(&self.root)
            .with_context(|| format!("{} is outside the sync root", path.display()))?;
        if rel.as_os_str().is_empty() {
            return Ok(None);
        }
        let mut size = meta.len();
        if meta.is_dir() {
            if !self.include_empty_dirs {
                return Ok(None);
            }
            size = 0;
        }
        let mtime = FileTime::from_last_modification_time(meta);
        Ok(Some(SrcFile {
            path: rel.to_string_lossy().into_owned(),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
            size,
            mtime_sec: mtime.unix_seconds(),
            mtime_nsec: mtime.nanoseconds(),
        }))
    }
}
