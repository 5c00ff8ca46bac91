//! Temporary-file naming.
//!
//! Names are drawn from a process-wide atomic counter so concurrent owners
//! never collide; the files live inside a per-use scratch directory created
//! under the configured temp dir. Deletion policy is owner-on-drop: a
//! `TempPath` removes its file when dropped unless marked persistent.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

/// Next unique id for temporary file naming.
pub fn next_temp_id() -> u64 {
    NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed)
}

/// A scratch directory for one job (one sort, one pipeline run). The
/// directory and everything in it are removed when the value drops.
#[derive(Debug)]
pub struct ScratchDir {
    dir: tempfile::TempDir,
}

impl ScratchDir {
    /// Create a scratch directory under `base` with the given prefix.
    pub fn new(base: &Path, prefix: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}_"))
            .tempdir_in(base)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A fresh uniquely named file path inside this directory. The file is
    /// not created.
    pub fn file(&self, tag: &str) -> TempPath {
        let path = self
            .dir
            .path()
            .join(format!("{tag}_{:06}.osp", next_temp_id()));
        TempPath {
            path,
            persistent: false,
        }
    }
}

/// A temp file path that deletes its file on drop.
#[derive(Debug)]
pub struct TempPath {
    path: PathBuf,
    persistent: bool,
}

impl TempPath {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file on disk after this value drops.
    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if !self.persistent && self.path.exists() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), %err, "failed to remove temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = next_temp_id();
        let b = next_temp_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_scratch_files_do_not_collide() {
        let base = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(base.path(), "sort").unwrap();
        let f1 = scratch.file("run");
        let f2 = scratch.file("run");
        assert_ne!(f1.path(), f2.path());
        assert!(f1.path().starts_with(scratch.path()));
    }

    #[test]
    fn test_temp_path_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(base.path(), "t").unwrap();
        let kept;
        {
            let f = scratch.file("run");
            std::fs::write(f.path(), b"data").unwrap();
            kept = f.path().to_path_buf();
        }
        assert!(!kept.exists());
    }

    #[test]
    fn test_persistent_path_survives_drop() {
        let base = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(base.path(), "t").unwrap();
        let kept;
        {
            let mut f = scratch.file("run");
            std::fs::write(f.path(), b"data").unwrap();
            f.set_persistent(true);
            kept = f.path().to_path_buf();
        }
        assert!(kept.exists());
    }
}
