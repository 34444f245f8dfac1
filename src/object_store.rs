use log::{debug, warn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::media_type;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid photo id: {0}")]
    InvalidId(String),
}

/// Content-addressed filesystem layout for previews and video originals.
///
/// Derivatives for id `XYZZWWWW...` live under `<root>/XY/ZZ/`; the
/// two-level nibble fanout keeps any single directory small at scale.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn fanout_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.len() < 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(&id[0..2]).join(&id[2..4]))
    }

    pub fn small_preview_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.fanout_dir(id)?.join(format!("{}_s.webp", id)))
    }

    pub fn large_preview_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.fanout_dir(id)?.join(format!("{}_l.webp", id)))
    }

    pub fn video_path(&self, id: &str, ext: &str) -> Result<PathBuf, StoreError> {
        Ok(self.fanout_dir(id)?.join(format!("{}.{}", id, ext)))
    }

    /// Atomically publishes bytes at the canonical path: written to a temp
    /// sibling in the final directory, fsync'd, then renamed into place. A
    /// partial file is never visible under the canonical name.
    pub fn publish(&self, final_path: &Path, data: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = temp_sibling(final_path);
        let mut file = File::create(&tmp_path)?;
        if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        drop(file);

        fs::rename(&tmp_path, final_path)?;
        Ok(())
    }

    /// Copies a source file into the store with the same temp-then-rename
    /// discipline. Used for video originals.
    pub fn publish_file(&self, final_path: &Path, src: &Path) -> Result<u64, StoreError> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = temp_sibling(final_path);
        let copied = match fs::copy(src, &tmp_path) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        };
        if let Err(e) = File::open(&tmp_path).and_then(|f| f.sync_all()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        fs::rename(&tmp_path, final_path)?;
        Ok(copied)
    }

    /// Best-effort removal of everything stored for an id. Missing files
    /// are not errors: a photo has no video original, a video has no large
    /// preview, and a crashed ingest may have published nothing at all.
    pub fn remove_derivatives(&self, id: &str) -> Result<(), StoreError> {
        let mut candidates = vec![self.small_preview_path(id)?, self.large_preview_path(id)?];
        for ext in media_type::video_extensions() {
            candidates.push(self.video_path(id, ext)?);
        }

        for path in candidates {
            match fs::remove_file(&path) {
                Ok(_) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }

        Ok(())
    }
}

fn temp_sibling(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    final_path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
}

/// Removes now-empty directories from `start` up to (but never including)
/// `root`. Stops at the first non-empty ancestor.
pub fn remove_empty_ancestors(start: &Path, root: &Path) {
    let mut dir = start.to_path_buf();
    loop {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        match fs::remove_dir(&dir) {
            Ok(_) => debug!("Removed empty directory {}", dir.display()),
            Err(_) => break,
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fanout_layout() {
        let store = ObjectStore::new("/media");
        let small = store.small_preview_path("a1b2c3d4e5f6").unwrap();
        assert_eq!(small, PathBuf::from("/media/a1/b2/a1b2c3d4e5f6_s.webp"));

        let large = store.large_preview_path("a1b2c3d4e5f6").unwrap();
        assert_eq!(large, PathBuf::from("/media/a1/b2/a1b2c3d4e5f6_l.webp"));

        let video = store.video_path("a1b2c3d4e5f6", "mp4").unwrap();
        assert_eq!(video, PathBuf::from("/media/a1/b2/a1b2c3d4e5f6.mp4"));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let store = ObjectStore::new("/media");
        assert!(store.small_preview_path("xy").is_err());
        assert!(store.small_preview_path("../../../etc").is_err());
    }

    #[test]
    fn test_publish_is_atomic_at_the_name() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());

        let path = store.small_preview_path("a1b2c3d4e5f6").unwrap();
        store.publish(&path, b"preview-bytes").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"preview-bytes");
        // No temp leftovers in the fanout directory.
        let siblings: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[test]
    fn test_publish_file_copies_source() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path().join("media"));

        let src = tmp.path().join("vid.mp4");
        fs::write(&src, b"mp4-bytes").unwrap();

        let dst = store.video_path("a1b2c3d4e5f6", "mp4").unwrap();
        let copied = store.publish_file(&dst, &src).unwrap();
        assert_eq!(copied, 9);
        assert_eq!(fs::read(&dst).unwrap(), b"mp4-bytes");
        // The source is untouched; deleting it is the processor's call.
        assert!(src.exists());
    }

    #[test]
    fn test_remove_derivatives_tolerates_missing() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());

        let small = store.small_preview_path("a1b2c3d4e5f6").unwrap();
        store.publish(&small, b"x").unwrap();

        store.remove_derivatives("a1b2c3d4e5f6").unwrap();
        assert!(!small.exists());

        // Second pass: everything already gone, still fine.
        store.remove_derivatives("a1b2c3d4e5f6").unwrap();
    }

    #[test]
    fn test_remove_empty_ancestors_stops_at_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("uploads");
        let deep = root.join("a/b/c");
        fs::create_dir_all(&deep).unwrap();

        remove_empty_ancestors(&deep, &root);

        assert!(root.exists());
        assert!(!root.join("a").exists());
    }

    #[test]
    fn test_remove_empty_ancestors_keeps_nonempty() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("uploads");
        let deep = root.join("a/b");
        fs::create_dir_all(&deep).unwrap();
        fs::write(root.join("a/keep.jpg"), b"data").unwrap();

        remove_empty_ancestors(&deep, &root);

        assert!(!root.join("a/b").exists());
        assert!(root.join("a/keep.jpg").exists());
    }
}
