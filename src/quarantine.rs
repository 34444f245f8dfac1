use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid quarantine path: {0}")]
    InvalidPath(String),
    #[error("no such quarantined file: {0}")]
    NotFound(String),
}

/// Sidecar written next to every quarantined file, describing why ingestion
/// gave up on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSidecar {
    pub stage: String,
    pub error: String,
    pub worker_id: String,
    pub moved_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    /// Path relative to the quarantine root, e.g. `2026-08-01/photo.jpg`.
    pub path: String,
    pub size: u64,
    pub sidecar: Option<ErrorSidecar>,
}

/// Terminal storage for source files that failed to ingest, laid out as
/// `<root>/<YYYY-MM-DD>/<filename>` plus a `<filename>.error` sidecar.
#[derive(Debug, Clone)]
pub struct Quarantine {
    root: PathBuf,
}

impl Quarantine {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Moves `src` into today's quarantine directory and writes the error
    /// sidecar. A name collision gets a numeric suffix rather than
    /// clobbering an earlier failure.
    pub fn quarantine_file(
        &self,
        src: &Path,
        sidecar: &ErrorSidecar,
    ) -> Result<PathBuf, QuarantineError> {
        let day_dir = self.root.join(sidecar.moved_at.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir)?;

        let filename = src
            .file_name()
            .ok_or_else(|| QuarantineError::InvalidPath(src.display().to_string()))?
            .to_string_lossy()
            .to_string();

        let dest = unique_destination(&day_dir, &filename);

        // Rename first, fall back to copy+remove for cross-device moves.
        if fs::rename(src, &dest).is_err() {
            fs::copy(src, &dest)?;
            fs::remove_file(src)?;
        }

        let sidecar_path = sidecar_path_for(&dest);
        fs::write(&sidecar_path, serde_json::to_vec_pretty(sidecar)?)?;

        info!(
            "Quarantined {} -> {} (stage: {})",
            src.display(),
            dest.display(),
            sidecar.stage
        );
        Ok(dest)
    }

    /// All quarantined files, newest day first.
    pub fn list(&self) -> Result<Vec<FailedFile>, QuarantineError> {
        let mut failed = Vec::new();

        let mut days: Vec<PathBuf> = match fs::read_dir(&self.root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(failed),
            Err(e) => return Err(e.into()),
        };
        days.sort();
        days.reverse();

        for day in days {
            let mut entries: Vec<PathBuf> = fs::read_dir(&day)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().map(|e| e != "error").unwrap_or(true))
                .collect();
            entries.sort();

            for path in entries {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let sidecar = read_sidecar(&path);
                let rel = path
                    .strip_prefix(&self.root)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|_| path.display().to_string());
                failed.push(FailedFile {
                    path: rel,
                    size,
                    sidecar,
                });
            }
        }

        Ok(failed)
    }

    /// Moves a quarantined file back into the uploads root so the scanner
    /// picks it up again. The sidecar is discarded.
    pub fn retry(&self, rel_path: &str, uploads_root: &Path) -> Result<PathBuf, QuarantineError> {
        let src = self.resolve(rel_path)?;
        let filename = src
            .file_name()
            .ok_or_else(|| QuarantineError::InvalidPath(rel_path.to_string()))?;

        fs::create_dir_all(uploads_root)?;
        let dest = uploads_root.join(filename);

        if fs::rename(&src, &dest).is_err() {
            fs::copy(&src, &dest)?;
            fs::remove_file(&src)?;
        }
        remove_sidecar(&src);
        self.prune_day_dir(&src);

        info!("Returned {} to uploads for retry", rel_path);
        Ok(dest)
    }

    pub fn delete(&self, rel_path: &str) -> Result<(), QuarantineError> {
        let path = self.resolve(rel_path)?;
        fs::remove_file(&path)?;
        remove_sidecar(&path);
        self.prune_day_dir(&path);
        Ok(())
    }

    /// Resolves a client-supplied relative path, refusing anything that
    /// escapes the quarantine root.
    fn resolve(&self, rel_path: &str) -> Result<PathBuf, QuarantineError> {
        let rel = Path::new(rel_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(QuarantineError::InvalidPath(rel_path.to_string()));
        }

        let path = self.root.join(rel);
        if !path.is_file() {
            return Err(QuarantineError::NotFound(rel_path.to_string()));
        }
        Ok(path)
    }

    fn prune_day_dir(&self, removed: &Path) {
        if let Some(day_dir) = removed.parent() {
            if day_dir != self.root {
                let _ = fs::remove_dir(day_dir);
            }
        }
    }
}

fn sidecar_path_for(file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    file.with_file_name(format!("{}.error", name))
}

fn read_sidecar(file: &Path) -> Option<ErrorSidecar> {
    let raw = fs::read(sidecar_path_for(file)).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(sidecar) => Some(sidecar),
        Err(e) => {
            warn!("Unreadable sidecar for {}: {}", file.display(), e);
            None
        }
    }
}

fn remove_sidecar(file: &Path) {
    let _ = fs::remove_file(sidecar_path_for(file));
}

fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let first = dir.join(filename);
    if !first.exists() {
        return first;
    }

    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    let ext = Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1.. {
        let candidate = dir.join(format!("{}-{}{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sidecar(stage: &str) -> ErrorSidecar {
        ErrorSidecar {
            stage: stage.to_string(),
            error: "decode failed".to_string(),
            worker_id: "worker-0".to_string(),
            moved_at: Utc::now(),
            attempts: 5,
        }
    }

    #[test]
    fn test_quarantine_moves_file_and_writes_sidecar() {
        let tmp = TempDir::new().unwrap();
        let quarantine = Quarantine::new(tmp.path().join("failed"));

        let src = tmp.path().join("broken.jpg");
        fs::write(&src, b"not a jpeg").unwrap();

        let dest = quarantine.quarantine_file(&src, &sidecar("decode")).unwrap();

        assert!(!src.exists());
        assert!(dest.exists());
        let day = dest.parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(day, Utc::now().format("%Y-%m-%d").to_string());

        let listed = quarantine.list().unwrap();
        assert_eq!(listed.len(), 1);
        let entry = &listed[0];
        assert!(entry.path.ends_with("broken.jpg"));
        let side = entry.sidecar.as_ref().unwrap();
        assert_eq!(side.stage, "decode");
        assert_eq!(side.attempts, 5);
    }

    #[test]
    fn test_quarantine_name_collision_gets_suffix() {
        let tmp = TempDir::new().unwrap();
        let quarantine = Quarantine::new(tmp.path().join("failed"));

        for _ in 0..2 {
            let src = tmp.path().join("dup.jpg");
            fs::write(&src, b"bytes").unwrap();
            quarantine.quarantine_file(&src, &sidecar("decode")).unwrap();
        }

        let listed = quarantine.list().unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn test_retry_moves_back_to_uploads() {
        let tmp = TempDir::new().unwrap();
        let quarantine = Quarantine::new(tmp.path().join("failed"));
        let uploads = tmp.path().join("uploads");

        let src = tmp.path().join("again.jpg");
        fs::write(&src, b"bytes").unwrap();
        quarantine.quarantine_file(&src, &sidecar("decode")).unwrap();

        let rel = quarantine.list().unwrap()[0].path.clone();
        let restored = quarantine.retry(&rel, &uploads).unwrap();

        assert_eq!(restored, uploads.join("again.jpg"));
        assert!(restored.exists());
        assert!(quarantine.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_file_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let quarantine = Quarantine::new(tmp.path().join("failed"));

        let src = tmp.path().join("gone.jpg");
        fs::write(&src, b"bytes").unwrap();
        quarantine.quarantine_file(&src, &sidecar("decode")).unwrap();

        let rel = quarantine.list().unwrap()[0].path.clone();
        quarantine.delete(&rel).unwrap();

        assert!(quarantine.list().unwrap().is_empty());
    }

    #[test]
    fn test_path_traversal_is_refused() {
        let tmp = TempDir::new().unwrap();
        let quarantine = Quarantine::new(tmp.path().join("failed"));

        assert!(matches!(
            quarantine.delete("../../etc/passwd"),
            Err(QuarantineError::InvalidPath(_))
        ));
        assert!(matches!(
            quarantine.delete("/etc/passwd"),
            Err(QuarantineError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_list_empty_root() {
        let tmp = TempDir::new().unwrap();
        let quarantine = Quarantine::new(tmp.path().join("never-created"));
        assert!(quarantine.list().unwrap().is_empty());
    }
}
