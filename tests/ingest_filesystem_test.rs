use chrono::Utc;
use std::fs;
use tempfile::TempDir;

use lumapix::media_type;
use lumapix::object_store::{remove_empty_ancestors, ObjectStore};
use lumapix::processor::hash_file;
use lumapix::quarantine::{ErrorSidecar, Quarantine};
use lumapix::queue::dedup_key;

/// Identical bytes under different names and directories resolve to one
/// identity and therefore one set of derivative paths.
#[test]
fn test_identical_bytes_share_one_identity() {
    let tmp = TempDir::new().unwrap();
    let uploads = tmp.path().join("uploads");
    fs::create_dir_all(uploads.join("a/b")).unwrap();
    fs::create_dir_all(uploads.join("c")).unwrap();

    let first = uploads.join("a/b/photo1.jpg");
    let second = uploads.join("c/copy-of-photo1.jpg");
    fs::write(&first, b"the very same jpeg bytes").unwrap();
    fs::write(&second, b"the very same jpeg bytes").unwrap();

    let id_first = hash_file(&first).unwrap();
    let id_second = hash_file(&second).unwrap();
    assert_eq!(id_first, id_second);

    let store = ObjectStore::new(tmp.path().join("media"));
    assert_eq!(
        store.small_preview_path(&id_first).unwrap(),
        store.small_preview_path(&id_second).unwrap()
    );
}

/// Derivatives land at the canonical fanout paths and survive republication
/// (at-least-once delivery redoes the same writes).
#[test]
fn test_publish_layout_and_idempotence() {
    let tmp = TempDir::new().unwrap();
    let store = ObjectStore::new(tmp.path().join("media"));

    let source = tmp.path().join("photo.jpg");
    fs::write(&source, b"jpeg bytes for hashing").unwrap();
    let id = hash_file(&source).unwrap();

    let small = store.small_preview_path(&id).unwrap();
    let large = store.large_preview_path(&id).unwrap();

    for _ in 0..2 {
        store.publish(&small, b"small webp").unwrap();
        store.publish(&large, b"large webp").unwrap();
    }

    assert_eq!(fs::read(&small).unwrap(), b"small webp");
    assert_eq!(fs::read(&large).unwrap(), b"large webp");

    // Two-level nibble fanout under the media root.
    let rel = small.strip_prefix(tmp.path().join("media")).unwrap();
    let components: Vec<_> = rel.iter().map(|c| c.to_string_lossy()).collect();
    assert_eq!(components.len(), 3);
    assert_eq!(components[0], id[0..2]);
    assert_eq!(components[1], id[2..4]);
    assert_eq!(components[2], format!("{}_s.webp", id));
}

/// The quarantine round trip: failed file moves into a dated directory
/// with the JSON sidecar, retry brings it back under uploads, and the day
/// directory does not linger.
#[test]
fn test_quarantine_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let uploads = tmp.path().join("uploads");
    let failed = tmp.path().join("failed");
    fs::create_dir_all(uploads.join("incoming")).unwrap();

    let source = uploads.join("incoming/corrupt.jpg");
    fs::write(&source, b"truncated jpeg").unwrap();

    let quarantine = Quarantine::new(&failed);
    let moved_at = Utc::now();
    quarantine
        .quarantine_file(
            &source,
            &ErrorSidecar {
                stage: "decode".to_string(),
                error: "unexpected end of image data".to_string(),
                worker_id: "worker-1".to_string(),
                moved_at,
                attempts: 5,
            },
        )
        .unwrap();
    remove_empty_ancestors(source.parent().unwrap(), &uploads);

    // Source is gone from uploads, including its now-empty directory.
    assert!(!source.exists());
    assert!(!uploads.join("incoming").exists());
    assert!(uploads.exists());

    // Exactly the sidecar fields the retry tooling expects, nothing more.
    let day = moved_at.format("%Y-%m-%d").to_string();
    let sidecar_path = failed.join(&day).join("corrupt.jpg.error");
    let raw: serde_json::Value =
        serde_json::from_slice(&fs::read(&sidecar_path).unwrap()).unwrap();
    let keys: Vec<_> = raw.as_object().unwrap().keys().cloned().collect();
    assert_eq!(
        keys,
        ["attempts", "error", "moved_at", "stage", "worker_id"]
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
    );

    // Retry returns the file to the uploads root and clears the sidecar.
    let listed = quarantine.list().unwrap();
    assert_eq!(listed.len(), 1);
    quarantine.retry(&listed[0].path, &uploads).unwrap();

    assert!(uploads.join("corrupt.jpg").exists());
    assert!(!sidecar_path.exists());
    assert!(quarantine.list().unwrap().is_empty());
}

/// Enqueue dedup is keyed on the path, so a repeat detection of the same
/// file coalesces while a different path never does.
#[test]
fn test_dedup_key_tracks_path_identity() {
    let key_a1 = dedup_key("/uploads/a/b/photo1.jpg");
    let key_a2 = dedup_key("/uploads/a/b/photo1.jpg");
    let key_b = dedup_key("/uploads/a/b/photo2.jpg");

    assert_eq!(key_a1, key_a2);
    assert_ne!(key_a1, key_b);
}

/// Hidden files and unsupported extensions never reach the queue.
#[test]
fn test_scanner_file_filter() {
    use std::path::Path;

    assert!(media_type::is_supported_file(Path::new("a/b/photo.jpg")));
    assert!(media_type::is_supported_file(Path::new("clip.MKV")));
    assert!(!media_type::is_supported_file(Path::new("a/.photo.jpg")));
    assert!(!media_type::is_supported_file(Path::new("notes.txt")));
    assert!(!media_type::is_supported_file(Path::new("archive.zip")));
}
