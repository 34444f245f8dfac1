use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::config::PreviewConfig;
use crate::db::{crud, DbPool, MediaKind, ReadyPhoto};
use crate::media_type;
use crate::metadata_extractor::MetadataExtractor;
use crate::metrics::metrics;
use crate::object_store::{remove_empty_ancestors, ObjectStore};
use crate::preview_generator::{
    auto_orient, compute_blurhash, encode_webp, make_preview, resize_to_fit, Preview,
};
use crate::quarantine::{ErrorSidecar, Quarantine};
use crate::queue::{TaskEnvelope, TaskError, TaskHandler};
use crate::raw_processor;
use crate::video_processor;

/// Consumes ProcessFile tasks: hashes, decodes, derives previews, publishes
/// the catalog row, and removes the source. All idempotency rests on the
/// hash reservation in the catalog.
pub struct Processor {
    db: DbPool,
    store: ObjectStore,
    quarantine: Quarantine,
    uploads_root: PathBuf,
    preview: PreviewConfig,
    paused: AtomicBool,
    last_error: RwLock<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatus {
    pub paused: bool,
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

/// What one decoded file contributes to the catalog row.
struct Derived {
    width: Option<i32>,
    height: Option<i32>,
    small: Preview,
    large: Option<Preview>,
    ready: ReadyPhoto,
}

impl Processor {
    pub fn new(
        db: DbPool,
        store: ObjectStore,
        quarantine: Quarantine,
        uploads_root: PathBuf,
        preview: PreviewConfig,
    ) -> Self {
        Self {
            db,
            store,
            quarantine,
            uploads_root,
            preview,
            paused: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Processor paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Processor resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ProcessorStatus {
        let m = metrics();
        ProcessorStatus {
            paused: self.is_paused(),
            processed: m.processor_files_processed.get(),
            duplicates: m.processor_files_duplicate.get(),
            failed: m.processor_files_failed.get(),
            last_error: self.last_error.read().ok().and_then(|g| g.clone()),
        }
    }

    fn record_error(&self, message: &str) {
        if let Ok(mut guard) = self.last_error.write() {
            *guard = Some(message.to_string());
        }
    }

    async fn wait_if_paused(&self) {
        while self.is_paused() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Path stored in the catalog: relative to the uploads root.
    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.uploads_root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// The file is ingested, a duplicate, or obsolete: the original leaves
    /// the uploads tree, along with any directories it kept alive.
    fn remove_source(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(_) => debug!("Removed source {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove source {}: {}", path.display(), e),
        }
        if let Some(parent) = path.parent() {
            remove_empty_ancestors(parent, &self.uploads_root);
        }
    }

    async fn process(&self, worker_id: &str, envelope: &TaskEnvelope) -> Result<(), TaskError> {
        self.wait_if_paused().await;

        let path = PathBuf::from(&envelope.payload.file_path);

        if let Err(e) = crud::processing_state_started(&self.db, &envelope.payload.file_path, worker_id).await
        {
            warn!("Could not record processing state: {}", e);
        }

        // 1. A vanished source means the task is obsolete, not failed.
        if !path.exists() {
            debug!("{} is gone, task obsolete", path.display());
            let _ = crud::processing_state_completed(&self.db, &envelope.payload.file_path).await;
            return Ok(());
        }

        // 2. Content hash; the first 12 hex chars are the identity.
        let hash_path = path.clone();
        let id = tokio::task::spawn_blocking(move || hash_file(&hash_path))
            .await
            .map_err(|e| retry("hash", e))?
            .map_err(|e| retry("hash", e))?;

        // 3. Type discrimination. The scanner filters extensions already,
        // so anything else arriving here is terminal.
        let kind = media_type::kind_from_path(&path)
            .ok_or_else(|| terminal("validate", "unsupported file extension"))?;

        let rel_path = self.relative_path(&path);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| rel_path.clone());

        // 4. Reserve the id. Losing the race means duplicate bytes -- with
        // one exception: a row left in 'processing' for this same path is
        // our own earlier attempt (crash or retry), and we pick it up.
        let won = crud::reserve_photo(&self.db, &id, kind, &rel_path, &filename)
            .await
            .map_err(|e| retry("catalog", e))?;

        if !won {
            let existing = crud::find_photo(&self.db, &id)
                .await
                .map_err(|e| retry("catalog", e))?;
            let resumed_own_work = existing
                .as_ref()
                .map(|p| p.status == "processing" && p.original_path == rel_path)
                .unwrap_or(false);

            if !resumed_own_work {
                info!("{} is a duplicate of {}, removing", path.display(), id);
                self.remove_source(&path);
                metrics().processor_files_duplicate.inc();
                let _ =
                    crud::processing_state_completed(&self.db, &envelope.payload.file_path).await;
                return Ok(());
            }
            debug!("Resuming interrupted ingest of {}", id);
        }

        // 5. Decode and derive, off the async runtime.
        let derived = {
            let path = path.clone();
            let id = id.clone();
            let preview = self.preview.clone();
            let file_size = envelope.payload.file_size;
            metrics().processor_active_workers.inc();
            let result = tokio::task::spawn_blocking(move || match kind {
                MediaKind::Photo => derive_image(&path, &id, file_size, &preview),
                MediaKind::Video => derive_video(&path, &id, file_size, &preview),
            })
            .await;
            metrics().processor_active_workers.dec();
            result.map_err(|e| retry("decode", e))??
        };

        // 6. Publish derivatives, then promote the catalog row. The store
        // writes are idempotent (hash-addressed, temp-then-rename), so a
        // crash between these steps redoes harmless work.
        let store = self.store.clone();
        let id_for_store = id.clone();
        let small_data = derived.small.data.clone();
        let large_data = derived.large.as_ref().map(|l| l.data.clone());
        let video_src = match kind {
            MediaKind::Video => Some((path.clone(), media_type::normalized_extension(&path))),
            MediaKind::Photo => None,
        };
        tokio::task::spawn_blocking(move || -> Result<(), TaskError> {
            let small_path = store
                .small_preview_path(&id_for_store)
                .map_err(|e| retry("store", e))?;
            store
                .publish(&small_path, &small_data)
                .map_err(|e| retry("store", e))?;

            if let Some(large) = large_data {
                let large_path = store
                    .large_preview_path(&id_for_store)
                    .map_err(|e| retry("store", e))?;
                store
                    .publish(&large_path, &large)
                    .map_err(|e| retry("store", e))?;
            }

            if let Some((src, ext)) = video_src {
                let ext = ext.unwrap_or_else(|| "mp4".to_string());
                let video_path = store
                    .video_path(&id_for_store, &ext)
                    .map_err(|e| retry("store", e))?;
                store
                    .publish_file(&video_path, &src)
                    .map_err(|e| retry("store", e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| retry("store", e))??;

        crud::promote_ready(&self.db, &derived.ready)
            .await
            .map_err(|e| retry("catalog", e))?;

        // 7. Announce. Best-effort; the photo is already ready.
        let payload = serde_json::json!({ "id": id, "type": kind.as_str() });
        if let Err(e) = crud::insert_event(&self.db, "photo_added", payload).await {
            warn!("Could not append photo_added event for {}: {}", id, e);
        }

        // 8. The original has served its purpose.
        self.remove_source(&path);

        let _ = crud::processing_state_completed(&self.db, &envelope.payload.file_path).await;
        metrics().processor_files_processed.inc();
        info!(
            "Ingested {} as {} ({}x{})",
            filename,
            id,
            derived.width.unwrap_or(0),
            derived.height.unwrap_or(0)
        );

        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskHandler for Processor {
    async fn handle(&self, worker_id: &str, task: &TaskEnvelope) -> Result<(), TaskError> {
        let result = self.process(worker_id, task).await;
        if let Err(err) = &result {
            self.record_error(&err.to_string());
        }
        result
    }

    async fn on_final_failure(&self, worker_id: &str, task: &TaskEnvelope, error: &TaskError) {
        let path = PathBuf::from(&task.payload.file_path);
        let message = error.to_string();
        let (stage, detail) = message
            .split_once(": ")
            .map(|(s, d)| (s.to_string(), d.to_string()))
            .unwrap_or_else(|| ("process".to_string(), message.clone()));

        // Free the reservation so a corrected file (or a retry from the
        // failed tree) can claim the id again.
        if path.exists() {
            if let Ok(id) = hash_file(&path) {
                if let Err(e) = crud::release_reservation(&self.db, &id).await {
                    warn!("Could not release reservation {}: {}", id, e);
                }
            }

            let sidecar = ErrorSidecar {
                stage,
                error: detail,
                worker_id: worker_id.to_string(),
                moved_at: Utc::now(),
                attempts: task.attempts + 1,
            };
            if let Err(e) = self.quarantine.quarantine_file(&path, &sidecar) {
                error!("Could not quarantine {}: {}", path.display(), e);
            }
            if let Some(parent) = path.parent() {
                remove_empty_ancestors(parent, &self.uploads_root);
            }
        }

        if let Err(e) =
            crud::processing_state_failed(&self.db, &task.payload.file_path, &message).await
        {
            warn!("Could not record failure state: {}", e);
        }

        metrics().processor_files_failed.inc();
        self.record_error(&message);
    }
}

fn retry(stage: &str, err: impl std::fmt::Display) -> TaskError {
    TaskError::Retry(format!("{}: {}", stage, err))
}

fn terminal(stage: &str, err: impl std::fmt::Display) -> TaskError {
    TaskError::Terminal(format!("{}: {}", stage, err))
}

/// Streaming SHA-256, truncated to the 12 hex chars the catalog keys on.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize())[..12].to_string())
}

/// Image branch: orient, measure, derive both previews and the blurhash,
/// pull EXIF. EXIF trouble degrades to empty fields; decode trouble is a
/// real failure.
fn derive_image(
    path: &Path,
    id: &str,
    file_size: i64,
    config: &PreviewConfig,
) -> Result<Derived, TaskError> {
    let file_metadata = std::fs::metadata(path).ok();
    let exif = MetadataExtractor::extract(path, file_metadata.as_ref());

    let img = if raw_processor::is_raw_file(path) {
        raw_processor::decode_raw_to_dynamic_image(path).map_err(|e| retry("decode", e))?
    } else {
        image::open(path).map_err(|e| retry("decode", e))?
    };

    let oriented = auto_orient(img, exif.orientation);
    let (width, height) = (oriented.width() as i32, oriented.height() as i32);

    let small_img = resize_to_fit(&oriented, config.small_px);
    let large_img = resize_to_fit(&oriented, config.large_px);
    let blurhash = compute_blurhash(&small_img);

    let small = Preview {
        width: small_img.width(),
        height: small_img.height(),
        data: encode_webp(&small_img, config.quality).map_err(|e| retry("encode", e))?,
    };
    let large = Preview {
        width: large_img.width(),
        height: large_img.height(),
        data: encode_webp(&large_img, config.quality).map_err(|e| retry("encode", e))?,
    };

    let ready = ReadyPhoto {
        id: id.to_string(),
        file_size,
        width: Some(width),
        height: Some(height),
        small_width: Some(small.width as i32),
        small_height: Some(small.height as i32),
        small_size: Some(small.data.len() as i64),
        large_width: Some(large.width as i32),
        large_height: Some(large.height as i32),
        large_size: Some(large.data.len() as i64),
        blurhash: Some(blurhash),
        camera_make: exif.camera_make,
        camera_model: exif.camera_model,
        lens: exif.lens,
        iso: exif.iso,
        aperture: exif.aperture,
        shutter_speed: exif.shutter_speed,
        focal_length: exif.focal_length,
        flash_used: exif.flash_used,
        gps_lat: exif.gps_lat,
        gps_lon: exif.gps_lon,
        gps_altitude: exif.gps_altitude,
        taken_at: exif.taken_at,
        duration_sec: None,
        video_codec: None,
    };

    Ok(Derived {
        width: Some(width),
        height: Some(height),
        small,
        large: Some(large),
        ready,
    })
}

/// Video branch: probe, pull one frame near the midpoint for the small
/// preview. The original is copied into the store by the caller.
fn derive_video(
    path: &Path,
    id: &str,
    file_size: i64,
    config: &PreviewConfig,
) -> Result<Derived, TaskError> {
    let info = video_processor::probe(path).map_err(|e| retry("probe", e))?;

    let frame_time = video_processor::preview_frame_time(info.duration);
    let frame_path =
        video_processor::extract_frame(path, frame_time).map_err(|e| retry("frame", e))?;

    let frame = image::open(&frame_path);
    let _ = std::fs::remove_file(&frame_path);
    let frame = frame.map_err(|e| retry("frame", e))?;

    let small =
        make_preview(&frame, config.small_px, config.quality).map_err(|e| retry("encode", e))?;

    let taken_at = info.created.or_else(|| {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(chrono::DateTime::from)
            .ok()
    });

    let ready = ReadyPhoto {
        id: id.to_string(),
        file_size,
        width: Some(info.width),
        height: Some(info.height),
        small_width: Some(small.width as i32),
        small_height: Some(small.height as i32),
        small_size: Some(small.data.len() as i64),
        blurhash: Some(compute_blurhash(&frame)),
        gps_lat: info.gps.map(|g| g.lat),
        gps_lon: info.gps.map(|g| g.lon),
        gps_altitude: info.gps.and_then(|g| g.altitude),
        taken_at,
        duration_sec: Some(info.duration),
        video_codec: Some(info.codec),
        ..Default::default()
    };

    Ok(Derived {
        width: Some(info.width),
        height: Some(info.height),
        small,
        large: None,
        ready,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_is_content_addressed() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        let b = tmp.path().join("sub/b.jpg");
        std::fs::create_dir_all(b.parent().unwrap()).unwrap();
        std::fs::write(&a, b"identical bytes").unwrap();
        std::fs::write(&b, b"identical bytes").unwrap();

        let ha = hash_file(&a).unwrap();
        let hb = hash_file(&b).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ha.len(), 12);
        assert!(ha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_file_differs_by_content() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        let b = tmp.path().join("b.jpg");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn test_derive_image_from_png() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photo.png");
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(1200, 900, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 77])
        }));
        img.save(&path).unwrap();

        let config = PreviewConfig {
            quality: 85,
            small_px: 800,
            large_px: 2500,
        };
        let derived = derive_image(&path, "a1b2c3d4e5f6", 1234, &config).unwrap();

        assert_eq!(derived.width, Some(1200));
        assert_eq!(derived.height, Some(900));
        // Small preview bounded by 800 on the longest edge.
        assert_eq!(derived.small.width, 800);
        assert_eq!(derived.small.height, 600);
        // Large target exceeds the original: no upscaling.
        let large = derived.large.as_ref().unwrap();
        assert_eq!((large.width, large.height), (1200, 900));
        assert!(derived.ready.blurhash.as_ref().is_some_and(|b| !b.is_empty()));
        assert_eq!(derived.ready.file_size, 1234);
        assert_eq!(derived.ready.small_size, Some(derived.small.data.len() as i64));
    }

    #[test]
    fn test_derive_image_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.jpg");
        std::fs::write(&path, b"this is not a jpeg").unwrap();

        let config = PreviewConfig {
            quality: 85,
            small_px: 800,
            large_px: 2500,
        };
        let result = derive_image(&path, "a1b2c3d4e5f6", 18, &config);
        assert!(matches!(result, Err(TaskError::Retry(msg)) if msg.starts_with("decode:")));
    }

    #[test]
    fn test_stage_prefix_parsing() {
        let err = retry("probe", "ffprobe exited with status 1");
        let message = err.to_string();
        let (stage, detail) = message.split_once(": ").unwrap();
        assert_eq!(stage, "probe");
        assert!(detail.contains("ffprobe"));
    }
}
