use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::db::models::{
    MediaKind, NewPlace, PendingPlacePhoto, Photo, ProcessingState, ReadyPhoto,
};
use crate::db::DbPool;

// ---------------------------------------------------------------------------
// Photos
// ---------------------------------------------------------------------------

/// Reserves a content hash for the calling worker.
///
/// This single statement is the only uniqueness arbiter in the system: the
/// worker that gets a row back owns the id; an empty result means the hash
/// was already reserved (by this worker in a previous life or by another
/// one) and the file is a duplicate.
pub async fn reserve_photo(
    pool: &DbPool,
    id: &str,
    kind: MediaKind,
    original_path: &str,
    original_filename: &str,
) -> Result<bool, sqlx::Error> {
    let won = sqlx::query_scalar::<_, bool>(
        "INSERT INTO photos (id, type, status, original_path, original_filename)
         VALUES ($1, $2, 'processing', $3, $4)
         ON CONFLICT (id) DO NOTHING
         RETURNING TRUE",
    )
    .bind(id)
    .bind(kind.as_str())
    .bind(original_path)
    .bind(original_filename)
    .fetch_optional(pool)
    .await?;

    Ok(won.unwrap_or(false))
}

/// Promotes a reserved row to `ready` with everything extracted from the
/// file. The status flip is the completion point; catalog triggers take it
/// from here (AI queue, place album bookkeeping).
pub async fn promote_ready(pool: &DbPool, photo: &ReadyPhoto) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE photos SET
             status = 'ready',
             file_size = $2,
             width = $3, height = $4,
             small_width = $5, small_height = $6, small_size = $7,
             large_width = $8, large_height = $9, large_size = $10,
             blurhash = $11,
             camera_make = $12, camera_model = $13, lens = $14,
             iso = $15, aperture = $16, shutter_speed = $17,
             focal_length = $18, flash_used = $19,
             gps_lat = $20, gps_lon = $21, gps_altitude = $22,
             taken_at = $23,
             duration_sec = $24, video_codec = $25
         WHERE id = $1",
    )
    .bind(&photo.id)
    .bind(photo.file_size)
    .bind(photo.width)
    .bind(photo.height)
    .bind(photo.small_width)
    .bind(photo.small_height)
    .bind(photo.small_size)
    .bind(photo.large_width)
    .bind(photo.large_height)
    .bind(photo.large_size)
    .bind(&photo.blurhash)
    .bind(&photo.camera_make)
    .bind(&photo.camera_model)
    .bind(&photo.lens)
    .bind(photo.iso)
    .bind(photo.aperture)
    .bind(&photo.shutter_speed)
    .bind(photo.focal_length)
    .bind(photo.flash_used)
    .bind(photo.gps_lat)
    .bind(photo.gps_lon)
    .bind(photo.gps_altitude)
    .bind(photo.taken_at)
    .bind(photo.duration_sec)
    .bind(&photo.video_codec)
    .execute(pool)
    .await?;

    Ok(())
}

/// Drops a reservation that never made it to `ready` (terminal decode
/// failure). The id becomes reservable again once the operator re-submits
/// the file from quarantine.
pub async fn release_reservation(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM photos WHERE id = $1 AND status = 'processing'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_photo(pool: &DbPool, id: &str) -> Result<Option<Photo>, sqlx::Error> {
    sqlx::query_as::<_, Photo>("SELECT * FROM photos WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn soft_delete_photo(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE photos SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn restore_photo(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE photos SET deleted_at = NULL WHERE id = $1 AND deleted_at IS NOT NULL",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Photos whose trash residency exceeded the retention window.
pub async fn list_expired_trash(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Photo>, sqlx::Error> {
    sqlx::query_as::<_, Photo>(
        "SELECT * FROM photos WHERE deleted_at IS NOT NULL AND deleted_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Final removal of a trashed photo. Membership rows cascade.
pub async fn purge_photo(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM photos WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_photos_by_status(pool: &DbPool, status: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM photos WHERE status = $1")
        .bind(status)
        .fetch_one(pool)
        .await
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub async fn insert_event(
    pool: &DbPool,
    event_type: &str,
    payload: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO events (type, payload) VALUES ($1, $2)")
        .bind(event_type)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Places
// ---------------------------------------------------------------------------

/// Photos with GPS that still lack a place assignment.
pub async fn photos_pending_place(
    pool: &DbPool,
    limit: i64,
) -> Result<Vec<PendingPlacePhoto>, sqlx::Error> {
    sqlx::query_as::<_, PendingPlacePhoto>(
        "SELECT id, gps_lat, gps_lon FROM photos
         WHERE status = 'ready' AND gps_lat IS NOT NULL AND gps_lon IS NOT NULL
           AND place_id IS NULL AND deleted_at IS NULL
         ORDER BY created_at
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Nearest place whose clustering radius covers the coordinates, if any.
/// Great-circle distance via the earthdistance extension.
pub async fn nearest_place_within_radius(
    pool: &DbPool,
    lat: f64,
    lon: f64,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id FROM places
         WHERE earth_distance(ll_to_earth(lat, lon), ll_to_earth($1, $2)) <= radius_m
         ORDER BY earth_distance(ll_to_earth(lat, lon), ll_to_earth($1, $2))
         LIMIT 1",
    )
    .bind(lat)
    .bind(lon)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.get::<i64, _>("id")))
}

pub async fn create_place(pool: &DbPool, place: &NewPlace) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO places (name, country, city, address, lat, lon, radius_m)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING id",
    )
    .bind(&place.name)
    .bind(&place.country)
    .bind(&place.city)
    .bind(&place.address)
    .bind(place.lat)
    .bind(place.lon)
    .bind(place.radius_m)
    .fetch_one(pool)
    .await
}

pub async fn assign_place(pool: &DbPool, photo_id: &str, place_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE photos SET place_id = $2 WHERE id = $1")
        .bind(photo_id)
        .bind(place_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Processing state (crash-recovery diagnostics)
// ---------------------------------------------------------------------------

pub async fn processing_state_queued(pool: &DbPool, file_path: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO processing_state (file_path, status)
         VALUES ($1, 'queued')
         ON CONFLICT (file_path) DO UPDATE
         SET status = 'queued', last_error = NULL, completed_at = NULL",
    )
    .bind(file_path)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn processing_state_started(
    pool: &DbPool,
    file_path: &str,
    worker_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO processing_state (file_path, status, attempts, worker_id, started_at)
         VALUES ($1, 'processing', 1, $2, now())
         ON CONFLICT (file_path) DO UPDATE
         SET status = 'processing',
             attempts = processing_state.attempts + 1,
             worker_id = $2,
             started_at = now()",
    )
    .bind(file_path)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn processing_state_completed(
    pool: &DbPool,
    file_path: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE processing_state
         SET status = 'completed', completed_at = now(), last_error = NULL
         WHERE file_path = $1",
    )
    .bind(file_path)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn processing_state_failed(
    pool: &DbPool,
    file_path: &str,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE processing_state
         SET status = 'failed', completed_at = now(), last_error = $2
         WHERE file_path = $1",
    )
    .bind(file_path)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn last_failures(pool: &DbPool, limit: i64) -> Result<Vec<ProcessingState>, sqlx::Error> {
    sqlx::query_as::<_, ProcessingState>(
        "SELECT * FROM processing_state
         WHERE status = 'failed'
         ORDER BY completed_at DESC NULLS LAST
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub async fn load_settings(
    pool: &DbPool,
) -> Result<std::collections::HashMap<String, String>, sqlx::Error> {
    let rows = sqlx::query("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
        .collect())
}
