use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Media kind as discriminated from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

/// Catalog row for an ingested photo or video, keyed by the first 12 hex
/// chars of the SHA-256 of the original bytes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Photo {
    pub id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub original_path: String,
    pub original_filename: String,
    pub file_size: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub small_width: Option<i32>,
    pub small_height: Option<i32>,
    pub small_size: Option<i64>,
    pub large_width: Option<i32>,
    pub large_height: Option<i32>,
    pub large_size: Option<i64>,
    pub blurhash: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub iso: Option<i32>,
    pub aperture: Option<f64>,
    pub shutter_speed: Option<String>,
    pub focal_length: Option<f64>,
    pub flash_used: Option<bool>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub gps_altitude: Option<f64>,
    pub place_id: Option<i64>,
    pub taken_at: Option<DateTime<Utc>>,
    pub duration_sec: Option<f64>,
    pub video_codec: Option<String>,
    pub is_favorite: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the processor learned about a file, written in one UPDATE
/// when the reserved row is promoted to `ready`.
#[derive(Debug, Clone, Default)]
pub struct ReadyPhoto {
    pub id: String,
    pub file_size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub small_width: Option<i32>,
    pub small_height: Option<i32>,
    pub small_size: Option<i64>,
    pub large_width: Option<i32>,
    pub large_height: Option<i32>,
    pub large_size: Option<i64>,
    pub blurhash: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub iso: Option<i32>,
    pub aperture: Option<f64>,
    pub shutter_speed: Option<String>,
    pub focal_length: Option<f64>,
    pub flash_used: Option<bool>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub gps_altitude: Option<f64>,
    pub taken_at: Option<DateTime<Utc>>,
    pub duration_sec: Option<f64>,
    pub video_codec: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Place {
    pub id: i64,
    pub name: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
    pub photo_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPlace {
    pub name: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
}

/// Crash-recovery diagnostics written by workers; not used for flow control.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProcessingState {
    pub file_path: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A photo the place resolver still has to look at.
#[derive(Debug, Clone, FromRow)]
pub struct PendingPlacePhoto {
    pub id: String,
    pub gps_lat: f64,
    pub gps_lon: f64,
}
