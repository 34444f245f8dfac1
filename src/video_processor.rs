use log::debug;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffprobe failed: {0}")]
    Probe(String),
    #[error("ffmpeg failed: {0}")]
    Extract(String),
    #[error("video metadata missing: {0}")]
    Metadata(String),
}

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub duration: f64,
    pub codec: String,
    pub width: i32,
    pub height: i32,
    /// From the container's creation_time tag, when present.
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    /// From the container's ISO 6709 location tag, when present.
    pub gps: Option<GeoTag>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTag {
    pub lat: f64,
    pub lon: f64,
    pub altitude: Option<f64>,
}

fn ffmpeg_path() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

fn ffprobe_path() -> String {
    std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string())
}

/// Startup check; ingestion of video is impossible without the tools, so a
/// missing binary is an unrecoverable configuration error.
pub fn ensure_tools_available() -> Result<(), VideoError> {
    for (name, path) in [("ffmpeg", ffmpeg_path()), ("ffprobe", ffprobe_path())] {
        Command::new(&path)
            .arg("-version")
            .output()
            .map_err(|e| VideoError::Probe(format!("{} not available at '{}': {}", name, path, e)))?;
    }
    Ok(())
}

/// Probes duration, codec and dimensions. Blocking; run from a worker's
/// blocking section.
pub fn probe(video_path: &Path) -> Result<VideoInfo, VideoError> {
    let output = Command::new(ffprobe_path())
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(video_path)
        .output()
        .map_err(|e| VideoError::Probe(e.to_string()))?;

    if !output.status.success() {
        return Err(VideoError::Probe(format!(
            "ffprobe exited with status {}",
            output.status
        )));
    }

    let json_str = String::from_utf8(output.stdout)
        .map_err(|e| VideoError::Probe(format!("invalid UTF-8 output: {}", e)))?;
    parse_probe_output(&json_str)
}

/// Pulls the fields out of ffprobe's JSON: duration from the format
/// section, codec and dimensions from the first video stream.
pub fn parse_probe_output(json_str: &str) -> Result<VideoInfo, VideoError> {
    let parsed: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| VideoError::Probe(format!("JSON parse error: {}", e)))?;

    let duration = parsed["format"]["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| VideoError::Metadata("duration not found".to_string()))?;

    let streams = parsed["streams"]
        .as_array()
        .ok_or_else(|| VideoError::Metadata("no streams found".to_string()))?;

    let video_stream = streams
        .iter()
        .find(|stream| stream["codec_type"] == "video")
        .ok_or_else(|| VideoError::Metadata("no video stream found".to_string()))?;

    let codec = video_stream["codec_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    let width = video_stream["width"]
        .as_i64()
        .ok_or_else(|| VideoError::Metadata("width not found".to_string()))? as i32;
    let height = video_stream["height"]
        .as_i64()
        .ok_or_else(|| VideoError::Metadata("height not found".to_string()))? as i32;

    let tags = &parsed["format"]["tags"];
    let created = tags["creation_time"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));

    // MP4/MOV carry GPS as an ISO 6709 string under one of two tag names.
    let gps = tags["location"]
        .as_str()
        .or_else(|| tags["com.apple.quicktime.location.ISO6709"].as_str())
        .and_then(parse_iso6709);

    Ok(VideoInfo {
        duration,
        codec,
        width,
        height,
        created,
        gps,
    })
}

/// Parses an ISO 6709 location string like `+55.7500+037.6200/` or
/// `+55.7512-037.6184+123.400/` into decimal coordinates.
pub fn parse_iso6709(raw: &str) -> Option<GeoTag> {
    let trimmed = raw.trim().trim_end_matches('/');

    let mut parts: Vec<f64> = Vec::new();
    let mut start = 0;
    for (i, c) in trimmed.char_indices().skip(1) {
        if c == '+' || c == '-' {
            parts.push(trimmed[start..i].parse().ok()?);
            start = i;
        }
    }
    parts.push(trimmed[start..].parse().ok()?);

    if parts.len() < 2 {
        return None;
    }
    let (lat, lon) = (parts[0], parts[1]);
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }

    Some(GeoTag {
        lat,
        lon,
        altitude: parts.get(2).copied(),
    })
}

/// Thumbnail frame position: the temporal midpoint, except very short clips
/// take the one-second mark (clamped back to the midpoint when even that
/// would overshoot).
pub fn preview_frame_time(duration: f64) -> f64 {
    if duration >= 2.0 {
        duration / 2.0
    } else if duration > 1.0 {
        1.0
    } else {
        (duration / 2.0).max(0.0)
    }
}

/// Extracts a single frame as JPEG into a temp path next to nothing in
/// particular; the caller owns cleanup. `-ss` before `-i` does input-level
/// seeking, which keeps this fast on long videos.
pub fn extract_frame(video_path: &Path, time_seconds: f64) -> Result<PathBuf, VideoError> {
    let output_path = std::env::temp_dir().join(format!(
        "lumapix_frame_{}_{}.jpg",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ));

    let output = Command::new(ffmpeg_path())
        .args(["-y", "-ss", &time_seconds.to_string(), "-i"])
        .arg(video_path)
        .args(["-frames:v", "1", "-q:v", "2"])
        .arg(&output_path)
        .output()
        .map_err(|e| VideoError::Extract(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let _ = std::fs::remove_file(&output_path);
        return Err(VideoError::Extract(format!(
            "ffmpeg exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    debug!(
        "Extracted frame at {:.2}s from {}",
        time_seconds,
        video_path.display()
    );
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_time_midpoint() {
        assert!((preview_frame_time(120.0) - 60.0).abs() < f64::EPSILON);
        assert!((preview_frame_time(2.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frame_time_short_clip_uses_one_second_mark() {
        assert!((preview_frame_time(1.5) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frame_time_very_short_clip_stays_inside() {
        let t = preview_frame_time(0.6);
        assert!(t >= 0.0 && t < 0.6);
    }

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{
            "format": { "duration": "12.480000" },
            "streams": [
                { "codec_type": "audio", "codec_name": "aac" },
                { "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080 }
            ]
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert!((info.duration - 12.48).abs() < 1e-9);
        assert_eq!(info.codec, "h264");
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!(info.created.is_none());
        assert!(info.gps.is_none());
    }

    #[test]
    fn test_parse_probe_output_with_tags() {
        let json = r#"{
            "format": {
                "duration": "8.0",
                "tags": {
                    "creation_time": "2024-06-15T09:30:00.000000Z",
                    "location": "+55.7500+037.6200/"
                }
            },
            "streams": [
                { "codec_type": "video", "codec_name": "hevc", "width": 3840, "height": 2160 }
            ]
        }"#;

        let info = parse_probe_output(json).unwrap();
        let gps = info.gps.unwrap();
        assert!((gps.lat - 55.75).abs() < 1e-9);
        assert!((gps.lon - 37.62).abs() < 1e-9);
        assert!(gps.altitude.is_none());
        assert_eq!(
            info.created.unwrap().to_rfc3339(),
            "2024-06-15T09:30:00+00:00"
        );
    }

    #[test]
    fn test_parse_iso6709_with_altitude() {
        let tag = parse_iso6709("+55.7512-037.6184+123.400/").unwrap();
        assert!((tag.lat - 55.7512).abs() < 1e-9);
        assert!((tag.lon + 37.6184).abs() < 1e-9);
        assert!((tag.altitude.unwrap() - 123.4).abs() < 1e-9);
    }

    #[test]
    fn test_parse_iso6709_rejects_garbage() {
        assert!(parse_iso6709("Red Square, Moscow").is_none());
        assert!(parse_iso6709("+95.0000+037.0000/").is_none());
    }

    #[test]
    fn test_parse_probe_output_without_video_stream() {
        let json = r#"{
            "format": { "duration": "3.0" },
            "streams": [ { "codec_type": "audio", "codec_name": "mp3" } ]
        }"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(VideoError::Metadata(_))
        ));
    }

    #[test]
    fn test_parse_probe_output_bad_json() {
        assert!(matches!(
            parse_probe_output("not json"),
            Err(VideoError::Probe(_))
        ));
    }
}
