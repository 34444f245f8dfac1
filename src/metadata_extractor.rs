use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use exif::{Exif, In, Rational, Reader, Tag, Value};
use log::{debug, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// EXIF fields the catalog keeps. Everything is optional; a file without
/// usable EXIF still ingests.
#[derive(Debug, Default)]
pub struct PhotoMetadata {
    pub taken_at: Option<DateTime<Utc>>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub iso: Option<i32>,
    pub aperture: Option<f64>,
    pub shutter_speed: Option<String>,
    pub focal_length: Option<f64>,
    pub orientation: Option<u16>,
    pub flash_used: Option<bool>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub gps_altitude: Option<f64>,
}

pub struct MetadataExtractor;

impl MetadataExtractor {
    /// Reads EXIF from an image file. Decode failure yields an empty
    /// metadata set, never an error; the photo just has no EXIF.
    pub fn extract(path: &Path, file_metadata: Option<&std::fs::Metadata>) -> PhotoMetadata {
        let parsed = File::open(path).ok().and_then(|file| {
            Reader::new()
                .read_from_container(&mut BufReader::new(file))
                .ok()
        });

        let Some(exif) = parsed else {
            debug!("No EXIF data in {}", path.display());
            return PhotoMetadata {
                taken_at: filesystem_timestamp(file_metadata),
                ..Default::default()
            };
        };

        let fields = ExifFields { exif: &exif };
        let coordinates = fields.coordinates();

        PhotoMetadata {
            taken_at: fields.capture_time().or_else(|| filesystem_timestamp(file_metadata)),
            camera_make: fields.text(Tag::Make),
            camera_model: fields.text(Tag::Model),
            lens: fields.text(Tag::LensModel),
            iso: fields
                .short(Tag::ISOSpeed)
                .or_else(|| fields.short(Tag::PhotographicSensitivity))
                .map(i32::from),
            aperture: fields.rational(Tag::FNumber),
            shutter_speed: fields.text(Tag::ExposureTime),
            focal_length: fields.rational(Tag::FocalLength),
            orientation: fields.short(Tag::Orientation),
            flash_used: fields.flash_fired(),
            gps_lat: coordinates.map(|(lat, _)| lat),
            gps_lon: coordinates.map(|(_, lon)| lon),
            gps_altitude: coordinates.and_then(|_| fields.altitude()),
        }
    }
}

/// Typed access to the primary IFD. Each getter returns None for a missing
/// tag or a value of the wrong shape, so callers compose them freely.
struct ExifFields<'a> {
    exif: &'a Exif,
}

impl ExifFields<'_> {
    fn field(&self, tag: Tag) -> Option<&exif::Field> {
        self.exif.get_field(tag, In::PRIMARY)
    }

    fn text(&self, tag: Tag) -> Option<String> {
        let rendered = self.field(tag)?.display_value().to_string();
        let tidy = tidy_text(&rendered);
        (!tidy.is_empty()).then_some(tidy)
    }

    fn short(&self, tag: Tag) -> Option<u16> {
        match &self.field(tag)?.value {
            Value::Short(values) => values.first().copied(),
            _ => None,
        }
    }

    fn rational(&self, tag: Tag) -> Option<f64> {
        match &self.field(tag)?.value {
            Value::Rational(values) => values.first().map(Rational::to_f64),
            _ => None,
        }
    }

    /// The Flash tag renders as a sentence; "No" anywhere in it means the
    /// flash stayed off.
    fn flash_fired(&self) -> Option<bool> {
        let rendered = self.field(Tag::Flash)?.display_value().to_string();
        Some(!rendered.contains("No"))
    }

    /// Capture time, most trustworthy source first. The GPS datestamp has
    /// no time of day but still beats a filesystem guess.
    fn capture_time(&self) -> Option<DateTime<Utc>> {
        [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
            .into_iter()
            .find_map(|tag| {
                let rendered = self.field(tag)?.display_value().to_string();
                parse_capture_time(&rendered)
            })
            .or_else(|| self.gps_day())
    }

    fn gps_day(&self) -> Option<DateTime<Utc>> {
        let stamp = self.field(Tag::GPSDateStamp)?.display_value().to_string();
        let day = NaiveDate::parse_from_str(&normalize_date_separators(stamp.trim()), "%F").ok()?;
        Some(day.and_time(chrono::NaiveTime::MIN).and_utc())
    }

    /// Both coordinates or neither; a lone latitude is useless to the
    /// place resolver. Out-of-range values are dropped, not fatal.
    fn coordinates(&self) -> Option<(f64, f64)> {
        let lat = self.angle(Tag::GPSLatitude, Tag::GPSLatitudeRef, 'S')?;
        let lon = self.angle(Tag::GPSLongitude, Tag::GPSLongitudeRef, 'W')?;

        if !valid_coordinates(lat, lon) {
            warn!("Dropping out-of-range GPS coordinates ({}, {})", lat, lon);
            return None;
        }
        Some((lat, lon))
    }

    /// One signed angle from a degrees/minutes/seconds triple plus its
    /// hemisphere tag.
    fn angle(&self, value_tag: Tag, ref_tag: Tag, negative_hemisphere: char) -> Option<f64> {
        let Value::Rational(parts) = &self.field(value_tag)?.value else {
            return None;
        };
        let magnitude = sexagesimal_to_degrees(parts)?;

        let hemisphere = self.field(ref_tag)?.display_value().to_string();
        if hemisphere.contains(negative_hemisphere) {
            Some(-magnitude)
        } else {
            Some(magnitude)
        }
    }

    fn altitude(&self) -> Option<f64> {
        let Value::Rational(values) = &self.field(Tag::GPSAltitude)?.value else {
            return None;
        };
        let meters = values.first()?.to_f64();

        // AltitudeRef byte 1 marks below sea level.
        let below_sea_level = matches!(
            self.field(Tag::GPSAltitudeRef).map(|f| &f.value),
            Some(Value::Byte(bytes)) if bytes.first() == Some(&1)
        );
        Some(if below_sea_level { -meters } else { meters })
    }
}

/// Degrees/minutes/seconds to decimal degrees; each position is worth a
/// factor of 60 less than the one before it.
fn sexagesimal_to_degrees(parts: &[Rational]) -> Option<f64> {
    if parts.len() != 3 {
        return None;
    }
    Some(
        parts
            .iter()
            .zip([1.0, 60.0, 3600.0])
            .map(|(part, weight)| part.to_f64() / weight)
            .sum(),
    )
}

/// EXIF text reaches us through the display formatter, which quotes values
/// and renders arrays comma-separated; raw values may also carry trailing
/// NULs. Keep the first entry, stripped down to the actual text.
fn tidy_text(rendered: &str) -> String {
    let first_entry = rendered.split(',').next().unwrap_or_default();
    first_entry
        .chars()
        .filter(|&c| c != '"' && c != '\0')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Cameras separate date parts with colons ("2024:05:01 12:00:00");
/// editing software sometimes rewrites them with dashes. Normalize the
/// date separators and parse once.
pub fn parse_capture_time(rendered: &str) -> Option<DateTime<Utc>> {
    let cleaned = rendered.trim().trim_matches('"');
    let (date, time) = cleaned.split_once(' ')?;

    let stamp = format!("{} {}", normalize_date_separators(date), time.trim());
    NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn normalize_date_separators(date: &str) -> String {
    date.replace(':', "-")
}

/// Last resort for files with no embedded date at all. Modification time
/// is the better guess; creation time on Linux records when the file was
/// copied here, not when the photo was taken.
fn filesystem_timestamp(meta: Option<&std::fs::Metadata>) -> Option<DateTime<Utc>> {
    let meta = meta?;
    meta.modified()
        .or_else(|_| meta.created())
        .ok()
        .map(DateTime::from)
}

pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rational(num: u32, denom: u32) -> Rational {
        Rational { num, denom }
    }

    #[test]
    fn test_tidy_text_strips_quotes_and_nuls() {
        assert_eq!(tidy_text("\"Canon\""), "Canon");
        assert_eq!(tidy_text("Canon\0\0\0"), "Canon");
        assert_eq!(tidy_text("  Canon  "), "Canon");
        assert_eq!(tidy_text("\"\""), "");
    }

    #[test]
    fn test_tidy_text_keeps_first_array_entry() {
        assert_eq!(
            tidy_text("\"EF-S18-55mm f/3.5-5.6 IS\", \"\", \"\", \"\""),
            "EF-S18-55mm f/3.5-5.6 IS"
        );
        assert_eq!(
            tidy_text("\"EF-S18-55mm f/3.5-5.6 IS\0\0\", \"\", \"\", \"\""),
            "EF-S18-55mm f/3.5-5.6 IS"
        );
    }

    #[test]
    fn test_parse_capture_time_camera_format() {
        let parsed = parse_capture_time("2024:05:01 12:00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_parse_capture_time_dashed_format() {
        let parsed = parse_capture_time("2024-05-01 12:00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_parse_capture_time_rejects_garbage() {
        assert!(parse_capture_time("yesterday").is_none());
        assert!(parse_capture_time("2024:05:01").is_none());
    }

    // Dates in the future are accepted as-is; the catalog stores what the
    // camera claimed.
    #[test]
    fn test_parse_capture_time_future_date_accepted() {
        let parsed = parse_capture_time("2099:01:01 00:00:00").unwrap();
        assert!(parsed > Utc::now());
    }

    #[test]
    fn test_sexagesimal_conversion() {
        // 55 deg 45 min = 55.75
        let parts = [rational(55, 1), rational(45, 1), rational(0, 1)];
        let degrees = sexagesimal_to_degrees(&parts).unwrap();
        assert!((degrees - 55.75).abs() < 1e-9);

        // Fractional seconds survive: 37 deg 37 min 12.6 sec.
        let parts = [rational(37, 1), rational(37, 1), rational(126, 10)];
        let degrees = sexagesimal_to_degrees(&parts).unwrap();
        assert!((degrees - 37.6201666).abs() < 1e-6);
    }

    #[test]
    fn test_sexagesimal_rejects_wrong_shape() {
        assert!(sexagesimal_to_degrees(&[rational(55, 1)]).is_none());
        assert!(sexagesimal_to_degrees(&[]).is_none());
    }

    #[test]
    fn test_valid_coordinates() {
        assert!(valid_coordinates(55.75, 37.62));
        assert!(valid_coordinates(-90.0, 180.0));
        assert!(!valid_coordinates(91.0, 0.0));
        assert!(!valid_coordinates(0.0, -181.0));
    }

    #[test]
    fn test_extract_from_non_image_yields_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("not-an-image.jpg");
        std::fs::write(&path, b"plain text").unwrap();

        let metadata = MetadataExtractor::extract(&path, None);
        assert!(metadata.camera_make.is_none());
        assert!(metadata.gps_lat.is_none());
        // No fs metadata handed in, so not even the fallback date.
        assert!(metadata.taken_at.is_none());
    }
}
