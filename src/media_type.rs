use std::path::Path;

use crate::db::MediaKind;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tiff", "tif", "bmp", "raw", "cr2",
    "cr3", "arw", "nef", "dng", "orf", "rw2",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "m4v", "mts", "m2ts", "3gp",
];

/// Classifies a path by its extension (case-insensitive).
pub fn kind_from_path(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Photo)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// A file the scanner should pick up: supported extension and not hidden.
pub fn is_supported_file(path: &Path) -> bool {
    if is_hidden(path) {
        return false;
    }
    kind_from_path(path).is_some()
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(true)
}

/// Lowercased extension, for carrying video originals into the media tree
/// under their native container format.
pub fn normalized_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Every extension a video original may have been stored under; used when
/// purging derivatives without knowing the original container.
pub fn video_extensions() -> &'static [&'static str] {
    VIDEO_EXTENSIONS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_image_extensions() {
        assert_eq!(
            kind_from_path(&PathBuf::from("photo.jpg")),
            Some(MediaKind::Photo)
        );
        assert_eq!(
            kind_from_path(&PathBuf::from("photo.JPG")),
            Some(MediaKind::Photo)
        );
        assert_eq!(
            kind_from_path(&PathBuf::from("photo.heic")),
            Some(MediaKind::Photo)
        );
        assert_eq!(
            kind_from_path(&PathBuf::from("photo.CR2")),
            Some(MediaKind::Photo)
        );
    }

    #[test]
    fn test_video_extensions() {
        assert_eq!(
            kind_from_path(&PathBuf::from("clip.mp4")),
            Some(MediaKind::Video)
        );
        assert_eq!(
            kind_from_path(&PathBuf::from("clip.M2TS")),
            Some(MediaKind::Video)
        );
        assert_eq!(
            kind_from_path(&PathBuf::from("clip.3gp")),
            Some(MediaKind::Video)
        );
    }

    #[test]
    fn test_unsupported() {
        assert_eq!(kind_from_path(&PathBuf::from("notes.txt")), None);
        assert_eq!(kind_from_path(&PathBuf::from("archive")), None);
    }

    #[test]
    fn test_hidden_files_are_skipped() {
        assert!(!is_supported_file(&PathBuf::from(".hidden.jpg")));
        assert!(!is_supported_file(&PathBuf::from("a/b/.DS_Store")));
        assert!(is_supported_file(&PathBuf::from("a/b/photo.jpg")));
    }

    #[test]
    fn test_normalized_extension() {
        assert_eq!(
            normalized_extension(&PathBuf::from("clip.MOV")),
            Some("mov".to_string())
        );
        assert_eq!(normalized_extension(&PathBuf::from("noext")), None);
    }
}
