use image::{DynamicImage, Rgb, RgbImage};
use tempfile::TempDir;

use lumapix::object_store::ObjectStore;
use lumapix::preview_generator::{auto_orient, compute_blurhash, make_preview, resize_to_fit};
use lumapix::processor::hash_file;

fn test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 239) as u8])
    }))
}

/// The full derivative chain for one photo: orient, resize, encode, publish.
/// Afterwards both previews exist at the canonical hash paths, bounded by
/// their configured longest edges.
#[test]
fn test_previews_land_at_canonical_paths() {
    let tmp = TempDir::new().unwrap();

    let source_path = tmp.path().join("photo.png");
    let img = test_image(1600, 1200);
    img.save(&source_path).unwrap();
    let id = hash_file(&source_path).unwrap();

    let oriented = auto_orient(img, Some(1));
    let small = make_preview(&oriented, 800, 85).unwrap();
    let large = make_preview(&oriented, 2500, 85).unwrap();

    assert_eq!((small.width, small.height), (800, 600));
    // Original is smaller than the large target: kept as-is.
    assert_eq!((large.width, large.height), (1600, 1200));

    let store = ObjectStore::new(tmp.path().join("media"));
    let small_path = store.small_preview_path(&id).unwrap();
    let large_path = store.large_preview_path(&id).unwrap();
    store.publish(&small_path, &small.data).unwrap();
    store.publish(&large_path, &large.data).unwrap();

    assert!(small_path.exists());
    assert!(large_path.exists());

    // Both are WebP containers.
    for path in [&small_path, &large_path] {
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
    }
}

/// The blurhash is a pure function of pixel content: recomputing it from
/// the same resized preview gives the same string.
#[test]
fn test_blurhash_stable_across_reencodes() {
    let img = test_image(640, 480);
    let small = resize_to_fit(&img, 800);

    let first = compute_blurhash(&small);
    let second = compute_blurhash(&resize_to_fit(&img, 800));

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

/// Orientation is applied before measuring: a rotated portrait comes out
/// with swapped dimensions and previews follow suit.
#[test]
fn test_rotated_image_previews_follow_orientation() {
    let img = test_image(1200, 800);
    let oriented = auto_orient(img, Some(6));
    assert_eq!((oriented.width(), oriented.height()), (800, 1200));

    let small = make_preview(&oriented, 400, 85).unwrap();
    assert_eq!(small.height, 400);
    assert!(small.width < small.height);
}
