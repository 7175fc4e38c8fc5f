use std::collections::BTreeMap;
use std::io::Cursor;

use dirpy::config::Config;
use dirpy::pipeline::Pipeline;
use dirpy::query::{parse_query, OptionBag, OptionValue};
use dirpy::telemetry::MetaData;

fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(w, h);
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg).unwrap();
    buf
}

fn flag_bag(keys: &[&str]) -> OptionBag {
    keys.iter().map(|k| ((*k).to_string(), OptionValue::Flag)).collect()
}

#[test]
fn resize_with_nxn_key() {
    let cfg = Config::default();
    let mut meta = MetaData::new();
    let bytes = jpeg_bytes(800, 600);
    let mut p = Pipeline::decode(bytes, "test.jpg".to_string(), &cfg, &mut meta).unwrap();

    let mut opts: OptionBag = BTreeMap::new();
    opts.insert("400x300".to_string(), OptionValue::Flag);
    p.resize(&opts).unwrap();
    assert_eq!(p.out_x, 400);
    assert_eq!(p.out_y, 300);
    assert!(p.modified);

    let out = p.save(&OptionBag::new(), &cfg, &mut meta).unwrap();
    assert_eq!(out.out_fmt, "jpeg");
    assert!(!out.bytes.is_empty());
}

#[test]
fn unmodified_jpeg_passes_through_original_bytes() {
    let cfg = Config::default();
    let mut meta = MetaData::new();
    let bytes = jpeg_bytes(100, 100);
    let original = bytes.clone();
    let mut p = Pipeline::decode(bytes, "test.jpg".to_string(), &cfg, &mut meta).unwrap();

    let out = p.save(&OptionBag::new(), &cfg, &mut meta).unwrap();
    assert_eq!(out.bytes, original);
}

#[test]
fn coordinate_crop_requires_all_four_values() {
    let cfg = Config::default();
    let mut meta = MetaData::new();
    let bytes = jpeg_bytes(200, 200);
    let mut p = Pipeline::decode(bytes, "test.jpg".to_string(), &cfg, &mut meta).unwrap();

    let mut opts: OptionBag = BTreeMap::new();
    opts.insert("10x20x150x".to_string(), OptionValue::Flag);
    let err = p.crop(&opts).unwrap_err();
    assert!(matches!(err, dirpy::DirpyError::User { .. }));
}

#[test]
fn no_op_crop_at_same_dims_is_skipped() {
    let cfg = Config::default();
    let mut meta = MetaData::new();
    let bytes = jpeg_bytes(200, 150);
    let mut p = Pipeline::decode(bytes, "test.jpg".to_string(), &cfg, &mut meta).unwrap();

    let mut opts: OptionBag = BTreeMap::new();
    opts.insert("200x150".to_string(), OptionValue::Flag);
    p.crop(&opts).unwrap();
    assert!(!p.modified);
    assert_eq!(p.out_x, 200);
    assert_eq!(p.out_y, 150);
}

#[test]
fn transpose_requires_exactly_one_option() {
    let cfg = Config::default();
    let mut meta = MetaData::new();
    let bytes = jpeg_bytes(50, 50);
    let mut p = Pipeline::decode(bytes, "test.jpg".to_string(), &cfg, &mut meta).unwrap();

    let err = p.transpose(&flag_bag(&["rotate90", "rotate180"])).unwrap_err();
    assert!(matches!(err, dirpy::DirpyError::User { .. }));

    p.transpose(&flag_bag(&["rotate90"])).unwrap();
    assert!(p.modified);
}

#[test]
fn pad_rejects_area_smaller_than_source() {
    let cfg = Config::default();
    let mut meta = MetaData::new();
    let bytes = jpeg_bytes(200, 200);
    let mut p = Pipeline::decode(bytes, "test.jpg".to_string(), &cfg, &mut meta).unwrap();

    let mut opts: OptionBag = BTreeMap::new();
    opts.insert("100x100".to_string(), OptionValue::Flag);
    let err = p.pad(&opts).unwrap_err();
    assert!(matches!(err, dirpy::DirpyError::User { .. }));
}

#[test]
fn query_pipeline_round_trip_resize_crop_save() {
    let parsed = parse_query("resize=200x200&crop=n:c&save=fmt:webp,qual:80");
    assert_eq!(parsed.pipeline.len(), 2);
    assert_eq!(parsed.pipeline[0].0, "resize");
    assert_eq!(parsed.pipeline[1].0, "crop");
    let save = parsed.save.expect("save bag present");
    assert_eq!(save.get("fmt"), Some(&OptionValue::Value("webp".to_string())));
}

#[test]
fn decompression_bomb_guard_rejects_oversized_image() {
    let mut cfg = Config::default();
    cfg.max_pixels = 100;
    let mut meta = MetaData::new();
    let bytes = jpeg_bytes(64, 64);
    let err = Pipeline::decode(bytes, "test.jpg".to_string(), &cfg, &mut meta).unwrap_err();
    assert!(matches!(err, dirpy::DirpyError::User { .. }));
}
