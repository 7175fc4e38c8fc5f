use std::io::Cursor;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use dirpy::config::Config;
use dirpy::server::{router, AppState};

fn write_test_jpeg(root: &std::path::Path, rel: &str) {
    let img = image::DynamicImage::new_rgb8(640, 480);
    let path = root.join(rel.trim_start_matches('/'));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg).unwrap();
    std::fs::write(path, buf).unwrap();
}

fn test_state(http_root: &std::path::Path) -> Arc<AppState> {
    let mut cfg = Config::default();
    cfg.http_root = http_root.display().to_string();
    Arc::new(AppState { cfg, cache: None })
}

#[tokio::test]
async fn favicon_always_returns_no_content() {
    let dir = std::env::temp_dir().join("dirpy-test-favicon");
    std::fs::create_dir_all(&dir).unwrap();
    let app = router(test_state(&dir));

    let resp = app
        .oneshot(Request::builder().uri("/favicon.ico?resize=100x100").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(resp.headers().contains_key("Dirpy-Data"));
}

#[tokio::test]
async fn status_command_short_circuits_to_no_content() {
    let dir = std::env::temp_dir().join("dirpy-test-status");
    std::fs::create_dir_all(&dir).unwrap();
    let app = router(test_state(&dir));

    let resp = app
        .oneshot(Request::builder().uri("/anything.jpg?status&resize=100x100").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn resize_and_save_local_file_returns_image() {
    let dir = std::env::temp_dir().join("dirpy-test-resize");
    std::fs::create_dir_all(&dir).unwrap();
    write_test_jpeg(&dir, "photo.jpg");
    let app = router(test_state(&dir));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/photo.jpg?resize=320x240&save=fmt:jpeg")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(axum::http::header::CONTENT_TYPE).unwrap(),
        "image/jpeg"
    );
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(!body.is_empty());
}

#[tokio::test]
async fn unknown_command_is_a_user_error() {
    let dir = std::env::temp_dir().join("dirpy-test-unknown-cmd");
    std::fs::create_dir_all(&dir).unwrap();
    write_test_jpeg(&dir, "photo.jpg");
    let app = router(test_state(&dir));

    let resp = app
        .oneshot(Request::builder().uri("/photo.jpg?frobnicate=yes").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn post_with_single_file_part_is_accepted() {
    let dir = std::env::temp_dir().join("dirpy-test-post-ok");
    std::fs::create_dir_all(&dir).unwrap();
    let app = router(test_state(&dir));

    let img = image::DynamicImage::new_rgb8(64, 64);
    let mut jpeg = Vec::new();
    img.write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg).unwrap();

    let boundary = "dirpy-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"upload.jpg\"\r\n");
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(&jpeg);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload.jpg?post&resize=32x32&save=fmt:jpeg")
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn post_missing_file_part_is_a_user_error() {
    let dir = std::env::temp_dir().join("dirpy-test-post-missing-file");
    std::fs::create_dir_all(&dir).unwrap();
    let app = router(test_state(&dir));

    let boundary = "dirpy-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"notes\"\r\n\r\n");
    body.extend_from_slice(b"no file here");
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload.jpg?post")
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_file_is_a_fatal_error() {
    let dir = std::env::temp_dir().join("dirpy-test-missing-file");
    std::fs::create_dir_all(&dir).unwrap();
    let app = router(test_state(&dir));

    let resp = app
        .oneshot(Request::builder().uri("/does-not-exist.jpg").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
