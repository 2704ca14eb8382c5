//! Synthetic sessions: settings → fallback encoder → pipeline → output tally.

use std::sync::Arc;

use venc_app::session::{build_encoder, run_session};
use venc_app::settings::{Quality, Settings};
use venc_media::factory::SoftwareEncoderFactory;
use venc_media::fake_encoder::{FakeEncoder, FakeEncoderConfig};
use venc_media::fallback::FallbackEncoder;
use venc_protocol::EncoderError;

use crate::helpers::{init_test_tracing, plan, TestTimer};

fn failing_primary() -> Box<FakeEncoder> {
    Box::new(FakeEncoder::with_config(FakeEncoderConfig {
        init_error: Some(EncoderError::Error),
        ..FakeEncoderConfig::default()
    }))
}

/// A clean network keeps the start bitrate and every frame is delivered.
#[tokio::test]
async fn clean_network_delivers_every_frame() {
    init_test_tracing();
    let mut timer = TestTimer::new("clean_network_delivers_every_frame");

    let settings = Settings::default();
    let report = run_session(&settings, &plan(60, vec![0]), build_encoder())
        .await
        .unwrap();
    timer.phase("session");

    assert_eq!(report.frames_sent, 60);
    assert_eq!(report.frames_encoded, 60);
    assert_eq!(report.images, 60);
    assert_eq!(report.key_frames, 1);
    assert_eq!(report.send_failures, 0);
    assert_eq!(report.final_bitrate_kbps, 500);
    assert_eq!(report.implementation, "fake_encoder");
}

/// Sustained loss walks the target down multiplicatively.
#[tokio::test]
async fn lossy_network_lowers_bitrate() {
    init_test_tracing();
    let settings = Settings::default();

    let clean = run_session(&settings, &plan(120, vec![0]), build_encoder())
        .await
        .unwrap();
    let lossy = run_session(&settings, &plan(120, vec![20]), build_encoder())
        .await
        .unwrap();

    // Reports at frames 30, 60 and 90: 500 → 400 → 320 → 256
    assert_eq!(lossy.final_bitrate_kbps, 256);
    assert_eq!(lossy.frames_encoded, 120);
    assert!(lossy.bytes < clean.bytes);
}

/// Simulcast produces one image per stream per frame.
#[tokio::test]
async fn simulcast_session_delivers_all_layers() {
    init_test_tracing();
    let settings = Settings {
        quality: Quality::High,
        simulcast: true,
        ..Settings::default()
    };

    let report = run_session(&settings, &plan(10, vec![0]), build_encoder())
        .await
        .unwrap();

    assert_eq!(report.frames_encoded, 10);
    assert_eq!(report.images, 30);
    assert_eq!(report.key_frames, 3);
}

/// Without a software encoder for the codec, the primary's failure surfaces.
#[tokio::test]
async fn failed_primary_without_fallback_fails_session() {
    init_test_tracing();
    let settings = Settings::default();
    let encoder = Box::new(FallbackEncoder::new(
        failing_primary(),
        Arc::new(SoftwareEncoderFactory),
    ));

    let err = run_session(&settings, &plan(10, vec![0]), encoder)
        .await
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("failed to start encode pipeline"), "{message}");
}

/// With OpenH264 available, a failed primary is replaced transparently.
#[cfg(feature = "video-codec")]
#[tokio::test]
async fn failed_primary_falls_back_to_openh264() {
    use venc_protocol::CodecType;

    init_test_tracing();
    let settings = Settings {
        codec: CodecType::H264,
        quality: Quality::Low,
        ..Settings::default()
    };
    let encoder = Box::new(FallbackEncoder::new(
        failing_primary(),
        Arc::new(SoftwareEncoderFactory),
    ));

    let report = run_session(&settings, &plan(30, vec![0]), encoder)
        .await
        .unwrap();

    assert_eq!(report.frames_sent, 30);
    assert!(report.images > 0);
    assert!(report.key_frames >= 1);
}
