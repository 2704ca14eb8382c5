//! Integration tests for the encode pipeline driving the reference encoder.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use venc_media::encode_pipeline::{EncodePipeline, EncodePipelineConfig, EncodedOutput};
use venc_media::fake_encoder::{FakeEncoder, FakeEncoderConfig};
use venc_media::testing::{init_test_tracing, synthetic_frame, wait_for_processed, TestTimer};
use venc_protocol::{
    BitrateAllocation, CodecType, FrameType, QpThresholds, RawFrame, ScalingSettings,
    VideoCodecSettings,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    pipeline: EncodePipeline,
    frame_tx: mpsc::UnboundedSender<RawFrame>,
    output_rx: mpsc::Receiver<EncodedOutput>,
}

async fn start_pipeline(
    settings: VideoCodecSettings,
    config: FakeEncoderConfig,
    output_capacity: usize,
) -> Harness {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::channel(output_capacity);
    let mut pipeline = EncodePipeline::new(
        Box::new(FakeEncoder::with_config(config)),
        EncodePipelineConfig::new(settings),
        frame_rx,
        output_tx,
    );
    pipeline.start().await.unwrap();
    Harness {
        pipeline,
        frame_tx,
        output_rx,
    }
}

async fn recv(rx: &mut mpsc::Receiver<EncodedOutput>) -> EncodedOutput {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for encoded output")
        .expect("output channel closed")
}

fn qvga() -> VideoCodecSettings {
    VideoCodecSettings::new(CodecType::Vp8, 320, 240, 300)
}

#[tokio::test]
async fn frames_flow_through_in_order() {
    init_test_tracing();
    let mut timer = TestTimer::new("frames_flow_through_in_order");
    let mut h = start_pipeline(qvga(), FakeEncoderConfig::default(), 16).await;
    timer.phase("start");

    for i in 0..5 {
        h.frame_tx.send(synthetic_frame(320, 240, i)).unwrap();
    }
    let mut timestamps = Vec::new();
    for _ in 0..5 {
        timestamps.push(recv(&mut h.output_rx).await.image.timestamp);
    }
    timer.phase("encode");

    assert_eq!(timestamps, vec![0, 3000, 6000, 9000, 12000]);
    wait_for_processed(h.pipeline.metrics(), 5, 5).await;
    assert_eq!(h.pipeline.metrics().frames_encoded.load(Ordering::Relaxed), 5);
    h.pipeline.stop().await;
}

#[tokio::test]
async fn keyframe_request_applies_to_next_frame() {
    init_test_tracing();
    let mut h = start_pipeline(qvga(), FakeEncoderConfig::default(), 16).await;

    h.frame_tx.send(synthetic_frame(320, 240, 0)).unwrap();
    h.frame_tx.send(synthetic_frame(320, 240, 1)).unwrap();
    assert_eq!(recv(&mut h.output_rx).await.image.frame_type, FrameType::Key);
    assert_eq!(recv(&mut h.output_rx).await.image.frame_type, FrameType::Delta);

    h.pipeline.request_keyframe();
    h.frame_tx.send(synthetic_frame(320, 240, 2)).unwrap();
    assert_eq!(recv(&mut h.output_rx).await.image.frame_type, FrameType::Key);
    assert_eq!(
        h.pipeline.metrics().keyframes_requested.load(Ordering::Relaxed),
        1
    );
    h.pipeline.stop().await;
}

#[tokio::test]
async fn backpressure_drops_then_forces_key_frame() {
    init_test_tracing();
    // One slot: the first image fills it and asks for a drop.
    let mut h = start_pipeline(qvga(), FakeEncoderConfig::default(), 1).await;
    let metrics = std::sync::Arc::clone(h.pipeline.metrics());

    for i in 0..3 {
        h.frame_tx.send(synthetic_frame(320, 240, i)).unwrap();
    }
    wait_for_processed(&metrics, 3, 5).await;

    // Frame 0 delivered, frame 1 dropped on request, frame 2 hit a full channel.
    assert_eq!(metrics.frames_dropped.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.send_failures.load(Ordering::Relaxed), 1);
    let first = recv(&mut h.output_rx).await;
    assert_eq!(first.image.timestamp, 0);

    h.frame_tx.send(synthetic_frame(320, 240, 3)).unwrap();
    let next = recv(&mut h.output_rx).await;
    assert_eq!(next.image.timestamp, 9000);
    assert_eq!(next.image.frame_type, FrameType::Key);
    h.pipeline.stop().await;
}

#[tokio::test]
async fn resolution_change_reinitializes() {
    init_test_tracing();
    let mut h = start_pipeline(qvga(), FakeEncoderConfig::default(), 16).await;

    h.frame_tx.send(synthetic_frame(320, 240, 0)).unwrap();
    let out = recv(&mut h.output_rx).await;
    assert_eq!((out.image.encoded_width, out.image.encoded_height), (320, 240));

    h.frame_tx.send(synthetic_frame(640, 480, 1)).unwrap();
    let out = recv(&mut h.output_rx).await;
    assert_eq!((out.image.encoded_width, out.image.encoded_height), (640, 480));
    assert_eq!(out.image.frame_type, FrameType::Key);

    let metrics = h.pipeline.metrics();
    assert_eq!(metrics.reinitializations.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.encode_errors.load(Ordering::Relaxed), 0);
    h.pipeline.stop().await;
}

#[tokio::test]
async fn zero_allocation_pauses_stream() {
    init_test_tracing();
    let mut h = start_pipeline(qvga(), FakeEncoderConfig::default(), 16).await;
    let metrics = std::sync::Arc::clone(h.pipeline.metrics());

    h.pipeline.set_rate_allocation(BitrateAllocation::new(), 30);
    for i in 0..3 {
        h.frame_tx.send(synthetic_frame(320, 240, i)).unwrap();
    }
    wait_for_processed(&metrics, 3, 5).await;
    assert_eq!(metrics.frames_dropped.load(Ordering::Relaxed), 3);

    let mut allocation = BitrateAllocation::new();
    allocation.set_bitrate(0, 0, 300_000);
    h.pipeline.set_rate_allocation(allocation, 30);
    h.frame_tx.send(synthetic_frame(320, 240, 3)).unwrap();
    let out = recv(&mut h.output_rx).await;
    assert_eq!(out.image.timestamp, 9000);
    h.pipeline.stop().await;
}

#[tokio::test]
async fn timeout_does_not_stop_pipeline() {
    init_test_tracing();
    let config = FakeEncoderConfig {
        timeout_on_frame: Some(0),
        ..FakeEncoderConfig::default()
    };
    let mut h = start_pipeline(qvga(), config, 16).await;

    h.frame_tx.send(synthetic_frame(320, 240, 0)).unwrap();
    h.frame_tx.send(synthetic_frame(320, 240, 1)).unwrap();
    let out = recv(&mut h.output_rx).await;
    assert_eq!(out.image.timestamp, 3000);
    assert_eq!(
        h.pipeline.metrics().encode_timeouts.load(Ordering::Relaxed),
        1
    );
    h.pipeline.stop().await;
}

#[tokio::test]
async fn scaling_settings_published_on_start() {
    init_test_tracing();
    let scaling = ScalingSettings::with_thresholds(true, QpThresholds { low: 24, high: 37 });
    let config = FakeEncoderConfig {
        scaling,
        ..FakeEncoderConfig::default()
    };
    let mut h = start_pipeline(qvga(), config, 16).await;

    let rx = h.pipeline.scaling_settings();
    assert_eq!(*rx.borrow(), scaling);
    h.pipeline.stop().await;
}

#[tokio::test]
async fn stop_releases_encoder_and_closes_output() {
    init_test_tracing();
    let mut h = start_pipeline(qvga(), FakeEncoderConfig::default(), 16).await;

    h.frame_tx.send(synthetic_frame(320, 240, 0)).unwrap();
    recv(&mut h.output_rx).await;
    h.pipeline.stop().await;

    // Releasing the encoder drops the callback, the only output sender.
    let closed = tokio::time::timeout(RECV_TIMEOUT, h.output_rx.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn start_fails_on_invalid_settings() {
    init_test_tracing();
    let (_frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (output_tx, _output_rx) = mpsc::channel(4);
    let mut pipeline = EncodePipeline::new(
        Box::new(FakeEncoder::new()),
        EncodePipelineConfig::new(VideoCodecSettings::new(CodecType::Vp8, 0, 240, 300)),
        frame_rx,
        output_tx,
    );
    let err = pipeline.start().await.unwrap_err();
    assert!(format!("{err:#}").contains("failed to initialize encoder"));
}
