//! Shared test utilities for encoder tests.
//!
//! Available behind the `test-util` feature. Provides tracing setup, a
//! recording callback, synthetic frames, and timing instrumentation.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use venc_protocol::{
    CodecSpecificInfo, DeliveryResult, EncodedImage, FragmentationHeader, PixelFormat, RawFrame,
};

use crate::encode_pipeline::EncodePipelineMetrics;
use crate::encoder::EncodedImageCallback;

/// RTP timestamp step between synthetic frames (30 fps on the 90 kHz clock).
pub const FRAME_TIMESTAMP_STEP: u32 = 3000;

/// Default poll interval for metric waits.
const POLL_INTERVAL_MS: u64 = 10;

/// Initialise a tracing subscriber for tests.
///
/// Respects `RUST_LOG`, defaults to `debug`. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Build an I420 frame with a moving gradient so consecutive frames differ.
///
/// Timestamps advance by [`FRAME_TIMESTAMP_STEP`] per `index`.
pub fn synthetic_frame(width: u32, height: u32, index: u32) -> RawFrame {
    let len = PixelFormat::I420.expected_len(width, height);
    let data = (0..len)
        .map(|i| ((i as u32).wrapping_add(index.wrapping_mul(7)) % 251) as u8)
        .collect();
    RawFrame {
        data,
        width,
        height,
        format: PixelFormat::I420,
        timestamp: index.wrapping_mul(FRAME_TIMESTAMP_STEP),
        render_time_ms: index as i64 * 33,
    }
}

/// One image captured by [`RecordingCallback`].
#[derive(Debug, Clone)]
pub struct RecordedImage {
    pub image: EncodedImage,
    pub codec_specific_info: Option<CodecSpecificInfo>,
    pub fragmentation: Option<FragmentationHeader>,
}

#[derive(Default)]
struct Recording {
    images: Vec<RecordedImage>,
    dropped: usize,
    scripted: VecDeque<DeliveryResult>,
}

/// Callback that records every image and answers with scripted results.
///
/// Clones share the same recording, so keep one clone and hand the other to
/// the encoder. Unscripted deliveries answer `Ok` with the image timestamp as
/// frame id.
#[derive(Clone, Default)]
pub struct RecordingCallback {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results returned to the next deliveries, in order.
    pub fn script(&self, results: impl IntoIterator<Item = DeliveryResult>) {
        let mut inner = self.inner.lock().unwrap();
        inner.scripted.extend(results);
    }

    pub fn images(&self) -> Vec<RecordedImage> {
        self.inner.lock().unwrap().images.clone()
    }

    pub fn image_count(&self) -> usize {
        self.inner.lock().unwrap().images.len()
    }

    pub fn last(&self) -> Option<RecordedImage> {
        self.inner.lock().unwrap().images.last().cloned()
    }

    /// Times `on_dropped_frame` was called.
    pub fn dropped(&self) -> usize {
        self.inner.lock().unwrap().dropped
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().images.clear();
    }
}

impl EncodedImageCallback for RecordingCallback {
    fn on_encoded_image(
        &mut self,
        image: &EncodedImage,
        codec_specific_info: Option<&CodecSpecificInfo>,
        fragmentation: Option<&FragmentationHeader>,
    ) -> DeliveryResult {
        let mut inner = self.inner.lock().unwrap();
        inner.images.push(RecordedImage {
            image: image.clone(),
            codec_specific_info: codec_specific_info.cloned(),
            fragmentation: fragmentation.cloned(),
        });
        inner
            .scripted
            .pop_front()
            .unwrap_or_else(|| DeliveryResult::ok(image.timestamp))
    }

    fn on_dropped_frame(&mut self) {
        self.inner.lock().unwrap().dropped += 1;
    }
}

/// Wait until the pipeline has finished `count` frames.
///
/// Panics if the timeout is reached.
pub async fn wait_for_processed(metrics: &EncodePipelineMetrics, count: u64, timeout_secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        let processed = metrics.frames_processed();
        if processed >= count {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {count} processed frames, got {processed} (after {timeout_secs}s), received {}",
                metrics.frames_received.load(Ordering::Relaxed)
            );
        }
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

/// Timing instrumentation for test phases.
///
/// Records wall-clock duration of each named phase and logs a summary on drop.
pub struct TestTimer {
    test_name: String,
    start: std::time::Instant,
    last: std::time::Instant,
    phases: Vec<(String, Duration)>,
}

impl TestTimer {
    pub fn new(test_name: &str) -> Self {
        let now = std::time::Instant::now();
        tracing::info!(target: "venc_test::timer", test = test_name, "test started");
        Self {
            test_name: test_name.to_string(),
            start: now,
            last: now,
            phases: Vec::new(),
        }
    }

    /// Record the end of a named phase.
    pub fn phase(&mut self, name: &str) {
        let now = std::time::Instant::now();
        let duration = now - self.last;
        tracing::info!(
            target: "venc_test::timer",
            test = %self.test_name,
            phase = name,
            duration_ms = duration.as_millis() as u64,
            elapsed_ms = (now - self.start).as_millis() as u64,
            "phase complete"
        );
        self.phases.push((name.to_string(), duration));
        self.last = now;
    }
}

impl Drop for TestTimer {
    fn drop(&mut self) {
        tracing::info!(
            target: "venc_test::timer",
            test = %self.test_name,
            total_ms = self.start.elapsed().as_millis() as u64,
            phase_count = self.phases.len(),
            "test timing summary"
        );
    }
}
