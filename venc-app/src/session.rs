//! Synthetic encode session.
//!
//! Wires the pieces together the way a real sender would: a primary encoder
//! wrapped in software fallback, driven by an `EncodePipeline`, with a
//! `RateController` turning simulated receiver reports into rate and channel
//! updates. Frames come from a generated source rather than a camera.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use venc_media::allocator::SimulcastRateAllocator;
use venc_media::congestion::{RateControlConfig, RateController, ReceiverReport};
use venc_media::encode_pipeline::{
    EncodePipeline, EncodePipelineConfig, EncodePipelineMetrics, EncodedOutput,
};
use venc_media::factory::SoftwareEncoderFactory;
use venc_media::fake_encoder::FakeEncoder;
use venc_media::fallback::FallbackEncoder;
use venc_media::VideoEncoder;
use venc_protocol::frame::VIDEO_CLOCK_RATE_HZ;
use venc_protocol::{PixelFormat, RawFrame};

use crate::settings::Settings;

/// Output channel depth between the encoder and the packetizer stand-in.
const OUTPUT_CAPACITY: usize = 64;

/// How long to wait for the encoder to finish one frame.
const FRAME_DEADLINE: Duration = Duration::from_secs(5);

/// What the session should simulate.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    /// Frames to push through the pipeline.
    pub frames: u32,
    /// A receiver report is simulated every this many frames.
    pub report_interval: u32,
    /// Packet loss (percent) for successive reports, cycled.
    pub loss_pattern: Vec<u32>,
    /// Round-trip time reported with every report.
    pub rtt_ms: i64,
}

impl Default for SessionPlan {
    fn default() -> Self {
        Self {
            frames: 300,
            report_interval: 30,
            loss_pattern: vec![0],
            rtt_ms: 50,
        }
    }
}

/// Totals observed at the output of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub frames_sent: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub images: u64,
    pub key_frames: u64,
    pub bytes: u64,
    pub send_failures: u64,
    /// Rate controller target when the session ended.
    pub final_bitrate_kbps: u32,
    /// Implementation that produced the output.
    pub implementation: String,
}

/// Generated I420 frames with a scrolling luma ramp.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    timestamp_step: u32,
    ms_per_frame: i64,
    index: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, framerate: u32) -> Self {
        let framerate = framerate.max(1);
        Self {
            width,
            height,
            timestamp_step: VIDEO_CLOCK_RATE_HZ / framerate,
            ms_per_frame: 1000 / framerate as i64,
            index: 0,
        }
    }

    pub fn next_frame(&mut self) -> RawFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![128u8; PixelFormat::I420.expected_len(self.width, self.height)];
        let shift = self.index as usize;
        for row in 0..h {
            for col in 0..w {
                data[row * w + col] = ((col + row + shift * 4) % 256) as u8;
            }
        }
        let frame = RawFrame {
            data,
            width: self.width,
            height: self.height,
            format: PixelFormat::I420,
            timestamp: self.index.wrapping_mul(self.timestamp_step),
            render_time_ms: self.index as i64 * self.ms_per_frame,
        };
        self.index += 1;
        frame
    }
}

/// Primary encoder wrapped in software fallback.
pub fn build_encoder() -> Box<dyn VideoEncoder> {
    Box::new(FallbackEncoder::new(
        Box::new(FakeEncoder::new()),
        Arc::new(SoftwareEncoderFactory),
    ))
}

async fn wait_until_processed(metrics: &EncodePipelineMetrics, count: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + FRAME_DEADLINE;
    while metrics.frames_processed() < count {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!(
                "encoder stalled: {} of {count} frames processed",
                metrics.frames_processed()
            );
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(())
}

/// Run a session with `encoder` and return what came out.
pub async fn run_session(
    settings: &Settings,
    plan: &SessionPlan,
    encoder: Box<dyn VideoEncoder>,
) -> Result<SessionReport> {
    let codec_settings = settings.codec_settings();
    let allocator = SimulcastRateAllocator::new(codec_settings.clone());
    let mut controller = RateController::new(RateControlConfig {
        min_bitrate_kbps: codec_settings.min_bitrate_kbps,
        max_bitrate_kbps: codec_settings.max_bitrate_kbps,
        initial_bitrate_kbps: codec_settings.start_bitrate_kbps,
        ..RateControlConfig::default()
    });

    let implementation = encoder.implementation_name().to_string();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::channel::<EncodedOutput>(OUTPUT_CAPACITY);

    let mut pipeline = EncodePipeline::new(
        encoder,
        EncodePipelineConfig {
            settings: codec_settings.clone(),
            number_of_cores: settings.number_of_cores,
            max_payload_size: settings.max_payload_size,
        },
        frame_rx,
        output_tx,
    );
    pipeline
        .start()
        .await
        .context("failed to start encode pipeline")?;
    if settings.periodic_key_frames {
        pipeline.set_periodic_key_frames(true);
    }

    // Stand-in for the packetizer: tally what the encoder delivers.
    let consumer = tokio::spawn(async move {
        let mut report = SessionReport::default();
        while let Some(output) = output_rx.recv().await {
            report.images += 1;
            report.bytes += output.image.size() as u64;
            if output.image.is_key_frame() {
                report.key_frames += 1;
            }
        }
        report
    });

    tracing::info!(
        frames = plan.frames,
        codec = ?codec_settings.codec_type,
        width = codec_settings.width,
        height = codec_settings.height,
        layers = codec_settings.number_of_layers(),
        "session started"
    );

    let mut source = SyntheticSource::new(
        codec_settings.width,
        codec_settings.height,
        codec_settings.max_framerate,
    );
    let frame_duration = Duration::from_secs(1) / codec_settings.max_framerate.max(1);
    let clock = Instant::now();
    let report_interval = plan.report_interval.max(1);
    let mut reports = 0usize;

    for i in 0..plan.frames {
        if i > 0 && i % report_interval == 0 && !plan.loss_pattern.is_empty() {
            let loss = plan.loss_pattern[reports % plan.loss_pattern.len()].min(100);
            reports += 1;
            let now = clock + frame_duration * i;
            let update = controller.on_report(
                ReceiverReport {
                    packets_received: 100 - loss,
                    packets_lost: loss,
                    rtt_ms: plan.rtt_ms,
                },
                now,
            );
            pipeline.set_channel_parameters(update.channel);
            if let Some(kbps) = update.target_bitrate_kbps {
                let allocation = allocator.allocate(kbps);
                tracing::debug!(
                    target_kbps = kbps,
                    allocated_kbps = allocation.sum_kbps(),
                    "applying new rate"
                );
                pipeline.set_rate_allocation(allocation, codec_settings.max_framerate);
            }
        }

        frame_tx
            .send(source.next_frame())
            .context("encode pipeline stopped accepting frames")?;
        wait_until_processed(pipeline.metrics(), i as u64 + 1).await?;
    }

    let metrics = Arc::clone(pipeline.metrics());
    pipeline.stop().await;
    let mut report = consumer.await.context("output consumer panicked")?;

    report.frames_sent = metrics.frames_received.load(Relaxed);
    report.frames_encoded = metrics.frames_encoded.load(Relaxed);
    report.frames_dropped = metrics.frames_dropped.load(Relaxed);
    report.send_failures = metrics.send_failures.load(Relaxed);
    report.final_bitrate_kbps = controller.current_bitrate_kbps();
    report.implementation = implementation;

    tracing::info!(
        frames = report.frames_sent,
        images = report.images,
        key_frames = report.key_frames,
        bytes = report.bytes,
        final_kbps = report.final_bitrate_kbps,
        "session finished"
    );
    Ok(report)
}
