//! Encode pipeline: raw frames → encoder → encoded output channel.
//!
//! `EncodePipeline` owns one encoder inside a tokio task. Frames and control
//! commands arrive on separate channels and are handled one at a time by the
//! same task, so a rate update can never race an in-flight `encode`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use venc_protocol::{
    BitrateAllocation, ChannelParameters, CodecSpecificInfo, DeliveryResult, EncodeOutcome,
    EncodedImage, EncoderError, FragmentationHeader, FrameType, RawFrame, ScalingSettings,
    VideoCodecSettings,
};

use crate::encoder::{EncodedImageCallback, VideoEncoder};

/// Default max payload size for one partition (fits a typical RTP packet).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1200;

/// Control commands applied between encode calls.
#[derive(Debug, Clone)]
pub enum EncoderCommand {
    SetRates { bitrate_kbps: u32, framerate: u32 },
    SetRateAllocation {
        allocation: BitrateAllocation,
        framerate: u32,
    },
    SetChannelParameters(ChannelParameters),
    /// Request a key frame on every layer of the next frame.
    RequestKeyframe,
    SetPeriodicKeyFrames(bool),
}

/// One encoded image as it leaves the pipeline.
#[derive(Debug, Clone)]
pub struct EncodedOutput {
    pub image: EncodedImage,
    pub codec_specific_info: Option<CodecSpecificInfo>,
    pub fragmentation: Option<FragmentationHeader>,
}

/// Metrics exposed for observability and test assertions.
#[derive(Default)]
pub struct EncodePipelineMetrics {
    pub frames_received: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub images_delivered: AtomicU64,
    pub send_failures: AtomicU64,
    pub keyframes_requested: AtomicU64,
    pub encode_timeouts: AtomicU64,
    pub encode_errors: AtomicU64,
    pub reinitializations: AtomicU64,
}

impl EncodePipelineMetrics {
    /// Frames the encoder has finished with, whatever the outcome.
    pub fn frames_processed(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
            + self.frames_dropped.load(Ordering::Relaxed)
            + self.encode_timeouts.load(Ordering::Relaxed)
            + self.encode_errors.load(Ordering::Relaxed)
    }
}

/// Callback that forwards encoded images into a bounded channel.
///
/// A full or closed channel reports `SendFailed`. Taking the last free slot
/// asks the encoder to drop the next frame so the consumer can catch up.
pub struct ChannelCallback {
    tx: mpsc::Sender<EncodedOutput>,
    metrics: Arc<EncodePipelineMetrics>,
}

impl ChannelCallback {
    pub fn new(tx: mpsc::Sender<EncodedOutput>, metrics: Arc<EncodePipelineMetrics>) -> Self {
        Self { tx, metrics }
    }
}

impl EncodedImageCallback for ChannelCallback {
    fn on_encoded_image(
        &mut self,
        image: &EncodedImage,
        codec_specific_info: Option<&CodecSpecificInfo>,
        fragmentation: Option<&FragmentationHeader>,
    ) -> DeliveryResult {
        let output = EncodedOutput {
            image: image.clone(),
            codec_specific_info: codec_specific_info.cloned(),
            fragmentation: fragmentation.cloned(),
        };
        match self.tx.try_send(output) {
            Ok(()) => {
                self.metrics.images_delivered.fetch_add(1, Ordering::Relaxed);
                let result = DeliveryResult::ok(image.timestamp);
                if self.tx.capacity() == 0 {
                    result.with_drop_next_frame()
                } else {
                    result
                }
            }
            Err(e) => {
                self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    timestamp = image.timestamp,
                    layer = image.layer_index,
                    full = matches!(e, mpsc::error::TrySendError::Full(_)),
                    "encoded output channel rejected image"
                );
                DeliveryResult::send_failed()
            }
        }
    }
}

/// Configuration for the encode pipeline.
#[derive(Debug, Clone)]
pub struct EncodePipelineConfig {
    pub settings: VideoCodecSettings,
    pub number_of_cores: usize,
    pub max_payload_size: usize,
}

impl EncodePipelineConfig {
    pub fn new(settings: VideoCodecSettings) -> Self {
        Self {
            settings,
            number_of_cores: 1,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Pipeline that drives one encoder from a background task.
pub struct EncodePipeline {
    config: EncodePipelineConfig,
    encoder: Option<Box<dyn VideoEncoder>>,
    frame_in_rx: Option<mpsc::UnboundedReceiver<RawFrame>>,
    output_tx: Option<mpsc::Sender<EncodedOutput>>,
    command_tx: mpsc::UnboundedSender<EncoderCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<EncoderCommand>>,
    scaling_tx: Arc<watch::Sender<ScalingSettings>>,
    metrics: Arc<EncodePipelineMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Option<JoinHandle<()>>,
}

impl EncodePipeline {
    /// Create a pipeline around `encoder`, reading frames from `frame_in_rx`
    /// and writing encoded images to `output_tx`.
    pub fn new(
        encoder: Box<dyn VideoEncoder>,
        config: EncodePipelineConfig,
        frame_in_rx: mpsc::UnboundedReceiver<RawFrame>,
        output_tx: mpsc::Sender<EncodedOutput>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (scaling_tx, _) = watch::channel(ScalingSettings::disabled());

        tracing::info!(
            implementation = encoder.implementation_name(),
            codec = ?config.settings.codec_type,
            width = config.settings.width,
            height = config.settings.height,
            start_kbps = config.settings.start_bitrate_kbps,
            "encode pipeline created"
        );

        Self {
            config,
            encoder: Some(encoder),
            frame_in_rx: Some(frame_in_rx),
            output_tx: Some(output_tx),
            command_tx,
            command_rx: Some(command_rx),
            scaling_tx: Arc::new(scaling_tx),
            metrics: Arc::new(EncodePipelineMetrics::default()),
            shutdown_tx,
            shutdown_rx,
            handle: None,
        }
    }

    /// Initialize the encoder and spawn the encode task.
    pub async fn start(&mut self) -> Result<()> {
        let mut encoder = self
            .encoder
            .take()
            .context("pipeline already started (encoder consumed)")?;
        let frame_in_rx = self
            .frame_in_rx
            .take()
            .context("pipeline already started (frame_in_rx consumed)")?;
        let output_tx = self
            .output_tx
            .take()
            .context("pipeline already started (output_tx consumed)")?;
        let command_rx = self
            .command_rx
            .take()
            .context("pipeline already started (command_rx consumed)")?;

        encoder
            .init_encode(
                &self.config.settings,
                self.config.number_of_cores,
                self.config.max_payload_size,
            )
            .context("failed to initialize encoder")?;
        encoder
            .register_encode_complete_callback(Box::new(ChannelCallback::new(
                output_tx,
                Arc::clone(&self.metrics),
            )))
            .context("failed to register encode complete callback")?;
        self.scaling_tx.send_replace(encoder.scaling_settings());

        let handle = tokio::spawn(encode_loop(
            encoder,
            self.config.clone(),
            frame_in_rx,
            command_rx,
            Arc::clone(&self.scaling_tx),
            Arc::clone(&self.metrics),
            self.shutdown_rx.clone(),
        ));
        self.handle = Some(handle);

        tracing::info!("encode pipeline started");
        Ok(())
    }

    /// Signal shutdown, wait for the task and release the encoder.
    pub async fn stop(&mut self) {
        tracing::info!("stopping encode pipeline");
        let _ = self.shutdown_tx.send(true);

        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
        tracing::info!("encode pipeline stopped");
    }

    pub fn send_command(&self, command: EncoderCommand) {
        let _ = self.command_tx.send(command);
    }

    pub fn request_keyframe(&self) {
        self.send_command(EncoderCommand::RequestKeyframe);
    }

    pub fn set_rates(&self, bitrate_kbps: u32, framerate: u32) {
        self.send_command(EncoderCommand::SetRates {
            bitrate_kbps,
            framerate,
        });
    }

    pub fn set_rate_allocation(&self, allocation: BitrateAllocation, framerate: u32) {
        self.send_command(EncoderCommand::SetRateAllocation {
            allocation,
            framerate,
        });
    }

    pub fn set_channel_parameters(&self, channel: ChannelParameters) {
        self.send_command(EncoderCommand::SetChannelParameters(channel));
    }

    pub fn set_periodic_key_frames(&self, enable: bool) {
        self.send_command(EncoderCommand::SetPeriodicKeyFrames(enable));
    }

    /// Receiver for the encoder's current scaling settings.
    pub fn scaling_settings(&self) -> watch::Receiver<ScalingSettings> {
        self.scaling_tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<EncodePipelineMetrics> {
        &self.metrics
    }
}

/// Rate command most recently applied, replayed after re-initialization.
#[derive(Debug, Clone, Copy)]
enum AppliedRates {
    Coarse(u32, u32),
    Allocation(BitrateAllocation, u32),
}

fn apply_rates(encoder: &mut dyn VideoEncoder, rates: AppliedRates) {
    let result = match rates {
        AppliedRates::Coarse(kbps, fps) => encoder.set_rates(kbps, fps),
        AppliedRates::Allocation(allocation, fps) => encoder.set_rate_allocation(&allocation, fps),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, ?rates, "encoder rejected rate update");
    }
}

/// Scale the configured resolution (and each simulcast stream) to a new
/// input size.
fn resized(settings: &VideoCodecSettings, width: u32, height: u32) -> VideoCodecSettings {
    let mut next = settings.clone();
    for stream in &mut next.simulcast_streams {
        stream.width = (stream.width as u64 * width as u64 / settings.width.max(1) as u64)
            .max(1) as u32;
        stream.height = (stream.height as u64 * height as u64 / settings.height.max(1) as u64)
            .max(1) as u32;
    }
    next.width = width;
    next.height = height;
    next
}

/// Encode loop: commands and frames, one at a time.
async fn encode_loop(
    mut encoder: Box<dyn VideoEncoder>,
    config: EncodePipelineConfig,
    mut frame_in_rx: mpsc::UnboundedReceiver<RawFrame>,
    mut command_rx: mpsc::UnboundedReceiver<EncoderCommand>,
    scaling_tx: Arc<watch::Sender<ScalingSettings>>,
    metrics: Arc<EncodePipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut settings = config.settings.clone();
    let mut keyframe_pending = false;
    let mut last_rates: Option<AppliedRates> = None;

    tracing::debug!("encode loop started");

    loop {
        tokio::select! {
            biased;
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    tracing::debug!("encode loop shutdown");
                    break;
                }
            }
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("command channel closed");
                    break;
                };
                match cmd {
                    EncoderCommand::SetRates { bitrate_kbps, framerate } => {
                        let rates = AppliedRates::Coarse(bitrate_kbps, framerate);
                        apply_rates(&mut *encoder, rates);
                        last_rates = Some(rates);
                        tracing::debug!(bitrate_kbps, framerate, "rates changed");
                    }
                    EncoderCommand::SetRateAllocation { allocation, framerate } => {
                        let rates = AppliedRates::Allocation(allocation, framerate);
                        apply_rates(&mut *encoder, rates);
                        last_rates = Some(rates);
                        tracing::debug!(
                            total_kbps = allocation.sum_kbps(),
                            framerate,
                            "rate allocation changed"
                        );
                    }
                    EncoderCommand::SetChannelParameters(channel) => {
                        if let Err(e) = encoder.set_channel_parameters(channel.packet_loss, channel.rtt_ms) {
                            tracing::warn!(error = %e, "encoder rejected channel parameters");
                        }
                    }
                    EncoderCommand::RequestKeyframe => {
                        keyframe_pending = true;
                        metrics.keyframes_requested.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("keyframe requested");
                    }
                    EncoderCommand::SetPeriodicKeyFrames(enable) => {
                        if let Err(e) = encoder.set_periodic_key_frames(enable) {
                            tracing::warn!(error = %e, enable, "encoder rejected periodic key frames");
                        }
                    }
                }
            }
            frame = frame_in_rx.recv() => {
                let Some(frame) = frame else {
                    tracing::debug!("frame input channel closed");
                    break;
                };
                metrics.frames_received.fetch_add(1, Ordering::Relaxed);

                if frame.width != settings.width || frame.height != settings.height {
                    let next = resized(&settings, frame.width, frame.height);
                    tracing::info!(
                        old_width = settings.width,
                        old_height = settings.height,
                        width = frame.width,
                        height = frame.height,
                        "input resolution changed, re-initializing encoder"
                    );
                    if let Err(e) = encoder.init_encode(&next, config.number_of_cores, config.max_payload_size) {
                        tracing::warn!(error = %e, "re-initialization failed, skipping frame");
                        metrics.encode_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    settings = next;
                    metrics.reinitializations.fetch_add(1, Ordering::Relaxed);
                    if let Some(rates) = last_rates {
                        apply_rates(&mut *encoder, rates);
                    }
                    scaling_tx.send_replace(encoder.scaling_settings());
                }

                let key_request =
                    keyframe_pending.then(|| vec![FrameType::Key; settings.number_of_layers()]);

                match encoder.encode(&frame, None, key_request.as_deref()) {
                    Ok(EncodeOutcome::Encoded { deliveries }) => {
                        keyframe_pending = false;
                        metrics.frames_encoded.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(timestamp = frame.timestamp, deliveries, "frame encoded");
                    }
                    Ok(EncodeOutcome::Dropped) => {
                        metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(timestamp = frame.timestamp, "frame dropped by encoder");
                    }
                    Err(EncoderError::Timeout) => {
                        metrics.encode_timeouts.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(timestamp = frame.timestamp, "encode timed out, continuing");
                    }
                    Err(e) => {
                        metrics.encode_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, timestamp = frame.timestamp, "encode failed, skipping frame");
                    }
                }
            }
        }
    }

    if let Err(e) = encoder.release() {
        tracing::warn!(error = %e, "encoder release failed");
    }
}
