//! Deterministic reference encoder.
//!
//! `FakeEncoder` produces no real bitstream. It sizes each layer's payload from
//! the allocated bitrate and framerate, honours key frame requests and callback
//! feedback, and partitions payloads to the configured maximum payload size.
//! Pipelines and tests use it wherever a codec library is unavailable or
//! unnecessary.

use bytes::Bytes;
use venc_protocol::frame::key_frame_requested;
use venc_protocol::{
    BitrateAllocation, ChannelParameters, CodecSpecificInfo, EncodeOutcome, EncodedImage,
    EncoderError, EncoderResult, FragmentationHeader, FrameType, RawFrame, ScalingSettings,
    VideoCodecSettings,
};

use crate::allocator::SimulcastRateAllocator;
use crate::encoder::{EncodedImageCallback, VideoEncoder};
use crate::lifecycle::{EncoderLifecycle, EncoderState};

const IMPLEMENTATION_NAME: &str = "fake_encoder";

/// Key frames are this many times larger than delta frames.
const KEY_FRAME_SIZE_FACTOR: usize = 3;

/// Tunables that let tests steer the encoder.
#[derive(Debug, Clone, Default)]
pub struct FakeEncoderConfig {
    /// Reported by `scaling_settings`.
    pub scaling: ScalingSettings,
    /// Return `Timeout` for the `encode` call with this zero-based index.
    pub timeout_on_frame: Option<u64>,
    /// Fail `init_encode` with this error.
    pub init_error: Option<EncoderError>,
    /// Fail every `encode` call with this error.
    pub encode_error: Option<EncoderError>,
}

#[derive(Debug, Clone, Copy)]
struct Layer {
    width: u32,
    height: u32,
    qp_max: u32,
}

struct Session {
    settings: VideoCodecSettings,
    layers: Vec<Layer>,
    max_payload_size: usize,
    allocation: BitrateAllocation,
    framerate: u32,
    /// Frames since the last key frame, per layer. `None` until the first key frame.
    since_key: Vec<Option<u32>>,
}

/// Reference implementation of [`VideoEncoder`].
pub struct FakeEncoder {
    lifecycle: EncoderLifecycle,
    config: FakeEncoderConfig,
    session: Option<Session>,
    channel: ChannelParameters,
    periodic_key_frames: bool,
    encode_calls: u64,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::with_config(FakeEncoderConfig::default())
    }

    pub fn with_config(config: FakeEncoderConfig) -> Self {
        Self {
            lifecycle: EncoderLifecycle::new(IMPLEMENTATION_NAME),
            config,
            session: None,
            channel: ChannelParameters::default(),
            periodic_key_frames: false,
            encode_calls: 0,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.lifecycle.state()
    }

    /// Last channel parameters reported by the pipeline.
    pub fn channel_parameters(&self) -> ChannelParameters {
        self.channel
    }

    /// Current rate allocation, if initialized.
    pub fn allocation(&self) -> Option<&BitrateAllocation> {
        self.session.as_ref().map(|s| &s.allocation)
    }

    fn encode_layers(
        &mut self,
        frame: &RawFrame,
        frame_types: Option<&[FrameType]>,
        force_key: bool,
    ) -> usize {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        let interval = session.settings.specific.key_frame_interval();
        let framerate = session.framerate.max(1);
        let mut deliveries = 0;

        for (index, layer) in session.layers.iter().enumerate() {
            let layer_bps = session.allocation.spatial_layer_bitrate(index);
            if layer_bps == 0 {
                continue;
            }

            let since_key = session.since_key[index];
            let periodic_due = self.periodic_key_frames
                && matches!((since_key, interval), (Some(n), Some(i)) if n + 1 >= i);
            let key = force_key
                || since_key.is_none()
                || periodic_due
                || key_frame_requested(frame_types, index);

            let delta_bytes = (layer_bps as usize / 8 / framerate as usize).max(1);
            let size = if key {
                delta_bytes * KEY_FRAME_SIZE_FACTOR
            } else {
                delta_bytes
            };
            let payload = synthetic_payload(size, index as u8, key, self.encode_calls);
            let qp = synthetic_qp(size, layer);

            let image = EncodedImage {
                payload,
                timestamp: frame.timestamp,
                capture_time_ms: frame.render_time_ms,
                frame_type: if key { FrameType::Key } else { FrameType::Delta },
                encoded_width: layer.width,
                encoded_height: layer.height,
                qp: Some(qp),
                layer_index: index as u8,
                complete_frame: true,
            };
            let fragmentation = FragmentationHeader::split(size, session.max_payload_size);
            let info = CodecSpecificInfo {
                codec_type: session.settings.codec_type,
                implementation_name: IMPLEMENTATION_NAME.to_string(),
                simulcast_index: index as u8,
                temporal_index: None,
            };

            session.since_key[index] = Some(if key { 0 } else { since_key.unwrap_or(0) + 1 });

            tracing::trace!(
                timestamp = frame.timestamp,
                layer = index,
                size,
                qp,
                key,
                "fake encoded layer"
            );

            if self
                .lifecycle
                .deliver(&image, Some(&info), Some(&fragmentation))
                .is_some()
            {
                deliveries += 1;
            }
        }

        deliveries
    }
}

impl Default for FakeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn synthetic_payload(size: usize, layer: u8, key: bool, frame_index: u64) -> Bytes {
    let mut data = Vec::with_capacity(size);
    data.push((layer << 4) | u8::from(key));
    data.extend((1..size).map(|i| (i as u8).wrapping_add(frame_index as u8)));
    Bytes::from(data)
}

/// QP falls as the bits spent per pixel rise.
fn synthetic_qp(size: usize, layer: &Layer) -> u32 {
    let pixels = (layer.width as f64 * layer.height as f64).max(1.0);
    let bits_per_pixel = size as f64 * 8.0 / pixels;
    let quality = (bits_per_pixel / 0.5).min(1.0);
    ((layer.qp_max as f64 * (1.0 - quality)).round() as u32).max(1)
}

impl VideoEncoder for FakeEncoder {
    fn init_encode(
        &mut self,
        settings: &VideoCodecSettings,
        number_of_cores: usize,
        max_payload_size: usize,
    ) -> EncoderResult {
        self.lifecycle.begin_init()?;
        self.session = None;

        if number_of_cores == 0 {
            self.lifecycle.abort_init();
            return Err(EncoderError::Parameter);
        }
        if let Err(e) = settings.validate() {
            self.lifecycle.abort_init();
            return Err(e);
        }
        if let Some(e) = self.config.init_error {
            self.lifecycle.abort_init();
            return Err(e);
        }

        let layers: Vec<Layer> = if settings.simulcast_streams.is_empty() {
            vec![Layer {
                width: settings.width,
                height: settings.height,
                qp_max: settings.qp_max,
            }]
        } else {
            settings
                .simulcast_streams
                .iter()
                .map(|s| Layer {
                    width: s.width,
                    height: s.height,
                    qp_max: s.qp_max,
                })
                .collect()
        };

        let allocation =
            SimulcastRateAllocator::new(settings.clone()).allocate(settings.start_bitrate_kbps);

        tracing::info!(
            width = settings.width,
            height = settings.height,
            layers = layers.len(),
            start_bitrate_kbps = settings.start_bitrate_kbps,
            max_payload_size,
            "fake encoder configured"
        );

        self.session = Some(Session {
            since_key: vec![None; layers.len()],
            layers,
            max_payload_size,
            allocation,
            framerate: settings.max_framerate,
            settings: settings.clone(),
        });
        self.lifecycle.complete_init();
        Ok(())
    }

    fn register_encode_complete_callback(
        &mut self,
        callback: Box<dyn EncodedImageCallback>,
    ) -> EncoderResult {
        self.lifecycle.register(callback)
    }

    fn release(&mut self) -> EncoderResult {
        self.session = None;
        self.lifecycle.release();
        Ok(())
    }

    fn encode(
        &mut self,
        frame: &RawFrame,
        _codec_specific_info: Option<&CodecSpecificInfo>,
        frame_types: Option<&[FrameType]>,
    ) -> EncoderResult<EncodeOutcome> {
        self.lifecycle.check_encodable()?;
        let Some(session) = self.session.as_ref() else {
            return Err(EncoderError::Parameter);
        };
        if frame.width != session.settings.width || frame.height != session.settings.height {
            tracing::warn!(
                frame_width = frame.width,
                frame_height = frame.height,
                width = session.settings.width,
                height = session.settings.height,
                "frame size does not match encoder configuration"
            );
            return Err(EncoderError::Parameter);
        }
        if frame.data.len() < frame.format.expected_len(frame.width, frame.height) {
            return Err(EncoderError::Parameter);
        }

        let call = self.encode_calls;
        self.encode_calls += 1;

        if self.lifecycle.take_drop_request() {
            tracing::debug!(timestamp = frame.timestamp, "dropping frame on callback request");
            self.lifecycle.notify_dropped();
            return Ok(EncodeOutcome::Dropped);
        }
        if self.config.timeout_on_frame == Some(call) {
            return Err(EncoderError::Timeout);
        }
        if let Some(e) = self.config.encode_error {
            return Err(e);
        }
        if session.allocation.sum_bps() == 0 {
            tracing::trace!(timestamp = frame.timestamp, "stream paused, dropping frame");
            self.lifecycle.notify_dropped();
            return Ok(EncodeOutcome::Dropped);
        }

        let force_key = self.lifecycle.take_send_failure();
        let deliveries = self.encode_layers(frame, frame_types, force_key);
        Ok(EncodeOutcome::Encoded { deliveries })
    }

    fn set_channel_parameters(&mut self, packet_loss: u8, rtt_ms: i64) -> EncoderResult {
        self.lifecycle.check_not_released()?;
        self.channel = ChannelParameters {
            packet_loss,
            rtt_ms,
        };
        tracing::debug!(
            loss_percent = self.channel.loss_percent(),
            rtt_ms,
            "channel parameters updated"
        );
        Ok(())
    }

    fn set_rate_allocation(
        &mut self,
        allocation: &BitrateAllocation,
        framerate: u32,
    ) -> EncoderResult {
        self.lifecycle.check_not_released()?;
        let Some(session) = self.session.as_mut() else {
            return Err(EncoderError::Error);
        };
        if framerate == 0 {
            return Err(EncoderError::Parameter);
        }
        session.allocation = *allocation;
        session.framerate = framerate.min(session.settings.max_framerate.max(1));
        tracing::debug!(
            bitrate_kbps = allocation.sum_kbps(),
            framerate = session.framerate,
            "rate allocation updated"
        );
        Ok(())
    }

    fn scaling_settings(&self) -> ScalingSettings {
        self.config.scaling
    }

    fn set_periodic_key_frames(&mut self, enable: bool) -> EncoderResult {
        self.lifecycle.check_not_released()?;
        self.periodic_key_frames = enable;
        Ok(())
    }

    fn implementation_name(&self) -> &str {
        IMPLEMENTATION_NAME
    }
}
