//! H.264 encoder backed by OpenH264.
//!
//! Requires the `video-codec` feature to be enabled.

use bytes::Bytes;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode};
use openh264::formats::YUVSlices;
use openh264::nal_units;
use openh264::OpenH264API;
use venc_protocol::frame::key_frame_requested;
use venc_protocol::scaling::QpThresholds;
use venc_protocol::{
    CodecSpecificInfo, CodecType, EncodeOutcome, EncodedImage, EncoderError,
    EncoderResult, FragmentationHeader, FrameType, PixelFormat, RawFrame, ScalingSettings,
    VideoCodecSettings,
};

use crate::encoder::{EncodedImageCallback, VideoEncoder};
use crate::lifecycle::EncoderLifecycle;

const IMPLEMENTATION_NAME: &str = "openh264";

/// QP bounds handed to the quality scaler.
const LOW_QP_THRESHOLD: u32 = 24;
const HIGH_QP_THRESHOLD: u32 = 37;

// Option ids and layout from the OpenH264 C API (codec_app_def.h)
const ENCODER_OPTION_FRAME_RATE: std::ffi::c_int = 4;
const ENCODER_OPTION_BITRATE: std::ffi::c_int = 5;
const SPATIAL_LAYER_ALL: std::ffi::c_int = 4;

/// `SBitrateInfo`
#[repr(C)]
struct BitrateInfo {
    layer: std::ffi::c_int,
    bitrate_bps: std::ffi::c_int,
}

/// Convert RGBA pixel data to I420 (YUV 4:2:0 planar).
///
/// Width and height must be even.
pub fn rgba_to_i420(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for row in 0..h {
        for col in 0..w {
            let idx = (row * w + col) * 4;
            let r = rgba[idx] as f32;
            let g = rgba[idx + 1] as f32;
            let b = rgba[idx + 2] as f32;
            y_plane[row * w + col] = (0.299 * r + 0.587 * g + 0.114 * b)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }

    // Subsample U and V over 2x2 blocks
    for row in (0..h).step_by(2) {
        for col in (0..w).step_by(2) {
            let mut r_sum = 0.0f32;
            let mut g_sum = 0.0f32;
            let mut b_sum = 0.0f32;
            for dr in 0..2 {
                for dc in 0..2 {
                    let idx = ((row + dr) * w + (col + dc)) * 4;
                    r_sum += rgba[idx] as f32;
                    g_sum += rgba[idx + 1] as f32;
                    b_sum += rgba[idx + 2] as f32;
                }
            }
            let (r, g, b) = (r_sum / 4.0, g_sum / 4.0, b_sum / 4.0);

            let uv_idx = (row / 2) * (w / 2) + (col / 2);
            u_plane[uv_idx] = (-0.169 * r - 0.331 * g + 0.500 * b + 128.0)
                .round()
                .clamp(0.0, 255.0) as u8;
            v_plane[uv_idx] = (0.500 * r - 0.419 * g - 0.081 * b + 128.0)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }

    yuv
}

/// Length of the Annex B start code at `i`, if any.
fn start_code_len(data: &[u8], i: usize) -> Option<usize> {
    match data.get(i..) {
        Some([0, 0, 1, ..]) => Some(3),
        Some([0, 0, 0, 1, ..]) => Some(4),
        _ => None,
    }
}

/// True if an Annex B bitstream contains an IDR slice.
fn contains_idr_nal(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if let Some(len) = start_code_len(data, i) {
            if data.get(i + len).is_some_and(|b| b & 0x1F == 5) {
                return true;
            }
            i += len;
        } else {
            i += 1;
        }
    }
    false
}

struct Session {
    encoder: Encoder,
    width: u32,
    height: u32,
    /// Rates the encoder is running at, as `(kbps, fps)`.
    rates: (u32, u32),
    max_payload_size: usize,
}

impl Session {
    /// Pass an option to the underlying encoder.
    ///
    /// # Safety
    ///
    /// `value` must have the layout OpenH264 expects for `option`.
    unsafe fn set_option<T>(&mut self, option: std::ffi::c_int, value: &mut T) -> EncoderResult {
        let raw = self.encoder.raw_api();
        let status = raw.set_option(option, std::ptr::from_mut(value).cast());
        if status != 0 {
            tracing::warn!(option, status, "openh264 rejected option");
            return Err(EncoderError::Error);
        }
        Ok(())
    }
}

/// H.264 encoder wrapping OpenH264. Supports the coarse `set_rates` path only.
pub struct H264Encoder {
    lifecycle: EncoderLifecycle,
    session: Option<Session>,
}

impl H264Encoder {
    pub fn new() -> Self {
        Self {
            lifecycle: EncoderLifecycle::new(IMPLEMENTATION_NAME),
            session: None,
        }
    }

    /// Rates applied to the running encoder, as `(kbps, fps)`.
    pub fn current_rates(&self) -> Option<(u32, u32)> {
        self.session.as_ref().map(|s| s.rates)
    }

    fn build_encoder(bitrate_kbps: u32, framerate: u32) -> EncoderResult<Encoder> {
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate_kbps.saturating_mul(1000)))
            .max_frame_rate(FrameRate::from_hz(framerate as f32))
            .rate_control_mode(RateControlMode::Bitrate);

        let api = OpenH264API::from_source();
        Encoder::with_api_config(api, config).map_err(|e| {
            tracing::error!(error = %e, "failed to create openh264 encoder");
            EncoderError::Error
        })
    }
}

impl Default for H264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for H264Encoder {
    fn init_encode(
        &mut self,
        settings: &VideoCodecSettings,
        number_of_cores: usize,
        max_payload_size: usize,
    ) -> EncoderResult {
        self.lifecycle.begin_init()?;
        self.session = None;

        let checked = if settings.codec_type != CodecType::H264 || number_of_cores == 0 {
            Err(EncoderError::Parameter)
        } else if settings.width % 2 != 0 || settings.height % 2 != 0 {
            Err(EncoderError::Size)
        } else if settings.simulcast_streams.len() > 1 {
            Err(EncoderError::Parameter)
        } else {
            settings.validate()
        };
        if let Err(e) = checked {
            self.lifecycle.abort_init();
            return Err(e);
        }

        let encoder = match Self::build_encoder(settings.start_bitrate_kbps, settings.max_framerate)
        {
            Ok(encoder) => encoder,
            Err(e) => {
                self.lifecycle.abort_init();
                return Err(e);
            }
        };

        tracing::info!(
            width = settings.width,
            height = settings.height,
            framerate = settings.max_framerate,
            bitrate_kbps = settings.start_bitrate_kbps,
            "h264 encoder created"
        );

        self.session = Some(Session {
            encoder,
            width: settings.width,
            height: settings.height,
            rates: (settings.start_bitrate_kbps, settings.max_framerate),
            max_payload_size,
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
        let Some(session) = self.session.as_mut() else {
            return Err(EncoderError::Parameter);
        };
        if frame.width != session.width || frame.height != session.height {
            return Err(EncoderError::Parameter);
        }
        if frame.data.len() < frame.format.expected_len(frame.width, frame.height) {
            return Err(EncoderError::Parameter);
        }

        if self.lifecycle.take_drop_request() {
            self.lifecycle.notify_dropped();
            return Ok(EncodeOutcome::Dropped);
        }

        let i420_data;
        let yuv_data = match frame.format {
            PixelFormat::Rgba => {
                i420_data = rgba_to_i420(&frame.data, session.width, session.height);
                &i420_data
            }
            PixelFormat::I420 => &frame.data,
            PixelFormat::Nv12 => {
                tracing::warn!("NV12 input not supported; convert to RGBA or I420 first");
                return Err(EncoderError::Parameter);
            }
        };

        if self.lifecycle.take_send_failure() || key_frame_requested(frame_types, 0) {
            session.encoder.force_intra_frame();
            tracing::debug!(timestamp = frame.timestamp, "forced keyframe");
        }

        let w = session.width as usize;
        let h = session.height as usize;
        let y_size = w * h;
        let uv_size = (w / 2) * (h / 2);
        let yuv = YUVSlices::new(
            (
                &yuv_data[..y_size],
                &yuv_data[y_size..y_size + uv_size],
                &yuv_data[y_size + uv_size..y_size + uv_size * 2],
            ),
            (w, h),
            (w, w / 2, w / 2),
        );

        let bitstream = match session.encoder.encode(&yuv) {
            Ok(bitstream) => bitstream.to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, timestamp = frame.timestamp, "h264 encode failed");
                return Err(EncoderError::Error);
            }
        };

        if bitstream.is_empty() {
            // Rate control skipped the frame.
            self.lifecycle.notify_dropped();
            return Ok(EncodeOutcome::Dropped);
        }

        let nal_lengths: Vec<usize> = nal_units(&bitstream).map(|n| n.len()).collect();
        let oversized = nal_lengths
            .iter()
            .filter(|len| session.max_payload_size > 0 && **len > session.max_payload_size)
            .count();
        if oversized > 0 {
            tracing::debug!(
                oversized,
                max_payload_size = session.max_payload_size,
                "NAL units exceed max payload size, packetizer must fragment"
            );
        }
        let fragmentation = FragmentationHeader::from_lengths(nal_lengths);
        let key = contains_idr_nal(&bitstream);

        let image = EncodedImage {
            payload: Bytes::from(bitstream),
            timestamp: frame.timestamp,
            capture_time_ms: frame.render_time_ms,
            frame_type: if key { FrameType::Key } else { FrameType::Delta },
            encoded_width: session.width,
            encoded_height: session.height,
            qp: None,
            layer_index: 0,
            complete_frame: true,
        };
        let info = CodecSpecificInfo {
            codec_type: CodecType::H264,
            implementation_name: IMPLEMENTATION_NAME.to_string(),
            simulcast_index: 0,
            temporal_index: None,
        };

        tracing::trace!(
            nal_count = fragmentation.len(),
            total_bytes = image.size(),
            key,
            "encoded frame"
        );

        let deliveries = usize::from(
            self.lifecycle
                .deliver(&image, Some(&info), Some(&fragmentation))
                .is_some(),
        );
        Ok(EncodeOutcome::Encoded { deliveries })
    }

    fn set_channel_parameters(&mut self, packet_loss: u8, rtt_ms: i64) -> EncoderResult {
        self.lifecycle.check_not_released()?;
        // OpenH264 has no loss or RTT input; its rate control only sees set_rates.
        tracing::trace!(packet_loss, rtt_ms, "channel parameters ignored by openh264");
        Ok(())
    }

    fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) -> EncoderResult {
        self.lifecycle.check_not_released()?;
        let Some(session) = self.session.as_mut() else {
            return Err(EncoderError::Error);
        };
        if bitrate_kbps == 0 || framerate == 0 {
            return Err(EncoderError::Parameter);
        }

        let bps = bitrate_kbps.saturating_mul(1000).min(i32::MAX as u32);
        let mut frame_rate = framerate as f32;
        let mut bitrate = BitrateInfo {
            layer: SPATIAL_LAYER_ALL,
            bitrate_bps: bps as std::ffi::c_int,
        };
        // SAFETY: FRAME_RATE takes a float and BITRATE an SBitrateInfo; both
        // pointers refer to live locals of that layout.
        unsafe {
            session.set_option(ENCODER_OPTION_FRAME_RATE, &mut frame_rate)?;
            session.set_option(ENCODER_OPTION_BITRATE, &mut bitrate)?;
        }
        session.rates = (bitrate_kbps, framerate);

        tracing::debug!(bitrate_kbps, framerate, "set encoder rates");
        Ok(())
    }

    fn scaling_settings(&self) -> ScalingSettings {
        ScalingSettings::with_thresholds(
            true,
            QpThresholds {
                low: LOW_QP_THRESHOLD,
                high: HIGH_QP_THRESHOLD,
            },
        )
    }

    fn implementation_name(&self) -> &str {
        IMPLEMENTATION_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use openh264::decoder::{Decoder, DecoderConfig};
    use venc_protocol::DeliveryResult;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    #[derive(Clone, Default)]
    struct Collect {
        images: Arc<Mutex<Vec<EncodedImage>>>,
    }

    impl EncodedImageCallback for Collect {
        fn on_encoded_image(
            &mut self,
            image: &EncodedImage,
            _info: Option<&CodecSpecificInfo>,
            _frag: Option<&FragmentationHeader>,
        ) -> DeliveryResult {
            self.images.lock().unwrap().push(image.clone());
            DeliveryResult::ok(image.timestamp)
        }
    }

    /// Create a solid-color RGBA test frame.
    fn solid_rgba_frame(width: u32, height: u32, r: u8, g: u8, b: u8, index: u32) -> RawFrame {
        let pixel_count = (width * height) as usize;
        let mut data = Vec::with_capacity(pixel_count * 4);
        for _ in 0..pixel_count {
            data.extend_from_slice(&[r, g, b, 255]);
        }
        RawFrame {
            data,
            width,
            height,
            format: PixelFormat::Rgba,
            timestamp: index * 3000,
            render_time_ms: index as i64 * 33,
        }
    }

    fn encoder(width: u32, height: u32, bitrate_kbps: u32) -> (H264Encoder, Collect) {
        let mut encoder = H264Encoder::new();
        let settings = VideoCodecSettings::new(CodecType::H264, width, height, bitrate_kbps);
        encoder.init_encode(&settings, 1, 1200).unwrap();
        let sink = Collect::default();
        encoder
            .register_encode_complete_callback(Box::new(sink.clone()))
            .unwrap();
        (encoder, sink)
    }

    fn decodes(payload: &[u8]) -> bool {
        let api = OpenH264API::from_source();
        let mut decoder = Decoder::with_api_config(api, DecoderConfig::new()).unwrap();
        let mut decoded = false;
        for nal in nal_units(payload) {
            if decoder.decode(nal).unwrap().is_some() {
                decoded = true;
            }
        }
        decoded
    }

    #[test]
    fn first_frame_is_decodable_keyframe() {
        init_test_tracing();
        let (mut encoder, sink) = encoder(160, 120, 200);

        let outcome = encoder
            .encode(&solid_rgba_frame(160, 120, 255, 0, 0, 0), None, None)
            .unwrap();
        assert_eq!(outcome, EncodeOutcome::Encoded { deliveries: 1 });

        let images = sink.images.lock().unwrap();
        assert_eq!(images[0].frame_type, FrameType::Key);
        assert_eq!(images[0].timestamp, 0);
        assert!(decodes(&images[0].payload));
    }

    #[test]
    fn key_frame_hint_produces_idr() {
        init_test_tracing();
        let (mut encoder, sink) = encoder(160, 120, 200);

        for i in 0..10 {
            let frame = solid_rgba_frame(160, 120, (i * 20) as u8, 100, 50, i);
            encoder.encode(&frame, None, None).unwrap();
        }
        let frame = solid_rgba_frame(160, 120, 255, 255, 0, 10);
        encoder.encode(&frame, None, Some(&[FrameType::Key])).unwrap();

        let images = sink.images.lock().unwrap();
        let last = images.last().unwrap();
        assert_eq!(last.frame_type, FrameType::Key);
        assert!(decodes(&last.payload));
    }

    #[test]
    fn set_rates_at_runtime() {
        init_test_tracing();
        let (mut encoder, sink) = encoder(160, 120, 500);
        for i in 0..5 {
            let frame = solid_rgba_frame(160, 120, (i * 40) as u8, 100, 50, i);
            encoder.encode(&frame, None, None).unwrap();
        }
        assert_eq!(encoder.current_rates(), Some((500, 30)));
        assert_eq!(encoder.set_rates(100, 15), Ok(()));
        assert_eq!(encoder.current_rates(), Some((100, 15)));

        // Rejected updates leave the running rates alone
        assert_eq!(encoder.set_rates(0, 15), Err(EncoderError::Parameter));
        assert_eq!(encoder.set_rates(100, 0), Err(EncoderError::Parameter));
        assert_eq!(encoder.current_rates(), Some((100, 15)));

        let frame = solid_rgba_frame(160, 120, 10, 100, 50, 5);
        encoder.encode(&frame, None, Some(&[FrameType::Key])).unwrap();
        let images = sink.images.lock().unwrap();
        let last = images.last().unwrap();
        assert_eq!(last.frame_type, FrameType::Key);
        assert!(decodes(&last.payload));
    }

    #[test]
    fn set_rates_needs_running_encoder() {
        let mut idle = H264Encoder::new();
        assert_eq!(idle.set_rates(300, 30), Err(EncoderError::Error));
        assert_eq!(idle.current_rates(), None);

        let (mut released, _sink) = encoder(160, 120, 300);
        released.release().unwrap();
        assert_eq!(released.set_rates(300, 30), Err(EncoderError::Error));
        assert_eq!(
            released.set_channel_parameters(10, 20),
            Err(EncoderError::Error)
        );
    }

    #[test]
    fn rejects_other_codecs_and_odd_sizes() {
        let mut encoder = H264Encoder::new();
        let vp8 = VideoCodecSettings::new(CodecType::Vp8, 160, 120, 200);
        assert_eq!(encoder.init_encode(&vp8, 1, 0), Err(EncoderError::Parameter));
        let odd = VideoCodecSettings::new(CodecType::H264, 161, 120, 200);
        assert_eq!(encoder.init_encode(&odd, 1, 0), Err(EncoderError::Size));
    }

    #[test]
    fn scaling_thresholds_reported() {
        let settings = H264Encoder::new().scaling_settings();
        assert!(settings.enabled);
        assert_eq!(settings.thresholds, Some(QpThresholds { low: 24, high: 37 }));
    }

    #[test]
    fn contains_idr_nal_detects_keyframe() {
        assert!(contains_idr_nal(&[0x00, 0x00, 0x00, 0x01, 0x65, 0xFF, 0xFF]));
        assert!(!contains_idr_nal(&[0x00, 0x00, 0x00, 0x01, 0x41, 0xFF, 0xFF]));
        assert!(contains_idr_nal(&[0x00, 0x00, 0x01, 0x65, 0xFF]));
        assert!(!contains_idr_nal(&[]));
    }

    #[test]
    fn rgba_i420_correct_sizes() {
        let rgba = vec![128u8; 320 * 240 * 4];
        let i420 = rgba_to_i420(&rgba, 320, 240);
        assert_eq!(i420.len(), 320 * 240 * 3 / 2);
    }
}
