//! The encoder contract: `VideoEncoder` and the `EncodedImageCallback` sink.
//!
//! A pipeline drives an encoder through `init_encode` → `register_encode_complete_callback`
//! → repeated `encode` → `release`. Encoded output only ever leaves the encoder
//! through the registered callback.

use std::sync::{Arc, Mutex};

use venc_protocol::{
    BitrateAllocation, CodecSpecificInfo, DeliveryResult, EncodeOutcome, EncodedImage,
    EncoderError, EncoderResult, FragmentationHeader, FrameType, RawFrame, ScalingSettings,
    VideoCodecSettings,
};

/// Sink that receives encoded images from an encoder.
pub trait EncodedImageCallback: Send {
    /// Called once per produced image.
    ///
    /// Must return quickly: a synchronous encoder is blocked until it does.
    /// `image` is only valid for the duration of the call; clone its payload
    /// to keep it.
    fn on_encoded_image(
        &mut self,
        image: &EncodedImage,
        codec_specific_info: Option<&CodecSpecificInfo>,
        fragmentation: Option<&FragmentationHeader>,
    ) -> DeliveryResult;

    /// Called when the encoder elects not to produce output for a pushed frame.
    fn on_dropped_frame(&mut self) {}
}

/// Callback that can be handed to several encoders at once.
///
/// Used by [`FallbackEncoder`](crate::fallback::FallbackEncoder) so the primary
/// and the software fallback deliver into the same sink.
#[derive(Clone)]
pub struct SharedCallback {
    inner: Arc<Mutex<Box<dyn EncodedImageCallback>>>,
}

impl SharedCallback {
    pub fn new(callback: Box<dyn EncodedImageCallback>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(callback)),
        }
    }
}

impl EncodedImageCallback for SharedCallback {
    fn on_encoded_image(
        &mut self,
        image: &EncodedImage,
        codec_specific_info: Option<&CodecSpecificInfo>,
        fragmentation: Option<&FragmentationHeader>,
    ) -> DeliveryResult {
        match self.inner.lock() {
            Ok(mut cb) => cb.on_encoded_image(image, codec_specific_info, fragmentation),
            Err(_) => {
                tracing::error!("shared callback poisoned, dropping encoded image");
                DeliveryResult::send_failed()
            }
        }
    }

    fn on_dropped_frame(&mut self) {
        if let Ok(mut cb) = self.inner.lock() {
            cb.on_dropped_frame();
        }
    }
}

/// A stateful video encoder.
///
/// Lifecycle: `Uninitialized → Initialized → Released`. Released is terminal.
///
/// Calls taking `&mut self` are serialized by the borrow checker, so `encode`
/// never overlaps another `encode`, a callback change, or `release`. A
/// pipeline that needs rate updates from a control thread forwards them to
/// the task that owns the encoder (see [`EncodePipeline`](crate::encode_pipeline::EncodePipeline)).
pub trait VideoEncoder: Send {
    /// Initialize with `settings`.
    ///
    /// `max_payload_size` bounds a single compressed partition; 0 means no
    /// limit. Calling this while initialized tears down the previous session
    /// first.
    fn init_encode(
        &mut self,
        settings: &VideoCodecSettings,
        number_of_cores: usize,
        max_payload_size: usize,
    ) -> EncoderResult;

    /// Replace the sink that receives encoded images.
    fn register_encode_complete_callback(
        &mut self,
        callback: Box<dyn EncodedImageCallback>,
    ) -> EncoderResult;

    /// Free all encoder state and drop the callback. Idempotent.
    fn release(&mut self) -> EncoderResult;

    /// Encode one frame.
    ///
    /// Deliveries happen before this returns, in ascending layer order, at
    /// most one per configured layer. `frame_types` optionally requests a
    /// frame type per layer.
    fn encode(
        &mut self,
        frame: &RawFrame,
        codec_specific_info: Option<&CodecSpecificInfo>,
        frame_types: Option<&[FrameType]>,
    ) -> EncoderResult<EncodeOutcome>;

    /// Report packet loss (fraction scaled to 0..=255) and RTT in milliseconds.
    fn set_channel_parameters(&mut self, packet_loss: u8, rtt_ms: i64) -> EncoderResult;

    /// Coarse rate control: one target for the whole stream.
    ///
    /// Implementations that only handle [`set_rate_allocation`](Self::set_rate_allocation)
    /// leave this unimplemented; reaching it is a programming error.
    fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) -> EncoderResult {
        tracing::error!(
            implementation = self.implementation_name(),
            bitrate_kbps,
            framerate,
            "set_rates called on an encoder that does not support it"
        );
        debug_assert!(
            false,
            "set_rates is not supported by {}",
            self.implementation_name()
        );
        Err(EncoderError::Error)
    }

    /// Fine-grained rate control: per-layer bitrates.
    ///
    /// Defaults to collapsing the allocation to its total and forwarding it to
    /// [`set_rates`](Self::set_rates).
    fn set_rate_allocation(
        &mut self,
        allocation: &BitrateAllocation,
        framerate: u32,
    ) -> EncoderResult {
        self.set_rates(allocation.sum_kbps(), framerate)
    }

    /// QP thresholds for an external quality scaler.
    fn scaling_settings(&self) -> ScalingSettings {
        ScalingSettings::disabled()
    }

    fn set_periodic_key_frames(&mut self, _enable: bool) -> EncoderResult {
        Err(EncoderError::Error)
    }

    fn supports_native_handle(&self) -> bool {
        false
    }

    fn implementation_name(&self) -> &str {
        "unknown"
    }
}

impl<E: VideoEncoder + ?Sized> VideoEncoder for Box<E> {
    fn init_encode(
        &mut self,
        settings: &VideoCodecSettings,
        number_of_cores: usize,
        max_payload_size: usize,
    ) -> EncoderResult {
        (**self).init_encode(settings, number_of_cores, max_payload_size)
    }

    fn register_encode_complete_callback(
        &mut self,
        callback: Box<dyn EncodedImageCallback>,
    ) -> EncoderResult {
        (**self).register_encode_complete_callback(callback)
    }

    fn release(&mut self) -> EncoderResult {
        (**self).release()
    }

    fn encode(
        &mut self,
        frame: &RawFrame,
        codec_specific_info: Option<&CodecSpecificInfo>,
        frame_types: Option<&[FrameType]>,
    ) -> EncoderResult<EncodeOutcome> {
        (**self).encode(frame, codec_specific_info, frame_types)
    }

    fn set_channel_parameters(&mut self, packet_loss: u8, rtt_ms: i64) -> EncoderResult {
        (**self).set_channel_parameters(packet_loss, rtt_ms)
    }

    fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) -> EncoderResult {
        (**self).set_rates(bitrate_kbps, framerate)
    }

    fn set_rate_allocation(
        &mut self,
        allocation: &BitrateAllocation,
        framerate: u32,
    ) -> EncoderResult {
        (**self).set_rate_allocation(allocation, framerate)
    }

    fn scaling_settings(&self) -> ScalingSettings {
        (**self).scaling_settings()
    }

    fn set_periodic_key_frames(&mut self, enable: bool) -> EncoderResult {
        (**self).set_periodic_key_frames(enable)
    }

    fn supports_native_handle(&self) -> bool {
        (**self).supports_native_handle()
    }

    fn implementation_name(&self) -> &str {
        (**self).implementation_name()
    }
}
