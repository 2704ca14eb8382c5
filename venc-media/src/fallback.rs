//! Software fallback wrapper.
//!
//! `FallbackEncoder` drives a primary (typically hardware) encoder and swaps in
//! a software encoder of the same type when the primary cannot initialize or
//! fails mid-stream. The swap is invisible to the pipeline: the same callback
//! keeps receiving images and the last rate and channel state is replayed.

use std::sync::Arc;

use venc_protocol::{
    BitrateAllocation, ChannelParameters, CodecSpecificInfo, EncodeOutcome, EncoderError,
    EncoderResult, EncoderType, FrameType, RawFrame, ScalingSettings, VideoCodecSettings,
};

use crate::encoder::{EncodedImageCallback, SharedCallback, VideoEncoder};
use crate::factory::VideoEncoderFactory;

#[derive(Debug, Clone, Copy)]
enum Rates {
    Coarse { bitrate_kbps: u32, framerate: u32 },
    Allocation { allocation: BitrateAllocation, framerate: u32 },
}

#[derive(Debug, Clone)]
struct InitParams {
    settings: VideoCodecSettings,
    number_of_cores: usize,
    max_payload_size: usize,
}

/// Encoder that falls back to software when the primary fails.
pub struct FallbackEncoder {
    primary: Box<dyn VideoEncoder>,
    fallback: Option<Box<dyn VideoEncoder>>,
    factory: Arc<dyn VideoEncoderFactory>,
    name: String,
    native_handle: bool,
    init: Option<InitParams>,
    callback: Option<SharedCallback>,
    rates: Option<Rates>,
    channel: Option<ChannelParameters>,
    periodic_key_frames: Option<bool>,
    released: bool,
}

impl FallbackEncoder {
    pub fn new(primary: Box<dyn VideoEncoder>, factory: Arc<dyn VideoEncoderFactory>) -> Self {
        let name = primary.implementation_name().to_string();
        let native_handle = primary.supports_native_handle();
        Self {
            primary,
            fallback: None,
            factory,
            name,
            native_handle,
            init: None,
            callback: None,
            rates: None,
            channel: None,
            periodic_key_frames: None,
            released: false,
        }
    }

    /// Whether the software fallback has taken over.
    pub fn is_using_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Name of the encoder currently producing output.
    pub fn active_implementation_name(&self) -> &str {
        match &self.fallback {
            Some(encoder) => encoder.implementation_name(),
            None => self.primary.implementation_name(),
        }
    }

    fn active(&mut self) -> &mut dyn VideoEncoder {
        match self.fallback.as_mut() {
            Some(encoder) => &mut **encoder,
            None => &mut *self.primary,
        }
    }

    /// Build, initialize and prime a software encoder. Returns false if none
    /// could be brought up; the primary stays in place in that case.
    fn engage_fallback(&mut self) -> bool {
        let Some(init) = self.init.clone() else {
            return false;
        };
        let encoder_type = EncoderType::from_codec_type(init.settings.codec_type);
        let Some(mut encoder) = self.factory.create(encoder_type) else {
            tracing::warn!(
                primary = %self.name,
                ?encoder_type,
                "no software fallback available"
            );
            return false;
        };

        if let Err(e) =
            encoder.init_encode(&init.settings, init.number_of_cores, init.max_payload_size)
        {
            tracing::warn!(
                fallback = encoder.implementation_name(),
                error = %e,
                "software fallback failed to initialize"
            );
            return false;
        }

        if let Some(callback) = &self.callback {
            if let Err(e) = encoder.register_encode_complete_callback(Box::new(callback.clone())) {
                tracing::warn!(error = %e, "software fallback rejected callback");
                return false;
            }
        }

        // Replay the last control state; failures here are advisory.
        let replayed = match self.rates {
            Some(Rates::Coarse {
                bitrate_kbps,
                framerate,
            }) => encoder.set_rates(bitrate_kbps, framerate),
            Some(Rates::Allocation {
                allocation,
                framerate,
            }) => encoder.set_rate_allocation(&allocation, framerate),
            None => Ok(()),
        };
        if let Err(e) = replayed {
            tracing::warn!(error = %e, "replaying rates on software fallback failed");
        }
        if let Some(channel) = self.channel {
            if let Err(e) = encoder.set_channel_parameters(channel.packet_loss, channel.rtt_ms) {
                tracing::warn!(
                    error = %e,
                    "replaying channel parameters on software fallback failed"
                );
            }
        }
        if let Some(enable) = self.periodic_key_frames {
            if let Err(e) = encoder.set_periodic_key_frames(enable) {
                tracing::warn!(
                    error = %e,
                    enable,
                    "replaying periodic key frames on software fallback failed"
                );
            }
        }

        let _ = self.primary.release();
        tracing::warn!(
            primary = %self.name,
            fallback = encoder.implementation_name(),
            "switched to software fallback encoder"
        );
        self.fallback = Some(encoder);
        true
    }
}

impl VideoEncoder for FallbackEncoder {
    fn init_encode(
        &mut self,
        settings: &VideoCodecSettings,
        number_of_cores: usize,
        max_payload_size: usize,
    ) -> EncoderResult {
        if self.released {
            return Err(EncoderError::Parameter);
        }
        self.init = Some(InitParams {
            settings: settings.clone(),
            number_of_cores,
            max_payload_size,
        });

        if let Some(fallback) = self.fallback.as_mut() {
            return fallback.init_encode(settings, number_of_cores, max_payload_size);
        }

        match self
            .primary
            .init_encode(settings, number_of_cores, max_payload_size)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(primary = %self.name, error = %e, "primary encoder init failed");
                if self.engage_fallback() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn register_encode_complete_callback(
        &mut self,
        callback: Box<dyn EncodedImageCallback>,
    ) -> EncoderResult {
        if self.released {
            return Err(EncoderError::Parameter);
        }
        let shared = SharedCallback::new(callback);
        self.callback = Some(shared.clone());
        self.active()
            .register_encode_complete_callback(Box::new(shared))
    }

    fn release(&mut self) -> EncoderResult {
        let primary = self.primary.release();
        let fallback = match self.fallback.take() {
            Some(mut encoder) => encoder.release(),
            None => Ok(()),
        };
        self.callback = None;
        self.released = true;
        primary.and(fallback)
    }

    fn encode(
        &mut self,
        frame: &RawFrame,
        codec_specific_info: Option<&CodecSpecificInfo>,
        frame_types: Option<&[FrameType]>,
    ) -> EncoderResult<EncodeOutcome> {
        let result = self
            .active()
            .encode(frame, codec_specific_info, frame_types);
        match result {
            Err(EncoderError::Error) if self.fallback.is_none() => {
                tracing::warn!(
                    primary = %self.name,
                    timestamp = frame.timestamp,
                    "primary encoder failed, trying software fallback"
                );
                if self.engage_fallback() {
                    self.active()
                        .encode(frame, codec_specific_info, frame_types)
                } else {
                    Err(EncoderError::Error)
                }
            }
            other => other,
        }
    }

    fn set_channel_parameters(&mut self, packet_loss: u8, rtt_ms: i64) -> EncoderResult {
        self.channel = Some(ChannelParameters {
            packet_loss,
            rtt_ms,
        });
        self.active().set_channel_parameters(packet_loss, rtt_ms)
    }

    fn set_rates(&mut self, bitrate_kbps: u32, framerate: u32) -> EncoderResult {
        self.rates = Some(Rates::Coarse {
            bitrate_kbps,
            framerate,
        });
        self.active().set_rates(bitrate_kbps, framerate)
    }

    fn set_rate_allocation(
        &mut self,
        allocation: &BitrateAllocation,
        framerate: u32,
    ) -> EncoderResult {
        self.rates = Some(Rates::Allocation {
            allocation: *allocation,
            framerate,
        });
        self.active().set_rate_allocation(allocation, framerate)
    }

    fn scaling_settings(&self) -> ScalingSettings {
        match &self.fallback {
            Some(encoder) => encoder.scaling_settings(),
            None => self.primary.scaling_settings(),
        }
    }

    fn set_periodic_key_frames(&mut self, enable: bool) -> EncoderResult {
        self.periodic_key_frames = Some(enable);
        self.active().set_periodic_key_frames(enable)
    }

    fn supports_native_handle(&self) -> bool {
        self.native_handle
    }

    fn implementation_name(&self) -> &str {
        &self.name
    }
}
