//! Codec settings handed to `init_encode`.

use serde::{Deserialize, Serialize};

use crate::status::{EncoderError, EncoderResult};

/// Maximum number of simulcast streams a configuration may carry.
pub const MAX_SIMULCAST_STREAMS: usize = 4;

/// Maximum number of temporal layers per stream.
pub const MAX_TEMPORAL_LAYERS: u8 = 4;

/// Default key frame interval (in frames) for all codecs.
const DEFAULT_KEY_FRAME_INTERVAL: u32 = 3000;

/// Video codec carried by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    Vp8,
    Vp9,
    H264,
    Generic,
}

/// Encoder family a factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderType {
    H264,
    Vp8,
    Vp9,
    Unsupported,
}

impl EncoderType {
    pub fn from_codec_type(codec_type: CodecType) -> Self {
        match codec_type {
            CodecType::H264 => EncoderType::H264,
            CodecType::Vp8 => EncoderType::Vp8,
            CodecType::Vp9 => EncoderType::Vp9,
            CodecType::Generic => EncoderType::Unsupported,
        }
    }
}

/// Content the stream carries; encoders tune differently for screen content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentMode {
    #[default]
    RealtimeVideo,
    Screensharing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Normal,
    High,
    Higher,
    Max,
}

/// VP8 tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vp8Settings {
    pub complexity: Complexity,
    pub resilience: bool,
    pub number_of_temporal_layers: u8,
    pub denoising: bool,
    pub error_concealment: bool,
    pub automatic_resize: bool,
    pub frame_dropping: bool,
    pub key_frame_interval: u32,
}

impl Default for Vp8Settings {
    fn default() -> Self {
        Self {
            complexity: Complexity::Normal,
            resilience: true,
            number_of_temporal_layers: 1,
            denoising: true,
            error_concealment: false,
            automatic_resize: false,
            frame_dropping: true,
            key_frame_interval: DEFAULT_KEY_FRAME_INTERVAL,
        }
    }
}

/// VP9 tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vp9Settings {
    pub complexity: Complexity,
    pub resilience: bool,
    pub number_of_temporal_layers: u8,
    pub denoising: bool,
    pub frame_dropping: bool,
    pub key_frame_interval: u32,
    pub adaptive_qp_mode: bool,
    pub automatic_resize: bool,
    pub number_of_spatial_layers: u8,
    pub flexible_mode: bool,
}

impl Default for Vp9Settings {
    fn default() -> Self {
        Self {
            complexity: Complexity::Normal,
            resilience: true,
            number_of_temporal_layers: 1,
            denoising: true,
            frame_dropping: true,
            key_frame_interval: DEFAULT_KEY_FRAME_INTERVAL,
            adaptive_qp_mode: true,
            automatic_resize: true,
            number_of_spatial_layers: 1,
            flexible_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum H264Profile {
    #[default]
    ConstrainedBaseline,
    Baseline,
    Main,
    High,
}

/// H.264 tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct H264Settings {
    pub frame_dropping: bool,
    pub key_frame_interval: u32,
    pub profile: H264Profile,
}

impl Default for H264Settings {
    fn default() -> Self {
        Self {
            frame_dropping: true,
            key_frame_interval: DEFAULT_KEY_FRAME_INTERVAL,
            profile: H264Profile::ConstrainedBaseline,
        }
    }
}

/// Codec-specific sub-settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum CodecSpecific {
    Vp8(Vp8Settings),
    Vp9(Vp9Settings),
    H264(H264Settings),
    #[default]
    None,
}

impl CodecSpecific {
    /// Default sub-settings for a codec.
    pub fn default_for(codec_type: CodecType) -> Self {
        match codec_type {
            CodecType::Vp8 => CodecSpecific::Vp8(Vp8Settings::default()),
            CodecType::Vp9 => CodecSpecific::Vp9(Vp9Settings::default()),
            CodecType::H264 => CodecSpecific::H264(H264Settings::default()),
            CodecType::Generic => CodecSpecific::None,
        }
    }

    fn matches(&self, codec_type: CodecType) -> bool {
        matches!(
            (self, codec_type),
            (CodecSpecific::None, _)
                | (CodecSpecific::Vp8(_), CodecType::Vp8)
                | (CodecSpecific::Vp9(_), CodecType::Vp9)
                | (CodecSpecific::H264(_), CodecType::H264)
        )
    }

    /// Key frame interval in frames, if the codec defines one.
    pub fn key_frame_interval(&self) -> Option<u32> {
        match self {
            CodecSpecific::Vp8(s) => Some(s.key_frame_interval),
            CodecSpecific::Vp9(s) => Some(s.key_frame_interval),
            CodecSpecific::H264(s) => Some(s.key_frame_interval),
            CodecSpecific::None => None,
        }
    }

    /// Number of temporal layers the codec is configured for.
    pub fn temporal_layers(&self) -> u8 {
        match self {
            CodecSpecific::Vp8(s) => s.number_of_temporal_layers,
            CodecSpecific::Vp9(s) => s.number_of_temporal_layers,
            CodecSpecific::H264(_) | CodecSpecific::None => 1,
        }
    }
}

/// One simulcast stream; streams are ordered from lowest to highest resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulcastStream {
    pub width: u32,
    pub height: u32,
    pub number_of_temporal_layers: u8,
    pub min_bitrate_kbps: u32,
    pub target_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub qp_max: u32,
}

/// Full encoder configuration for one `init_encode` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCodecSettings {
    pub codec_type: CodecType,
    pub width: u32,
    pub height: u32,
    pub start_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub max_framerate: u32,
    pub qp_max: u32,
    #[serde(default)]
    pub mode: ContentMode,
    #[serde(default)]
    pub simulcast_streams: Vec<SimulcastStream>,
    #[serde(default)]
    pub specific: CodecSpecific,
}

impl VideoCodecSettings {
    /// Single-layer configuration with default codec-specific settings.
    pub fn new(codec_type: CodecType, width: u32, height: u32, start_bitrate_kbps: u32) -> Self {
        Self {
            codec_type,
            width,
            height,
            start_bitrate_kbps,
            min_bitrate_kbps: 30,
            max_bitrate_kbps: start_bitrate_kbps.max(30) * 2,
            max_framerate: 30,
            qp_max: 56,
            mode: ContentMode::RealtimeVideo,
            simulcast_streams: Vec::new(),
            specific: CodecSpecific::default_for(codec_type),
        }
    }

    /// Maximum number of images one `encode` call may deliver.
    pub fn number_of_layers(&self) -> usize {
        self.simulcast_streams.len().max(1)
    }

    /// Check the settings, classifying the first violation found.
    pub fn validate(&self) -> EncoderResult {
        if self.width == 0 || self.height == 0 {
            return Err(EncoderError::Size);
        }
        if self.max_framerate == 0 || self.start_bitrate_kbps == 0 {
            return Err(EncoderError::Parameter);
        }
        if self.max_bitrate_kbps > 0 && self.min_bitrate_kbps > self.max_bitrate_kbps {
            return Err(EncoderError::Parameter);
        }
        if !self.specific.matches(self.codec_type) {
            return Err(EncoderError::Parameter);
        }
        if self.specific.temporal_layers() > MAX_TEMPORAL_LAYERS {
            return Err(EncoderError::Parameter);
        }
        if self.simulcast_streams.len() > MAX_SIMULCAST_STREAMS {
            return Err(EncoderError::Parameter);
        }
        for stream in &self.simulcast_streams {
            if stream.width == 0 || stream.height == 0 {
                return Err(EncoderError::Size);
            }
            if stream.width > self.width || stream.height > self.height {
                return Err(EncoderError::Size);
            }
            if stream.number_of_temporal_layers > MAX_TEMPORAL_LAYERS
                || stream.min_bitrate_kbps > stream.max_bitrate_kbps
            {
                return Err(EncoderError::Parameter);
            }
        }
        Ok(())
    }
}
