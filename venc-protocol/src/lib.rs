//! Value types shared across the video encoder boundary.

pub mod codec;
pub mod frame;
pub mod rate;
pub mod scaling;
pub mod status;

pub use codec::{CodecSpecific, CodecType, EncoderType, SimulcastStream, VideoCodecSettings};
pub use frame::{
    CodecSpecificInfo, EncodedImage, FragmentationHeader, FrameType, PixelFormat, RawFrame,
};
pub use rate::{BitrateAllocation, ChannelParameters};
pub use scaling::{QpThresholds, ScalingSettings};
pub use status::{
    DeliveryResult, DeliveryStatus, EncodeOutcome, EncoderError, EncoderResult, VIDEO_CODEC_OK,
};
