//! Video encoder contract, encoders, fallback, rate control and encode pipeline.

pub mod allocator;
pub mod congestion;
pub mod encode_pipeline;
pub mod encoder;
pub mod factory;
pub mod fake_encoder;
pub mod fallback;
#[cfg(feature = "video-codec")]
pub mod h264;
pub mod lifecycle;
#[cfg(feature = "test-util")]
pub mod testing;

pub use encoder::{EncodedImageCallback, SharedCallback, VideoEncoder};
