//! Encoder construction by codec type.

use venc_protocol::EncoderType;

use crate::encoder::VideoEncoder;

/// Creates encoders on demand.
pub trait VideoEncoderFactory: Send + Sync {
    /// Encoder types this factory can build.
    fn supported_types(&self) -> Vec<EncoderType>;

    /// Build a fresh, uninitialized encoder, or `None` if unsupported.
    fn create(&self, encoder_type: EncoderType) -> Option<Box<dyn VideoEncoder>>;
}

/// Factory for the software encoders compiled into this workspace.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareEncoderFactory;

impl VideoEncoderFactory for SoftwareEncoderFactory {
    fn supported_types(&self) -> Vec<EncoderType> {
        [EncoderType::H264, EncoderType::Vp8, EncoderType::Vp9]
            .into_iter()
            .filter(|t| is_supported_software(*t))
            .collect()
    }

    fn create(&self, encoder_type: EncoderType) -> Option<Box<dyn VideoEncoder>> {
        create_software(encoder_type)
    }
}

/// True if a software encoder exists for `encoder_type`.
pub fn is_supported_software(encoder_type: EncoderType) -> bool {
    match encoder_type {
        EncoderType::H264 => cfg!(feature = "video-codec"),
        EncoderType::Vp8 | EncoderType::Vp9 | EncoderType::Unsupported => false,
    }
}

/// Create a software encoder, or `None` if there is none for `encoder_type`.
pub fn create_software(encoder_type: EncoderType) -> Option<Box<dyn VideoEncoder>> {
    match encoder_type {
        #[cfg(feature = "video-codec")]
        EncoderType::H264 => Some(Box::new(crate::h264::H264Encoder::new())),
        other => {
            tracing::debug!(encoder_type = ?other, "no software encoder available");
            None
        }
    }
}
