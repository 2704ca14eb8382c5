//! Status codes returned by encoder operations and callback deliveries.

use thiserror::Error;

/// Status code for a successful operation.
pub const VIDEO_CODEC_OK: i32 = 0;

/// Failure kinds an encoder operation may report.
///
/// This is a closed set: every failure an implementation hits must be mapped
/// onto one of these variants before it crosses the encoder boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum EncoderError {
    /// Unclassified failure, or an operation the implementation does not support.
    #[error("encoder error")]
    Error,
    /// The requested profile/level cannot be satisfied.
    #[error("requested profile or level exceeded")]
    LevelExceeded,
    /// Allocation failed.
    #[error("encoder out of memory")]
    Memory,
    /// Invalid or unsupported settings, wrong frame size, or wrong lifecycle state.
    #[error("invalid parameter")]
    Parameter,
    /// Resolution or size constraint violated.
    #[error("invalid size")]
    Size,
    /// The encoder could not finish within its internal deadline.
    #[error("encode timed out")]
    Timeout,
}

impl EncoderError {
    /// All failure kinds, in code order.
    pub const ALL: [EncoderError; 6] = [
        EncoderError::Error,
        EncoderError::LevelExceeded,
        EncoderError::Memory,
        EncoderError::Parameter,
        EncoderError::Size,
        EncoderError::Timeout,
    ];

    /// Signed status code for this failure (always negative).
    pub fn code(self) -> i32 {
        match self {
            EncoderError::Error => -1,
            EncoderError::LevelExceeded => -2,
            EncoderError::Memory => -3,
            EncoderError::Parameter => -4,
            EncoderError::Size => -5,
            EncoderError::Timeout => -6,
        }
    }

    /// Map a signed status code back to a failure kind.
    ///
    /// Returns `None` for success codes (`>= 0`) and for negative codes outside
    /// the enumerated set.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }
}

/// Result type used by every encoder operation.
pub type EncoderResult<T = ()> = Result<T, EncoderError>;

/// Collapse an encoder result into its signed status code.
pub fn status_code<T>(result: &EncoderResult<T>) -> i32 {
    match result {
        Ok(_) => VIDEO_CODEC_OK,
        Err(e) => e.code(),
    }
}

/// Successful outcome of one `encode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// The frame was encoded; `deliveries` images were handed to the callback.
    Encoded { deliveries: usize },
    /// The encoder elected not to encode this frame. No images were delivered.
    Dropped,
}

impl EncodeOutcome {
    /// Number of callback deliveries produced by the call.
    pub fn deliveries(&self) -> usize {
        match self {
            EncodeOutcome::Encoded { deliveries } => *deliveries,
            EncodeOutcome::Dropped => 0,
        }
    }
}

/// Outcome of a single callback delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Ok,
    /// The sink could not send the image (transport back-pressure or failure).
    SendFailed,
}

/// Result returned by `EncodedImageCallback::on_encoded_image`.
///
/// The frame id is only present when the delivery succeeded, so a failed
/// delivery can never carry a stale id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryResult {
    status: DeliveryStatus,
    frame_id: Option<u32>,
    drop_next_frame: bool,
}

impl DeliveryResult {
    /// Successful delivery. `frame_id` must equal the id the receiver sees on
    /// the wire (the RTP timestamp for RTP transports).
    pub fn ok(frame_id: u32) -> Self {
        Self {
            status: DeliveryStatus::Ok,
            frame_id: Some(frame_id),
            drop_next_frame: false,
        }
    }

    /// Failed delivery.
    pub fn send_failed() -> Self {
        Self {
            status: DeliveryStatus::SendFailed,
            frame_id: None,
            drop_next_frame: false,
        }
    }

    /// Ask the encoder to skip the next pushed frame.
    pub fn with_drop_next_frame(mut self) -> Self {
        self.drop_next_frame = true;
        self
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == DeliveryStatus::Ok
    }

    /// Frame id assigned by the sink, `None` unless the delivery succeeded.
    pub fn frame_id(&self) -> Option<u32> {
        self.frame_id
    }

    /// Frame id as carried on the wire, where 0 means "unused".
    pub fn frame_id_or_default(&self) -> u32 {
        self.frame_id.unwrap_or(0)
    }

    pub fn drop_next_frame(&self) -> bool {
        self.drop_next_frame
    }
}
