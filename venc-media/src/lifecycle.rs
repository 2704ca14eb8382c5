//! Lifecycle bookkeeping shared by encoder implementations.
//!
//! `EncoderLifecycle` owns the state machine, the registered callback, and the
//! feedback the callback sends back (drop requests, send failures). Embedding
//! it gives an implementation the contract's state checks and delivery rules
//! without re-deriving them.

use venc_protocol::{
    CodecSpecificInfo, DeliveryResult, DeliveryStatus, EncodedImage, EncoderError, EncoderResult,
    FragmentationHeader,
};

use crate::encoder::EncodedImageCallback;

/// Lifecycle state of an encoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Initialized,
    /// Terminal.
    Released,
}

/// State machine plus callback ownership for one encoder.
pub struct EncoderLifecycle {
    name: &'static str,
    state: EncoderState,
    callback: Option<Box<dyn EncodedImageCallback>>,
    drop_next_frame: bool,
    send_failure: bool,
    images_delivered: u64,
    send_failures: u64,
    frames_dropped: u64,
}

impl EncoderLifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: EncoderState::Uninitialized,
            callback: None,
            drop_next_frame: false,
            send_failure: false,
            images_delivered: 0,
            send_failures: 0,
            frames_dropped: 0,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == EncoderState::Initialized
    }

    /// Check that `init_encode` may proceed.
    ///
    /// Re-initializing an initialized encoder is allowed; the caller tears
    /// down its own session state before building the new one. Pending
    /// callback feedback from the previous session is discarded.
    pub fn begin_init(&mut self) -> EncoderResult {
        match self.state {
            EncoderState::Released => {
                tracing::warn!(encoder = self.name, "init_encode after release");
                Err(EncoderError::Parameter)
            }
            EncoderState::Initialized => {
                tracing::debug!(encoder = self.name, "re-initializing encoder");
                self.drop_next_frame = false;
                self.send_failure = false;
                Ok(())
            }
            EncoderState::Uninitialized => Ok(()),
        }
    }

    /// Mark the encoder initialized after a successful `init_encode`.
    pub fn complete_init(&mut self) {
        self.state = EncoderState::Initialized;
        tracing::info!(encoder = self.name, "encoder initialized");
    }

    /// Return to `Uninitialized` after a failed re-initialization.
    pub fn abort_init(&mut self) {
        if self.state == EncoderState::Initialized {
            self.state = EncoderState::Uninitialized;
        }
    }

    /// Install a callback, replacing the previous one.
    pub fn register(&mut self, callback: Box<dyn EncodedImageCallback>) -> EncoderResult {
        if self.state == EncoderState::Released {
            return Err(EncoderError::Parameter);
        }
        if self.callback.replace(callback).is_some() {
            tracing::debug!(encoder = self.name, "replaced encode complete callback");
        }
        Ok(())
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Check that `encode` may proceed.
    pub fn check_encodable(&self) -> EncoderResult {
        if self.state != EncoderState::Initialized {
            tracing::warn!(encoder = self.name, state = ?self.state, "encode in wrong state");
            return Err(EncoderError::Parameter);
        }
        Ok(())
    }

    /// Check that an advisory setter may proceed.
    pub fn check_not_released(&self) -> EncoderResult {
        if self.state == EncoderState::Released {
            return Err(EncoderError::Error);
        }
        Ok(())
    }

    /// Consume a pending drop request from the callback.
    pub fn take_drop_request(&mut self) -> bool {
        std::mem::take(&mut self.drop_next_frame)
    }

    /// Consume a pending send failure; encoders use it to force a key frame.
    pub fn take_send_failure(&mut self) -> bool {
        std::mem::take(&mut self.send_failure)
    }

    /// Hand one image to the callback and record its feedback.
    ///
    /// Returns `None` when no callback is registered; the image is dropped.
    pub fn deliver(
        &mut self,
        image: &EncodedImage,
        codec_specific_info: Option<&CodecSpecificInfo>,
        fragmentation: Option<&FragmentationHeader>,
    ) -> Option<DeliveryResult> {
        let Some(callback) = self.callback.as_mut() else {
            tracing::trace!(
                encoder = self.name,
                timestamp = image.timestamp,
                "no callback registered, dropping encoded image"
            );
            return None;
        };

        let result = callback.on_encoded_image(image, codec_specific_info, fragmentation);
        match result.status() {
            DeliveryStatus::Ok => self.images_delivered += 1,
            DeliveryStatus::SendFailed => {
                self.send_failures += 1;
                self.send_failure = true;
                tracing::warn!(
                    encoder = self.name,
                    timestamp = image.timestamp,
                    layer = image.layer_index,
                    "encoded image delivery failed"
                );
            }
        }
        if result.drop_next_frame() {
            self.drop_next_frame = true;
        }
        Some(result)
    }

    /// Notify the callback that the current frame produces no output.
    pub fn notify_dropped(&mut self) {
        self.frames_dropped += 1;
        if let Some(callback) = self.callback.as_mut() {
            callback.on_dropped_frame();
        }
    }

    /// Enter `Released`, dropping the callback without invoking it.
    pub fn release(&mut self) {
        if self.state != EncoderState::Released {
            tracing::info!(
                encoder = self.name,
                delivered = self.images_delivered,
                send_failures = self.send_failures,
                dropped = self.frames_dropped,
                "encoder released"
            );
        }
        self.callback = None;
        self.drop_next_frame = false;
        self.send_failure = false;
        self.state = EncoderState::Released;
    }

    pub fn images_delivered(&self) -> u64 {
        self.images_delivered
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}
