//! Shared test helpers for session integration tests.
//!
//! Re-exports from `venc_media::testing` so every crate uses the same setup.

pub use venc_media::testing::{init_test_tracing, TestTimer};

use venc_app::session::SessionPlan;

/// A plan of `frames` frames with one report per second of video.
pub fn plan(frames: u32, loss_pattern: Vec<u32>) -> SessionPlan {
    SessionPlan {
        frames,
        report_interval: 30,
        loss_pattern,
        rtt_ms: 40,
    }
}
