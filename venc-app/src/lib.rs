//! Synthetic encode sessions driven by persisted settings.

pub mod session;
pub mod settings;
