//! Integration tests covering whole encode sessions end-to-end.

mod helpers;

mod synthetic_session;
