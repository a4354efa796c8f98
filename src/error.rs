//! Engine failure taxonomy.
//!
//! None of these escape the public API as panics; every failure is
//! observable through `SessionState` and the message log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Microphone access denied or capture device unavailable. Capture does
    /// not start; no automatic retry.
    #[error("microphone unavailable: {0}")]
    Permission(String),

    /// Channel close or failure. Full teardown; reconnecting requires an
    /// explicit new `connect()`.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed binary or text frame. Dropped, never fatal.
    #[error("malformed frame: {0}")]
    Protocol(String),
}
