//! voicewire - real-time voice interview streaming engine.
//!
//! Captures microphone audio, frames it onto a duplex WebSocket channel,
//! receives synthesized speech back, and schedules it for gapless,
//! turn-aware playback, while enforcing session-lifetime policies (idle
//! timeout, maximum duration) through cascading timers.
//!
//! Data flow: mic → capture engine → codec → channel out; channel in →
//! codec → playback scheduler → output device. Traffic in either direction
//! resets the idle timer. Session creation (issuing the channel endpoint
//! and token) happens outside this crate.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod net_link;
pub mod policy;
pub mod protocol;
pub mod session;

pub use codec::{AudioFrame, Direction};
pub use config::EngineConfig;
pub use error::EngineError;
pub use protocol::{ChatMessage, MessageKind};
pub use session::{InterviewEngine, SessionState};
