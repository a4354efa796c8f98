//! Audio I/O: exclusive ownership of the capture and playback devices.
//!
//! The capture engine owns the input device; the playback scheduler owns
//! the output device and its clock. Real-time I/O runs on dedicated OS
//! threads (not tokio tasks) to avoid contention with async networking.

mod alsa_device;
mod capture;
mod playback;

pub use capture::{CaptureConfig, CaptureEngine, CaptureSource, FrameChunker};
pub use playback::{
    AlsaOutputSink, OutputSink, PlaybackScheduler, PLAYAHEAD, TURN_START_DELAY, TURN_START_GRACE,
};
