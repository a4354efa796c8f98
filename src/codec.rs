//! Binary frame codec for the interview audio channel.
//!
//! Wire format: one direction byte (0x01 client→server, 0x02 server→client)
//! followed by little-endian signed 16-bit PCM, mono. Sample rates are fixed
//! per direction and never negotiated.

/// Capture sample rate for client-origin frames.
pub const CLIENT_SAMPLE_RATE: u32 = 16_000;
/// Playback sample rate for server-origin frames.
pub const SERVER_SAMPLE_RATE: u32 = 24_000;
/// Exact sample count of every captured frame.
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

use crate::error::EngineError;

const DIR_CLIENT: u8 = 0x01;
const DIR_SERVER: u8 = 0x02;

/// Which side of the channel produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientOrigin,
    ServerOrigin,
}

impl Direction {
    pub fn byte(self) -> u8 {
        match self {
            Direction::ClientOrigin => DIR_CLIENT,
            Direction::ServerOrigin => DIR_SERVER,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            DIR_CLIENT => Some(Direction::ClientOrigin),
            DIR_SERVER => Some(Direction::ServerOrigin),
            _ => None,
        }
    }

    /// Fixed per-direction sample rate (mono, not negotiated).
    pub fn sample_rate(self) -> u32 {
        match self {
            Direction::ClientOrigin => CLIENT_SAMPLE_RATE,
            Direction::ServerOrigin => SERVER_SAMPLE_RATE,
        }
    }
}

/// A decoded audio frame from either side of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub direction: Direction,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn sample_rate(&self) -> u32 {
        self.direction.sample_rate()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate() as f64
    }
}

/// Encode PCM16 samples into a wire frame: direction byte + LE payload.
pub fn encode(direction: Direction, samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + samples.len() * 2);
    out.push(direction.byte());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decode a wire frame. An unknown direction byte or a payload that is not
/// a whole number of 16-bit samples is a `Protocol` error; the caller drops
/// the frame without disturbing the session.
pub fn decode(data: &[u8]) -> Result<AudioFrame, EngineError> {
    let Some((&dir_byte, payload)) = data.split_first() else {
        return Err(EngineError::Protocol("empty frame".into()));
    };
    let direction = Direction::from_byte(dir_byte).ok_or_else(|| {
        EngineError::Protocol(format!("unknown direction byte {:#04x}", dir_byte))
    })?;
    if payload.len() % 2 != 0 {
        return Err(EngineError::Protocol(format!(
            "odd payload length {}",
            payload.len()
        )));
    }
    let samples = payload
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    Ok(AudioFrame { direction, samples })
}

/// Convert float samples in [-1, 1] to PCM16.
///
/// `i16 = clamp(round(f * 32768), -32768, 32767)`. The only numeric
/// normalization in the system; must stay exact for wire compatibility.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&f| (f * 32768.0).round().clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Convert PCM16 samples to floats in [-1, 1): `f = i16 / 32768`.
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}
