//! Microphone capture engine.
//!
//! Owns the input device exclusively. Capture runs on a dedicated OS thread
//! (not a tokio task) to keep real-time reads away from async networking.
//! The thread reads 16 kHz mono periods, chunks them into exactly
//! 4096-sample frames, encodes each with the client direction byte, and
//! forwards the bytes to the controller's outbound sink. The controller
//! counts every forwarded frame as session activity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

use anyhow::Result;

use super::alsa_device;
use crate::codec::{self, CAPTURE_FRAME_SAMPLES, CLIENT_SAMPLE_RATE, Direction};
use crate::error::EngineError;

/// Capture device request. The processing flags are honored as far as the
/// device layer supports them.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub device: String,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

/// Seam between the controller and the input device. The live
/// implementation is `CaptureEngine`; tests stand in a fake to exercise the
/// denied-microphone path without hardware.
pub trait CaptureSource: Send {
    /// Open the input device and begin emitting encoded frames into
    /// `frame_tx`. A device failure maps to `EngineError::Permission`.
    fn start(
        &mut self,
        config: &CaptureConfig,
        frame_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), EngineError>;

    /// Stop and release the input device. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// The capture engine. `start` acquires the device before any thread is
/// spawned, so a denied or missing microphone leaves the engine exactly as
/// it was; capture never starts.
pub struct CaptureEngine {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureEngine {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl CaptureSource for CaptureEngine {
    fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    fn start(
        &mut self,
        config: &CaptureConfig,
        frame_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), EngineError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let (pcm, params) = alsa_device::open_capture(&config.device, CLIENT_SAMPLE_RATE)
            .map_err(|e| EngineError::Permission(format!("{:#}", e)))?;

        log::info!(
            "Capture starting: device={}, rate={}, aec={}, ns={}",
            config.device,
            params.sample_rate,
            config.echo_cancellation,
            config.noise_suppression,
        );

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                if let Err(e) = capture_loop(pcm, params.period_size, frame_tx, &running) {
                    log::error!("Capture thread error: {}", e);
                }
            })
            .map_err(|e| EngineError::Permission(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
            log::info!("Capture stopped");
        }
    }
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    pcm: alsa::pcm::PCM,
    period_size: usize,
    frame_tx: mpsc::Sender<Vec<u8>>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let mut read_buf = vec![0i16; period_size];
    let mut chunker = FrameChunker::new(CAPTURE_FRAME_SAMPLES);

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                chunker.push(&read_buf[..frames]);
                while let Some(frame) = chunker.pop_frame() {
                    let encoded = codec::encode(Direction::ClientOrigin, &frame);
                    if frame_tx.blocking_send(encoded).is_err() {
                        log::warn!("Capture sink dropped, stopping");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Accumulates arbitrary-length period reads and yields frames of an exact
/// sample count. A partial tail is held until more samples arrive.
pub struct FrameChunker {
    frame_samples: usize,
    buf: Vec<i16>,
}

impl FrameChunker {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            buf: Vec::with_capacity(frame_samples * 2),
        }
    }

    pub fn push(&mut self, samples: &[i16]) {
        self.buf.extend_from_slice(samples);
    }

    pub fn pop_frame(&mut self) -> Option<Vec<i16>> {
        if self.buf.len() < self.frame_samples {
            return None;
        }
        let frame = self.buf[..self.frame_samples].to_vec();
        self.buf.drain(..self.frame_samples);
        Some(frame)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
