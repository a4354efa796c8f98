//! Gapless, turn-aware playback scheduling for synthesized speech.
//!
//! Server audio arrives as discrete, irregularly timed chunks. Within one
//! conversational turn consecutive buffers must chain back-to-back with zero
//! gap; across turns a deliberate pause keeps a new utterance from starting
//! the instant the prior one ends and gives slack for the late first packets
//! of the new turn.
//!
//! The scheduler owns the single playback cursor (`next_playback_time`) and
//! the output device behind the `OutputSink` seam; tests substitute a fake
//! sink with a settable clock.

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::alsa_device;
use crate::codec::{self, SERVER_SAMPLE_RATE};

/// Minimum forward buffering margin before any scheduled start.
pub const PLAYAHEAD: f64 = 0.25;
/// Extra pause injected before the first buffer of a new turn.
pub const TURN_START_DELAY: f64 = 0.5;
/// Slack for treating a buffer as continuing the previous turn.
pub const TURN_START_GRACE: f64 = 0.05;

/// An output device with its own monotonic clock. Scheduled entries play in
/// arrival order; start times handed to `schedule` are non-decreasing.
pub trait OutputSink: Send {
    /// Current device-clock time in seconds, monotonic from sink creation.
    fn now(&self) -> f64;
    /// Queue samples to begin playing at `start` on the device clock.
    fn schedule(&mut self, samples: Vec<f32>, start: f64) -> Result<()>;
    /// Release the device. Buffers already handed off are not retracted.
    fn close(&mut self);
}

type SinkFactory = Box<dyn FnMut() -> Result<Box<dyn OutputSink>> + Send>;

pub struct PlaybackScheduler {
    factory: SinkFactory,
    sink: Option<Box<dyn OutputSink>>,
    /// End of the last scheduled entry on the device clock. 0 whenever a
    /// fresh sink is created.
    next_playback_time: f64,
}

impl PlaybackScheduler {
    pub fn new(factory: SinkFactory) -> Self {
        Self {
            factory,
            sink: None,
            next_playback_time: 0.0,
        }
    }

    /// Scheduler backed by a real ALSA playback device, created lazily on
    /// the first server buffer.
    pub fn with_alsa_device(device: String) -> Self {
        Self::new(Box::new(move || {
            let sink = AlsaOutputSink::open(&device)?;
            Ok(Box::new(sink))
        }))
    }

    /// Schedule one decoded server buffer; returns the chosen start time.
    ///
    /// `start = max(next_playback_time, now + PLAYAHEAD)`, plus
    /// `TURN_START_DELAY` when the previous audio has already (nearly)
    /// finished, i.e. this buffer begins a new turn.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Result<f64> {
        let sink = match &mut self.sink {
            Some(sink) => sink,
            slot @ None => {
                self.next_playback_time = 0.0;
                slot.insert((self.factory)()?)
            }
        };

        let now = sink.now();
        let is_new_turn = self.next_playback_time <= now + TURN_START_GRACE;

        let mut start = self.next_playback_time.max(now + PLAYAHEAD);
        if is_new_turn {
            start = start.max(now + PLAYAHEAD + TURN_START_DELAY);
        }

        let duration = samples.len() as f64 / SERVER_SAMPLE_RATE as f64;
        sink.schedule(samples, start)?;
        self.next_playback_time = start + duration;
        Ok(start)
    }

    /// Close the output device and reset the cursor to 0. The next enqueue
    /// creates a fresh sink.
    pub fn shutdown(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
        self.next_playback_time = 0.0;
    }

    pub fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }
}

// ======================== ALSA output sink ========================

struct PlayEntry {
    start: f64,
    samples: Vec<f32>,
}

/// Real output device: a dedicated `audio-play` thread holding the ALSA
/// PCM, with an `Instant` origin as the device clock. Entries are played in
/// arrival order; the thread sleeps until each entry's start time.
pub struct AlsaOutputSink {
    origin: Instant,
    tx: Option<mpsc::UnboundedSender<PlayEntry>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaOutputSink {
    pub fn open(device: &str) -> Result<Self> {
        let (pcm, params) = alsa_device::open_playback(device, SERVER_SAMPLE_RATE, Some(1024))?;

        // The device may come up suspended or merely set up; make sure it
        // is runnable before the first write.
        if pcm.state() != alsa::pcm::State::Running {
            pcm.prepare()?;
        }

        let origin = Instant::now();
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_loop(pcm, origin, rx, &running) {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        log::info!(
            "Playback sink open: device={}, rate={}, period={}",
            device,
            params.sample_rate,
            params.period_size,
        );

        Ok(Self {
            origin,
            tx: Some(tx),
            running,
            handle: Some(handle),
        })
    }
}

impl OutputSink for AlsaOutputSink {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, samples: Vec<f32>, start: f64) -> Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("playback sink closed");
        };
        tx.send(PlayEntry { start, samples })
            .map_err(|_| anyhow::anyhow!("playback thread gone"))?;
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the sender ends the thread's recv loop; the thread is
        // detached rather than joined so close never blocks on audio that
        // was already handed off.
        self.tx = None;
        self.handle.take();
    }
}

impl Drop for AlsaOutputSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn play_loop(
    pcm: alsa::pcm::PCM,
    origin: Instant,
    mut rx: mpsc::UnboundedReceiver<PlayEntry>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;

    while running.load(Ordering::Relaxed) {
        let Some(entry) = rx.blocking_recv() else {
            log::info!("Playback sink closed");
            break;
        };

        // Hold the entry until its scheduled start on the device clock.
        let elapsed = origin.elapsed().as_secs_f64();
        if entry.start > elapsed {
            thread::sleep(Duration::from_secs_f64(entry.start - elapsed));
        }

        let pcm_data = codec::f32_to_pcm16(&entry.samples);
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < pcm_data.len() {
            match io.writei(&pcm_data[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA playback error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        return Err(e2.into());
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Dropping {} unwritten frames after repeated recovery",
                            pcm_data.len() - frames_written,
                        );
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records scheduled entries; the clock is advanced by hand.
    struct FakeSink {
        clock: Arc<Mutex<f64>>,
        scheduled: Arc<Mutex<Vec<(f64, usize)>>>,
        closed: Arc<AtomicBool>,
    }

    impl OutputSink for FakeSink {
        fn now(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn schedule(&mut self, samples: Vec<f32>, start: f64) -> Result<()> {
            self.scheduled.lock().unwrap().push((start, samples.len()));
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        scheduler: PlaybackScheduler,
        clock: Arc<Mutex<f64>>,
        scheduled: Arc<Mutex<Vec<(f64, usize)>>>,
        closed: Arc<AtomicBool>,
        created: Arc<Mutex<u32>>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(Mutex::new(0.0));
        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let created = Arc::new(Mutex::new(0));

        let scheduler = {
            let clock = clock.clone();
            let scheduled = scheduled.clone();
            let closed = closed.clone();
            let created = created.clone();
            PlaybackScheduler::new(Box::new(move || {
                *created.lock().unwrap() += 1;
                Ok(Box::new(FakeSink {
                    clock: clock.clone(),
                    scheduled: scheduled.clone(),
                    closed: closed.clone(),
                }))
            }))
        };

        Harness {
            scheduler,
            clock,
            scheduled,
            closed,
            created,
        }
    }

    fn set_clock(h: &Harness, t: f64) {
        *h.clock.lock().unwrap() = t;
    }

    /// 2400 samples at 24 kHz = 100 ms.
    fn buffer_100ms() -> Vec<f32> {
        vec![0.0; 2400]
    }

    #[test]
    fn test_first_buffer_gets_turn_start_delay() {
        let mut h = harness();
        let start = h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert_eq!(start, PLAYAHEAD + TURN_START_DELAY);
        assert_eq!(h.scheduler.next_playback_time(), start + 0.1);
    }

    #[test]
    fn test_contiguity_within_a_turn() {
        // Buffers arriving 10 ms apart chain with no gap and no overlap.
        let mut h = harness();
        let first = h.scheduler.enqueue(buffer_100ms()).unwrap();

        set_clock(&h, 0.010);
        let second = h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert_eq!(second, first + 0.1);

        set_clock(&h, 0.020);
        let third = h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert_eq!(third, second + 0.1);
    }

    #[test]
    fn test_turn_gap_inserts_pause() {
        let mut h = harness();
        let first = h.scheduler.enqueue(buffer_100ms()).unwrap();
        let first_end = first + 0.1;

        // 2 s of silence after the first buffer finished, then a new turn
        // arrives at time t: it must start no earlier than t + 0.75.
        let t = first_end + 2.0;
        set_clock(&h, t);
        let start = h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert_eq!(start, t + PLAYAHEAD + TURN_START_DELAY);
    }

    #[test]
    fn test_arrival_at_queue_drain_starts_new_turn() {
        let mut h = harness();
        let first = h.scheduler.enqueue(buffer_100ms()).unwrap();
        let first_end = first + 0.1;

        // Arrival the moment the previous audio finishes: within the grace
        // window, so the previous turn counts as over and the pause applies.
        set_clock(&h, first_end);
        let second = h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert_eq!(second, first_end + PLAYAHEAD + TURN_START_DELAY);
    }

    #[test]
    fn test_start_never_beats_playahead() {
        let mut h = harness();
        set_clock(&h, 5.0);
        let start = h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert!(start >= 5.0 + PLAYAHEAD);
    }

    #[test]
    fn test_start_times_are_non_decreasing() {
        let mut h = harness();
        for i in 0..20 {
            set_clock(&h, i as f64 * 0.03);
            h.scheduler.enqueue(buffer_100ms()).unwrap();
        }
        let scheduled = h.scheduled.lock().unwrap();
        for pair in scheduled.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[test]
    fn test_shutdown_resets_cursor_and_recreates_sink() {
        let mut h = harness();
        h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert!(h.scheduler.is_open());
        assert_eq!(*h.created.lock().unwrap(), 1);

        h.scheduler.shutdown();
        assert!(!h.scheduler.is_open());
        assert!(h.closed.load(Ordering::SeqCst));
        assert_eq!(h.scheduler.next_playback_time(), 0.0);

        // A fresh sink with a fresh cursor: same schedule as a first buffer
        set_clock(&h, 0.0);
        let start = h.scheduler.enqueue(buffer_100ms()).unwrap();
        assert_eq!(start, PLAYAHEAD + TURN_START_DELAY);
        assert_eq!(*h.created.lock().unwrap(), 2);
    }

    #[test]
    fn test_shutdown_without_sink_is_noop() {
        let mut h = harness();
        h.scheduler.shutdown();
        assert_eq!(*h.created.lock().unwrap(), 0);
        assert_eq!(h.scheduler.next_playback_time(), 0.0);
    }
}
