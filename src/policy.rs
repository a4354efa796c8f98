//! Session lifetime policy: idle-timeout and max-duration cascades.
//!
//! Two independent cascades, both cleared together on disconnect:
//!
//! - **Idle**: every activity signal re-arms a warning timer and an expiry
//!   timer. Five minutes with no audio in either direction ends the session,
//!   with a warning one minute before.
//! - **Duration**: a 1-second tick counts down from connect. Warnings at
//!   five minutes and one minute remaining, hard stop at zero. Activity
//!   never resets this cascade; it is wall-clock from connect.
//!
//! Timers are plain tokio tasks held as abortable handles, so tests drive
//! them on the paused clock and assert exact firing instants.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Forced disconnect after this long with no audio activity.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Idle warning fires this long before the idle disconnect.
pub const WARNING_LEAD: Duration = Duration::from_secs(60);
/// Hard ceiling on session wall-clock time from connect.
pub const MAX_DURATION: Duration = Duration::from_secs(1800);
/// Remaining-time marks (seconds) at which the duration cascade warns.
pub const DURATION_WARNINGS: [u64; 2] = [300, 60];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    /// One minute of inactivity away from a forced disconnect.
    IdleWarning,
    /// Idle timeout reached; the session must be closed.
    IdleExpired,
    /// Max-duration countdown crossed a warning mark (seconds remaining).
    DurationWarning(u64),
    /// Max duration reached; the session must be closed.
    DurationExpired,
}

/// Owns every policy timer for one session. All handles are cancelled
/// unconditionally by `clear()`; nothing fires after that.
pub struct SessionPolicy {
    tx: Option<mpsc::Sender<PolicyEvent>>,
    started_at: Option<Instant>,
    last_activity: Option<Instant>,
    idle_warning: Option<JoinHandle<()>>,
    idle_expiry: Option<JoinHandle<()>>,
    duration_tick: Option<JoinHandle<()>>,
}

impl SessionPolicy {
    pub fn new() -> Self {
        Self {
            tx: None,
            started_at: None,
            last_activity: None,
            idle_warning: None,
            idle_expiry: None,
            duration_tick: None,
        }
    }

    /// Start both cascades at session connect. Also performs the initial
    /// idle arm, so a session with zero traffic still idles out.
    pub fn start(&mut self, tx: mpsc::Sender<PolicyEvent>) {
        self.clear();
        self.tx = Some(tx.clone());
        self.started_at = Some(Instant::now());
        self.last_activity = self.started_at;

        self.duration_tick = Some(tokio::spawn(duration_task(tx)));
        self.arm_idle();
    }

    /// Activity signal: any inbound or outbound audio frame. Re-arms the
    /// idle cascade; the duration cascade is untouched.
    pub fn touch(&mut self) {
        if self.tx.is_none() {
            return;
        }
        self.last_activity = Some(Instant::now());
        self.arm_idle();
    }

    /// Cancel every timer. Idempotent; called on disconnect.
    pub fn clear(&mut self) {
        for handle in [
            self.idle_warning.take(),
            self.idle_expiry.take(),
            self.duration_tick.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.tx = None;
        self.started_at = None;
        self.last_activity = None;
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Wall-clock time since connect, while running.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Time since the last activity signal, while running.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_activity.map(|t| t.elapsed())
    }

    fn arm_idle(&mut self) {
        let Some(tx) = self.tx.clone() else { return };
        if let Some(h) = self.idle_warning.take() {
            h.abort();
        }
        if let Some(h) = self.idle_expiry.take() {
            h.abort();
        }

        let warn_tx = tx.clone();
        self.idle_warning = Some(tokio::spawn(async move {
            time::sleep(IDLE_TIMEOUT - WARNING_LEAD).await;
            let _ = warn_tx.send(PolicyEvent::IdleWarning).await;
        }));
        self.idle_expiry = Some(tokio::spawn(async move {
            time::sleep(IDLE_TIMEOUT).await;
            let _ = tx.send(PolicyEvent::IdleExpired).await;
        }));
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionPolicy {
    fn drop(&mut self) {
        self.clear();
    }
}

/// The repeating 1-second countdown tick. Each warning mark fires exactly
/// once; the task ends itself after the expiry event.
async fn duration_task(tx: mpsc::Sender<PolicyEvent>) {
    let started = Instant::now();
    let mut interval = time::interval(Duration::from_secs(1));
    interval.tick().await; // first tick completes immediately
    let mut warned = [false; DURATION_WARNINGS.len()];

    loop {
        interval.tick().await;
        let remaining = MAX_DURATION.saturating_sub(started.elapsed()).as_secs();
        if remaining == 0 {
            let _ = tx.send(PolicyEvent::DurationExpired).await;
            return;
        }
        for (i, &mark) in DURATION_WARNINGS.iter().enumerate() {
            if !warned[i] && remaining <= mark {
                warned[i] = true;
                let _ = tx.send(PolicyEvent::DurationWarning(mark)).await;
            }
        }
    }
}
