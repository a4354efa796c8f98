//! Connection controller for one interview session.
//!
//! Composes the channel link, frame codec, capture engine, playback
//! scheduler, and lifetime policy. Every channel, timer, capture, and
//! playback handle lives here, and this is the only component that tears
//! the others down. All external stimulus arrives as one closed set of
//! events (`EngineEvent`) through a single dispatch function, so tests
//! drive the whole state machine with a fake channel and the paused clock.
//!
//! No failure escapes the public API: everything is observable through
//! `SessionState` and the append-only message log.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{CaptureConfig, CaptureEngine, CaptureSource, PlaybackScheduler};
use crate::codec::{self, Direction};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::net_link::{ChannelLink, NetCommand, NetEvent};
use crate::policy::{PolicyEvent, SessionPolicy};
use crate::protocol::ChatMessage;

/// Session lifecycle. `Recording` is a sub-state of connected: the channel
/// is open and the microphone is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Recording,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Recording)
    }
}

/// The closed set of events the controller dispatches over.
#[derive(Debug)]
pub enum EngineEvent {
    /// Channel lifecycle and inbound traffic.
    Channel(NetEvent),
    /// Lifetime policy firings.
    Policy(PolicyEvent),
    /// An encoded client-origin frame from the capture engine, bound for
    /// the channel.
    Outbound(Vec<u8>),
}

pub struct InterviewEngine {
    config: EngineConfig,
    state: SessionState,
    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: mpsc::Receiver<EngineEvent>,
    net_tx: Option<mpsc::Sender<NetCommand>>,
    link_task: Option<JoinHandle<()>>,
    policy: SessionPolicy,
    scheduler: PlaybackScheduler,
    capture: Box<dyn CaptureSource>,
    log: Vec<ChatMessage>,
    message_sink: Option<mpsc::UnboundedSender<ChatMessage>>,
}

impl InterviewEngine {
    pub fn new(config: EngineConfig) -> Self {
        let scheduler = PlaybackScheduler::with_alsa_device(config.playback_device.clone());
        Self::with_scheduler(config, scheduler)
    }

    /// Engine with an injected playback scheduler (custom output sink).
    pub fn with_scheduler(config: EngineConfig, scheduler: PlaybackScheduler) -> Self {
        Self::with_parts(config, scheduler, Box::new(CaptureEngine::new()))
    }

    /// Full seam: injected playback scheduler and capture source.
    pub(crate) fn with_parts(
        config: EngineConfig,
        scheduler: PlaybackScheduler,
        capture: Box<dyn CaptureSource>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            config,
            state: SessionState::Disconnected,
            event_tx,
            event_rx,
            net_tx: None,
            link_task: None,
            policy: SessionPolicy::new(),
            scheduler,
            capture,
            log: Vec::new(),
            message_sink: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The append-only message log.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.log
    }

    /// Register an observer that receives every appended message (the UI).
    pub fn set_message_sink(&mut self, tx: mpsc::UnboundedSender<ChatMessage>) {
        self.message_sink = Some(tx);
    }

    /// Open the duplex channel. No-op when a session is already under way.
    pub fn connect(&mut self) {
        if self.state != SessionState::Disconnected {
            log::debug!("connect() ignored in state {:?}", self.state);
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (link_tx, link_rx) = mpsc::channel(256);
        let link = ChannelLink::new(
            self.config.channel_url.clone(),
            self.config.channel_token.clone(),
            link_tx,
            cmd_rx,
        );
        let task = tokio::spawn(link.run());
        self.spawn_channel_pump(link_rx);
        self.open_channel(cmd_tx, Some(task));
    }

    /// Forward link events into the dispatch loop; ends by itself when the
    /// link task finishes and its sender drops.
    fn spawn_channel_pump(&self, mut link_rx: mpsc::Receiver<NetEvent>) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                if event_tx.send(EngineEvent::Channel(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Wire an (already connecting) channel's command sender into the
    /// engine. `connect()` goes through here; tests drive it with a fake
    /// mpsc pair instead of a live socket.
    pub(crate) fn open_channel(
        &mut self,
        cmd_tx: mpsc::Sender<NetCommand>,
        task: Option<JoinHandle<()>>,
    ) {
        self.state = SessionState::Connecting;
        self.net_tx = Some(cmd_tx);
        self.link_task = task;
    }

    /// Start the microphone. No-op unless connected and not yet recording.
    /// A denied or missing device appends a System message and leaves the
    /// state untouched.
    pub fn start_recording(&mut self) {
        if self.state != SessionState::Connected {
            log::debug!("start_recording() ignored in state {:?}", self.state);
            return;
        }

        let capture_config = CaptureConfig {
            device: self.config.capture_device.clone(),
            echo_cancellation: self.config.echo_cancellation,
            noise_suppression: self.config.noise_suppression,
        };
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(16);

        match self.capture.start(&capture_config, frame_tx) {
            Ok(()) => {
                // Pump captured frames into the dispatch loop; ends by
                // itself when capture stops and the sender drops.
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    while let Some(frame) = frame_rx.recv().await {
                        if event_tx.send(EngineEvent::Outbound(frame)).await.is_err() {
                            break;
                        }
                    }
                });
                self.state = SessionState::Recording;
            }
            Err(e) => {
                log::warn!("Capture failed to start: {}", e);
                let detail = match e {
                    EngineError::Permission(detail) => detail,
                    other => other.to_string(),
                };
                self.append(ChatMessage::system(format!(
                    "Microphone unavailable: {}",
                    detail
                )));
            }
        }
    }

    /// Stop the microphone and release the input device. Idempotent.
    pub fn stop_recording(&mut self) {
        self.capture.stop();
        if self.state == SessionState::Recording {
            self.state = SessionState::Connected;
        }
    }

    /// Full return to the initial state: stop recording, cancel every
    /// timer, close the channel, tear down the playback device, reset the
    /// scheduler cursor. Idempotent.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if let Some(tx) = &self.net_tx {
            let _ = tx.try_send(NetCommand::Close);
        }
        self.teardown();
        self.append(ChatMessage::system("Session disconnected"));
    }

    /// Process one engine event. The binary's select loop drives this.
    pub async fn step(&mut self) {
        let event = self.event_rx.recv().await;
        if let Some(event) = event {
            self.handle_event(event).await;
        }
    }

    /// The single dispatch point for the session state machine.
    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Channel(NetEvent::Opened) => self.on_channel_open(),
            EngineEvent::Channel(NetEvent::Text(text)) => self.on_text_frame(&text),
            EngineEvent::Channel(NetEvent::Binary(data)) => self.on_binary_frame(&data),
            EngineEvent::Channel(NetEvent::Closed(reason)) => self.on_channel_closed(&reason),
            EngineEvent::Policy(event) => self.on_policy_event(event),
            EngineEvent::Outbound(frame) => self.on_outbound_frame(frame).await,
        }
    }

    fn on_channel_open(&mut self) {
        if self.state != SessionState::Connecting {
            log::debug!("Channel open ignored in state {:?}", self.state);
            return;
        }
        self.state = SessionState::Connected;

        // Starting the duration cascade also performs the initial idle arm.
        let (policy_tx, mut policy_rx) = mpsc::channel(16);
        self.policy.start(policy_tx);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = policy_rx.recv().await {
                if event_tx.send(EngineEvent::Policy(event)).await.is_err() {
                    break;
                }
            }
        });

        self.append(ChatMessage::system("Interview session connected"));
        log::info!("Session connected");
    }

    fn on_text_frame(&mut self, text: &str) {
        match ChatMessage::parse(text) {
            Ok(message) => self.append(message),
            // Malformed JSON is logged locally, never surfaced.
            Err(e) => log::debug!("Dropping text frame: {}", e),
        }
    }

    fn on_binary_frame(&mut self, data: &[u8]) {
        let frame = match codec::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Dropping binary frame: {}", e);
                return;
            }
        };
        match frame.direction {
            Direction::ServerOrigin => {
                let samples = codec::pcm16_to_f32(&frame.samples);
                if let Err(e) = self.scheduler.enqueue(samples) {
                    log::warn!("Playback scheduling failed: {}", e);
                }
                self.policy.touch();
            }
            // A client-origin frame coming back down is a protocol error.
            Direction::ClientOrigin => {
                log::debug!("Dropping client-origin frame from server");
            }
        }
    }

    fn on_channel_closed(&mut self, reason: &str) {
        if self.state == SessionState::Disconnected {
            return;
        }
        log::info!("Channel closed: {}", reason);
        self.teardown();
        self.append(ChatMessage::system(format!("Session closed: {}", reason)));
    }

    fn on_policy_event(&mut self, event: PolicyEvent) {
        if !self.state.is_connected() {
            return;
        }
        match event {
            PolicyEvent::IdleWarning => {
                self.append(ChatMessage::status(
                    "No audio detected; the session will end in 60 seconds without activity",
                ));
            }
            PolicyEvent::IdleExpired => {
                self.policy_close("Session ended due to inactivity");
            }
            PolicyEvent::DurationWarning(secs) => {
                self.append(ChatMessage::system(format!(
                    "Interview time remaining: {} minute{}",
                    secs / 60,
                    if secs >= 120 { "s" } else { "" },
                )));
            }
            PolicyEvent::DurationExpired => {
                self.policy_close("Maximum interview duration reached");
            }
        }
    }

    async fn on_outbound_frame(&mut self, frame: Vec<u8>) {
        let Some(tx) = &self.net_tx else { return };
        if tx.send(NetCommand::SendBinary(frame)).await.is_err() {
            log::warn!("Channel sink gone, dropping captured frame");
            return;
        }
        self.policy.touch();
    }

    /// Policy-forced closure: append the explanation, then close through
    /// the same teardown path as any other close.
    fn policy_close(&mut self, explanation: &str) {
        self.append(ChatMessage::system(explanation));
        if let Some(tx) = &self.net_tx {
            let _ = tx.try_send(NetCommand::Close);
        }
        self.teardown();
    }

    /// The single cancellation point. There is no partial teardown.
    fn teardown(&mut self) {
        self.capture.stop();
        self.policy.clear();
        self.scheduler.shutdown();
        self.net_tx = None;
        // The link task ends on its own once the command sender is gone.
        self.link_task.take();
        self.state = SessionState::Disconnected;
    }

    fn append(&mut self, message: ChatMessage) {
        if let Some(sink) = &self.message_sink {
            let _ = sink.send(message.clone());
        }
        self.log.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OutputSink;
    use crate::protocol::MessageKind;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};

    /// Fixed-clock sink recording scheduled buffer sizes.
    struct NullSink {
        scheduled: Arc<Mutex<Vec<usize>>>,
    }

    impl OutputSink for NullSink {
        fn now(&self) -> f64 {
            0.0
        }
        fn schedule(&mut self, samples: Vec<f32>, _start: f64) -> Result<()> {
            self.scheduled.lock().unwrap().push(samples.len());
            Ok(())
        }
        fn close(&mut self) {}
    }

    /// In-memory capture source; `start` flips a flag, or fails with the
    /// configured denial.
    struct FakeCapture {
        deny: Option<String>,
        running: bool,
    }

    impl FakeCapture {
        fn working() -> Box<Self> {
            Box::new(Self {
                deny: None,
                running: false,
            })
        }

        fn denied(reason: &str) -> Box<Self> {
            Box::new(Self {
                deny: Some(reason.into()),
                running: false,
            })
        }
    }

    impl CaptureSource for FakeCapture {
        fn start(
            &mut self,
            _config: &CaptureConfig,
            _frame_tx: mpsc::Sender<Vec<u8>>,
        ) -> Result<(), EngineError> {
            if let Some(reason) = &self.deny {
                return Err(EngineError::Permission(reason.clone()));
            }
            self.running = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    struct TestSession {
        engine: InterviewEngine,
        cmd_rx: mpsc::Receiver<NetCommand>,
        scheduled: Arc<Mutex<Vec<usize>>>,
    }

    /// Engine wired to a fake channel: commands are observable on `cmd_rx`
    /// and channel traffic is injected through `handle_event`.
    fn test_session() -> TestSession {
        test_session_with_capture(FakeCapture::working())
    }

    fn test_session_with_capture(capture: Box<dyn CaptureSource>) -> TestSession {
        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let scheduler = {
            let scheduled = scheduled.clone();
            PlaybackScheduler::new(Box::new(move || {
                Ok(Box::new(NullSink {
                    scheduled: scheduled.clone(),
                }))
            }))
        };
        let mut engine =
            InterviewEngine::with_parts(EngineConfig::default(), scheduler, capture);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        engine.open_channel(cmd_tx, None);
        TestSession {
            engine,
            cmd_rx,
            scheduled,
        }
    }

    async fn open(session: &mut TestSession) {
        session
            .engine
            .handle_event(EngineEvent::Channel(NetEvent::Opened))
            .await;
    }

    #[tokio::test]
    async fn test_open_transitions_and_logs() {
        let mut s = test_session();
        assert_eq!(s.engine.state(), SessionState::Connecting);
        open(&mut s).await;
        assert_eq!(s.engine.state(), SessionState::Connected);
        assert!(s.engine.policy.is_running());
        let last = s.engine.messages().last().unwrap();
        assert_eq!(last.kind, MessageKind::System);
        assert!(last.content.contains("connected"));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_once_underway() {
        let mut s = test_session();
        open(&mut s).await;
        // Guarded before any socket work happens
        s.engine.connect();
        assert_eq!(s.engine.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_server_audio_is_scheduled_and_counts_as_activity() {
        let mut s = test_session();
        open(&mut s).await;

        let frame = codec::encode(Direction::ServerOrigin, &vec![100i16; 2400]);
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Binary(frame)))
            .await;

        assert_eq!(*s.scheduled.lock().unwrap(), vec![2400]);
        assert!(s.engine.policy.idle_for().is_some());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped_silently() {
        let mut s = test_session();
        open(&mut s).await;
        let log_len = s.engine.messages().len();

        // Unknown direction, odd payload, garbage JSON
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Binary(vec![0x07, 0, 0])))
            .await;
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Binary(vec![0x02, 0, 0, 0])))
            .await;
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Text("{broken".into())))
            .await;

        assert_eq!(s.engine.state(), SessionState::Connected);
        assert_eq!(s.engine.messages().len(), log_len);
        assert!(s.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transcript_frames_append_to_log() {
        let mut s = test_session();
        open(&mut s).await;
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Text(
                r#"{"type":"assistant","content":"Tell me about yourself","timestamp":1}"#.into(),
            )))
            .await;
        let last = s.engine.messages().last().unwrap();
        assert_eq!(last.kind, MessageKind::Assistant);
        assert_eq!(last.content, "Tell me about yourself");
    }

    #[tokio::test]
    async fn test_channel_close_tears_down_once() {
        let mut s = test_session();
        open(&mut s).await;
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Binary(codec::encode(
                Direction::ServerOrigin,
                &[0i16; 240],
            ))))
            .await;
        assert!(s.engine.scheduler.is_open());

        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Closed("eof".into())))
            .await;
        assert_eq!(s.engine.state(), SessionState::Disconnected);
        assert!(!s.engine.policy.is_running());
        assert!(!s.engine.scheduler.is_open());
        assert_eq!(s.engine.scheduler.next_playback_time(), 0.0);
        let log_len = s.engine.messages().len();
        assert!(s.engine.messages().last().unwrap().content.contains("eof"));

        // A second close event is a no-op
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Closed("eof".into())))
            .await;
        assert_eq!(s.engine.messages().len(), log_len);
    }

    #[tokio::test]
    async fn test_disconnect_is_clean_and_idempotent() {
        let mut s = test_session();
        open(&mut s).await;
        s.engine.disconnect();

        assert_eq!(s.engine.state(), SessionState::Disconnected);
        assert!(!s.engine.policy.is_running());
        assert_eq!(s.engine.scheduler.next_playback_time(), 0.0);
        assert!(matches!(s.cmd_rx.try_recv(), Ok(NetCommand::Close)));
        let log_len = s.engine.messages().len();

        s.engine.disconnect();
        assert_eq!(s.engine.messages().len(), log_len);
    }

    #[tokio::test]
    async fn test_idle_expiry_closes_with_explanation() {
        let mut s = test_session();
        open(&mut s).await;
        s.engine
            .handle_event(EngineEvent::Policy(PolicyEvent::IdleExpired))
            .await;
        assert_eq!(s.engine.state(), SessionState::Disconnected);
        assert!(!s.engine.policy.is_running());
        let last = s.engine.messages().last().unwrap();
        assert!(last.content.contains("inactivity"));
        assert!(matches!(s.cmd_rx.try_recv(), Ok(NetCommand::Close)));
    }

    #[tokio::test]
    async fn test_duration_warning_keeps_session_open() {
        let mut s = test_session();
        open(&mut s).await;
        s.engine
            .handle_event(EngineEvent::Policy(PolicyEvent::DurationWarning(300)))
            .await;
        assert_eq!(s.engine.state(), SessionState::Connected);
        let last = s.engine.messages().last().unwrap();
        assert_eq!(last.kind, MessageKind::System);
        assert!(last.content.contains("5 minutes"));

        s.engine
            .handle_event(EngineEvent::Policy(PolicyEvent::DurationExpired))
            .await;
        assert_eq!(s.engine.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_outbound_frames_reach_channel_and_touch_policy() {
        let mut s = test_session();
        open(&mut s).await;

        let frame = codec::encode(Direction::ClientOrigin, &[0i16; 4096]);
        s.engine
            .handle_event(EngineEvent::Outbound(frame.clone()))
            .await;

        match s.cmd_rx.try_recv() {
            Ok(NetCommand::SendBinary(sent)) => {
                assert_eq!(sent.len(), 8193);
                assert_eq!(sent, frame);
            }
            other => panic!("expected SendBinary, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recording_starts_and_stops_with_capture_device() {
        let mut s = test_session();
        open(&mut s).await;

        s.engine.start_recording();
        assert_eq!(s.engine.state(), SessionState::Recording);
        assert!(s.engine.capture.is_running());

        s.engine.stop_recording();
        assert_eq!(s.engine.state(), SessionState::Connected);
        assert!(!s.engine.capture.is_running());
    }

    #[tokio::test]
    async fn test_denied_microphone_reports_and_stays_connected() {
        let mut s = test_session_with_capture(FakeCapture::denied("device busy"));
        open(&mut s).await;

        s.engine.start_recording();
        assert_eq!(s.engine.state(), SessionState::Connected);
        assert!(!s.engine.capture.is_running());
        let last = s.engine.messages().last().unwrap();
        assert_eq!(last.kind, MessageKind::System);
        assert_eq!(last.content, "Microphone unavailable: device busy");
    }

    #[tokio::test]
    async fn test_stop_recording_is_noop_when_not_recording() {
        let mut s = test_session();
        open(&mut s).await;
        s.engine.stop_recording();
        assert_eq!(s.engine.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_start_recording_requires_connection() {
        let scheduler = PlaybackScheduler::new(Box::new(|| {
            Ok(Box::new(NullSink {
                scheduled: Arc::new(Mutex::new(Vec::new())),
            }))
        }));
        let mut engine = InterviewEngine::with_scheduler(EngineConfig::default(), scheduler);
        engine.start_recording();
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(engine.messages().is_empty());
    }

    #[tokio::test]
    async fn test_message_sink_observes_appends() {
        let mut s = test_session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.engine.set_message_sink(tx);
        open(&mut s).await;
        let observed = rx.recv().await.unwrap();
        assert_eq!(observed.kind, MessageKind::System);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_warning_flows_through_dispatch_loop() {
        let mut s = test_session();
        open(&mut s).await;

        // The next engine event is the idle warning, 240 s in (the paused
        // clock fast-forwards there).
        s.engine.step().await;
        let last = s.engine.messages().last().unwrap();
        assert_eq!(last.kind, MessageKind::Status);
        assert!(last.content.contains("60 seconds"));
        assert_eq!(s.engine.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_disconnect_has_no_memory() {
        let mut s = test_session();
        open(&mut s).await;
        s.engine
            .handle_event(EngineEvent::Channel(NetEvent::Binary(codec::encode(
                Direction::ServerOrigin,
                &[0i16; 24_000],
            ))))
            .await;
        tokio::time::advance(std::time::Duration::from_secs(100)).await;
        s.engine.disconnect();

        // New channel, new session: fresh cursor and a fresh session clock
        let (cmd_tx, _cmd_rx) = mpsc::channel(64);
        s.engine.open_channel(cmd_tx, None);
        open(&mut s).await;
        assert_eq!(s.engine.scheduler.next_playback_time(), 0.0);
        assert_eq!(
            s.engine.policy.elapsed(),
            Some(std::time::Duration::ZERO)
        );
    }
}
