//! **Call session orchestration** — the engine's dispatch loop and public API.
//!
//! One `CallSession` object owns every moving part of an active call: the
//! capture handle, the realtime transport, the playback sink and the VAD.
//! It runs an explicit `select!` dispatch loop over command, capture and
//! transport channels plus a ~60Hz tick for voice-activity polling — state
//! lives in this one place and the embedding UI consumes a narrow
//! [`EngineEvent`] stream.
//!
//! Turn state machine:
//!
//! ```text
//! Idle → Capturing → Committing → AwaitingResponse → Speaking → Idle
//!   ▲                                                     │
//!   └── call mode: re-enter Capturing on a fresh ─────────┘
//!       per-turn connection after response.done
//! ```
//!
//! Any device/transport/protocol failure surfaces to the caller and lands
//! back in `Idle` with microphone and speaker released, so a retry never
//! needs an application restart.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureConfig, CaptureHandle, CapturePipeline};
use crate::codec::{self, WireFrame};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioBuffer, OutputSink, PlaybackConfig, PlaybackScheduler};
use crate::protocol::{
    ClientEvent, ConversationItem, ResponsePayload, ResponseRequest, ServerEvent,
};
use crate::sink::{AudioOutput, SinkConfig};
use crate::spectrum::{SpectrumAnalyzer, SpectrumConfig};
use crate::transport::{RealtimeSession, TransportConfig};
use crate::turn::{CallState, Turn, TurnRole};
use crate::vad::{VadConfig, VadDetector, VadEvent};

/// Control-loop tick period (~60Hz, the rate the VAD was tuned at).
const TICK_PERIOD: Duration = Duration::from_millis(16);

/// Full engine configuration, one section per component.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Input device id from [`crate::capture::list_devices`]; `None` uses
    /// the default microphone.
    pub device_id: Option<String>,
    pub capture: CaptureConfig,
    pub spectrum: SpectrumConfig,
    pub vad: VadConfig,
    pub playback: PlaybackConfig,
    pub sink: SinkConfig,
    pub transport: TransportConfig,
}

/// Events emitted to the embedding layer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(CallState),
    CallModeChanged(bool),
    TurnStarted(Turn),
    TurnUpdated(Turn),
    TurnCompleted(Turn),
    /// A surfaced device/transport/protocol failure; the engine has already
    /// reset to `Idle` with all audio resources released.
    Error(String),
}

enum Command {
    StartTalk,
    StopTalk,
    SendText(String),
    ToggleCall,
}

/// Public engine handle. Construction spawns the session loop; commands are
/// fire-and-forget and their outcomes arrive on the event stream.
pub struct VoiceEngine {
    command_tx: mpsc::UnboundedSender<Command>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl VoiceEngine {
    /// Create the engine and spawn its session loop. Must be called within
    /// a tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = CallSession::new(config, events_tx);
        let task = tokio::spawn(session.run(command_rx));

        Self {
            command_tx,
            events_rx: Some(events_rx),
            task: Some(task),
        }
    }

    /// Push-to-talk: begin capturing a single turn.
    pub fn start(&self) -> VoiceResult<()> {
        self.send(Command::StartTalk)
    }

    /// Push-to-talk release: commit the captured turn.
    pub fn stop(&self) -> VoiceResult<()> {
        self.send(Command::StopTalk)
    }

    /// Submit a typed message as its own turn.
    pub fn send_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(Command::SendText(text.into()))
    }

    /// Toggle hands-free call mode on or off.
    pub fn toggle_call(&self) -> VoiceResult<()> {
        self.send(Command::ToggleCall)
    }

    /// Take the event stream (single consumer).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.take()
    }

    /// Stop the session loop and wait for its cleanup to finish.
    pub async fn shutdown(self) {
        let VoiceEngine {
            command_tx, task, ..
        } = self;
        // Closing the command channel makes the loop tear down and exit.
        drop(command_tx);
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }

    fn send(&self, command: Command) -> VoiceResult<()> {
        self.command_tx
            .send(command)
            .map_err(|_| VoiceError::ChannelSend("engine session loop is gone".to_string()))
    }
}

type FrameRx = Option<mpsc::UnboundedReceiver<WireFrame>>;
type ServerRx = Option<mpsc::UnboundedReceiver<ServerEvent>>;

/// Await a message from an optional channel; a missing channel never
/// resolves, which disables the corresponding select branch.
async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Owns all per-call resources and applies the turn state machine.
struct CallSession {
    config: EngineConfig,
    state: CallState,
    call_mode: bool,
    capture: Option<CaptureHandle>,
    transport: Option<RealtimeSession>,
    output: Option<Arc<AudioOutput>>,
    playback: Option<Arc<PlaybackScheduler>>,
    vad: VadDetector,
    analyzer: SpectrumAnalyzer,
    user_turn: Option<Turn>,
    assistant_turn: Option<Turn>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl CallSession {
    fn new(config: EngineConfig, events_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let vad = VadDetector::new(config.vad.clone());
        let analyzer = SpectrumAnalyzer::new(config.spectrum.clone());
        Self {
            config,
            state: CallState::Idle,
            call_mode: false,
            capture: None,
            transport: None,
            output: None,
            playback: None,
            vad,
            analyzer,
            user_turn: None,
            assistant_turn: None,
            events_tx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut frames: FrameRx = None;
        let mut server: ServerRx = None;

        let mut tick = tokio::time::interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        self.handle_command(command, &mut frames, &mut server).await;
                    }
                    None => {
                        debug!("engine handle dropped, tearing down session loop");
                        self.teardown(&mut frames, &mut server).await;
                        break;
                    }
                },

                frame = recv_opt(&mut frames) => match frame {
                    Some(frame) => {
                        if let Err(e) = self.forward_frame(frame) {
                            self.fail(e, &mut frames, &mut server).await;
                        }
                    }
                    None => frames = None,
                },

                event = recv_opt(&mut server) => match event {
                    Some(event) => {
                        self.handle_server_event(event, &mut frames, &mut server).await;
                    }
                    None => {
                        server = None;
                        if self.state != CallState::Idle {
                            self.fail(
                                VoiceError::Transport(
                                    "connection closed unexpectedly".to_string(),
                                ),
                                &mut frames,
                                &mut server,
                            )
                            .await;
                        }
                    }
                },

                _ = tick.tick() => self.on_tick(&mut frames),
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
        frames: &mut FrameRx,
        server: &mut ServerRx,
    ) {
        match command {
            Command::ToggleCall => {
                if self.call_mode {
                    info!("call mode off");
                    self.teardown(frames, server).await;
                } else {
                    info!("call mode on");
                    self.call_mode = true;
                    self.emit(EngineEvent::CallModeChanged(true));
                    if let Err(e) = self.begin_turn(frames, server).await {
                        self.fail(e, frames, server).await;
                    }
                }
            }
            Command::StartTalk => {
                if self.state != CallState::Idle || self.call_mode {
                    warn!("push-to-talk start ignored in state {:?}", self.state);
                    return;
                }
                if let Err(e) = self.begin_turn(frames, server).await {
                    self.fail(e, frames, server).await;
                }
            }
            Command::StopTalk => {
                if self.state == CallState::Capturing && !self.call_mode {
                    self.commit_turn(frames);
                }
            }
            Command::SendText(text) => {
                if self.state != CallState::Idle {
                    warn!("text turn ignored while a turn is in flight");
                    return;
                }
                if let Err(e) = self.send_text_turn(text, server).await {
                    self.fail(e, frames, server).await;
                }
            }
        }
    }

    /// Open per-turn resources and enter `Capturing`. The transport comes
    /// first so a connect failure claims no devices; each later failure
    /// path releases everything through `fail`.
    async fn begin_turn(&mut self, frames: &mut FrameRx, server: &mut ServerRx) -> VoiceResult<()> {
        // Serialize with any previous turn: its resources must be released
        // before this one claims the microphone or the socket.
        self.release_turn_io(frames, server).await;

        let mut session = RealtimeSession::open(self.config.transport.clone()).await?;
        *server = session.take_events();
        session.send(&ClientEvent::InputAudioBufferClear)?;
        self.transport = Some(session);

        if self.output.is_none() {
            let output = AudioOutput::open(self.config.sink.clone())?;
            let sink: Arc<dyn OutputSink> = output.clone();
            self.playback = Some(PlaybackScheduler::new(self.config.playback.clone(), sink));
            self.output = Some(output);
        }

        let pipeline = CapturePipeline::new(self.config.capture.clone());
        let mut handle = pipeline.start(self.config.device_id.as_deref())?;
        *frames = handle.take_frames();
        self.capture = Some(handle);

        self.vad.reset();
        self.analyzer.reset();
        self.user_turn = None;
        self.assistant_turn = None;
        self.set_state(CallState::Capturing);
        Ok(())
    }

    /// Submit a typed message as one turn exchange on its own connection.
    async fn send_text_turn(&mut self, text: String, server: &mut ServerRx) -> VoiceResult<()> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(());
        }

        if self.transport.is_none() {
            let mut session = RealtimeSession::open(self.config.transport.clone()).await?;
            *server = session.take_events();
            self.transport = Some(session);
        }
        if let Some(transport) = &self.transport {
            transport.send(&ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(&text),
            })?;
            transport.send(&ClientEvent::ResponseCreate {
                response: ResponseRequest::text_only(),
            })?;
        }

        let mut turn = Turn::with_text(TurnRole::User, text);
        turn.complete(None);
        self.emit(EngineEvent::TurnCompleted(turn));

        self.set_state(CallState::AwaitingResponse);
        Ok(())
    }

    /// ~60Hz control tick: poll the VAD against the freshest capture
    /// samples. Only call mode drives automatic submission.
    fn on_tick(&mut self, frames: &mut FrameRx) {
        if self.state != CallState::Capturing || !self.call_mode {
            return;
        }
        let Some(capture) = &self.capture else {
            return;
        };

        let samples = capture.latest_samples(self.config.spectrum.fft_size);
        let magnitude = self.analyzer.mean_magnitude(&samples);
        let playback_active = self
            .playback
            .as_ref()
            .map(|p| p.is_playing())
            .unwrap_or(false);

        match self.vad.poll(magnitude, playback_active, Instant::now()) {
            Some(VadEvent::SpeechStarted) => {
                if self.user_turn.is_none() {
                    let turn = Turn::new(TurnRole::User);
                    self.emit(EngineEvent::TurnStarted(turn.clone()));
                    self.user_turn = Some(turn);
                }
            }
            Some(VadEvent::SustainedSilence) => {
                debug!("sustained silence, awaiting confirmation");
            }
            Some(VadEvent::TurnReady) => {
                info!("silence confirmed, submitting turn");
                self.commit_turn(frames);
            }
            None => {}
        }
    }

    /// Capturing → Committing: flush the accumulator, then commit.
    fn commit_turn(&mut self, frames: &mut FrameRx) {
        if self.state != CallState::Capturing {
            return;
        }

        self.vad.reset();

        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        // Drain flushed frames so trailing audio precedes the commit.
        if let Some(rx) = frames.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                if let Err(e) = self.forward_frame(frame) {
                    warn!("dropping trailing capture frame: {e}");
                }
            }
        }
        *frames = None;

        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send_frame(&WireFrame::commit()) {
                warn!("commit frame not delivered: {e}");
            }
        }
        self.set_state(CallState::Committing);
    }

    /// Forward a capture wire frame to the transport. Codec problems skip
    /// the frame; a dead transport is reported to the caller.
    fn forward_frame(&mut self, frame: WireFrame) -> VoiceResult<()> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        match transport.send_frame(&frame) {
            Ok(()) => Ok(()),
            Err(VoiceError::Codec(e)) => {
                warn!("skipping malformed capture frame: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_server_event(
        &mut self,
        event: ServerEvent,
        frames: &mut FrameRx,
        server: &mut ServerRx,
    ) {
        match event {
            ServerEvent::SessionUpdated => debug!("session negotiation acknowledged"),

            ServerEvent::SpeechStarted => {
                if self.user_turn.is_none() {
                    let turn = Turn::new(TurnRole::User);
                    self.emit(EngineEvent::TurnStarted(turn.clone()));
                    self.user_turn = Some(turn);
                }
            }
            ServerEvent::SpeechStopped => debug!("remote speech endpoint detected"),
            ServerEvent::Committed => debug!("input buffer committed"),

            ServerEvent::TranscriptionDelta { delta, .. } => {
                if let Some(delta) = delta {
                    let turn = self
                        .user_turn
                        .get_or_insert_with(|| Turn::new(TurnRole::User));
                    turn.append_delta(&delta);
                    let snapshot = turn.clone();
                    self.emit(EngineEvent::TurnUpdated(snapshot));
                }
            }

            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                let mut turn = self
                    .user_turn
                    .take()
                    .unwrap_or_else(|| Turn::new(TurnRole::User));
                turn.complete(transcript);
                self.emit(EngineEvent::TurnCompleted(turn));

                if self.state == CallState::Committing {
                    if let Some(transport) = &self.transport {
                        if let Err(e) = transport.send(&ClientEvent::ResponseCreate {
                            response: ResponseRequest::with_audio(),
                        }) {
                            warn!("response request not delivered: {e}");
                        }
                    }
                    self.set_state(CallState::AwaitingResponse);
                }
            }

            ServerEvent::ItemCreated { item } => self.apply_assistant_item(item),

            ServerEvent::OutputItemAdded { item } => {
                self.enter_speaking();
                self.apply_assistant_item(item);
            }

            ServerEvent::AudioDelta { delta, .. } => {
                self.enter_speaking();
                let Some(encoded) = delta else { return };
                match codec::decode(&encoded) {
                    Ok(samples) => {
                        if let Some(playback) = &self.playback {
                            playback
                                .enqueue(AudioBuffer::new(samples, self.config.sink.sample_rate));
                        }
                    }
                    // Skip the frame and keep the stream alive.
                    Err(e) => warn!("skipping malformed audio delta: {e}"),
                }
            }

            ServerEvent::AudioDone => debug!("response audio complete"),

            ServerEvent::ResponseDone { response } => {
                self.finish_response(response, frames, server).await;
            }

            ServerEvent::Error { error } => {
                let message = error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "unknown remote error".to_string());
                self.fail(VoiceError::Protocol(message), frames, server).await;
            }

            ServerEvent::Unknown => {}
        }
    }

    /// AwaitingResponse → Speaking on the first response output.
    fn enter_speaking(&mut self) {
        if matches!(
            self.state,
            CallState::AwaitingResponse | CallState::Committing
        ) {
            self.set_state(CallState::Speaking);
        }
    }

    /// Apply an assistant conversation item, suppressing duplicates the
    /// remote delivers across `output_item.added` and `response.done`.
    fn apply_assistant_item(&mut self, item: Option<ConversationItem>) {
        let Some(item) = item else { return };
        if item.role.as_deref() != Some("assistant") {
            return;
        }
        let Some((text, _is_audio)) = item.display_text() else {
            return;
        };
        if text.is_empty() {
            return;
        }

        if let Some(turn) = self.assistant_turn.as_mut() {
            if turn.transcript == text {
                return;
            }
            turn.transcript = text;
            let snapshot = turn.clone();
            self.emit(EngineEvent::TurnUpdated(snapshot));
            return;
        }

        let turn = Turn::with_text(TurnRole::Assistant, text);
        self.emit(EngineEvent::TurnStarted(turn.clone()));
        self.assistant_turn = Some(turn);
    }

    /// Speaking → Idle, or straight back to Capturing in call mode on a
    /// fresh per-turn connection.
    async fn finish_response(
        &mut self,
        response: Option<ResponsePayload>,
        frames: &mut FrameRx,
        server: &mut ServerRx,
    ) {
        if let Some(item) = response
            .and_then(|payload| payload.output)
            .and_then(|output| output.into_iter().next())
        {
            self.apply_assistant_item(Some(item));
        }

        if let Some(mut turn) = self.assistant_turn.take() {
            turn.complete(None);
            self.emit(EngineEvent::TurnCompleted(turn));
        }

        // This connection served its turn exchange.
        *server = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }

        if self.call_mode {
            if let Err(e) = self.begin_turn(frames, server).await {
                self.fail(e, frames, server).await;
            }
        } else {
            self.set_state(CallState::Idle);
        }
    }

    /// Surface a failure and reset to Idle with everything released.
    async fn fail(&mut self, error: VoiceError, frames: &mut FrameRx, server: &mut ServerRx) {
        error!("call failed: {error}");
        self.emit(EngineEvent::Error(error.to_string()));
        self.teardown(frames, server).await;
    }

    /// Release the per-turn capture and transport (kept separate from full
    /// teardown so call mode can roll to the next turn).
    async fn release_turn_io(&mut self, frames: &mut FrameRx, server: &mut ServerRx) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        *frames = None;
        *server = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    /// Stop everything. Every step runs regardless of the others; from the
    /// caller's perspective cleanup is all-or-nothing.
    async fn teardown(&mut self, frames: &mut FrameRx, server: &mut ServerRx) {
        // (a) cancel any pending VAD confirmation
        self.vad.reset();

        // (b) stop the capture device and release its handle
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        *frames = None;

        // (c) clear the remote input buffer and close the connection
        if let Some(transport) = &self.transport {
            let _ = transport.send(&ClientEvent::InputAudioBufferClear);
        }
        *server = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }

        // (d) clear the playback queue and reset its clock, then release
        // the speaker
        if let Some(playback) = self.playback.take() {
            playback.clear();
        }
        if let Some(output) = self.output.take() {
            output.clear();
            output.close();
        }

        self.user_turn = None;
        self.assistant_turn = None;

        if self.call_mode {
            self.call_mode = false;
            self.emit(EngineEvent::CallModeChanged(false));
        }
        self.set_state(CallState::Idle);
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "call state change");
            self.state = state;
            self.emit(EngineEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("engine event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContentPart;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn session() -> (CallSession, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (CallSession::new(EngineConfig::default(), events_tx), events_rx)
    }

    fn assistant_item(text: &str) -> Option<ConversationItem> {
        Some(ConversationItem {
            id: Some("msg_1".to_string()),
            kind: "message".to_string(),
            role: Some("assistant".to_string()),
            content: Some(vec![ContentPart {
                kind: "audio".to_string(),
                text: None,
                transcript: Some(text.to_string()),
            }]),
        })
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn transcription_flow_drives_turn_and_state() {
        let (mut session, mut events_rx) = session();
        session.state = CallState::Committing;
        let (mut frames, mut server) = (None, None);

        session
            .handle_server_event(
                ServerEvent::TranscriptionDelta {
                    delta: Some("hello ".to_string()),
                    item_id: None,
                },
                &mut frames,
                &mut server,
            )
            .await;
        session
            .handle_server_event(
                ServerEvent::TranscriptionDelta {
                    delta: Some("there".to_string()),
                    item_id: None,
                },
                &mut frames,
                &mut server,
            )
            .await;
        session
            .handle_server_event(
                ServerEvent::TranscriptionCompleted {
                    transcript: Some("hello there".to_string()),
                    item_id: None,
                },
                &mut frames,
                &mut server,
            )
            .await;

        assert_eq!(session.state, CallState::AwaitingResponse);

        let events = drain_events(&mut events_rx);
        let completed = events.iter().find_map(|e| match e {
            EngineEvent::TurnCompleted(turn) => Some(turn.clone()),
            _ => None,
        });
        let completed = completed.expect("transcription completion emits the turn");
        assert_eq!(completed.transcript, "hello there");
        assert!(completed.is_complete);
    }

    #[tokio::test]
    async fn first_response_output_enters_speaking() {
        let (mut session, mut events_rx) = session();
        session.state = CallState::AwaitingResponse;
        let (mut frames, mut server) = (None, None);

        session
            .handle_server_event(
                ServerEvent::OutputItemAdded {
                    item: assistant_item("certainly"),
                },
                &mut frames,
                &mut server,
            )
            .await;

        assert_eq!(session.state, CallState::Speaking);
        let events = drain_events(&mut events_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::TurnStarted(turn) if turn.role == TurnRole::Assistant
        )));
    }

    #[tokio::test]
    async fn duplicate_assistant_items_are_suppressed() {
        let (mut session, mut events_rx) = session();
        session.state = CallState::Speaking;

        session.apply_assistant_item(assistant_item("certainly"));
        session.apply_assistant_item(assistant_item("certainly"));

        let events = drain_events(&mut events_rx);
        let starts = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::TurnStarted(_)))
            .count();
        let updates = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::TurnUpdated(_)))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(updates, 0);
    }

    #[tokio::test]
    async fn response_done_returns_to_idle_outside_call_mode() {
        let (mut session, mut events_rx) = session();
        session.state = CallState::Speaking;
        session.assistant_turn = Some(Turn::with_text(TurnRole::Assistant, "certainly"));
        let (mut frames, mut server) = (None, None);

        session
            .handle_server_event(
                ServerEvent::ResponseDone { response: None },
                &mut frames,
                &mut server,
            )
            .await;

        assert_eq!(session.state, CallState::Idle);
        let events = drain_events(&mut events_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::TurnCompleted(turn) if turn.role == TurnRole::Assistant && turn.is_complete
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::StateChanged(CallState::Idle))));
    }

    #[tokio::test]
    async fn remote_error_resets_to_idle_and_surfaces() {
        let (mut session, mut events_rx) = session();
        session.state = CallState::AwaitingResponse;
        session.call_mode = true;
        let (mut frames, mut server) = (None, None);

        session
            .handle_server_event(
                ServerEvent::Error {
                    error: Some(crate::protocol::ErrorPayload {
                        kind: Some("server_error".to_string()),
                        message: Some("backend unavailable".to_string()),
                    }),
                },
                &mut frames,
                &mut server,
            )
            .await;

        assert_eq!(session.state, CallState::Idle);
        assert!(!session.call_mode);

        let events = drain_events(&mut events_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Error(message) if message.contains("backend unavailable")
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::CallModeChanged(false))));
    }

    #[tokio::test]
    async fn malformed_audio_delta_does_not_abort_the_stream() {
        let (mut session, _events_rx) = session();
        session.state = CallState::Speaking;
        let (mut frames, mut server) = (None, None);

        session
            .handle_server_event(
                ServerEvent::AudioDelta {
                    delta: Some("!!!not-base64!!!".to_string()),
                    item_id: None,
                },
                &mut frames,
                &mut server,
            )
            .await;

        // Still Speaking, no failure path taken.
        assert_eq!(session.state, CallState::Speaking);
    }

    #[tokio::test]
    async fn send_text_without_credentials_surfaces_error_and_stays_idle() {
        init_tracing();
        // Default transport config has no API key: the turn must fail with
        // a surfaced error and no state change, before any device claim.
        let mut engine = VoiceEngine::new(EngineConfig::default());
        let mut events = engine.take_events().unwrap();

        engine.send_text("hello").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("engine must answer")
            .expect("event stream open");
        match event {
            EngineEvent::Error(message) => assert!(message.contains("API key")),
            other => panic!("expected an error event, got {other:?}"),
        }

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn failed_call_start_reports_and_resets_call_mode() {
        init_tracing();
        let mut engine = VoiceEngine::new(EngineConfig::default());
        let mut events = engine.take_events().unwrap();

        engine.toggle_call().unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(event)) => seen.push(event),
                _ => break,
            }
        }

        assert!(matches!(seen.first(), Some(EngineEvent::CallModeChanged(true))));
        assert!(seen.iter().any(|e| matches!(e, EngineEvent::Error(_))));
        assert!(seen
            .iter()
            .any(|e| matches!(e, EngineEvent::CallModeChanged(false))));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_completes_cleanly() {
        let engine = VoiceEngine::new(EngineConfig::default());
        tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .expect("session loop exits when the handle closes");
    }
}
