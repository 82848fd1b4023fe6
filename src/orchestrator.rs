//! Conversation orchestrator: owns the session state machine and routes
//! every event between the audio source, the active backend, the
//! function executor, and the audio sink.
//!
//! All state mutation happens on one loop task. External callers hold a
//! [`ConversationOrchestrator`] handle: commands go in over a channel,
//! events come back over the bus, and the status snapshot is readable at
//! any time.

use crate::audio::{AudioFrame, AudioSink, SinkFormat};
use crate::backend::premium::PLAYBACK_SAMPLE_RATE;
use crate::backend::{
    Backend, BackendEvent, EfficientBackend, PremiumBackend, ToolCall,
    efficient::EfficientConfig, premium::PremiumConfig,
};
use crate::clock::Clock;
use crate::config::{AgentConfig, Mode};
use crate::cost::SharedLedger;
use crate::credentials::CredentialProvider;
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventBus, SessionStatus};
use crate::functions::{FunctionExecutor, error_payload};
use crate::routing::{AdaptiveRouter, InteractionHint, RoutingDecision};
use crate::wakeword::WakeReceiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fixed pool of idle follow-up prompts.
const NUDGE_POOL: &[&str] = &[
    "Is there anything else I can help you with?",
    "Anything else on your mind?",
];

/// Legal session status transitions.
///
/// ```text
/// idle → listening → thinking → (executing ↔ thinking) → speaking → idle
/// any → error → idle
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    status: SessionStatus,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    fn allowed(from: SessionStatus, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (from, to),
            (Idle, Listening)
                | (Listening, Thinking)
                | (Thinking, Executing)
                | (Executing, Thinking)
                | (Thinking, Speaking)
                | (Speaking, Idle)
                | (_, Error)
                | (Error, Idle)
        )
    }

    /// Apply a transition, rejecting anything outside the state machine.
    pub fn transition(&mut self, to: SessionStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !Self::allowed(self.status, to) {
            return Err(AgentError::State(format!(
                "illegal transition {} → {}",
                self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Reset to idle outside the normal flow (stop / recover).
    pub fn force_idle(&mut self) {
        self.status = SessionStatus::Idle;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub mode: Mode,
}

enum Command {
    SendText(String),
    SetForcedMode(Option<Mode>),
}

/// Public handle to the running session.
pub struct ConversationOrchestrator {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    ledger: SharedLedger,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn AudioSink>,
    executor: Arc<FunctionExecutor>,
    events: EventBus<AgentEvent>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConversationOrchestrator {
    pub fn new(
        config: AgentConfig,
        clock: Arc<dyn Clock>,
        ledger: SharedLedger,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn AudioSink>,
        executor: Arc<FunctionExecutor>,
    ) -> Self {
        let default_mode = config.routing.default_mode;
        Self {
            config,
            clock,
            ledger,
            credentials,
            sink,
            executor,
            events: EventBus::new(),
            snapshot: Arc::new(Mutex::new(SessionSnapshot {
                status: SessionStatus::Idle,
                mode: default_mode,
            })),
            commands: Mutex::new(None),
            cancel: Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe to orchestrator events.
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Current session status.
    pub fn status(&self) -> SessionStatus {
        self.snapshot
            .lock()
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Error)
    }

    /// Currently active backend mode.
    pub fn mode(&self) -> Mode {
        self.snapshot
            .lock()
            .map(|s| s.mode)
            .unwrap_or(self.config.routing.default_mode)
    }

    /// Start the session loop over the given audio source. The source
    /// delivers frames or a source error; an error is fatal for the
    /// session.
    ///
    /// Credentials are resolved here; a missing key fails synchronously.
    /// Everything after this call is delivered as events.
    pub async fn start(
        &self,
        frames: mpsc::Receiver<Result<AudioFrame>>,
        wake: Option<WakeReceiver>,
    ) -> Result<()> {
        {
            let commands = self
                .commands
                .lock()
                .map_err(|_| AgentError::State("orchestrator lock poisoned".into()))?;
            if commands.is_some() {
                return Err(AgentError::State("session already started".into()));
            }
        }

        let api_key = self.credentials.api_key()?;
        let voice = self.credentials.voice();

        let router = AdaptiveRouter::new(
            self.config.routing.clone(),
            self.ledger.clone(),
            self.clock.clone(),
        );
        let decision = router.route(None);
        info!(mode = %decision.mode, reason = ?decision.reason, "initial routing decision");

        let backend = self
            .instantiate(decision.mode, api_key.clone(), voice.clone())
            .await?;
        let backend_rx = backend.subscribe();

        let (command_tx, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let mut session = SessionLoop {
            config: self.config.clone(),
            clock: self.clock.clone(),
            ledger: self.ledger.clone(),
            sink: self.sink.clone(),
            executor: self.executor.clone(),
            events: self.events.clone(),
            snapshot: self.snapshot.clone(),
            router,
            api_key,
            voice,
            backend,
            backend_rx,
            machine: StateMachine::new(),
            frames,
            frames_closed: false,
            wake,
            commands: command_rx,
            cancel: cancel.clone(),
            silence_deadline: None,
            nudge_deadline: None,
            nudge_count: 0,
            greeted: false,
            audio_playing: false,
        };
        session.sync_snapshot();

        let handle = tokio::spawn(async move { session.run().await });

        if let Ok(mut commands) = self.commands.lock() {
            *commands = Some(command_tx);
        }
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = Some(cancel);
        }
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    /// Stop the session: cancel pending work, disconnect the backend
    /// deliberately, drain the sink, return to idle. Idempotent.
    pub async fn stop(&self) {
        let cancel = self
            .cancel
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        if let Ok(mut commands) = self.commands.lock() {
            *commands = None;
        }
    }

    /// Inject a user text turn into the active backend.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.command(Command::SendText(text.into())).await
    }

    /// Force or clear the routing mode for subsequent interactions.
    pub async fn set_forced_mode(&self, mode: Option<Mode>) -> Result<()> {
        self.command(Command::SetForcedMode(mode)).await
    }

    async fn command(&self, command: Command) -> Result<()> {
        let sender = self
            .commands
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        match sender {
            Some(sender) => sender
                .send(command)
                .await
                .map_err(|_| AgentError::Channel("session loop is gone".into())),
            None => Err(AgentError::State("session not started".into())),
        }
    }

    async fn instantiate(
        &self,
        mode: Mode,
        api_key: String,
        voice: Option<String>,
    ) -> Result<Backend> {
        instantiate_backend(
            &self.config,
            mode,
            api_key,
            voice,
            self.clock.clone(),
            self.ledger.clone(),
        )
        .await
    }
}

async fn instantiate_backend(
    config: &AgentConfig,
    mode: Mode,
    api_key: String,
    voice: Option<String>,
    clock: Arc<dyn Clock>,
    ledger: SharedLedger,
) -> Result<Backend> {
    let executor_catalog = crate::functions::FunctionCatalog::new();
    let schemas = executor_catalog.schemas_for_api();
    match mode {
        Mode::Premium => {
            let premium_config = PremiumConfig::from_agent(config, api_key, voice, schemas);
            let backend = PremiumBackend::connect(premium_config, clock, ledger).await?;
            Ok(Backend::Premium(backend))
        }
        Mode::Efficient => {
            let efficient_config = EfficientConfig::from_agent(config, api_key, voice);
            Ok(Backend::Efficient(EfficientBackend::new(
                efficient_config,
                schemas,
                clock,
                ledger,
            )))
        }
    }
}

struct SessionLoop {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    ledger: SharedLedger,
    sink: Arc<dyn AudioSink>,
    executor: Arc<FunctionExecutor>,
    events: EventBus<AgentEvent>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    router: AdaptiveRouter,
    api_key: String,
    voice: Option<String>,
    backend: Backend,
    backend_rx: broadcast::Receiver<BackendEvent>,
    machine: StateMachine,
    frames: mpsc::Receiver<Result<AudioFrame>>,
    frames_closed: bool,
    wake: Option<WakeReceiver>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    /// Efficient-mode utterance boundary timer.
    silence_deadline: Option<tokio::time::Instant>,
    /// Idle conversational nudge timer.
    nudge_deadline: Option<tokio::time::Instant>,
    nudge_count: u32,
    greeted: bool,
    audio_playing: bool,
}

impl SessionLoop {
    async fn run(&mut self) {
        // Spoken greeting opens the session; idle nudges arm afterwards.
        let greeting = self.config.conversation.greeting.clone();
        if !greeting.is_empty() {
            self.text_turn(&greeting).await;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        // Every handle is gone; end the session cleanly.
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                frame = self.frames.recv(), if !self.frames_closed => {
                    match frame {
                        Some(Ok(frame)) => self.on_frame(frame).await,
                        Some(Err(err)) => {
                            self.fatal(&format!("audio source failure: {err}")).await;
                        }
                        None => {
                            debug!("audio source ended");
                            self.frames_closed = true;
                        }
                    }
                }

                event = self.backend_rx.recv() => {
                    match event {
                        Ok(event) => self.on_backend_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "backend event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.fatal("backend event stream closed").await;
                        }
                    }
                }

                wake = async {
                    match self.wake.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match wake {
                        Some(event) => {
                            info!(keyword = %event.keyword, "wake signal");
                            self.events.emit(AgentEvent::Wakeword(event.keyword));
                        }
                        // Wake source went away; stop polling it.
                        None => self.wake = None,
                    }
                }

                _ = async {
                    match self.silence_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.silence_deadline = None;
                    self.on_silence_elapsed().await;
                }

                _ = async {
                    match self.nudge_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.nudge_deadline = None;
                    self.on_nudge_elapsed().await;
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendText(text) => {
                self.events.emit(AgentEvent::Transcript {
                    role: "user",
                    text: text.clone(),
                    is_final: true,
                });
                self.text_turn(&text).await;
            }
            Command::SetForcedMode(mode) => {
                self.router.set_forced_mode(mode);
            }
        }
    }

    async fn on_frame(&mut self, frame: AudioFrame) {
        match self.machine.status() {
            // Echo suppression: response audio must not loop back in.
            SessionStatus::Speaking | SessionStatus::Error => return,
            SessionStatus::Idle => {
                self.set_status(SessionStatus::Listening);
                self.nudge_count = 0;
                self.nudge_deadline = None;
            }
            _ => {}
        }

        if self.backend.mode() == Mode::Efficient {
            let timeout = Duration::from_millis(self.config.conversation.silence_timeout_ms);
            self.silence_deadline = Some(tokio::time::Instant::now() + timeout);
        }

        if let Err(err) = self.backend.append_audio(frame).await {
            self.fatal(&format!("audio forwarding failed: {err}")).await;
        }
    }

    /// Efficient-mode utterance boundary: the local silence timer fired.
    async fn on_silence_elapsed(&mut self) {
        if self.machine.status() != SessionStatus::Listening {
            return;
        }
        self.set_status(SessionStatus::Thinking);

        // A stop() during the chain abandons the utterance, pending
        // retries included.
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.backend.commit_audio() => result,
        };
        if let Err(err) = result {
            self.fatal(&format!("utterance failed: {err}")).await;
        }
    }

    async fn on_nudge_elapsed(&mut self) {
        if self.machine.status() != SessionStatus::Idle {
            return;
        }
        if self.nudge_count >= self.config.conversation.max_nudges {
            return;
        }
        let prompt = NUDGE_POOL[self.nudge_count as usize % NUDGE_POOL.len()];
        info!(nudge = self.nudge_count + 1, "idle follow-up");
        self.nudge_count += 1;
        self.text_turn(prompt).await;
    }

    /// Run a text turn through the same state flow as a spoken one, so
    /// response playback gets echo suppression.
    async fn text_turn(&mut self, text: &str) {
        if self.machine.status() == SessionStatus::Idle {
            self.set_status(SessionStatus::Listening);
            self.set_status(SessionStatus::Thinking);
        }
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.backend.send_text(text) => result,
        };
        if let Err(err) = result {
            self.fatal(&format!("text turn failed: {err}")).await;
        }
    }

    async fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::SessionReady => {
                debug!("backend session ready");
            }
            BackendEvent::SpeechStarted => {
                if self.machine.status() == SessionStatus::Idle {
                    self.set_status(SessionStatus::Listening);
                }
                self.nudge_count = 0;
                self.nudge_deadline = None;
            }
            BackendEvent::SpeechStopped => {
                if self.machine.status() == SessionStatus::Listening {
                    self.set_status(SessionStatus::Thinking);
                }
            }
            BackendEvent::Stage(stage) => {
                debug!(%stage, "chain stage");
            }
            BackendEvent::Transcription(text) => {
                self.events.emit(AgentEvent::Transcript {
                    role: "user",
                    text,
                    is_final: true,
                });
            }
            BackendEvent::Response(text) => {
                self.events.emit(AgentEvent::Transcript {
                    role: "assistant",
                    text,
                    is_final: true,
                });
            }
            BackendEvent::TextDelta(text) => {
                self.events.emit(AgentEvent::Transcript {
                    role: "assistant",
                    text,
                    is_final: false,
                });
            }
            BackendEvent::TextDone(text) => {
                self.events.emit(AgentEvent::Transcript {
                    role: "assistant",
                    text,
                    is_final: true,
                });
            }
            BackendEvent::AudioChunk(chunk) => {
                self.ensure_speaking();
                self.play(chunk, SinkFormat::Pcm16 {
                    sample_rate: PLAYBACK_SAMPLE_RATE,
                })
                .await;
            }
            BackendEvent::Audio(buffer) => {
                self.ensure_speaking();
                if !buffer.is_empty() {
                    self.play(buffer, SinkFormat::Encoded { mime: "audio/mpeg" })
                        .await;
                }
            }
            BackendEvent::AudioDone => {
                debug!("response audio stream ended");
            }
            BackendEvent::ToolCall(call) => {
                self.on_tool_call(call).await;
            }
            BackendEvent::ResponseDone => {
                self.complete_interaction().await;
            }
            BackendEvent::Retry {
                stage,
                attempt,
                delay_ms,
            } => {
                debug!(%stage, attempt, delay_ms, "stage retry");
            }
            BackendEvent::Reconnecting { attempt, delay_ms } => {
                info!(attempt, delay_ms, "backend reconnecting");
            }
            BackendEvent::Reconnected { attempt } => {
                info!(attempt, "backend reconnected");
            }
            BackendEvent::ReconnectionFailed => {
                self.fatal("backend reconnection failed permanently").await;
            }
            BackendEvent::Error(message) => {
                self.fatal(&message).await;
            }
            BackendEvent::Disconnected { code, reason } => {
                debug!(?code, reason = %reason, "backend disconnected");
            }
        }
    }

    async fn on_tool_call(&mut self, call: ToolCall) {
        // Sequential by construction: the loop processes one call at a
        // time, and the result goes back before the next is picked up.
        if self.machine.status() == SessionStatus::Thinking {
            self.set_status(SessionStatus::Executing);
        }

        info!(function = %call.name, call_id = %call.call_id, "tool call");
        let payload = match self.executor.execute(&call.name, &call.arguments).await {
            Ok(outcome) => {
                debug!(
                    function = %call.name,
                    duration_ms = outcome.execution_time_ms,
                    "tool call succeeded"
                );
                outcome.result
            }
            Err(err) => {
                warn!(function = %call.name, error = %err, "tool call failed");
                error_payload(&err)
            }
        };

        // In-flight executions complete, but a stopped session discards
        // their results.
        if self.cancel.is_cancelled() {
            return;
        }

        if let Err(err) = self.backend.send_tool_result(&call.call_id, payload).await {
            self.fatal(&format!("tool result delivery failed: {err}")).await;
            return;
        }

        if self.machine.status() == SessionStatus::Executing {
            self.set_status(SessionStatus::Thinking);
        }
    }

    /// Response finished: flush playback, record metrics, re-route, idle.
    async fn complete_interaction(&mut self) {
        self.ensure_speaking();

        if let Err(err) = self.sink.flush().await {
            warn!(error = %err, "sink flush failed");
        }
        if self.audio_playing {
            self.audio_playing = false;
            self.events.emit(AgentEvent::AudioStopped);
        }

        let mode = self.backend.mode();
        self.set_status(SessionStatus::Idle);
        self.events.emit(AgentEvent::InteractionComplete { mode });

        let metrics = self
            .ledger
            .lock()
            .map(|ledger| ledger.metrics(self.clock.now()))
            .ok();
        if let Some(metrics) = metrics {
            self.events.emit(AgentEvent::Metrics(metrics));
        }

        self.greeted = true;
        self.arm_nudge();
        self.reroute(None).await;
    }

    /// Re-evaluate routing at the utterance boundary and swap backends
    /// when the decision changes.
    async fn reroute(&mut self, hint: Option<InteractionHint>) {
        let decision: RoutingDecision = self.router.route(hint);
        if decision.mode == self.backend.mode() {
            return;
        }

        info!(
            from = %self.backend.mode(),
            to = %decision.mode,
            reason = ?decision.reason,
            "switching backend"
        );

        if let Err(err) = self.backend.disconnect(true).await {
            warn!(error = %err, "backend teardown failed");
        }

        match instantiate_backend(
            &self.config,
            decision.mode,
            self.api_key.clone(),
            self.voice.clone(),
            self.clock.clone(),
            self.ledger.clone(),
        )
        .await
        {
            Ok(backend) => {
                self.backend_rx = backend.subscribe();
                self.backend = backend;
                self.sync_snapshot();
            }
            Err(err) => {
                self.fatal(&format!("backend swap failed: {err}")).await;
            }
        }
    }

    fn arm_nudge(&mut self) {
        if !self.greeted || self.nudge_count >= self.config.conversation.max_nudges {
            self.nudge_deadline = None;
            return;
        }
        let delay = Duration::from_secs(self.config.conversation.idle_nudge_secs);
        self.nudge_deadline = Some(tokio::time::Instant::now() + delay);
    }

    fn ensure_speaking(&mut self) {
        if self.machine.status() == SessionStatus::Thinking {
            self.set_status(SessionStatus::Speaking);
        }
    }

    async fn play(&mut self, chunk: bytes::Bytes, format: SinkFormat) {
        if !self.audio_playing {
            self.audio_playing = true;
            self.events.emit(AgentEvent::AudioPlaying);
        }
        if let Err(err) = self.sink.play(chunk, format).await {
            warn!(error = %err, "sink write failed");
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.machine.status() == status {
            return;
        }
        match self.machine.transition(status) {
            Ok(()) => {
                self.sync_snapshot();
                self.events.emit(AgentEvent::Status(status));
            }
            Err(err) => warn!(error = %err, "rejected status transition"),
        }
    }

    fn sync_snapshot(&self) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            snapshot.status = self.machine.status();
            snapshot.mode = self.backend.mode();
        }
    }

    async fn fatal(&mut self, message: &str) {
        error!(message, "fatal session error");
        let _ = self.machine.transition(SessionStatus::Error);
        self.sync_snapshot();
        self.events.emit(AgentEvent::Status(SessionStatus::Error));
        self.events.emit(AgentEvent::Error(message.to_owned()));
        self.silence_deadline = None;
        self.nudge_deadline = None;
    }

    async fn shutdown(&mut self) {
        info!("session stopping");
        if let Err(err) = self.backend.disconnect(true).await {
            debug!(error = %err, "backend disconnect during stop");
        }
        if let Err(err) = self.sink.flush().await {
            debug!(error = %err, "sink drain during stop");
        }
        if let Backend::Efficient(backend) = &mut self.backend {
            backend.clear_history();
        }
        self.machine.force_idle();
        self.sync_snapshot();
        self.events.emit(AgentEvent::Status(SessionStatus::Idle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── State machine ─────────────────────────────────────────

    #[test]
    fn happy_path_transitions() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.status(), SessionStatus::Idle);

        machine.transition(SessionStatus::Listening).unwrap();
        machine.transition(SessionStatus::Thinking).unwrap();
        machine.transition(SessionStatus::Executing).unwrap();
        machine.transition(SessionStatus::Thinking).unwrap();
        machine.transition(SessionStatus::Speaking).unwrap();
        machine.transition(SessionStatus::Idle).unwrap();
    }

    #[test]
    fn no_skipping() {
        let mut machine = StateMachine::new();
        assert!(machine.transition(SessionStatus::Thinking).is_err());
        assert!(machine.transition(SessionStatus::Speaking).is_err());

        machine.transition(SessionStatus::Listening).unwrap();
        assert!(machine.transition(SessionStatus::Speaking).is_err());
        assert!(machine.transition(SessionStatus::Executing).is_err());
    }

    #[test]
    fn error_reachable_from_anywhere_and_recovers_to_idle() {
        for start in [
            SessionStatus::Idle,
            SessionStatus::Listening,
            SessionStatus::Thinking,
            SessionStatus::Speaking,
        ] {
            let mut machine = StateMachine::new();
            // Drive to the starting state along legal edges.
            let path: &[SessionStatus] = match start {
                SessionStatus::Idle => &[],
                SessionStatus::Listening => &[SessionStatus::Listening],
                SessionStatus::Thinking => &[SessionStatus::Listening, SessionStatus::Thinking],
                SessionStatus::Speaking => &[
                    SessionStatus::Listening,
                    SessionStatus::Thinking,
                    SessionStatus::Speaking,
                ],
                _ => &[],
            };
            for step in path {
                machine.transition(*step).unwrap();
            }

            machine.transition(SessionStatus::Error).unwrap();
            assert!(machine.transition(SessionStatus::Listening).is_err());
            machine.transition(SessionStatus::Idle).unwrap();
        }
    }

    #[test]
    fn same_state_transition_is_a_no_op() {
        let mut machine = StateMachine::new();
        machine.transition(SessionStatus::Idle).unwrap();
        assert_eq!(machine.status(), SessionStatus::Idle);
    }

    #[test]
    fn force_idle_resets_from_any_state() {
        let mut machine = StateMachine::new();
        machine.transition(SessionStatus::Listening).unwrap();
        machine.force_idle();
        assert_eq!(machine.status(), SessionStatus::Idle);
    }

    #[test]
    fn nudge_pool_is_bounded() {
        // Two follow-ups per idle period, straight from the pool.
        assert!(NUDGE_POOL.len() >= 2);
    }

    // ── Echo suppression ──────────────────────────────────────

    use crate::audio::MemorySink;
    use crate::backend::efficient::EfficientConfig;
    use crate::clock::ManualClock;
    use crate::cost::CostLedger;
    use bytes::Bytes;

    fn test_session_loop() -> SessionLoop {
        let config = AgentConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let ledger: SharedLedger = Arc::new(Mutex::new(CostLedger::new(1.0, 30.0)));
        let efficient_config =
            EfficientConfig::from_agent(&config, "test-key".into(), None);
        let backend = Backend::Efficient(EfficientBackend::new(
            efficient_config,
            Vec::new(),
            clock.clone(),
            ledger.clone(),
        ));
        let backend_rx = backend.subscribe();
        let (_commands_tx, commands) = mpsc::channel(1);
        let (_frames_tx, frames) = mpsc::channel(1);
        let router = AdaptiveRouter::new(config.routing.clone(), ledger.clone(), clock.clone());
        let executor = Arc::new(FunctionExecutor::new(&config.functions, clock.clone()));
        let snapshot = Arc::new(Mutex::new(SessionSnapshot {
            status: SessionStatus::Idle,
            mode: Mode::Efficient,
        }));
        SessionLoop {
            config,
            clock,
            ledger,
            sink: Arc::new(MemorySink::new()),
            executor,
            events: EventBus::new(),
            snapshot,
            router,
            api_key: "test-key".into(),
            voice: None,
            backend,
            backend_rx,
            machine: StateMachine::new(),
            frames,
            frames_closed: false,
            wake: None,
            commands,
            cancel: CancellationToken::new(),
            silence_deadline: None,
            nudge_deadline: None,
            nudge_count: 0,
            greeted: false,
            audio_playing: false,
        }
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(Bytes::from(vec![0u8; 640]), 16_000, 1, chrono::Utc::now())
    }

    fn buffered(session: &SessionLoop) -> usize {
        match &session.backend {
            Backend::Efficient(backend) => backend.buffered_bytes(),
            Backend::Premium(_) => 0,
        }
    }

    #[tokio::test]
    async fn frames_forwarded_while_listening() {
        let mut session = test_session_loop();
        session.on_frame(frame()).await;
        assert_eq!(session.machine.status(), SessionStatus::Listening);
        assert_eq!(buffered(&session), 640);
        assert!(session.silence_deadline.is_some());
    }

    #[tokio::test]
    async fn frames_discarded_while_speaking() {
        let mut session = test_session_loop();
        session.machine.transition(SessionStatus::Listening).unwrap();
        session.machine.transition(SessionStatus::Thinking).unwrap();
        session.machine.transition(SessionStatus::Speaking).unwrap();

        session.on_frame(frame()).await;
        assert_eq!(buffered(&session), 0, "speaking must drop inbound audio");
        assert!(session.silence_deadline.is_none());
    }

    #[tokio::test]
    async fn frames_discarded_in_error_state() {
        let mut session = test_session_loop();
        session.machine.transition(SessionStatus::Error).unwrap();

        session.on_frame(frame()).await;
        assert_eq!(buffered(&session), 0);
    }

    #[tokio::test]
    async fn frame_while_idle_resets_nudges() {
        let mut session = test_session_loop();
        session.nudge_count = 2;
        session.nudge_deadline = Some(tokio::time::Instant::now());

        session.on_frame(frame()).await;
        assert_eq!(session.nudge_count, 0);
        assert!(session.nudge_deadline.is_none());
    }
}
