//! Premium backend: streaming speech-to-speech over a persistent
//! WebSocket session.
//!
//! A session actor owns the socket; the [`PremiumBackend`] handle talks
//! to it over a command channel and never touches the transport. The
//! actor re-issues the session configuration on every (re)connect and
//! runs the reconnect backoff when the server drops the connection.

use super::{BackendBus, BackendEvent, ToolCall};
use crate::audio::AudioFrame;
use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::cost::SharedLedger;
use crate::error::{AgentError, Result};
use crate::events::EventBus;
use crate::resilience::BackoffPolicy;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::wire::{ClientEvent, ConversationItem, SessionConfig};

/// Response audio sample rate, distinct from the 16 kHz capture rate.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Connection handshake deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Endpoint and session settings for the streaming backend.
#[derive(Debug, Clone)]
pub struct PremiumConfig {
    pub api_url: String,
    pub model: String,
    pub api_key: String,
    pub voice: String,
    pub instructions: String,
    pub temperature: f64,
    /// Tool schemas in realtime form (`{type, name, description, parameters}`).
    pub tools: Vec<Value>,
    /// Capture sample rate of appended frames.
    pub input_sample_rate: u32,
}

impl PremiumConfig {
    /// Derive session settings from agent config plus resolved
    /// credentials and the catalog export.
    pub fn from_agent(
        config: &AgentConfig,
        api_key: String,
        voice: Option<String>,
        tool_schemas: Vec<Value>,
    ) -> Self {
        let tools = tool_schemas
            .into_iter()
            .map(|schema| {
                json!({
                    "type": "function",
                    "name": schema.get("name").cloned().unwrap_or_default(),
                    "description": schema.get("description").cloned().unwrap_or_default(),
                    "parameters": schema.get("parameters").cloned().unwrap_or_default(),
                })
            })
            .collect();
        Self {
            api_url: config.premium.api_url.clone(),
            model: config.premium.model.clone(),
            api_key,
            voice: voice
                .or_else(|| config.voice.name.clone())
                .unwrap_or_else(|| "alloy".to_owned()),
            instructions: config.conversation.instructions.clone(),
            temperature: config.premium.temperature,
            tools,
            input_sample_rate: config.audio.sample_rate,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(
            self.instructions.clone(),
            self.voice.clone(),
            self.tools.clone(),
            self.temperature,
        )
    }
}

enum Command {
    Append(Bytes),
    Commit,
    SendText(String),
    ToolResult { call_id: String, payload: Value },
    Reconnect,
    Disconnect,
}

/// Handle to a live streaming session.
pub struct PremiumBackend {
    events: BackendBus,
    commands: mpsc::UnboundedSender<Command>,
}

impl PremiumBackend {
    /// Dial the endpoint and start the session actor.
    ///
    /// Connection and configuration errors surface here; everything after
    /// this point is delivered as events.
    pub async fn connect(
        config: PremiumConfig,
        clock: Arc<dyn Clock>,
        ledger: SharedLedger,
    ) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::Credentials(
                "premium backend requires an API key".into(),
            ));
        }

        let socket = dial(&config).await?;
        info!(url = %config.api_url, model = %config.model, "premium session connected");

        let events: BackendBus = EventBus::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            config,
            clock,
            ledger,
            events: events.clone(),
            input_seconds: 0.0,
            output_seconds: 0.0,
        };
        tokio::spawn(actor.run(socket, command_rx));

        Ok(Self { events, commands })
    }

    /// Subscribe to backend events.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    /// Stream one frame of captured PCM.
    pub async fn append_audio(&mut self, frame: AudioFrame) -> Result<()> {
        self.send(Command::Append(frame.bytes().clone()))
    }

    /// Signal end-of-utterance and request a response.
    pub async fn commit_audio(&mut self) -> Result<()> {
        self.send(Command::Commit)
    }

    /// Inject a user text turn.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(Command::SendText(text.to_owned()))
    }

    /// Answer a tool call.
    pub async fn send_tool_result(&mut self, call_id: &str, payload: Value) -> Result<()> {
        self.send(Command::ToolResult {
            call_id: call_id.to_owned(),
            payload,
        })
    }

    /// Reset the reconnect attempt counter and, if the session is parked
    /// after exhausting its attempts, try again.
    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    /// Close the session. Handle-initiated disconnects are deliberate and
    /// never trigger reconnection, whatever `intentional` says.
    pub async fn disconnect(&mut self, _intentional: bool) -> Result<()> {
        self.send(Command::Disconnect)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| AgentError::Channel("premium session actor is gone".into()))
    }
}

async fn dial(config: &PremiumConfig) -> Result<Ws> {
    let url = if config.model.is_empty() {
        config.api_url.clone()
    } else {
        format!("{}?model={}", config.api_url, config.model)
    };

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::Transport(format!("invalid endpoint {url}: {e}")))?;
    let auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
        .map_err(|e| AgentError::Transport(format!("invalid API key header: {e}")))?;
    request.headers_mut().insert("Authorization", auth);

    let (socket, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| {
            AgentError::Timeout(format!(
                "connection handshake exceeded {}s",
                CONNECT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| AgentError::Transport(format!("connect failed: {e}")))?;

    Ok(socket)
}

enum ServeOutcome {
    /// Deliberate close; reconnection suppressed.
    Intentional,
    /// Every handle is gone; shut the actor down.
    HandleGone,
    /// Unsolicited drop; reconnection policy applies.
    Dropped { code: Option<u16>, reason: String },
}

struct SessionActor {
    config: PremiumConfig,
    clock: Arc<dyn Clock>,
    ledger: SharedLedger,
    events: BackendBus,
    /// Audio seconds streamed in since the last completed response.
    input_seconds: f64,
    /// Audio seconds received since the last completed response.
    output_seconds: f64,
}

impl SessionActor {
    async fn run(mut self, mut socket: Ws, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            if let Err(err) = self.configure(&mut socket).await {
                warn!(error = %err, "failed to send session configuration");
            }

            match self.serve(&mut socket, &mut commands).await {
                ServeOutcome::Intentional => {
                    let _ = socket.close(None).await;
                    self.events.emit(BackendEvent::Disconnected {
                        code: None,
                        reason: "intentional disconnect".to_owned(),
                    });
                    return;
                }
                ServeOutcome::HandleGone => {
                    let _ = socket.close(None).await;
                    return;
                }
                ServeOutcome::Dropped { code, reason } => {
                    warn!(?code, reason = %reason, "premium session dropped");
                    self.events
                        .emit(BackendEvent::Disconnected { code, reason });

                    match self.reconnect_loop(&mut commands).await {
                        Some(new_socket) => {
                            socket = new_socket;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Re-issue the session configuration (every connect and reconnect).
    async fn configure(&self, socket: &mut Ws) -> std::result::Result<(), String> {
        let frame = ClientEvent::SessionUpdate {
            session: self.config.session_config(),
        };
        socket
            .send(WsMessage::Text(frame.to_json()))
            .await
            .map_err(|e| e.to_string())
    }

    async fn serve(&mut self, socket: &mut Ws, commands: &mut mpsc::UnboundedReceiver<Command>) -> ServeOutcome {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        return ServeOutcome::HandleGone;
                    };
                    match command {
                        Command::Disconnect => return ServeOutcome::Intentional,
                        Command::Reconnect => {
                            debug!("reconnect requested while connected, ignoring");
                        }
                        other => {
                            if let Err(err) = self.forward(socket, other).await {
                                return ServeOutcome::Dropped {
                                    code: None,
                                    reason: format!("send failed: {err}"),
                                };
                            }
                        }
                    }
                }
                message = socket.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => self.handle_server_frame(&text),
                        Some(Ok(WsMessage::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                                .unwrap_or((None, String::new()));
                            return ServeOutcome::Dropped { code, reason };
                        }
                        Some(Ok(_)) => {} // ping/pong/binary control traffic
                        Some(Err(err)) => {
                            return ServeOutcome::Dropped {
                                code: None,
                                reason: err.to_string(),
                            };
                        }
                        None => {
                            return ServeOutcome::Dropped {
                                code: None,
                                reason: "connection closed".to_owned(),
                            };
                        }
                    }
                }
            }
        }
    }

    async fn forward(
        &mut self,
        socket: &mut Ws,
        command: Command,
    ) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
        match command {
            Command::Append(pcm) => {
                self.input_seconds +=
                    pcm.len() as f64 / 2.0 / self.config.input_sample_rate.max(1) as f64;
                let frame = ClientEvent::InputAudioAppend {
                    audio: BASE64.encode(&pcm),
                };
                socket.send(WsMessage::Text(frame.to_json())).await
            }
            Command::Commit => {
                socket
                    .send(WsMessage::Text(ClientEvent::InputAudioCommit.to_json()))
                    .await?;
                socket
                    .send(WsMessage::Text(ClientEvent::ResponseCreate.to_json()))
                    .await
            }
            Command::SendText(text) => {
                let item = ClientEvent::ItemCreate {
                    item: ConversationItem::user_text(&text),
                };
                socket.send(WsMessage::Text(item.to_json())).await?;
                socket
                    .send(WsMessage::Text(ClientEvent::ResponseCreate.to_json()))
                    .await
            }
            Command::ToolResult { call_id, payload } => {
                let item = ClientEvent::ItemCreate {
                    item: ConversationItem::tool_output(&call_id, &payload),
                };
                socket.send(WsMessage::Text(item.to_json())).await?;
                socket
                    .send(WsMessage::Text(ClientEvent::ResponseCreate.to_json()))
                    .await
            }
            Command::Disconnect | Command::Reconnect => Ok(()),
        }
    }

    fn handle_server_frame(&mut self, raw: &str) {
        use super::wire::ServerEvent;

        let event = match ServerEvent::parse(raw) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "malformed server frame, skipping");
                return;
            }
        };

        match event {
            ServerEvent::SessionCreated => self.events.emit(BackendEvent::SessionReady),
            ServerEvent::SessionUpdated => {}
            ServerEvent::SpeechStarted => self.events.emit(BackendEvent::SpeechStarted),
            ServerEvent::SpeechStopped => self.events.emit(BackendEvent::SpeechStopped),
            ServerEvent::AudioDelta(b64) => match BASE64.decode(b64.as_bytes()) {
                Ok(pcm) => {
                    self.output_seconds +=
                        pcm.len() as f64 / 2.0 / PLAYBACK_SAMPLE_RATE as f64;
                    self.events.emit(BackendEvent::AudioChunk(Bytes::from(pcm)));
                }
                Err(err) => warn!(error = %err, "undecodable audio delta, skipping"),
            },
            ServerEvent::AudioDone => self.events.emit(BackendEvent::AudioDone),
            ServerEvent::TranscriptDelta(delta) => {
                self.events.emit(BackendEvent::TextDelta(delta));
            }
            ServerEvent::TranscriptDone(transcript) => {
                self.events.emit(BackendEvent::TextDone(transcript));
            }
            ServerEvent::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let arguments: Value =
                    serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}));
                self.events.emit(BackendEvent::ToolCall(ToolCall {
                    call_id,
                    name,
                    arguments,
                }));
            }
            ServerEvent::ResponseDone => {
                let now = self.clock.now();
                if let Ok(mut ledger) = self.ledger.lock() {
                    ledger.record_realtime(now, self.input_seconds, self.output_seconds, 0, 0);
                }
                self.input_seconds = 0.0;
                self.output_seconds = 0.0;
                self.events.emit(BackendEvent::ResponseDone);
            }
            ServerEvent::Error(message) => self.events.emit(BackendEvent::Error(message)),
        }
    }

    /// Backoff reconnect loop. Returns the new socket, or `None` when the
    /// actor should shut down (intentional disconnect, handle gone, or a
    /// parked session that never got a reconnect request).
    async fn reconnect_loop(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<Ws> {
        let policy = BackoffPolicy::reconnect();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if attempt > policy.max_attempts {
                warn!(max_attempts = policy.max_attempts, "reconnection failed permanently");
                self.events.emit(BackendEvent::ReconnectionFailed);

                // Park: only an explicit reconnect (counter reset) or a
                // disconnect can move the session now.
                loop {
                    match commands.recv().await {
                        Some(Command::Reconnect) => {
                            attempt = 0;
                            break;
                        }
                        Some(Command::Disconnect) | None => return None,
                        Some(_) => {} // stale audio/text, dropped
                    }
                }
                continue;
            }

            let delay = policy.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.events.emit(BackendEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            // Honor disconnects (and counter resets) while waiting.
            let clock = self.clock.clone();
            let sleep = clock.sleep(delay);
            tokio::pin!(sleep);
            let mut reset = false;
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => match command {
                        Some(Command::Reconnect) => { reset = true; break; }
                        Some(Command::Disconnect) | None => return None,
                        Some(_) => {} // stale audio/text, dropped
                    }
                }
            }
            if reset {
                attempt = 0;
                continue;
            }

            match dial(&self.config).await {
                Ok(socket) => {
                    info!(attempt, "reconnected");
                    self.events.emit(BackendEvent::Reconnected { attempt });
                    return Some(socket);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                }
            }
        }
    }
}
