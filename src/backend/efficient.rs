//! Efficient backend: sequential transcribe → reason → synthesize chain.
//!
//! Audio frames are buffered locally until the orchestrator commits the
//! utterance; each stage is one REST call wrapped in the shared retry
//! policy. Conversation history lives here — the premium backend keeps
//! its history server-side.

use super::history::{MessageHistory, RecordedToolCall};
use super::{BackendBus, BackendEvent, Stage, ToolCall};
use crate::audio::{AudioFrame, encode_wav};
use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::cost::SharedLedger;
use crate::error::{AgentError, Result};
use crate::events::EventBus;
use crate::resilience::{BackoffPolicy, with_retry};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Endpoint and voice settings for the REST chain.
#[derive(Debug, Clone)]
pub struct EfficientConfig {
    pub base_url: String,
    pub api_key: String,
    pub transcribe_model: String,
    pub reason_model: String,
    pub tts_model: String,
    pub voice: String,
    pub voice_speed: f32,
    /// System message seeded into the rolling history.
    pub instructions: Option<String>,
    /// Capture sample rate of buffered frames.
    pub sample_rate: u32,
    /// Bound on one synthesis call.
    pub synthesis_timeout: Duration,
}

impl EfficientConfig {
    /// Derive chain settings from agent config plus resolved credentials.
    pub fn from_agent(config: &AgentConfig, api_key: String, voice: Option<String>) -> Self {
        Self {
            base_url: config.efficient.api_url.clone(),
            api_key,
            transcribe_model: config.efficient.transcribe_model.clone(),
            reason_model: config.efficient.reason_model.clone(),
            tts_model: config.efficient.tts_model.clone(),
            voice: voice
                .or_else(|| config.voice.name.clone())
                .unwrap_or_else(|| "alloy".to_owned()),
            voice_speed: config.voice.speed,
            instructions: Some(config.conversation.instructions.clone()),
            sample_rate: config.audio.sample_rate,
            synthesis_timeout: Duration::from_secs(30),
        }
    }
}

/// One failed stage attempt.
#[derive(Debug)]
enum StageError {
    /// Connection-level failure (reset, refused, DNS).
    Network(String),
    /// Non-success HTTP status.
    Status { code: u16, body: String },
    /// The call exceeded its deadline.
    Timeout,
    /// The response body did not have the expected shape.
    Malformed(String),
}

impl StageError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }

    /// Transient failures are retried; malformed responses and other
    /// 4xx statuses propagate immediately.
    fn retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { code, body } => {
                matches!(code, 408 | 429 | 500 | 502 | 503 | 504) || {
                    let body = body.to_lowercase();
                    body.contains("overloaded") || body.contains("rate limit")
                }
            }
            Self::Malformed(_) => false,
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Status { code, body } => write!(f, "HTTP {code}: {body}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

/// Parsed reasoning response.
struct ReasonOutcome {
    text: String,
    tool_calls: Vec<RecordedToolCall>,
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Three-stage REST conversation backend.
pub struct EfficientBackend {
    http: reqwest::Client,
    config: EfficientConfig,
    events: BackendBus,
    history: MessageHistory,
    /// PCM buffered for the current utterance.
    buffer: Vec<u8>,
    /// Tool calls emitted to the orchestrator and not yet answered.
    pending_calls: HashSet<String>,
    /// Tool schemas in chat-completions form.
    tools: Vec<Value>,
    clock: Arc<dyn Clock>,
    ledger: SharedLedger,
    policy: BackoffPolicy,
}

impl EfficientBackend {
    /// Build the backend. `tool_schemas` is the catalog export
    /// (`{name, description, parameters}` entries).
    pub fn new(
        config: EfficientConfig,
        tool_schemas: Vec<Value>,
        clock: Arc<dyn Clock>,
        ledger: SharedLedger,
    ) -> Self {
        let now = clock.now();
        let tools = tool_schemas
            .into_iter()
            .map(|schema| json!({ "type": "function", "function": schema }))
            .collect();
        Self {
            http: reqwest::Client::new(),
            history: MessageHistory::new(config.instructions.as_deref(), now),
            config,
            events: EventBus::new(),
            buffer: Vec::new(),
            pending_calls: HashSet::new(),
            tools,
            clock,
            ledger,
            policy: BackoffPolicy::rest_stage(),
        }
    }

    /// Subscribe to backend events.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    /// Number of non-system messages currently retained.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Bytes buffered for the current utterance.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer one captured frame for the current utterance.
    pub fn append_audio(&mut self, frame: AudioFrame) -> Result<()> {
        self.buffer.extend_from_slice(frame.bytes());
        Ok(())
    }

    /// Commit the buffered utterance and run the chain.
    pub async fn commit_audio(&mut self) -> Result<()> {
        let pcm = std::mem::take(&mut self.buffer);
        if pcm.is_empty() {
            debug!("commit with empty buffer, nothing to do");
            return Ok(());
        }

        let audio_seconds = pcm.len() as f64 / 2.0 / self.config.sample_rate as f64;
        let wav = encode_wav(&pcm, self.config.sample_rate, 1)?;

        self.events.emit(BackendEvent::Stage(Stage::Transcribing));
        let text = match self.transcribe(wav).await {
            Ok(text) => text,
            Err(err) => return Err(self.stage_failed(Stage::Transcribing, err)),
        };

        {
            let now = self.clock.now();
            if let Ok(mut ledger) = self.ledger.lock() {
                ledger.record_transcription(now, audio_seconds);
            }
        }

        info!(chars = text.len(), "transcription complete");
        self.events.emit(BackendEvent::Transcription(text.clone()));

        if text.trim().is_empty() {
            self.events.emit(BackendEvent::ResponseDone);
            return Ok(());
        }

        let now = self.clock.now();
        self.history.push_user(text, now);
        self.reason_and_continue().await
    }

    /// Inject a user text turn and run reason + synthesize.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        let now = self.clock.now();
        self.history.push_user(text, now);
        self.reason_and_continue().await
    }

    /// Answer one pending tool call. When the last pending call is
    /// answered the chain resumes with another reasoning pass.
    pub async fn send_tool_result(&mut self, call_id: &str, payload: Value) -> Result<()> {
        let now = self.clock.now();
        self.history
            .push_tool_result(call_id, payload.to_string(), now);
        self.pending_calls.remove(call_id);

        if self.pending_calls.is_empty() {
            self.reason_and_continue().await
        } else {
            Ok(())
        }
    }

    /// Drop buffered audio and pending calls. The chain holds no
    /// connection, so this never touches the network.
    pub fn disconnect(&mut self) -> Result<()> {
        self.buffer.clear();
        self.pending_calls.clear();
        Ok(())
    }

    /// Clear conversation history (protocol-error resync path).
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.pending_calls.clear();
    }

    fn stage_failed(&self, stage: Stage, err: StageError) -> AgentError {
        let message = format!("{stage} failed: {err}");
        warn!(%stage, error = %err, "stage failed after retries");
        self.events.emit(BackendEvent::Error(message.clone()));
        AgentError::Backend(message)
    }

    async fn reason_and_continue(&mut self) -> Result<()> {
        self.events.emit(BackendEvent::Stage(Stage::Reasoning));
        let messages = self.history.to_wire();
        let outcome = match self.reason(messages).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.stage_failed(Stage::Reasoning, err)),
        };

        {
            let now = self.clock.now();
            if let Ok(mut ledger) = self.ledger.lock() {
                ledger.record_reasoning(now, outcome.prompt_tokens, outcome.completion_tokens);
            }
        }

        let now = self.clock.now();
        self.history
            .push_assistant(outcome.text.clone(), outcome.tool_calls.clone(), now);

        if !outcome.text.is_empty() {
            self.events.emit(BackendEvent::Response(outcome.text.clone()));
        }

        if !outcome.tool_calls.is_empty() {
            for call in &outcome.tool_calls {
                self.pending_calls.insert(call.call_id.clone());
                let arguments: Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                self.events.emit(BackendEvent::ToolCall(ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments,
                }));
            }
            // The chain resumes when the last tool result arrives.
            return Ok(());
        }

        self.synthesize_and_finish(&outcome.text).await
    }

    async fn synthesize_and_finish(&mut self, text: &str) -> Result<()> {
        self.events.emit(BackendEvent::Stage(Stage::Synthesizing));

        if text.trim().is_empty() {
            self.events.emit(BackendEvent::Audio(Bytes::new()));
            self.events.emit(BackendEvent::ResponseDone);
            return Ok(());
        }

        let audio = match self.synthesize(text).await {
            Ok(audio) => audio,
            Err(err) => return Err(self.stage_failed(Stage::Synthesizing, err)),
        };

        {
            let now = self.clock.now();
            if let Ok(mut ledger) = self.ledger.lock() {
                ledger.record_synthesis(now, text.chars().count() as u64);
            }
        }

        self.events.emit(BackendEvent::Audio(audio));
        self.events.emit(BackendEvent::ResponseDone);
        Ok(())
    }

    async fn retry_stage<T, F, Fut>(&self, stage: Stage, op: F) -> std::result::Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, StageError>>,
    {
        let events = self.events.clone();
        with_retry(
            self.clock.as_ref(),
            &self.policy,
            StageError::retryable,
            move |attempt, delay| {
                warn!(%stage, attempt, delay_ms = delay.as_millis() as u64, "stage retry scheduled");
                events.emit(BackendEvent::Retry {
                    stage,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            },
            op,
        )
        .await
    }

    async fn transcribe(&self, wav: Vec<u8>) -> std::result::Result<String, StageError> {
        let http = self.http.clone();
        let url = format!("{}/v1/audio/transcriptions", self.config.base_url);
        let key = self.config.api_key.clone();
        let model = self.config.transcribe_model.clone();

        self.retry_stage(Stage::Transcribing, move || {
            let http = http.clone();
            let url = url.clone();
            let key = key.clone();
            let model = model.clone();
            let wav = wav.clone();
            async move {
                let part = reqwest::multipart::Part::bytes(wav)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| StageError::Malformed(e.to_string()))?;
                let form = reqwest::multipart::Form::new()
                    .text("model", model)
                    .part("file", part);

                let response = http
                    .post(&url)
                    .bearer_auth(&key)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(StageError::from_reqwest)?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(StageError::Status {
                        code: status.as_u16(),
                        body,
                    });
                }

                let value: Value = response.json().await.map_err(StageError::from_reqwest)?;
                value
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        StageError::Malformed("transcription response missing 'text'".into())
                    })
            }
        })
        .await
    }

    async fn reason(&self, messages: Vec<Value>) -> std::result::Result<ReasonOutcome, StageError> {
        let http = self.http.clone();
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let key = self.config.api_key.clone();
        let mut body = json!({
            "model": self.config.reason_model,
            "messages": messages,
        });
        if !self.tools.is_empty()
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("tools".into(), json!(self.tools));
        }

        self.retry_stage(Stage::Reasoning, move || {
            let http = http.clone();
            let url = url.clone();
            let key = key.clone();
            let body = body.clone();
            async move {
                let response = http
                    .post(&url)
                    .bearer_auth(&key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(StageError::from_reqwest)?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(StageError::Status {
                        code: status.as_u16(),
                        body,
                    });
                }

                let value: Value = response.json().await.map_err(StageError::from_reqwest)?;
                let message = value
                    .pointer("/choices/0/message")
                    .ok_or_else(|| StageError::Malformed("reasoning response missing message".into()))?;

                let text = message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();

                let tool_calls = message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| {
                        calls
                            .iter()
                            .filter_map(|call| {
                                let call_id = call.get("id").and_then(Value::as_str)?;
                                let name = call.pointer("/function/name").and_then(Value::as_str)?;
                                let arguments = call
                                    .pointer("/function/arguments")
                                    .and_then(Value::as_str)
                                    .unwrap_or("{}");
                                Some(RecordedToolCall {
                                    call_id: call_id.to_owned(),
                                    name: name.to_owned(),
                                    arguments: arguments.to_owned(),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let prompt_tokens = value
                    .pointer("/usage/prompt_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let completion_tokens = value
                    .pointer("/usage/completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);

                Ok(ReasonOutcome {
                    text,
                    tool_calls,
                    prompt_tokens,
                    completion_tokens,
                })
            }
        })
        .await
    }

    async fn synthesize(&self, text: &str) -> std::result::Result<Bytes, StageError> {
        let http = self.http.clone();
        let url = format!("{}/v1/audio/speech", self.config.base_url);
        let key = self.config.api_key.clone();
        let timeout = self.config.synthesis_timeout;
        let body = json!({
            "model": self.config.tts_model,
            "voice": self.config.voice,
            "input": text,
            "speed": self.config.voice_speed,
        });

        self.retry_stage(Stage::Synthesizing, move || {
            let http = http.clone();
            let url = url.clone();
            let key = key.clone();
            let body = body.clone();
            async move {
                let attempt = async {
                    let response = http
                        .post(&url)
                        .bearer_auth(&key)
                        .json(&body)
                        .send()
                        .await
                        .map_err(StageError::from_reqwest)?;

                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(StageError::Status {
                            code: status.as_u16(),
                            body,
                        });
                    }

                    // Stream the audio body and concatenate.
                    let mut stream = response.bytes_stream();
                    let mut audio = Vec::new();
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk.map_err(StageError::from_reqwest)?;
                        audio.extend_from_slice(&chunk);
                    }
                    Ok(Bytes::from(audio))
                };

                tokio::time::timeout(timeout, attempt)
                    .await
                    .map_err(|_| StageError::Timeout)?
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_retry_classification() {
        for code in [408u16, 429, 500, 502, 503, 504] {
            let err = StageError::Status {
                code,
                body: String::new(),
            };
            assert!(err.retryable(), "HTTP {code} should be retryable");
        }
        for code in [400u16, 401, 403, 404, 422] {
            let err = StageError::Status {
                code,
                body: String::new(),
            };
            assert!(!err.retryable(), "HTTP {code} should not be retryable");
        }
    }

    #[test]
    fn overloaded_body_is_retryable_despite_status() {
        let err = StageError::Status {
            code: 400,
            body: "The model is currently overloaded".into(),
        };
        assert!(err.retryable());

        let err = StageError::Status {
            code: 403,
            body: "Rate limit reached for requests".into(),
        };
        assert!(err.retryable());
    }

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(StageError::Network("connection reset by peer".into()).retryable());
        assert!(StageError::Timeout.retryable());
        assert!(!StageError::Malformed("missing text".into()).retryable());
    }
}
