//! `wisp-host`: headless bridge binary for embedding shells.
//!
//! Speaks the versioned envelope protocol over stdio: one JSON command
//! per line in, one JSON response or event per line out. Audio capture
//! and playback stay in the embedding shell; this bridge drives
//! lifecycle, settings, metrics, confirmations, and text turns.

use anyhow::{Context, bail};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wisp::audio::NullSink;
use wisp::bridge::{
    BridgeCommand, CommandEnvelope, EventEnvelope, ResponseEnvelope, state_payload,
};
use wisp::clock::SystemClock;
use wisp::config::AgentConfig;
use wisp::cost::{CostLedger, SharedLedger};
use wisp::credentials::EnvCredentials;
use wisp::functions::{ConfirmationRequest, FunctionExecutor};
use wisp::orchestrator::ConversationOrchestrator;

type PendingConfirmations = Arc<Mutex<HashMap<String, ConfirmationRequest>>>;

struct HostState {
    config: AgentConfig,
    orchestrator: Option<Arc<ConversationOrchestrator>>,
    ledger: Option<SharedLedger>,
    /// Held open so text-driven sessions run without an audio source.
    frames_tx: Option<mpsc::Sender<wisp::Result<wisp::audio::AudioFrame>>>,
    pending: PendingConfirmations,
}

impl HostState {
    fn new(config: AgentConfig) -> Self {
        Self {
            config,
            orchestrator: None,
            ledger: None,
            frames_tx: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => AgentConfig::load(std::path::Path::new(&path))
            .with_context(|| format!("loading config {path}"))?,
        None => AgentConfig::default(),
    };

    info!("wisp-host bridge ready");
    let mut state = HostState::new(config);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        let envelope: CommandEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "unparseable command line");
                emit(&ResponseEnvelope::err("?", format!("invalid command: {err}")));
                continue;
            }
        };

        let id = envelope.id.clone();
        match handle(&mut state, envelope.command).await {
            Ok(payload) => emit(&ResponseEnvelope::ok(id, payload)),
            Err(err) => emit(&ResponseEnvelope::err(id, err.to_string())),
        }
    }

    if let Some(orchestrator) = state.orchestrator.take() {
        orchestrator.stop().await;
    }
    Ok(())
}

fn emit<T: serde::Serialize>(frame: &T) {
    println!("{}", serde_json::to_string(frame).unwrap_or_default());
}

async fn handle(state: &mut HostState, command: BridgeCommand) -> anyhow::Result<serde_json::Value> {
    match command {
        BridgeCommand::AgentStart => {
            start_agent(state).await?;
            Ok(serde_json::json!({ "started": true }))
        }
        BridgeCommand::AgentStop => {
            stop_agent(state).await;
            Ok(serde_json::json!({ "stopped": true }))
        }
        BridgeCommand::AgentReset => {
            stop_agent(state).await;
            start_agent(state).await?;
            Ok(serde_json::json!({ "reset": true }))
        }
        BridgeCommand::AgentState => match &state.orchestrator {
            Some(orchestrator) => Ok(state_payload(orchestrator.status(), orchestrator.mode())),
            None => Ok(serde_json::json!({ "status": "stopped" })),
        },
        BridgeCommand::SettingsGet => {
            Ok(serde_json::to_value(&state.config)?)
        }
        BridgeCommand::SettingsPatch { patch } => {
            if state.orchestrator.is_some() {
                bail!("stop the agent before changing settings");
            }
            let mut current = serde_json::to_value(&state.config)?;
            merge(&mut current, &patch);
            state.config = serde_json::from_value(current)?;
            Ok(serde_json::json!({ "patched": true }))
        }
        BridgeCommand::MetricsGet => {
            let ledger = state.ledger.as_ref().context("agent not started")?;
            let metrics = ledger
                .lock()
                .map(|l| l.metrics(chrono::Utc::now()))
                .map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?;
            Ok(serde_json::to_value(metrics)?)
        }
        BridgeCommand::InjectText { text } => {
            let orchestrator = state.orchestrator.as_ref().context("agent not started")?;
            orchestrator.send_text(text).await?;
            Ok(serde_json::json!({ "accepted": true }))
        }
        BridgeCommand::ConfirmationRespond { id, approved } => {
            let request = state
                .pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&id))
                .with_context(|| format!("no pending confirmation {id}"))?;
            let delivered = request.respond(approved);
            Ok(serde_json::json!({ "delivered": delivered }))
        }
    }
}

async fn start_agent(state: &mut HostState) -> anyhow::Result<()> {
    if state.orchestrator.is_some() {
        bail!("agent already running");
    }

    let clock = Arc::new(SystemClock);
    let ledger: SharedLedger = Arc::new(Mutex::new(CostLedger::new(
        state.config.budget.daily,
        state.config.budget.monthly,
    )));

    let (confirmation_tx, mut confirmation_rx) = mpsc::channel(8);
    let mut executor = FunctionExecutor::new(&state.config.functions, clock.clone());
    executor.set_confirmation_channel(confirmation_tx);

    let orchestrator = Arc::new(ConversationOrchestrator::new(
        state.config.clone(),
        clock,
        ledger.clone(),
        Arc::new(EnvCredentials::default()),
        Arc::new(NullSink),
        Arc::new(executor),
    ));

    // The embedding shell owns capture; the bridge holds the sender so
    // the session treats the source as open but silent.
    let (frames_tx, frames_rx) = mpsc::channel(64);
    orchestrator.start(frames_rx, None).await?;
    state.frames_tx = Some(frames_tx);

    let mut events = orchestrator.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            emit(&EventEnvelope::from_agent_event(&event));
        }
    });

    let pending = state.pending.clone();
    tokio::spawn(async move {
        while let Some(request) = confirmation_rx.recv().await {
            emit(&serde_json::json!({
                "v": wisp::bridge::BRIDGE_VERSION,
                "event": "confirmation_request",
                "payload": {
                    "id": request.id,
                    "function": request.function,
                    "arguments": request.arguments,
                    "description": request.description,
                },
            }));
            let id = request.id.clone();
            if let Ok(mut pending) = pending.lock() {
                pending.insert(id, request);
            }
        }
    });

    state.ledger = Some(ledger);
    state.orchestrator = Some(orchestrator);
    Ok(())
}

async fn stop_agent(state: &mut HostState) {
    if let Some(orchestrator) = state.orchestrator.take() {
        orchestrator.stop().await;
    }
    state.ledger = None;
    state.frames_tx = None;
    if let Ok(mut pending) = state.pending.lock() {
        pending.clear();
    }
}

fn merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
