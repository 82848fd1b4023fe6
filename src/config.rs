//! Configuration types for the voice-agent core.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Conversation backend mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Streaming speech-to-speech session over a persistent transport.
    Premium,
    /// Sequential transcribe → reason → synthesize REST chain.
    Efficient,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Premium => write!(f, "premium"),
            Self::Efficient => write!(f, "efficient"),
        }
    }
}

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Audio capture settings.
    pub audio: AudioConfig,
    /// Wake signal settings (detection itself is external).
    pub wake: WakeConfig,
    /// Backend routing settings.
    pub routing: RoutingConfig,
    /// Cost budgets.
    pub budget: BudgetConfig,
    /// Voice selection for synthesized speech.
    pub voice: VoiceConfig,
    /// Conversation pacing (silence timer, idle nudges, greeting).
    pub conversation: ConversationConfig,
    /// Function execution policy (confirmation and block lists).
    pub functions: FunctionsConfig,
    /// Premium backend endpoint settings.
    pub premium: PremiumEndpointConfig,
    /// Efficient backend endpoint settings.
    pub efficient: EfficientEndpointConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| AgentError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, raw).map_err(|e| {
            AgentError::Config(format!("failed to write config {}: {e}", path.display()))
        })
    }
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture PCM sample rate in Hz.
    pub sample_rate: u32,
    /// Capture channel count (1 = mono).
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

/// Wake signal configuration. The keyword and sensitivity are consumed by
/// the external wake source; the core only surfaces its events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Keyword the external wake source listens for.
    pub keyword: String,
    /// External wake tuning, 0.0–1.0.
    pub sensitivity: f32,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            keyword: "jarvis".to_owned(),
            sensitivity: 0.5,
        }
    }
}

/// Backend routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Fallback mode when no other routing rule applies.
    pub default_mode: Mode,
    /// First hour (inclusive) of the peak window in which premium routing
    /// is allowed.
    pub peak_hours_start: u32,
    /// First hour past the peak window (exclusive).
    pub peak_hours_end: u32,
    /// Daily budget usage percentage at which routing trips to efficient.
    pub budget_threshold_pct: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_mode: Mode::Premium,
            peak_hours_start: 9,
            peak_hours_end: 17,
            budget_threshold_pct: 50.0,
        }
    }
}

/// Cost budgets in USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Dollars per rolling 24 hours.
    pub daily: f64,
    /// Dollars per rolling 30 days.
    pub monthly: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily: 1.00,
            monthly: 30.00,
        }
    }
}

/// Voice selection for synthesized speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Backend voice identifier. `None` lets the provider pick.
    pub name: Option<String>,
    /// TTS rate multiplier.
    pub speed: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            name: None,
            speed: 1.0,
        }
    }
}

/// Conversation pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Silence duration in ms that ends an utterance in efficient mode.
    pub silence_timeout_ms: u64,
    /// Seconds of post-greeting idle before a conversational nudge.
    pub idle_nudge_secs: u64,
    /// Maximum nudges per idle period.
    pub max_nudges: u32,
    /// Greeting spoken when the session starts.
    pub greeting: String,
    /// System instructions sent to both backends.
    pub instructions: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 3_000,
            idle_nudge_secs: 10,
            max_nudges: 2,
            greeting: "Hello! How can I help you today?".to_owned(),
            instructions: "You are a helpful voice assistant. Keep responses short and \
                           conversational; they will be spoken aloud."
                .to_owned(),
        }
    }
}

/// Function execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Function names that require user confirmation before execution.
    pub require_confirmation: Vec<String>,
    /// Function names that are always rejected.
    pub blocked: Vec<String>,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            require_confirmation: vec![
                "delete_file".to_owned(),
                "modify_system_settings".to_owned(),
                "uninstall_application".to_owned(),
                "modify_registry".to_owned(),
            ],
            blocked: vec![
                "access_credentials".to_owned(),
                "modify_admin_protected".to_owned(),
                "run_arbitrary_powershell".to_owned(),
            ],
        }
    }
}

/// Premium backend endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PremiumEndpointConfig {
    /// WebSocket endpoint URL.
    pub api_url: String,
    /// Realtime model identifier.
    pub model: String,
    /// Sampling temperature for the realtime session.
    pub temperature: f64,
}

impl Default for PremiumEndpointConfig {
    fn default() -> Self {
        Self {
            api_url: "wss://api.openai.com/v1/realtime".to_owned(),
            model: "gpt-4o-realtime-preview".to_owned(),
            temperature: 0.8,
        }
    }
}

/// Efficient backend endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EfficientEndpointConfig {
    /// HTTP base URL for all three stages.
    pub api_url: String,
    /// Transcription model identifier.
    pub transcribe_model: String,
    /// Reasoning model identifier.
    pub reason_model: String,
    /// Synthesis model identifier.
    pub tts_model: String,
}

impl Default for EfficientEndpointConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            transcribe_model: "whisper-1".to_owned(),
            reason_model: "gpt-4o-mini".to_owned(),
            tts_model: "tts-1".to_owned(),
        }
    }
}
