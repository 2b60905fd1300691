use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use crate::RelayError;

/// Free-form per-dispatch context handed to `Agent::execute` (tenant id, channel, session, ...).
pub type AgentContext = HashMap<String, serde_json::Value>;

static PROCESS_STARTED_AT: OnceLock<DateTime<Utc>> = OnceLock::new();

/// Timestamp of the first call in this process. Compiled-in agents use it as
/// their `created_at` so repeated `metadata()` calls stay stable.
pub fn process_started_at() -> DateTime<Utc> {
    *PROCESS_STARTED_AT.get_or_init(Utc::now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Economy,
    Standard,
    Premium,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Economy => "economy",
            Self::Standard => "standard",
            Self::Premium => "premium",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ModelTier {
    type Err = RelayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "economy" => Ok(Self::Economy),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            other => Err(RelayError::Config(format!(
                "unsupported model tier `{other}` (expected economy|standard|premium)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Web,
    Whatsapp,
    Voice,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Web, Channel::Whatsapp, Channel::Voice];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Web => "web",
            Self::Whatsapp => "whatsapp",
            Self::Voice => "voice",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Channel {
    type Err = RelayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(Self::Web),
            "whatsapp" => Ok(Self::Whatsapp),
            "voice" => Ok(Self::Voice),
            other => Err(RelayError::Config(format!(
                "unsupported channel `{other}` (expected web|whatsapp|voice)"
            ))),
        }
    }
}

/// Static descriptor of an agent. `name` is the registry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub capabilities: BTreeSet<String>,
    pub model_tier: ModelTier,
    pub channels: BTreeSet<Channel>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentMetadata {
    /// Standard tier, every channel, no capabilities.
    pub fn new(name: impl Into<String>, version: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            capabilities: BTreeSet::new(),
            model_tier: ModelTier::Standard,
            channels: Channel::ALL.into_iter().collect(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.model_tier = tier;
        self
    }

    #[must_use]
    pub fn with_channels<I: IntoIterator<Item = Channel>>(mut self, channels: I) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    #[must_use]
    pub fn supports_channel(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub skip_guardrail: bool,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
            history: Vec::new(),
            parameters: HashMap::new(),
            use_cache: true,
            skip_guardrail: false,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default = "AgentResponse::default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentResponse {
    fn default_confidence() -> f64 {
        1.0
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            suggestions: Vec::new(),
            confidence: Self::default_confidence(),
            blocked: false,
            cached: false,
            model_used: None,
            execution_time_ms: None,
            metadata: HashMap::new(),
        }
    }

    /// A handled refusal (e.g. guardrail block). Still a normal return, not an error.
    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            success: false,
            blocked: true,
            ..Self::success(message)
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// Confidence is clamped into `0.0..=1.0`; NaN becomes 0.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
