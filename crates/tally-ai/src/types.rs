//! Core types for chat transcripts

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locally generated message identifier.
///
/// Pending messages have no backend id yet, so the store never keys on the
/// backend's trace id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque token tying a sequence of turns together for the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a fresh session id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing conversation id (e.g. one loaded from history)
    pub fn from_existing(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token usage counters reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    #[serde(deserialize_with = "null_as_default")]
    pub requests: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub input_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub output_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub total_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub reasoning_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub cached_tokens: u64,
}

/// Cost breakdown in dollars, computed server side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostBreakdown {
    #[serde(deserialize_with = "null_as_default")]
    pub input_cost_usd: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub cached_input_cost_usd: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub output_cost_usd: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub reasoning_output_cost_usd: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub web_search_cost_usd: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub total_usd: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub web_search_calls: u32,
}

/// One reasoning item: summary paragraphs plus raw reasoning content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReasoningStepRepr")]
pub struct ReasoningStep {
    pub summary: Vec<String>,
    pub content: Vec<String>,
}

impl ReasoningStep {
    /// A step holding a single summary paragraph
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            summary: vec![text.into()],
            content: vec![],
        }
    }

    /// All paragraphs of this step, summary first
    pub fn text(&self) -> String {
        self.summary
            .iter()
            .chain(self.content.iter())
            .filter(|p| !p.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// Older traces store reasoning as bare strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum ReasoningStepRepr {
    Text(String),
    Parts {
        #[serde(default, deserialize_with = "null_as_default")]
        summary: Vec<String>,
        #[serde(default, deserialize_with = "null_as_default")]
        content: Vec<String>,
    },
}

impl From<ReasoningStepRepr> for ReasoningStep {
    fn from(repr: ReasoningStepRepr) -> Self {
        match repr {
            ReasoningStepRepr::Text(text) => ReasoningStep::summary(text),
            ReasoningStepRepr::Parts { summary, content } => ReasoningStep { summary, content },
        }
    }
}

/// Join the text of all reasoning steps into one block
pub fn reasoning_text(steps: &[ReasoningStep]) -> String {
    steps
        .iter()
        .map(ReasoningStep::text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Metadata attached to a completed assistant message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMetadata {
    /// Tool calls, kept exactly as the backend sent them
    pub tool_calls: Vec<serde_json::Value>,
    pub reasoning: Vec<ReasoningStep>,
    pub usage: Option<Usage>,
    pub estimated_cost_usd: Option<f64>,
    pub cost_breakdown: Option<CostBreakdown>,
    pub missing_model_pricing: bool,
    /// Backend trace reference
    pub trace_log_id: Option<i64>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// How a message reached its final state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Received a `done` event or was committed directly
    #[default]
    Completed,
    /// Finalized because of an error
    Failed,
    /// The stream ended without a `done` event
    Aborted,
}

/// A finalized message in the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub termination: Termination,
}

impl Message {
    /// Create a finalized user message
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: text.into(),
            error: None,
            metadata: None,
            termination: Termination::Completed,
        }
    }

    /// Create a finalized assistant message
    pub fn assistant(text: impl Into<String>, metadata: Option<MessageMetadata>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            content: text.into(),
            error: None,
            metadata,
            termination: Termination::Completed,
        }
    }

    /// Attach an error string
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Combined reasoning text from the metadata, if any
    pub fn reasoning_text(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| reasoning_text(&m.reasoning))
            .unwrap_or_default()
    }
}

/// One role/content pair sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

/// Request body for both the streaming and the blocking chat endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_config_id: Option<i64>,
    pub messages: Vec<ChatTurn>,
}

/// Payload of the terminal `done` event, also returned by the blocking call.
///
/// Every field decodes on its own: a malformed field falls back to its
/// default without losing the rest of the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DonePayload {
    #[serde(deserialize_with = "lenient")]
    pub assistant_message: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub tool_calls: Vec<serde_json::Value>,
    #[serde(deserialize_with = "lenient")]
    pub reasoning: Vec<ReasoningStep>,
    #[serde(deserialize_with = "lenient")]
    pub usage: Option<Usage>,
    #[serde(deserialize_with = "lenient")]
    pub estimated_cost_usd: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub cost_breakdown: Option<CostBreakdown>,
    #[serde(deserialize_with = "lenient")]
    pub missing_model_pricing: bool,
    #[serde(deserialize_with = "lenient")]
    pub trace_log_id: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    pub error: Option<String>,
}

impl DonePayload {
    /// Metadata portion of the payload
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            tool_calls: self.tool_calls.clone(),
            reasoning: self.reasoning.clone(),
            usage: self.usage.clone(),
            estimated_cost_usd: self.estimated_cost_usd,
            cost_breakdown: self.cost_breakdown.clone(),
            missing_model_pricing: self.missing_model_pricing,
            trace_log_id: self.trace_log_id,
        }
    }

    /// Rebuild the terminal payload a finished message was created from
    pub fn from_message(message: &Message) -> Self {
        let metadata = message.metadata.clone().unwrap_or_default();
        Self {
            assistant_message: Some(message.content.clone()),
            tool_calls: metadata.tool_calls,
            reasoning: metadata.reasoning,
            usage: metadata.usage,
            estimated_cost_usd: metadata.estimated_cost_usd,
            cost_breakdown: metadata.cost_breakdown,
            missing_model_pricing: metadata.missing_model_pricing,
            trace_log_id: metadata.trace_log_id,
            error: message.error.clone(),
        }
    }
}

/// Python backends send `null` for empty lists; treat it as the default.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode one field in isolation; a value of the wrong shape becomes the default.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value).unwrap_or_else(|e| {
        tracing::debug!("ignoring malformed field: {}", e);
        T::default()
    }))
}
