//! Typed stream events decoded from frames

use serde::Deserialize;
use serde_json::Value;

use crate::frame::Frame;
use crate::types::DonePayload;

/// Status used when a `tool_call` event omits one
pub const DEFAULT_TOOL_STATUS: &str = "tool_called";
/// Name used when a `tool_call` event omits one
pub const DEFAULT_TOOL_NAME: &str = "tool";

/// Closed set of events the backend sends while generating a reply
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Visible answer fragment
    TextDelta { delta: String },
    /// Reasoning fragment (`reasoning_delta`, `summary_delta`, `reasoning_summary_delta`)
    ReasoningDelta { delta: String },
    /// Tool call status change
    ToolCall { name: String, status: String },
    /// Final payload
    Done(Box<DonePayload>),
    /// Backend-reported failure
    Error { error: String },
    /// Event name this client does not handle
    Ignored { event: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeltaBody {
    delta: Option<String>,
    summary: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolCallBody {
    name: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    error: Option<String>,
}

impl StreamEvent {
    /// Decode a frame. Unparsable payloads are treated as an empty body.
    pub fn from_frame(frame: &Frame) -> Self {
        let body = parse_body(frame);
        match frame.event.as_str() {
            "text_delta" => {
                let body: DeltaBody = from_body(body);
                StreamEvent::TextDelta {
                    delta: body.delta.unwrap_or_default(),
                }
            }
            "reasoning_delta" | "summary_delta" | "reasoning_summary_delta" => {
                let body: DeltaBody = from_body(body);
                StreamEvent::ReasoningDelta {
                    delta: body.delta.or(body.summary).or(body.text).unwrap_or_default(),
                }
            }
            "tool_call" => {
                let body: ToolCallBody = from_body(body);
                StreamEvent::ToolCall {
                    name: body.name.unwrap_or_else(|| DEFAULT_TOOL_NAME.to_string()),
                    status: body
                        .status
                        .unwrap_or_else(|| DEFAULT_TOOL_STATUS.to_string()),
                }
            }
            "done" => StreamEvent::Done(Box::new(from_body(body))),
            "error" => {
                let body: ErrorBody = from_body(body);
                StreamEvent::Error {
                    error: body.error.unwrap_or_else(|| "stream error".to_string()),
                }
            }
            other => StreamEvent::Ignored {
                event: other.to_string(),
            },
        }
    }
}

fn parse_body(frame: &Frame) -> Value {
    if frame.data.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(&frame.data) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(event = %frame.event, "unparsable event payload, using empty body: {}", e);
            Value::Object(Default::default())
        }
    }
}

fn from_body<T: Default + serde::de::DeserializeOwned>(body: Value) -> T {
    serde_json::from_value(body).unwrap_or_else(|e| {
        tracing::debug!("event payload has unexpected shape, using empty body: {}", e);
        T::default()
    })
}
