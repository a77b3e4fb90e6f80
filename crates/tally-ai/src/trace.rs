//! Persisted request/response trace records and field extraction

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::{CostBreakdown, MessageMetadata, ReasoningStep, Role, Usage, lenient};

/// One completed backend call as stored by the trace log.
///
/// Fields other than `id` are decoded on their own so one malformed column
/// does not hide the rest of the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceRecord {
    pub id: i64,
    #[serde(deserialize_with = "lenient")]
    pub conversation_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub model: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub status: Option<String>,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    #[serde(deserialize_with = "lenient")]
    pub usage: Option<Usage>,
    #[serde(deserialize_with = "lenient")]
    pub error: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub estimated_cost_usd: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub cost_breakdown: Option<CostBreakdown>,
    #[serde(deserialize_with = "lenient")]
    pub missing_model_pricing: bool,
    #[serde(deserialize_with = "lenient")]
    pub latency_ms: Option<i64>,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Decode a trace list response, skipping records that cannot be read at all.
pub fn decode_trace_list(body: Value) -> serde_json::Result<Vec<TraceRecord>> {
    let items: Vec<Value> = serde_json::from_value(body)?;
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<TraceRecord>(item) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("skipping unreadable trace record: {}", e);
                None
            }
        })
        .collect())
}

/// RFC 3339, or a naive timestamp taken as UTC. Anything else is treated as missing.
fn timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Some(raw) = value.as_str() else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            raw.replacen(' ', "T", 1)
                .parse::<NaiveDateTime>()
                .ok()
                .map(|t| t.and_utc())
        });
    if parsed.is_none() {
        tracing::debug!(raw, "unreadable trace timestamp");
    }
    Ok(parsed)
}

impl TraceRecord {
    /// The user turn that started this call.
    ///
    /// Request payloads repeat the whole conversation, so only the last
    /// `user` entry of `messages` is the new turn. Single-shot payloads carry
    /// the text under `input` or `query` instead.
    pub fn user_text(&self) -> Option<String> {
        let request = self.request_payload.as_ref()?;

        if let Some(messages) = request.get("messages").and_then(Value::as_array) {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.get("role").and_then(Value::as_str) == Some(Role::User.as_str()));
            if let Some(text) = last_user.and_then(|m| m.get("content")).and_then(content_text) {
                return Some(text);
            }
        }

        ["input", "query"]
            .iter()
            .filter_map(|key| request.get(*key))
            .find_map(content_text)
    }

    /// Text of the assistant reply, trying the known response shapes in order:
    /// a direct text field, a chat-completions choice, structured output
    /// parts, then a generic `assistant_message` field.
    pub fn assistant_text(&self) -> Option<String> {
        let response = self.response_payload.as_ref()?;

        let direct = ["text", "output_text", "response"]
            .iter()
            .filter_map(|key| response.get(*key))
            .find_map(non_empty_str);
        if direct.is_some() {
            return direct;
        }

        let choice = response
            .pointer("/choices/0/message/content")
            .and_then(content_text);
        if choice.is_some() {
            return choice;
        }

        let structured = response
            .get("output")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("content").and_then(Value::as_array))
                    .flatten()
                    .filter_map(|part| part.get("text").and_then(non_empty_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.is_empty());
        if structured.is_some() {
            return structured;
        }

        response.get("assistant_message").and_then(content_text)
    }

    /// Error recorded on the trace or inside its response
    pub fn error_text(&self) -> Option<String> {
        self.error.clone().filter(|e| !e.is_empty()).or_else(|| {
            self.response_payload
                .as_ref()
                .and_then(|r| r.get("error"))
                .and_then(|e| {
                    non_empty_str(e).or_else(|| e.get("message").and_then(non_empty_str))
                })
        })
    }

    /// Metadata for the synthesized assistant message
    pub fn metadata(&self) -> MessageMetadata {
        let response = self.response_payload.as_ref();
        let tool_calls = response
            .and_then(|r| r.get("tool_calls"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let reasoning = response
            .and_then(|r| r.get("reasoning"))
            .cloned()
            .and_then(|r| serde_json::from_value::<Vec<ReasoningStep>>(r).ok())
            .unwrap_or_default();

        MessageMetadata {
            tool_calls,
            reasoning,
            usage: self.usage.clone(),
            estimated_cost_usd: self.estimated_cost_usd,
            cost_breakdown: self.cost_breakdown.clone(),
            missing_model_pricing: self.missing_model_pricing,
            trace_log_id: Some(self.id),
        }
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

/// Text of a message content field: a plain string or a list of parts.
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()).filter(|s| !s.is_empty()),
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("text").and_then(Value::as_str),
                })
                .collect::<Vec<_>>()
                .join("");
            Some(text).filter(|t| !t.is_empty())
        }
        Value::Object(_) => value.get("text").and_then(non_empty_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trace(request: Value, response: Value) -> TraceRecord {
        TraceRecord {
            id: 1,
            request_payload: Some(request),
            response_payload: Some(response),
            ..Default::default()
        }
    }

    #[test]
    fn test_user_text_takes_last_user_message() {
        let t = trace(
            json!({"messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": [{"type": "input_text", "text": "second"}]},
            ]}),
            json!({}),
        );
        assert_eq!(t.user_text().as_deref(), Some("second"));
    }

    #[test]
    fn test_user_text_falls_back_to_query() {
        let t = trace(json!({"query": "what is 2+2?", "mode": "cost_preview"}), json!({}));
        assert_eq!(t.user_text().as_deref(), Some("what is 2+2?"));
    }

    #[test]
    fn test_assistant_text_priority() {
        let all = json!({
            "text": "direct",
            "choices": [{"message": {"content": "choice"}}],
            "output": [{"content": [{"type": "output_text", "text": "structured"}]}],
            "assistant_message": "generic",
        });
        assert_eq!(trace(json!({}), all).assistant_text().as_deref(), Some("direct"));

        let no_direct = json!({
            "choices": [{"message": {"content": "choice"}}],
            "output": [{"content": [{"text": "structured"}]}],
        });
        assert_eq!(
            trace(json!({}), no_direct).assistant_text().as_deref(),
            Some("choice")
        );

        let structured = json!({
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [{"text": "part one, "}, {"text": "part two"}]},
            ],
            "assistant_message": "generic",
        });
        assert_eq!(
            trace(json!({}), structured).assistant_text().as_deref(),
            Some("part one, part two")
        );

        let generic = json!({"assistant_message": "generic"});
        assert_eq!(
            trace(json!({}), generic).assistant_text().as_deref(),
            Some("generic")
        );
    }

    #[test]
    fn test_runner_response_field_is_direct_text() {
        let t = trace(
            json!({"query": "q"}),
            json!({"response": "answer", "tool_calls": null, "reasoning": [{"summary": ["s"]}]}),
        );
        assert_eq!(t.assistant_text().as_deref(), Some("answer"));
        let metadata = t.metadata();
        assert!(metadata.tool_calls.is_empty());
        assert_eq!(metadata.reasoning, vec![ReasoningStep::summary("s")]);
        assert_eq!(metadata.trace_log_id, Some(1));
    }

    #[test]
    fn test_error_text_prefers_record_error() {
        let mut t = trace(json!({}), json!({"error": {"message": "inner"}}));
        assert_eq!(t.error_text().as_deref(), Some("inner"));
        t.error = Some("outer".into());
        assert_eq!(t.error_text().as_deref(), Some("outer"));
    }

    #[test]
    fn test_deserialize_api_record() {
        let t: TraceRecord = serde_json::from_value(json!({
            "id": 5,
            "conversation_id": "conv-1",
            "status": "completed",
            "usage": {"input_tokens": 10, "output_tokens": 2, "requests": 1},
            "missing_model_pricing": false,
            "created_at": "2025-01-02T03:04:05.123456+00:00",
            "organization_id": 1,
        }))
        .unwrap();
        assert_eq!(t.id, 5);
        assert_eq!(t.usage.unwrap().input_tokens, 10);
        assert!(t.created_at.is_some());
    }

    #[test]
    fn test_null_counter_does_not_sink_trace_list() {
        let records = decode_trace_list(json!([
            {"id": 1, "usage": {"input_tokens": 3, "cached_tokens": null}},
            {"id": 2, "usage": {"input_tokens": 4}, "estimated_cost_usd": null},
        ]))
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].usage.as_ref().unwrap().cached_tokens, 0);
        assert_eq!(records[1].usage.as_ref().unwrap().input_tokens, 4);
    }

    #[test]
    fn test_unreadable_record_is_skipped() {
        let records = decode_trace_list(json!([
            {"id": "not-a-number"},
            {"id": 2, "cost_breakdown": {"total_usd": null}},
        ]))
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 2);
        assert!(decode_trace_list(json!({"detail": "nope"})).is_err());
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let t: TraceRecord = serde_json::from_value(json!({
            "id": 3,
            "created_at": "2025-01-02 03:04:05.5",
        }))
        .unwrap();
        assert_eq!(
            t.created_at.unwrap().to_rfc3339(),
            "2025-01-02T03:04:05.500+00:00"
        );
        let odd: TraceRecord =
            serde_json::from_value(json!({"id": 4, "created_at": 17})).unwrap();
        assert!(odd.created_at.is_none());
    }
}
