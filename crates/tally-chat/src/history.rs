//! Rebuilding a conversation from persisted trace records

use tally_ai::{Message, SessionId, TraceRecord, TraceSource};

use crate::error::{Error, Result};
use crate::handle::{Activity, ChatHandle};

/// Turn trace records into an ordered list of finalized messages.
///
/// Records are ordered by creation time, then id. Each contributes its user
/// turn (when one can be extracted) followed by the assistant reply, which
/// carries the record's metadata and error.
pub fn reconstruct(traces: &[TraceRecord]) -> Vec<Message> {
    let mut ordered: Vec<&TraceRecord> = traces.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let mut messages = Vec::with_capacity(ordered.len() * 2);
    for trace in ordered {
        if let Some(text) = trace.user_text() {
            messages.push(Message::user(text));
        }
        let mut reply = Message::assistant(
            trace.assistant_text().unwrap_or_default(),
            Some(trace.metadata()),
        );
        if let Some(error) = trace.error_text() {
            reply = reply.with_error(error);
        }
        messages.push(reply);
    }
    messages
}

/// Load a conversation's history into the handle's store.
///
/// Returns the number of messages loaded. The store becomes read-only.
pub async fn load_conversation(
    source: &dyn TraceSource,
    handle: &ChatHandle,
    conversation_id: &str,
) -> Result<usize> {
    if handle.activity() == Activity::Replaying {
        return Err(Error::ReplayActive);
    }
    let traces = source.conversation_traces(conversation_id).await?;
    tracing::debug!(conversation_id, traces = traces.len(), "loaded trace records");

    let messages = reconstruct(&traces);
    let count = messages.len();
    handle.with_store(|store| {
        store.merge_history(SessionId::from_existing(conversation_id), messages)
    });
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tally_ai::{Role, Termination};

    fn record(id: i64, created_at: &str, query: &str, answer: &str) -> TraceRecord {
        serde_json::from_value(json!({
            "id": id,
            "conversation_id": "conv-1",
            "created_at": created_at,
            "request_payload": {"query": query},
            "response_payload": {"response": answer, "tool_calls": [{"name": "search"}]},
        }))
        .unwrap()
    }

    struct StaticTraces(Vec<TraceRecord>);

    #[async_trait]
    impl TraceSource for StaticTraces {
        async fn conversation_traces(
            &self,
            _conversation_id: &str,
        ) -> tally_ai::Result<Vec<TraceRecord>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_reconstruct_orders_by_time_then_id() {
        let traces = vec![
            record(3, "2025-01-01T00:00:02Z", "third", "c"),
            record(2, "2025-01-01T00:00:01Z", "second", "b"),
            record(1, "2025-01-01T00:00:01Z", "first", "a"),
        ];
        let messages = reconstruct(&traces);
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "a", "second", "b", "third", "c"]);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        let metadata = messages[1].metadata.as_ref().unwrap();
        assert_eq!(metadata.trace_log_id, Some(1));
        assert_eq!(metadata.tool_calls, vec![json!({"name": "search"})]);
    }

    #[test]
    fn test_reconstruct_without_user_text() {
        let mut trace = record(1, "2025-01-01T00:00:00Z", "", "answer");
        trace.request_payload = Some(json!({"mode": "batch"}));
        trace.error = Some("upstream failed".into());
        let messages = reconstruct(&[trace]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "answer");
        assert_eq!(messages[0].error.as_deref(), Some("upstream failed"));
        assert_eq!(messages[0].termination, Termination::Completed);
    }

    #[tokio::test]
    async fn test_load_marks_store_read_only() {
        let handle = ChatHandle::new();
        let source = StaticTraces(vec![record(1, "2025-01-01T00:00:00Z", "hi", "hello")]);
        let count = load_conversation(&source, &handle, "conv-1").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(handle.session_id().as_str(), "conv-1");
        assert!(handle.with_store(|s| s.is_read_only()));
    }

    #[tokio::test]
    async fn test_load_refused_during_replay() {
        let handle = ChatHandle::new();
        assert!(handle.try_claim(Activity::Replaying));
        let source = StaticTraces(Vec::new());
        let err = load_conversation(&source, &handle, "conv-1").await.unwrap_err();
        assert!(matches!(err, Error::ReplayActive));
    }
}
