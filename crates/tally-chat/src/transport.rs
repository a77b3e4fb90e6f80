//! Transmission: sending one user turn and streaming the reply into the store

use std::sync::Arc;

use futures::StreamExt;
use tally_ai::{
    ChatBackend, ChatRequest, ChatTurn, DonePayload, Message, Progress, Role, StreamEvent,
    StreamOpen, frame::frames,
};

use crate::error::{Error, Result};
use crate::handle::ChatHandle;

/// How the backend exchange ended
enum Finish {
    /// A `done` payload arrived, streamed or from the blocking call
    Done(DonePayload),
    /// The stream ended without `done`
    Aborted,
    /// The pending message disappeared mid-stream
    Discarded,
}

/// Drives one send at a time against a chat backend
pub struct TransmissionController {
    backend: Arc<dyn ChatBackend>,
    handle: ChatHandle,
    agent_config_id: Option<i64>,
}

impl TransmissionController {
    pub fn new(backend: Arc<dyn ChatBackend>, handle: ChatHandle) -> Self {
        Self {
            backend,
            handle,
            agent_config_id: None,
        }
    }

    /// Route requests to a specific backend agent configuration
    pub fn with_agent(mut self, agent_config_id: Option<i64>) -> Self {
        self.agent_config_id = agent_config_id;
        self
    }

    pub fn handle(&self) -> &ChatHandle {
        &self.handle
    }

    /// Send a user turn and stream the assistant reply into the store.
    ///
    /// Returns the finalized assistant message. Backend failures do not
    /// surface as `Err`: they are recorded on the message instead.
    pub async fn send(&self, text: impl Into<String>) -> Result<Message> {
        let text = text.into();
        let _guard = self.handle.begin_send()?;

        let request = self.handle.with_store(|store| -> Result<ChatRequest> {
            if store.is_read_only() {
                return Err(Error::ReadOnly);
            }
            if store.pending().is_some() {
                return Err(Error::PendingInProgress);
            }
            let mut messages = store.transcript();
            messages.push(ChatTurn::new(Role::User, text.clone()));
            store.append(Message::user(text));
            store.start_pending(Role::Assistant)?;
            Ok(ChatRequest {
                conversation_id: store.session_id().clone(),
                agent_config_id: self.agent_config_id,
                messages,
            })
        })?;

        tracing::debug!(
            conversation_id = %request.conversation_id,
            turns = request.messages.len(),
            "sending chat turn"
        );
        let finish = self.drive(&request).await;

        let finalized = self.handle.with_store(|store| {
            store
                .finalize_pending(|pending| match finish {
                    Ok(Finish::Done(done)) => pending.complete(done),
                    Ok(Finish::Aborted) | Ok(Finish::Discarded) => pending.abort(),
                    Err(e) if e.is_stream_event() => pending.fail(e.to_string()),
                    Err(e) => {
                        tracing::warn!(status = ?e.status(), "chat request failed: {}", e);
                        pending.fail_transport(e.to_string())
                    }
                })
                .cloned()
        });
        finalized.ok_or(Error::PendingDiscarded)
    }

    async fn drive(&self, request: &ChatRequest) -> tally_ai::Result<Finish> {
        let body = match self.backend.open_stream(request).await? {
            StreamOpen::Streaming(body) => body,
            StreamOpen::Unavailable { status } => {
                tracing::debug!(?status, "streaming unavailable, using blocking call");
                let done = self.backend.complete(request).await?;
                return Ok(Finish::Done(done));
            }
        };

        let frames = frames(body);
        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let event = StreamEvent::from_frame(&frame?);
            let applied = self
                .handle
                .with_store(|store| store.mutate_pending(|pending| pending.process_event(event)));
            match applied {
                None => {
                    tracing::debug!("pending message gone, dropping rest of stream");
                    return Ok(Finish::Discarded);
                }
                Some(progress) => match progress? {
                    Progress::Continue => {}
                    Progress::Completed(done) => return Ok(Finish::Done(*done)),
                },
            }
        }
        Ok(Finish::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tally_ai::{Termination, stream::EMPTY_STREAM_ERROR};

    use crate::handle::Activity;

    enum Reply {
        Chunks(Vec<tally_ai::Result<Vec<u8>>>),
        Unavailable,
        Refused(u16),
    }

    /// A backend that replays canned responses and records requests.
    struct MockBackend {
        reply: Mutex<Option<Reply>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockBackend {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(reply)),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn streaming(body: &str) -> Arc<Self> {
            Self::new(Reply::Chunks(vec![Ok(body.as_bytes().to_vec())]))
        }
    }

    #[async_trait]
    impl ChatBackend for MockBackend {
        async fn open_stream(&self, request: &ChatRequest) -> tally_ai::Result<StreamOpen> {
            self.requests.lock().push(request.clone());
            match self.reply.lock().take() {
                Some(Reply::Chunks(chunks)) => Ok(StreamOpen::Streaming(Box::pin(
                    futures::stream::iter(chunks),
                ))),
                Some(Reply::Unavailable) => Ok(StreamOpen::Unavailable { status: Some(404) }),
                Some(Reply::Refused(status)) => Err(tally_ai::Error::api(status, "refused")),
                None => Ok(StreamOpen::Streaming(Box::pin(
                    futures::stream::empty::<tally_ai::Result<Vec<u8>>>(),
                ))),
            }
        }

        async fn complete(&self, _request: &ChatRequest) -> tally_ai::Result<DonePayload> {
            Ok(DonePayload {
                assistant_message: Some("blocking answer".into()),
                trace_log_id: Some(77),
                ..Default::default()
            })
        }
    }

    fn controller(backend: Arc<MockBackend>) -> TransmissionController {
        TransmissionController::new(backend, ChatHandle::new())
    }

    #[tokio::test]
    async fn test_streamed_reply_is_finalized_from_done() {
        let backend = MockBackend::streaming(concat!(
            "event: reasoning_delta\ndata: {\"delta\":\"hmm\"}\n\n",
            "event: tool_call\ndata: {\"name\":\"search\"}\n\n",
            "event: text_delta\ndata: {\"delta\":\"Hel\"}\n\n",
            "event: text_delta\ndata: {\"delta\":\"lo\"}\n\n",
            "event: done\ndata: {\"assistant_message\":\"Hello\",\"trace_log_id\":9,",
            "\"tool_calls\":[{\"name\":\"search\",\"arguments\":{\"q\":\"x\"}}]}\n\n",
        ));
        let controller = controller(backend);
        let message = controller.send("hi").await.unwrap();

        assert_eq!(message.content, "Hello");
        assert_eq!(message.termination, Termination::Completed);
        let metadata = message.metadata.as_ref().unwrap();
        assert_eq!(metadata.trace_log_id, Some(9));
        assert_eq!(
            metadata.tool_calls,
            vec![json!({"name": "search", "arguments": {"q": "x"}})]
        );
        // streamed reasoning is not merged into the done metadata
        assert!(metadata.reasoning.is_empty());

        let messages = controller.handle().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].id, message.id);
        assert!(controller.handle().pending().is_none());
        assert!(controller.handle().is_idle());
    }

    #[tokio::test]
    async fn test_request_carries_prior_transcript() {
        let backend = MockBackend::streaming("event: done\ndata: {}\n\n");
        let controller = TransmissionController::new(backend.clone(), ChatHandle::new())
            .with_agent(Some(4));
        controller.handle().with_store(|store| {
            store.append(Message::user("earlier"));
            store.append(Message::assistant("reply", None));
        });
        controller.send("next").await.unwrap();

        let requests = backend.requests.lock();
        assert_eq!(requests[0].agent_config_id, Some(4));
        let contents: Vec<_> = requests[0].messages.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["earlier", "reply", "next"]);
    }

    #[tokio::test]
    async fn test_fallback_applies_blocking_result() {
        let controller = controller(MockBackend::new(Reply::Unavailable));
        let message = controller.send("hi").await.unwrap();
        assert_eq!(message.content, "blocking answer");
        assert_eq!(message.metadata.unwrap().trace_log_id, Some(77));
    }

    #[tokio::test]
    async fn test_stream_end_without_done_keeps_partial() {
        let backend = MockBackend::streaming("event: text_delta\ndata: {\"delta\":\"part\"}\n\n");
        let message = controller(backend).send("hi").await.unwrap();
        assert_eq!(message.content, "part");
        assert_eq!(message.error, None);
        assert_eq!(message.termination, Termination::Aborted);
    }

    #[tokio::test]
    async fn test_empty_stream_gets_synthetic_error() {
        let message = controller(MockBackend::streaming("")).send("hi").await.unwrap();
        assert_eq!(message.content, "");
        assert_eq!(message.error.as_deref(), Some(EMPTY_STREAM_ERROR));
    }

    #[tokio::test]
    async fn test_error_event_sets_error_without_content() {
        let backend = MockBackend::streaming(concat!(
            "event: text_delta\ndata: {\"delta\":\"partial\"}\n\n",
            "event: error\ndata: {\"error\":\"model overloaded\"}\n\n",
            "event: text_delta\ndata: {\"delta\":\"ignored\"}\n\n",
        ));
        let message = controller(backend).send("hi").await.unwrap();
        assert_eq!(message.content, "");
        assert_eq!(message.error.as_deref(), Some("model overloaded"));
        assert_eq!(message.termination, Termination::Failed);
    }

    #[tokio::test]
    async fn test_transport_failure_is_shown_inline() {
        let backend = MockBackend::new(Reply::Chunks(vec![
            Ok(b"event: text_delta\ndata: {\"delta\":\"a\"}\n\n".to_vec()),
            Err(tally_ai::Error::Body("connection reset".into())),
        ]));
        let controller = controller(backend);
        let message = controller.send("hi").await.unwrap();
        assert!(message.content.starts_with("ERROR: "), "got {}", message.content);
        assert!(message.error.as_deref().unwrap().contains("connection reset"));
        assert!(controller.handle().is_idle());
    }

    #[tokio::test]
    async fn test_refused_request_is_shown_inline() {
        let message = controller(MockBackend::new(Reply::Refused(500)))
            .send("hi")
            .await
            .unwrap();
        assert!(message.content.starts_with("ERROR: "));
        assert_eq!(message.termination, Termination::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_send_rejected() {
        let controller = controller(MockBackend::streaming("event: done\ndata: {}\n\n"));
        let _guard = controller.handle().begin_send().unwrap();
        let err = controller.send("second").await.unwrap_err();
        assert!(matches!(err, Error::SendInProgress));
        assert!(controller.handle().messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_rejected_during_replay_and_on_history() {
        let controller = controller(MockBackend::streaming("event: done\ndata: {}\n\n"));
        assert!(controller.handle().try_claim(Activity::Replaying));
        assert!(matches!(controller.send("x").await, Err(Error::ReplayActive)));
        controller.handle().release(Activity::Replaying);

        controller.handle().with_store(|store| {
            store.merge_history(tally_ai::SessionId::from_existing("old"), Vec::new())
        });
        assert!(matches!(controller.send("x").await, Err(Error::ReadOnly)));
        assert!(controller.handle().is_idle());
    }

    #[tokio::test]
    async fn test_send_with_foreign_pending_leaves_store_untouched() {
        let backend = MockBackend::streaming("event: done\ndata: {}\n\n");
        let controller = controller(backend.clone());
        let pending_id = controller
            .handle()
            .with_store(|store| store.start_pending(Role::Assistant))
            .unwrap();

        let err = controller.send("orphan").await.unwrap_err();
        assert!(matches!(err, Error::PendingInProgress));
        assert!(controller.handle().messages().is_empty());
        assert_eq!(controller.handle().pending().unwrap().id, pending_id);
        assert!(backend.requests.lock().is_empty());
        assert!(controller.handle().is_idle());
    }
}
