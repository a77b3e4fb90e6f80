//! Conversation store: finalized messages plus at most one pending tail.

use tally_ai::{ChatTurn, Message, MessageId, PendingMessage, Role, SessionId};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::events::TranscriptEvent;

/// Ordered, append-only log of the messages exchanged in one chat session.
///
/// The pending message is held outside the finalized log, so there can never
/// be more than one.
#[derive(Debug)]
pub struct ConversationStore {
    session_id: SessionId,
    messages: Vec<Message>,
    pending: Option<PendingMessage>,
    /// Text a replayed user turn is "typing"
    input_preview: String,
    /// Set when the contents were reconstructed from history or are a replay
    read_only: bool,
    notifier: Option<broadcast::Sender<TranscriptEvent>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Create an empty store for a fresh session
    pub fn new() -> Self {
        Self {
            session_id: SessionId::new(),
            messages: Vec::new(),
            pending: None,
            input_preview: String::new(),
            read_only: false,
            notifier: None,
        }
    }

    /// Broadcast every mutation on `sender`
    pub fn with_notifier(mut self, sender: broadcast::Sender<TranscriptEvent>) -> Self {
        self.notifier = Some(sender);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Finalized messages, in order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pending(&self) -> Option<&PendingMessage> {
        self.pending.as_ref()
    }

    pub fn input_preview(&self) -> &str {
        &self.input_preview
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of messages including a pending one
    pub fn len(&self) -> usize {
        self.messages.len() + usize::from(self.pending.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a finalized message, assigning it a fresh local id.
    pub fn append(&mut self, mut message: Message) -> MessageId {
        message.id = MessageId::new();
        let id = message.id;
        self.notify(|| TranscriptEvent::MessageAppended {
            message: message.clone(),
        });
        self.messages.push(message);
        id
    }

    /// Start the pending message. Fails without touching the store if one
    /// is already pending.
    pub fn start_pending(&mut self, role: Role) -> Result<MessageId> {
        if self.pending.is_some() {
            return Err(Error::PendingInProgress);
        }
        let pending = PendingMessage::new(role);
        let id = pending.id;
        self.pending = Some(pending);
        self.notify(|| TranscriptEvent::PendingStarted { id, role });
        Ok(id)
    }

    /// Apply `f` to the pending message; `None` when nothing is pending.
    pub fn mutate_pending<R>(&mut self, f: impl FnOnce(&mut PendingMessage) -> R) -> Option<R> {
        let pending = self.pending.as_mut()?;
        let result = f(pending);
        if let Some(sender) = &self.notifier {
            let _ = sender.send(TranscriptEvent::PendingUpdated {
                pending: pending.clone(),
            });
        }
        Some(result)
    }

    /// Turn the pending message into a final one; `None` when nothing is pending.
    pub fn finalize_pending(
        &mut self,
        f: impl FnOnce(PendingMessage) -> Message,
    ) -> Option<&Message> {
        let pending = self.pending.take()?;
        let id = pending.id;
        let mut message = f(pending);
        message.id = id;
        self.notify(|| TranscriptEvent::MessageFinalized {
            message: message.clone(),
        });
        self.messages.push(message);
        self.messages.last()
    }

    /// Drop the pending message without finalizing it
    pub fn discard_pending(&mut self) -> Option<PendingMessage> {
        let pending = self.pending.take()?;
        tracing::warn!(id = %pending.id, "discarding pending message");
        self.notify(|| TranscriptEvent::PendingDiscarded { id: pending.id });
        Some(pending)
    }

    /// Replace the live contents with history reconstructed from the backend.
    ///
    /// A pending message is discarded rather than mixed into the history.
    pub fn merge_history(&mut self, session_id: SessionId, prior: Vec<Message>) {
        self.discard_pending();
        self.session_id = session_id;
        self.messages = prior
            .into_iter()
            .map(|mut m| {
                m.id = MessageId::new();
                m
            })
            .collect();
        self.input_preview.clear();
        self.read_only = true;
        self.notify_replaced();
    }

    /// Clear the store for a replay of a finished conversation
    pub fn begin_playback(&mut self) {
        self.discard_pending();
        self.messages.clear();
        self.input_preview.clear();
        self.read_only = true;
        self.notify_replaced();
    }

    /// Start a new chat: fresh session id, empty log
    pub fn reset_session(&mut self) -> SessionId {
        self.discard_pending();
        self.session_id = SessionId::new();
        self.messages.clear();
        self.input_preview.clear();
        self.read_only = false;
        self.notify_replaced();
        self.session_id.clone()
    }

    /// Role/content pairs of the finalized messages, for the next request.
    ///
    /// Messages with no visible content (e.g. failed turns) are skipped.
    pub fn transcript(&self) -> Vec<ChatTurn> {
        self.messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(ChatTurn::from)
            .collect()
    }

    pub fn push_input_preview(&mut self, chunk: &str) {
        self.input_preview.push_str(chunk);
        let text = self.input_preview.clone();
        self.notify(|| TranscriptEvent::InputPreview { text });
    }

    pub fn clear_input_preview(&mut self) {
        if self.input_preview.is_empty() {
            return;
        }
        self.input_preview.clear();
        self.notify(|| TranscriptEvent::InputPreview {
            text: String::new(),
        });
    }

    fn notify_replaced(&self) {
        self.notify(|| TranscriptEvent::Replaced {
            session_id: self.session_id.clone(),
            read_only: self.read_only,
            message_count: self.messages.len(),
        });
    }

    fn notify(&self, event: impl FnOnce() -> TranscriptEvent) {
        if let Some(sender) = &self.notifier {
            // no subscribers is fine
            let _ = sender.send(event());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_ai::{DonePayload, StreamEvent, Termination};

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            delta: text.into(),
        }
    }

    #[test]
    fn test_append_assigns_unique_ids() {
        let mut store = ConversationStore::new();
        let message = Message::user("hi");
        let a = store.append(message.clone());
        let b = store.append(message);
        assert_ne!(a, b);
        let ids: Vec<_> = store.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_second_pending_is_rejected_without_corruption() {
        let mut store = ConversationStore::new();
        store.append(Message::user("q"));
        let id = store.start_pending(Role::Assistant).unwrap();
        store.mutate_pending(|p| p.process_event(delta("partial")));

        let err = store.start_pending(Role::Assistant).unwrap_err();
        assert!(matches!(err, Error::PendingInProgress));
        assert_eq!(store.pending().unwrap().id, id);
        assert_eq!(store.pending().unwrap().state.text, "partial");
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_mutate_without_pending_is_noop() {
        let mut store = ConversationStore::new();
        assert!(store.mutate_pending(|p| p.process_event(delta("late"))).is_none());
        assert!(store.finalize_pending(|p| p.abort()).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_finalize_keeps_pending_id_and_position() {
        let mut store = ConversationStore::new();
        store.append(Message::user("q"));
        let id = store.start_pending(Role::Assistant).unwrap();
        store.mutate_pending(|p| p.process_event(delta("answer")));
        let message = store
            .finalize_pending(|p| p.complete(DonePayload::default()))
            .unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.content, "answer");
        assert_eq!(message.termination, Termination::Completed);
        assert!(store.pending().is_none());
        assert_eq!(store.messages()[1].id, id);
    }

    #[test]
    fn test_merge_history_discards_pending() {
        let mut store = ConversationStore::new();
        store.append(Message::user("live"));
        store.start_pending(Role::Assistant).unwrap();

        let history = vec![Message::user("old q"), Message::assistant("old a", None)];
        store.merge_history(SessionId::from_existing("conv-7"), history);

        assert!(store.pending().is_none());
        assert!(store.is_read_only());
        assert_eq!(store.session_id().as_str(), "conv-7");
        let contents: Vec<_> = store.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["old q", "old a"]);
    }

    #[test]
    fn test_reset_session_issues_new_id() {
        let mut store = ConversationStore::new();
        let first = store.session_id().clone();
        store.append(Message::user("hello"));
        let second = store.reset_session();
        assert_ne!(first, second);
        assert!(store.is_empty());
        assert!(!store.is_read_only());
    }

    #[test]
    fn test_transcript_skips_empty_and_pending() {
        let mut store = ConversationStore::new();
        store.append(Message::user("one"));
        store.append(Message::assistant("", None).with_error("boom"));
        store.append(Message::user("two"));
        store.start_pending(Role::Assistant).unwrap();
        store.mutate_pending(|p| p.process_event(delta("streaming")));

        let turns = store.transcript();
        assert_eq!(
            turns,
            vec![ChatTurn::new(Role::User, "one"), ChatTurn::new(Role::User, "two")]
        );
    }

    #[test]
    fn test_notifier_sees_mutations_in_order() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut store = ConversationStore::new().with_notifier(tx);
        store.append(Message::user("q"));
        store.start_pending(Role::Assistant).unwrap();
        store.mutate_pending(|p| p.process_event(delta("a")));
        store.finalize_pending(|p| p.abort());

        assert!(matches!(rx.try_recv().unwrap(), TranscriptEvent::MessageAppended { .. }));
        assert!(matches!(rx.try_recv().unwrap(), TranscriptEvent::PendingStarted { .. }));
        match rx.try_recv().unwrap() {
            TranscriptEvent::PendingUpdated { pending } => assert_eq!(pending.state.text, "a"),
            other => panic!("unexpected {:?}", other),
        }
        let finalized = rx.try_recv().unwrap();
        assert_eq!(finalized.final_message().unwrap().content, "a");
    }
}
