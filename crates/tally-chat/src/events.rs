//! Transcript change notifications

use tally_ai::{Message, MessageId, PendingMessage, Role, SessionId};

/// Emitted by the conversation store after every mutation, for renderers
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    /// A finalized message was appended
    MessageAppended { message: Message },

    /// A pending message was started
    PendingStarted { id: MessageId, role: Role },

    /// The pending message changed
    PendingUpdated { pending: PendingMessage },

    /// The pending message became final
    MessageFinalized { message: Message },

    /// The pending message was dropped without finalizing
    PendingDiscarded { id: MessageId },

    /// The replay input preview changed
    InputPreview { text: String },

    /// The whole store was replaced (new chat, history load, replay start)
    Replaced {
        session_id: SessionId,
        read_only: bool,
        message_count: usize,
    },
}

impl TranscriptEvent {
    /// Whether this event carries a final message
    pub fn final_message(&self) -> Option<&Message> {
        match self {
            TranscriptEvent::MessageAppended { message }
            | TranscriptEvent::MessageFinalized { message } => Some(message),
            _ => None,
        }
    }
}
