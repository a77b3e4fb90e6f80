//! Delta assembly: folding stream events into one pending message

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::events::StreamEvent;
use crate::types::{
    DonePayload, Message, MessageId, MessageMetadata, ReasoningStep, Role, Termination,
};

/// Maximum number of activity labels kept in the rolling history
pub const ACTIVITY_HISTORY_LEN: usize = 5;

/// Activity label shown while reasoning deltas arrive
pub const THINKING_ACTIVITY: &str = "thinking";

/// Error recorded when a stream ends with nothing to show
pub const EMPTY_STREAM_ERROR: &str = "stream ended before a final response";

/// Where the assembler is in building a pending message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyPhase {
    Idle,
    AccumulatingContent,
    AccumulatingReasoning,
    Finalized,
    Aborted,
}

/// Buffers attached to a message that is still streaming
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingState {
    /// Visible answer so far
    pub text: String,
    /// Reasoning so far; never merged into `text`
    pub reasoning: String,
    /// Last few activity labels, oldest first
    pub activity_history: VecDeque<String>,
    /// Current activity label
    pub activity: Option<String>,
}

impl PendingState {
    fn record_activity(&mut self, label: String) {
        if self.activity_history.back() != Some(&label) {
            self.activity_history.push_back(label.clone());
            while self.activity_history.len() > ACTIVITY_HISTORY_LEN {
                self.activity_history.pop_front();
            }
        }
        self.activity = Some(label);
    }

    /// Whether any delta or activity has been seen
    pub fn has_progress(&self) -> bool {
        !self.text.is_empty() || !self.reasoning.is_empty() || self.activity.is_some()
    }
}

/// What the caller should do after an event was applied
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Keep reading
    Continue,
    /// A `done` event arrived; finalize with this payload
    Completed(Box<DonePayload>),
}

/// The message currently being assembled from live or replayed deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub id: MessageId,
    pub role: Role,
    pub state: PendingState,
    /// Streamed reasoning mirrored as a single growing step
    pub reasoning_steps: Vec<ReasoningStep>,
    phase: AssemblyPhase,
}

impl PendingMessage {
    pub fn new(role: Role) -> Self {
        Self {
            id: MessageId::new(),
            role,
            state: PendingState::default(),
            reasoning_steps: Vec::new(),
            phase: AssemblyPhase::Idle,
        }
    }

    pub fn phase(&self) -> AssemblyPhase {
        self.phase
    }

    /// Apply one event in arrival order.
    ///
    /// An `error` event is returned as `Err(Error::Stream)`; the caller
    /// finalizes with [`PendingMessage::fail`].
    pub fn process_event(&mut self, event: StreamEvent) -> Result<Progress> {
        match event {
            StreamEvent::TextDelta { delta } => {
                self.state.text.push_str(&delta);
                self.phase = AssemblyPhase::AccumulatingContent;
            }
            StreamEvent::ReasoningDelta { delta } => {
                self.state.reasoning.push_str(&delta);
                self.reasoning_steps = vec![ReasoningStep::summary(self.state.reasoning.clone())];
                self.phase = AssemblyPhase::AccumulatingReasoning;
                self.state.record_activity(THINKING_ACTIVITY.to_string());
            }
            StreamEvent::ToolCall { name, status } => {
                self.state.record_activity(format!("{}: {}", status, name));
            }
            StreamEvent::Done(done) => return Ok(Progress::Completed(done)),
            StreamEvent::Error { error } => return Err(Error::Stream(error)),
            StreamEvent::Ignored { event } => {
                tracing::trace!(event = %event, "ignoring unhandled stream event");
            }
        }
        Ok(Progress::Continue)
    }

    /// Finalize from a `done` payload.
    ///
    /// Metadata is taken from the payload as-is; streamed reasoning is not
    /// merged in. Text falls back to the streamed answer only when the payload
    /// carries none.
    pub fn complete(mut self, done: DonePayload) -> Message {
        self.phase = AssemblyPhase::Finalized;
        let metadata = done.metadata();
        let content = done
            .assistant_message
            .unwrap_or_else(|| std::mem::take(&mut self.state.text));
        let termination = if done.error.is_some() {
            Termination::Failed
        } else {
            Termination::Completed
        };
        Message {
            id: self.id,
            role: self.role,
            content,
            error: done.error,
            metadata: Some(metadata),
            termination,
        }
    }

    /// Finalize after an `error` event: error set, no content.
    pub fn fail(self, error: impl Into<String>) -> Message {
        let metadata = self.partial_metadata();
        Message {
            id: self.id,
            role: self.role,
            content: String::new(),
            error: Some(error.into()),
            metadata,
            termination: Termination::Failed,
        }
    }

    /// Finalize after a transport failure: the error is shown inline too.
    pub fn fail_transport(self, error: impl Into<String>) -> Message {
        let error = error.into();
        let metadata = self.partial_metadata();
        Message {
            id: self.id,
            role: self.role,
            content: format!("ERROR: {}", error),
            error: Some(error),
            metadata,
            termination: Termination::Failed,
        }
    }

    /// Finalize a stream that ended without `done`.
    ///
    /// With nothing observed the message gets a synthetic error; otherwise
    /// the partial answer is kept as a best-effort result without error.
    pub fn abort(mut self) -> Message {
        self.phase = AssemblyPhase::Aborted;
        let error = if self.state.has_progress() {
            None
        } else {
            Some(EMPTY_STREAM_ERROR.to_string())
        };
        let metadata = self.partial_metadata();
        Message {
            id: self.id,
            role: self.role,
            content: std::mem::take(&mut self.state.text),
            error,
            metadata,
            termination: Termination::Aborted,
        }
    }

    fn partial_metadata(&self) -> Option<MessageMetadata> {
        if self.reasoning_steps.is_empty() {
            return None;
        }
        Some(MessageMetadata {
            reasoning: self.reasoning_steps.clone(),
            ..Default::default()
        })
    }
}
