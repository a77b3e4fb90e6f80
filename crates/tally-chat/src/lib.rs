//! tally-chat: Live chat transcript engine
//!
//! This crate owns the conversation a chat surface displays: it sends user
//! turns and streams the replies in, rebuilds past conversations from trace
//! records, and replays finished conversations at human pace.

pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod history;
pub mod replay;
pub mod transport;

pub use conversation::ConversationStore;
pub use error::{Error, Result};
pub use events::TranscriptEvent;
pub use handle::{Activity, ChatHandle, SendGuard};
pub use history::{load_conversation, reconstruct};
pub use replay::{ReplayControl, ReplayOutcome, ReplayPacing, ReplayScheduler, Span};
pub use transport::TransmissionController;
