//! Error types for tally-chat

use thiserror::Error;

/// Result type alias using tally-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a conversation
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer
    #[error(transparent)]
    Ai(#[from] tally_ai::Error),

    /// A second pending message was requested while one is streaming
    #[error("a message is already pending")]
    PendingInProgress,

    /// A send was attempted while another one is in flight
    #[error("another message is still being sent")]
    SendInProgress,

    /// A send or history load was attempted during a replay
    #[error("a replay is running")]
    ReplayActive,

    /// The store holds reconstructed history, which cannot be continued
    #[error("this conversation is read-only history; start a new chat to send")]
    ReadOnly,

    /// The pending message was dropped (e.g. history loaded) before it finished
    #[error("the pending message was discarded before it finished")]
    PendingDiscarded,
}
