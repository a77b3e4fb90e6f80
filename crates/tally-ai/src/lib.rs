//! tally-ai: Wire layer for the tally chat backend
//!
//! Decodes the backend's event-framed response stream, folds events into a
//! pending message, and talks to the chat and trace HTTP endpoints.

pub mod client;
pub mod error;
pub mod events;
pub mod frame;
pub mod stream;
pub mod trace;
pub mod types;

pub use client::{ChatBackend, HttpBackend, StreamOpen, TraceSource};
pub use error::{Error, Result};
pub use events::StreamEvent;
pub use frame::{Frame, FrameDecoder};
pub use stream::{AssemblyPhase, PendingMessage, PendingState, Progress};
pub use trace::TraceRecord;
pub use types::*;
