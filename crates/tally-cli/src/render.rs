//! Plain-text transcript printer

use std::io::{self, Write};

use tally_ai::{Message, MessageMetadata, Role};
use tally_chat::TranscriptEvent;

use crate::utils::truncate_chars;

/// Longest tool-call summary shown in a footer
const TOOL_PREVIEW_CHARS: usize = 60;

/// Prints transcript events as they arrive, streaming pending text in place.
pub struct Printer {
    /// "\r\n" while the terminal is in raw mode
    newline: &'static str,
    /// Pending answer text already written
    streamed: String,
    /// Last activity label written for the pending message
    activity: Option<String>,
    /// Whether an input preview line is on screen
    preview_open: bool,
}

impl Printer {
    pub fn new() -> Self {
        Self {
            newline: "\n",
            streamed: String::new(),
            activity: None,
            preview_open: false,
        }
    }

    /// Printer for a terminal in raw mode
    pub fn raw() -> Self {
        Self {
            newline: "\r\n",
            ..Self::new()
        }
    }

    pub fn handle(&mut self, event: &TranscriptEvent, out: &mut impl Write) -> io::Result<()> {
        match event {
            TranscriptEvent::MessageAppended { message } => {
                self.close_preview(out)?;
                self.print_message(message, out)?;
            }
            TranscriptEvent::PendingStarted { role, .. } => {
                self.close_preview(out)?;
                self.streamed.clear();
                self.activity = None;
                write!(out, "{}> ", label(*role))?;
            }
            TranscriptEvent::PendingUpdated { pending } => {
                if pending.state.activity != self.activity && self.streamed.is_empty() {
                    if let Some(activity) = &pending.state.activity {
                        write!(out, "[{}] ", activity)?;
                    }
                    self.activity = pending.state.activity.clone();
                }
                let text = &pending.state.text;
                match text.strip_prefix(self.streamed.as_str()) {
                    Some(fresh) => write!(out, "{}", fresh)?,
                    None => write!(out, "{}{}", self.newline, text)?,
                }
                self.streamed = text.clone();
            }
            TranscriptEvent::MessageFinalized { message } => {
                let content = &message.content;
                match content.strip_prefix(self.streamed.as_str()) {
                    Some(rest) => write!(out, "{}", rest)?,
                    None => write!(out, "{}{}", self.newline, content)?,
                }
                write!(out, "{}", self.newline)?;
                self.footer(message, out)?;
                self.streamed.clear();
                self.activity = None;
            }
            TranscriptEvent::PendingDiscarded { .. } => {
                write!(out, "{}[discarded]{}", self.newline, self.newline)?;
                self.streamed.clear();
            }
            TranscriptEvent::InputPreview { text } => {
                if text.is_empty() {
                    self.close_preview(out)?;
                } else {
                    write!(out, "\r\x1b[2K> {}", text)?;
                    self.preview_open = true;
                }
            }
            TranscriptEvent::Replaced {
                session_id,
                read_only,
                message_count,
            } => {
                self.close_preview(out)?;
                write!(
                    out,
                    "--- conversation {} ({} messages{}) ---{}",
                    session_id,
                    message_count,
                    if *read_only { ", read-only" } else { "" },
                    self.newline
                )?;
            }
        }
        out.flush()
    }

    /// Print a finalized message in full
    pub fn print_message(&mut self, message: &Message, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{}> {}{}", label(message.role), message.content, self.newline)?;
        self.footer(message, out)
    }

    fn footer(&self, message: &Message, out: &mut impl Write) -> io::Result<()> {
        if let Some(error) = &message.error {
            write!(out, "  [error: {}]{}", error, self.newline)?;
        }
        let reasoning = message.reasoning_text();
        if !reasoning.is_empty() {
            write!(
                out,
                "  [reasoning: {}]{}",
                truncate_chars(&reasoning, TOOL_PREVIEW_CHARS),
                self.newline
            )?;
        }
        if let Some(summary) = message.metadata.as_ref().and_then(metadata_summary) {
            write!(out, "  [{}]{}", summary, self.newline)?;
        }
        Ok(())
    }

    fn close_preview(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.preview_open {
            write!(out, "\r\x1b[2K")?;
            self.preview_open = false;
        }
        Ok(())
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

/// One-line summary of tools, tokens, cost and trace id
fn metadata_summary(metadata: &MessageMetadata) -> Option<String> {
    let mut parts = Vec::new();
    if !metadata.tool_calls.is_empty() {
        let names: Vec<&str> = metadata
            .tool_calls
            .iter()
            .map(|call| {
                call.get("name")
                    .or_else(|| call.pointer("/function/name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("tool")
            })
            .collect();
        parts.push(format!(
            "tools: {}",
            truncate_chars(&names.join(", "), TOOL_PREVIEW_CHARS)
        ));
    }
    if let Some(usage) = &metadata.usage {
        parts.push(format!(
            "tokens: {} in, {} out",
            usage.input_tokens, usage.output_tokens
        ));
    }
    if let Some(cost) = metadata.estimated_cost_usd {
        parts.push(format!("cost: ${:.4}", cost));
    } else if metadata.missing_model_pricing {
        parts.push("cost: unpriced model".to_string());
    }
    if let Some(id) = metadata.trace_log_id {
        parts.push(format!("trace #{}", id));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}
