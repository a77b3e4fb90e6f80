//! Slash commands for interactive mode

/// Result of parsing a slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Start a new chat with a fresh session id
    NewChat,
    /// Load a persisted conversation (read-only)
    Load(String),
    /// Show the current session
    Session,
    /// Show a message to the user
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse a slash command; `None` when `input` is a chat message.
pub fn parse_command(input: &str) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next().unwrap_or("").to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "new" | "n" | "clear" => CommandResult::NewChat,

        "load" | "l" => {
            if args.is_empty() {
                CommandResult::Message("Usage: /load <conversation-id>".to_string())
            } else {
                CommandResult::Load(args.to_string())
            }
        }

        "session" | "s" => CommandResult::Session,

        "quit" | "exit" | "q" => CommandResult::Exit,

        _ => CommandResult::Unknown(command),
    })
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?          Show this help message
  /new, /n               Start a new chat
  /load, /l <id>         View a past conversation (read-only)
  /session, /s           Show the current conversation id
  /quit, /exit, /q       Exit"#
        .to_string()
}
