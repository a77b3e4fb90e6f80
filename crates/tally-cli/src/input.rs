//! Replay key handling

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::config::ReplayKeys;

/// What a key press asks the replay to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayAction {
    /// Let the next user turn start typing
    Step,
    TogglePause,
    /// Cancel the replay
    Stop,
    /// Ctrl+C
    Interrupt,
    Ignore,
}

/// Keys bound to the replay actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMap {
    step: KeyCode,
    pause: KeyCode,
    stop: KeyCode,
}

impl KeyMap {
    pub fn from_config(keys: &ReplayKeys) -> anyhow::Result<Self> {
        let lookup = |name: &str| {
            parse_key(name).ok_or_else(|| anyhow::anyhow!("unknown key name '{}' in [replay.keys]", name))
        };
        Ok(Self {
            step: lookup(&keys.step)?,
            pause: lookup(&keys.pause)?,
            stop: lookup(&keys.stop)?,
        })
    }

    /// Map a key event. Bound keys only match without modifiers.
    pub fn action(&self, event: KeyEvent) -> ReplayAction {
        let KeyEvent {
            code,
            modifiers,
            kind,
            ..
        } = event;

        if kind == KeyEventKind::Release {
            return ReplayAction::Ignore;
        }
        if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
            return ReplayAction::Interrupt;
        }
        if !modifiers.is_empty() {
            return ReplayAction::Ignore;
        }

        if code == self.step {
            ReplayAction::Step
        } else if code == self.pause {
            ReplayAction::TogglePause
        } else if code == self.stop {
            ReplayAction::Stop
        } else {
            ReplayAction::Ignore
        }
    }
}

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            step: KeyCode::Enter,
            pause: KeyCode::Char(' '),
            stop: KeyCode::Esc,
        }
    }
}

/// Parse a key name: "enter", "space", "esc", "tab", "f1".."f12", or a
/// single character.
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let lower = name.trim().to_lowercase();
    let code = match lower.as_str() {
        "enter" | "return" => KeyCode::Enter,
        "space" => KeyCode::Char(' '),
        "esc" | "escape" => KeyCode::Esc,
        "tab" => KeyCode::Tab,
        "backspace" => KeyCode::Backspace,
        other => {
            if let Some(n) = other.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                if (1..=12).contains(&n) {
                    return Some(KeyCode::F(n));
                }
                return None;
            }
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => KeyCode::Char(c),
                _ => return None,
            }
        }
    };
    Some(code)
}
