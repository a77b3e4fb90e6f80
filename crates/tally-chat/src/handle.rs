//! A cloneable handle onto the shared conversation.

use parking_lot::Mutex;
use std::sync::Arc;
use tally_ai::{Message, PendingMessage, SessionId};
use tokio::sync::broadcast;

use crate::conversation::ConversationStore;
use crate::error::{Error, Result};
use crate::events::TranscriptEvent;

/// Capacity of the transcript event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What currently owns the right to mutate the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Sending,
    Replaying,
}

/// A cloneable handle onto one conversation.
///
/// All fields are `Arc`-wrapped, so cloning is cheap. The store lock is
/// never held across an `.await`. When both locks are needed the store is
/// locked before the activity.
#[derive(Clone)]
pub struct ChatHandle {
    store: Arc<Mutex<ConversationStore>>,
    events: broadcast::Sender<TranscriptEvent>,
    activity: Arc<Mutex<Activity>>,
}

impl Default for ChatHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatHandle {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = ConversationStore::new().with_notifier(events.clone());
        Self {
            store: Arc::new(Mutex::new(store)),
            events,
            activity: Arc::new(Mutex::new(Activity::Idle)),
        }
    }

    /// Subscribe to transcript changes
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    /// Run `f` with exclusive access to the store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut ConversationStore) -> R) -> R {
        f(&mut *self.store.lock())
    }

    /// Snapshot of the finalized messages
    pub fn messages(&self) -> Vec<Message> {
        self.store.lock().messages().to_vec()
    }

    /// Snapshot of the pending message
    pub fn pending(&self) -> Option<PendingMessage> {
        self.store.lock().pending().cloned()
    }

    pub fn session_id(&self) -> SessionId {
        self.store.lock().session_id().clone()
    }

    pub fn activity(&self) -> Activity {
        *self.activity.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.activity() == Activity::Idle
    }

    /// Claim the conversation for `activity`. Fails if anything else holds it.
    pub fn try_claim(&self, activity: Activity) -> bool {
        let mut current = self.activity.lock();
        if *current != Activity::Idle {
            return false;
        }
        *current = activity;
        true
    }

    /// Give up a claim. A no-op when `activity` is not the current holder.
    pub fn release(&self, activity: Activity) {
        let mut current = self.activity.lock();
        if *current == activity {
            *current = Activity::Idle;
        }
    }

    /// Claim the conversation for one send; released when the guard drops.
    pub fn begin_send(&self) -> Result<SendGuard> {
        let mut current = self.activity.lock();
        match *current {
            Activity::Idle => {
                *current = Activity::Sending;
                Ok(SendGuard {
                    handle: self.clone(),
                })
            }
            Activity::Sending => Err(Error::SendInProgress),
            Activity::Replaying => Err(Error::ReplayActive),
        }
    }

    /// Start a new chat with a fresh session id. Refused while busy.
    ///
    /// The activity lock is held across the reset so no send can claim the
    /// conversation in between.
    pub fn new_chat(&self) -> Result<SessionId> {
        let mut store = self.store.lock();
        let current = self.activity.lock();
        match *current {
            Activity::Idle => Ok(store.reset_session()),
            Activity::Sending => Err(Error::SendInProgress),
            Activity::Replaying => Err(Error::ReplayActive),
        }
    }
}

/// Held for the duration of a send
pub struct SendGuard {
    handle: ChatHandle,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.handle.release(Activity::Sending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_ai::Role;

    #[test]
    fn test_send_guard_releases_on_drop() {
        let handle = ChatHandle::new();
        {
            let _guard = handle.begin_send().unwrap();
            assert_eq!(handle.activity(), Activity::Sending);
            assert!(matches!(handle.begin_send(), Err(Error::SendInProgress)));
            assert!(!handle.try_claim(Activity::Replaying));
        }
        assert!(handle.is_idle());
    }

    #[test]
    fn test_send_refused_during_replay() {
        let handle = ChatHandle::new();
        assert!(handle.try_claim(Activity::Replaying));
        assert!(matches!(handle.begin_send(), Err(Error::ReplayActive)));
        assert!(matches!(handle.new_chat(), Err(Error::ReplayActive)));
    }

    #[test]
    fn test_release_ignores_other_holder() {
        let handle = ChatHandle::new();
        assert!(handle.try_claim(Activity::Replaying));
        handle.release(Activity::Sending);
        assert_eq!(handle.activity(), Activity::Replaying);
        handle.release(Activity::Replaying);
        assert!(handle.is_idle());
    }

    #[test]
    fn test_clones_share_store() {
        let handle = ChatHandle::new();
        let other = handle.clone();
        other.with_store(|store| store.append(Message::user("shared")));
        assert_eq!(handle.messages().len(), 1);
    }

    #[test]
    fn test_new_chat_keeps_an_active_send_intact() {
        let handle = ChatHandle::new();
        let before = handle.session_id();
        let guard = handle.begin_send().unwrap();
        handle.with_store(|store| store.start_pending(Role::Assistant)).unwrap();

        assert!(matches!(handle.new_chat(), Err(Error::SendInProgress)));
        assert_eq!(handle.session_id(), before);
        assert!(handle.pending().is_some());

        drop(guard);
        handle.with_store(|store| store.discard_pending());
        let after = handle.new_chat().unwrap();
        assert_ne!(after, before);
    }

    #[test]
    fn test_new_chat_never_wipes_a_claimed_send() {
        let handle = ChatHandle::new();
        let racer = handle.clone();
        let sender = std::thread::spawn(move || {
            let _guard = racer.begin_send().unwrap();
            racer
                .with_store(|store| store.start_pending(Role::Assistant))
                .unwrap();
        });
        let _ = handle.new_chat();
        sender.join().unwrap();

        // whichever ran first, the send's pending message survives
        assert!(handle.pending().is_some());
    }
}
