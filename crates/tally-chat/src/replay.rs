//! Replay: paced re-streaming of a finished conversation
//!
//! A replay walks a list of finalized messages and feeds them back through
//! the same assembler events a live stream produces, at human-like speed.
//! User turns are "typed" into the input preview after a step signal;
//! assistant turns stream their reasoning, then their answer, into a pending
//! message that is finalized with the original metadata.
//!
//! Cancellation is generation based: every start and stop bumps a counter in
//! [`ReplayControl`], and a running replay re-checks its captured generation
//! after every suspension and before every store mutation.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tally_ai::{DonePayload, Message, Role, StreamEvent};
use tokio::task::JoinHandle;

use crate::conversation::ConversationStore;
use crate::handle::{Activity, ChatHandle};

/// Upper bound on a single sleep slice, and so on pause/cancel latency
pub const MAX_TICK_MS: u64 = 60;

/// Inclusive integer range sampled uniformly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub min: u64,
    pub max: u64,
}

impl Span {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        rng.gen_range(lo..=hi)
    }
}

/// Chunk sizes (in characters) and delays (in milliseconds) for each phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayPacing {
    pub user_chunk: Span,
    pub user_delay_ms: Span,
    pub reasoning_chunk: Span,
    pub reasoning_delay_ms: Span,
    pub answer_chunk: Span,
    pub answer_delay_ms: Span,
    /// Sleep slice between pause and cancellation checks
    pub tick_ms: u64,
}

impl Default for ReplayPacing {
    fn default() -> Self {
        Self {
            user_chunk: Span::new(1, 2),
            user_delay_ms: Span::new(24, 58),
            reasoning_chunk: Span::new(2, 6),
            reasoning_delay_ms: Span::new(4, 12),
            answer_chunk: Span::new(2, 7),
            answer_delay_ms: Span::new(5, 14),
            tick_ms: MAX_TICK_MS,
        }
    }
}

impl ReplayPacing {
    /// Sleep slice, clamped to `1..=MAX_TICK_MS`
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.clamp(1, MAX_TICK_MS))
    }

    fn spans(&self, target: Target) -> (Span, Span) {
        match target {
            Target::Preview => (self.user_chunk, self.user_delay_ms),
            Target::Reasoning => (self.reasoning_chunk, self.reasoning_delay_ms),
            Target::Answer => (self.answer_chunk, self.answer_delay_ms),
        }
    }
}

/// Shared pause/step/cancel state for one chat surface.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct ReplayControl {
    generation: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    step: Arc<AtomicBool>,
}

impl ReplayControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate every running replay; returns the new generation.
    pub fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }

    /// Flip the pause flag; returns the new value.
    pub fn toggle_pause(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Let a waiting user turn start typing. Latched until consumed.
    pub fn request_step(&self) {
        self.step.store(true, Ordering::Release);
    }

    /// Consume a pending step signal
    pub fn take_step(&self) -> bool {
        self.step.swap(false, Ordering::AcqRel)
    }

    fn clear_step(&self) {
        self.step.store(false, Ordering::Release);
    }
}

/// How a replay task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed,
    /// A newer generation took over, or the replay was stopped
    Cancelled,
}

/// The run no longer owns the store
struct Superseded;

type Step<T> = std::result::Result<T, Superseded>;

#[derive(Debug, Clone, Copy)]
enum Target {
    Preview,
    Reasoning,
    Answer,
}

/// Starts, steers and stops replays on one chat handle
pub struct ReplayScheduler {
    handle: ChatHandle,
    control: ReplayControl,
    pacing: ReplayPacing,
    seed: Option<u64>,
    auto_step: bool,
}

impl ReplayScheduler {
    pub fn new(handle: ChatHandle) -> Self {
        Self {
            handle,
            control: ReplayControl::new(),
            pacing: ReplayPacing::default(),
            seed: None,
            auto_step: false,
        }
    }

    pub fn with_pacing(mut self, pacing: ReplayPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Seed the pacing RNG for reproducible chunking
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Type user turns without waiting for a step signal
    pub fn with_auto_step(mut self, auto_step: bool) -> Self {
        self.auto_step = auto_step;
        self
    }

    pub fn control(&self) -> &ReplayControl {
        &self.control
    }

    pub fn handle(&self) -> &ChatHandle {
        &self.handle
    }

    /// Replay `messages` into the store.
    ///
    /// A no-op returning `None` while a send or another replay holds the
    /// conversation.
    pub fn start(&self, messages: Vec<Message>) -> Option<JoinHandle<ReplayOutcome>> {
        // Claim and generation change together under the store lock, the
        // same order `stop` takes them.
        let generation = self.handle.with_store(|store| {
            if !self.handle.try_claim(Activity::Replaying) {
                return None;
            }
            let generation = self.control.advance();
            self.control.set_paused(false);
            self.control.clear_step();
            store.begin_playback();
            Some(generation)
        });
        let Some(generation) = generation else {
            tracing::debug!(activity = ?self.handle.activity(), "replay not started, conversation busy");
            return None;
        };
        tracing::debug!(generation, messages = messages.len(), "starting replay");

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let run = ReplayRun {
            handle: self.handle.clone(),
            control: self.control.clone(),
            pacing: self.pacing.clone(),
            auto_step: self.auto_step,
            generation,
            rng,
        };
        Some(tokio::spawn(run.play(messages)))
    }

    /// Cancel the running replay.
    ///
    /// What was already emitted stays; a half-streamed assistant message is
    /// finalized with the abort rule.
    pub fn stop(&self) {
        self.handle.with_store(|store| {
            let generation = self.control.advance();
            self.control.set_paused(false);
            if self.is_running() {
                tracing::debug!(generation, "replay stopped");
                store.finalize_pending(|pending| pending.abort());
                store.clear_input_preview();
                self.handle.release(Activity::Replaying);
            }
        });
    }

    /// Flip the pause flag; returns whether the replay is now paused.
    pub fn toggle_pause(&self) -> bool {
        self.control.toggle_pause()
    }

    pub fn step(&self) {
        self.control.request_step();
    }

    pub fn is_running(&self) -> bool {
        self.handle.activity() == Activity::Replaying
    }
}

/// One replay task, bound to the generation it was started with
struct ReplayRun {
    handle: ChatHandle,
    control: ReplayControl,
    pacing: ReplayPacing,
    auto_step: bool,
    generation: u64,
    rng: StdRng,
}

impl ReplayRun {
    async fn play(mut self, messages: Vec<Message>) -> ReplayOutcome {
        let played = self.play_all(&messages).await;
        let released = played.and_then(|()| {
            self.apply(|store| {
                store.clear_input_preview();
                self.handle.release(Activity::Replaying);
            })
        });
        match released {
            Ok(()) => {
                tracing::debug!(generation = self.generation, "replay finished");
                ReplayOutcome::Completed
            }
            Err(Superseded) => {
                tracing::debug!(generation = self.generation, "replay superseded");
                ReplayOutcome::Cancelled
            }
        }
    }

    async fn play_all(&mut self, messages: &[Message]) -> Step<()> {
        for message in messages {
            match message.role {
                Role::User => self.play_user(message).await?,
                Role::Assistant => self.play_assistant(message).await?,
            }
        }
        Ok(())
    }

    async fn play_user(&mut self, message: &Message) -> Step<()> {
        if !self.auto_step {
            self.wait_for_step().await?;
        }
        self.type_out(&message.content, Target::Preview).await?;
        let committed = message.clone();
        self.apply(|store| {
            store.clear_input_preview();
            store.append(committed);
        })
    }

    async fn play_assistant(&mut self, original: &Message) -> Step<()> {
        if let Err(e) = self.apply(|store| store.start_pending(Role::Assistant))? {
            tracing::warn!("cannot replay assistant turn: {}", e);
            return Err(Superseded);
        }

        let reasoning = original.reasoning_text();
        self.type_out(&reasoning, Target::Reasoning).await?;
        self.type_out(&original.content, Target::Answer).await?;

        let finalized = self.apply(|store| {
            store
                .finalize_pending(|pending| {
                    let mut message = pending.complete(DonePayload::from_message(original));
                    message.metadata = original.metadata.clone();
                    message.termination = original.termination;
                    message
                })
                .is_some()
        })?;
        if finalized { Ok(()) } else { Err(Superseded) }
    }

    /// Emit `text` in randomly sized chunks with a paced delay before each.
    async fn type_out(&mut self, text: &str, target: Target) -> Step<()> {
        let (size, delay) = self.pacing.spans(target);
        let mut rest = text;
        while !rest.is_empty() {
            self.pace(delay).await?;
            let count = size.sample(&mut self.rng).max(1) as usize;
            let (chunk, tail) = split_chars(rest, count);
            rest = tail;

            let event = match target {
                Target::Preview => {
                    self.apply(|store| store.push_input_preview(chunk))?;
                    continue;
                }
                Target::Reasoning => StreamEvent::ReasoningDelta {
                    delta: chunk.to_string(),
                },
                Target::Answer => StreamEvent::TextDelta {
                    delta: chunk.to_string(),
                },
            };
            let applied = self.apply(|store| {
                store.mutate_pending(|pending| pending.process_event(event))
            })?;
            if applied.is_none() {
                return Err(Superseded);
            }
        }
        Ok(())
    }

    /// Mutate the store if this run still holds the current generation.
    fn apply<R>(&self, f: impl FnOnce(&mut ConversationStore) -> R) -> Step<R> {
        self.handle.with_store(|store| {
            if self.control.is_current(self.generation) {
                Ok(f(store))
            } else {
                Err(Superseded)
            }
        })
    }

    fn check(&self) -> Step<()> {
        if self.control.is_current(self.generation) {
            Ok(())
        } else {
            Err(Superseded)
        }
    }

    async fn pace(&mut self, span: Span) -> Step<()> {
        let delay = Duration::from_millis(span.sample(&mut self.rng));
        self.sleep(delay).await
    }

    /// The single wait primitive: sleeps in slices of at most one tick,
    /// stalling while paused and re-checking the generation after each slice.
    async fn sleep(&self, total: Duration) -> Step<()> {
        let tick = self.pacing.tick();
        let mut remaining = total;
        loop {
            self.check()?;
            if self.control.is_paused() {
                tokio::time::sleep(tick).await;
                continue;
            }
            if remaining.is_zero() {
                return Ok(());
            }
            let slice = remaining.min(tick);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
    }

    async fn wait_for_step(&self) -> Step<()> {
        loop {
            self.check()?;
            if self.control.take_step() {
                return Ok(());
            }
            self.sleep(self.pacing.tick()).await?;
        }
    }
}

/// Split after `count` characters, never inside a UTF-8 sequence
fn split_chars(text: &str, count: usize) -> (&str, &str) {
    let at = text
        .char_indices()
        .nth(count)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text.split_at(at)
}
