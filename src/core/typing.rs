//! Typing progress tracker
//!
//! The local participant's model of one race: per-character verdicts
//! against the target text, live stats, the extension latch, and the
//! finish/timeout latches. Every committed mutation produces the wire
//! intents the server expects, exactly once each.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::metrics::{accuracy, net_wpm};
use crate::core::protocol::Intent;

// =============================================================================
// INPUT
// =============================================================================

/// Outcome recorded at one target position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not typed yet (or reclaimed by backspace).
    Pending,
    Correct,
    Incorrect,
}

/// One committed mutation from the input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// Committed characters: a plain keystroke or a whole IME
    /// composition. Either way it is a single mutation.
    Chars(String),
    /// One backspace step.
    Backspace,
    Paste,
    Cut,
}

/// Why an input event mutated nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRejection {
    /// Paste and cut never count as typing.
    Clipboard,
    /// This tracker already finished or timed out.
    RaceOver,
}

/// What one input event produced.
#[derive(Debug, Default)]
pub struct InputOutcome {
    /// Wire intents to transmit, in order.
    pub intents: Vec<Intent>,
    /// The final target char was just typed.
    pub finished: bool,
    pub rejection: Option<InputRejection>,
}

// =============================================================================
// STATS
// =============================================================================

/// Live stats snapshot for the local participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub chars_typed: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub errors: u32,
}

impl Stats {
    pub fn progress_intent(&self) -> Intent {
        Intent::Progress {
            chars_typed: self.chars_typed,
            wpm: self.wpm,
            accuracy: self.accuracy,
            errors: self.errors,
        }
    }

    pub fn finish_intent(&self, elapsed_ms: u64) -> Intent {
        Intent::Finish {
            chars_typed: self.chars_typed,
            wpm: self.wpm,
            accuracy: self.accuracy,
            errors: self.errors,
            elapsed_ms,
        }
    }

    pub fn timed_finish_intent(&self) -> Intent {
        Intent::TimedFinish {
            chars_typed: self.chars_typed,
            wpm: self.wpm,
            accuracy: self.accuracy,
            errors: self.errors,
        }
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Tracks one participant's typing against the target text.
///
/// Characters compare case-sensitively at the current index and the
/// index always advances, so a mistake must be backspaced before the
/// right character can land. Backspace reclaims the verdict (and the
/// error, when the verdict was incorrect).
#[derive(Debug)]
pub struct TypingTracker {
    target: Vec<char>,
    verdicts: Vec<Verdict>,
    index: usize,
    errors: u32,
    started_at: Instant,
    time_limit: Option<Duration>,
    supports_extension: bool,
    extension_threshold: f64,
    extension_requested: bool,
    finish_sent: bool,
    frozen: Option<Stats>,
}

impl TypingTracker {
    pub fn new(
        text: &str,
        started_at: Instant,
        time_limit: Option<Duration>,
        supports_extension: bool,
        extension_threshold: f64,
    ) -> Self {
        let target: Vec<char> = text.chars().collect();
        let verdicts = vec![Verdict::Pending; target.len()];
        Self {
            target,
            verdicts,
            index: 0,
            errors: 0,
            started_at,
            time_limit,
            supports_extension,
            extension_threshold,
            extension_requested: false,
            finish_sent: false,
            frozen: None,
        }
    }

    /// Feed one committed input event. At most one `progress` intent
    /// comes back per call; `finish` and `extend_paragraph` ride along
    /// when their latches trip.
    pub fn apply(&mut self, event: InputEvent, now: Instant) -> InputOutcome {
        let mut outcome = InputOutcome::default();

        if self.latched() {
            outcome.rejection = Some(InputRejection::RaceOver);
            return outcome;
        }

        match event {
            InputEvent::Paste | InputEvent::Cut => {
                outcome.rejection = Some(InputRejection::Clipboard);
                return outcome;
            }
            InputEvent::Chars(chunk) => {
                let mut mutated = false;
                for ch in chunk.chars() {
                    if self.index >= self.target.len() {
                        break;
                    }
                    self.verdicts[self.index] = if ch == self.target[self.index] {
                        Verdict::Correct
                    } else {
                        self.errors += 1;
                        Verdict::Incorrect
                    };
                    self.index += 1;
                    mutated = true;
                }
                if !mutated {
                    return outcome;
                }
            }
            InputEvent::Backspace => {
                if self.index == 0 {
                    return outcome;
                }
                self.index -= 1;
                if self.verdicts[self.index] == Verdict::Incorrect {
                    self.errors -= 1;
                }
                self.verdicts[self.index] = Verdict::Pending;
            }
        }

        let stats = self.stats(now);
        outcome.intents.push(stats.progress_intent());

        if self.is_complete() {
            self.finish_sent = true;
            outcome.finished = true;
            let elapsed_ms = self.elapsed(now).as_millis() as u64;
            outcome.intents.push(stats.finish_intent(elapsed_ms));
        } else if self.should_request_extension() {
            self.extension_requested = true;
            outcome.intents.push(Intent::ExtendParagraph);
        }

        outcome
    }

    /// Timed races only: freeze the stats and emit `timed_finish` the
    /// first time the deadline is observed past. Inert otherwise.
    pub fn check_deadline(&mut self, now: Instant) -> Option<Intent> {
        let limit = self.time_limit?;
        if self.latched() || now.saturating_duration_since(self.started_at) < limit {
            return None;
        }
        let stats = self.stats(now);
        self.frozen = Some(stats);
        debug!(
            "[TYPING] Time limit reached, stats frozen at {} chars",
            stats.chars_typed
        );
        Some(stats.timed_finish_intent())
    }

    /// Server appended paragraph text. Verdicts extend as pending and
    /// the extension latch re-arms for the next round.
    pub fn extend_target(&mut self, appended: &str) {
        for ch in appended.chars() {
            self.target.push(ch);
            self.verdicts.push(Verdict::Pending);
        }
        self.extension_requested = false;
    }

    /// Current stats. Frozen after a timeout; elapsed time is clamped
    /// to the limit so late reads cannot decay the rate.
    pub fn stats(&self, now: Instant) -> Stats {
        if let Some(frozen) = self.frozen {
            return frozen;
        }
        let typed = self.index as u32;
        Stats {
            chars_typed: typed,
            wpm: net_wpm(typed, self.errors, self.elapsed(now)),
            accuracy: accuracy(typed, self.errors),
            errors: self.errors,
        }
    }

    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn target_len(&self) -> usize {
        self.target.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.target.is_empty() && self.index >= self.target.len()
    }

    /// No further input or progress leaves this tracker.
    pub fn latched(&self) -> bool {
        self.finish_sent || self.frozen.is_some()
    }

    /// Time left on the clock, for timed races.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let limit = self.time_limit?;
        Some(limit.saturating_sub(now.saturating_duration_since(self.started_at)))
    }

    fn elapsed(&self, now: Instant) -> Duration {
        let raw = now.saturating_duration_since(self.started_at);
        match self.time_limit {
            Some(limit) => raw.min(limit),
            None => raw,
        }
    }

    fn should_request_extension(&self) -> bool {
        if !self.supports_extension || self.extension_requested || self.target.is_empty() {
            return false;
        }
        self.index as f64 >= self.target.len() as f64 * self.extension_threshold
    }
}
