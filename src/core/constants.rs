//! Engine constants - timing, reconnection, input limits
//!
//! Protocol behavior that is fixed lives here; reconnection and the
//! extension threshold can be overridden through the configuration layer.

use std::time::Duration;

// =============================================================================
// RECONNECTION
// =============================================================================

/// Delay before the first reconnection attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Multiplier applied to the reconnect delay after each failed attempt.
pub const RECONNECT_FACTOR: u32 = 2;

/// Upper bound for the reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Reconnection attempts per round before surfacing a terminal failure.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

// =============================================================================
// SESSION TIMERS
// =============================================================================

/// Interval of the elapsed-time sampler while a race is running.
pub const ELAPSED_TICK: Duration = Duration::from_millis(100);

/// Interval of the pre-race countdown tick.
pub const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Grace window between an optimistic local finish and the fallback
/// result display. An authoritative finish arriving inside the window
/// supersedes the optimistic result.
pub const RESULT_GRACE_WINDOW: Duration = Duration::from_millis(1000);

// =============================================================================
// TYPING
// =============================================================================

/// Fraction of the target text at which a paragraph extension request
/// is transmitted, for races that support extension.
pub const EXTENSION_THRESHOLD: f64 = 0.85;

/// Minimum roster size (bots included) before a race can be started.
pub const MIN_RACE_PARTICIPANTS: usize = 2;

/// Hard cap for a single outgoing chat message, in characters.
pub const MAX_CHAT_LEN: usize = 512;
