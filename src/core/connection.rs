//! Connection policy
//!
//! The pure half of the connection manager: reconnect backoff, the
//! pending-intent queue, and the rules for what happens after a socket
//! closes. `net::websocket` executes these decisions from its client
//! thread; tests drive the policy directly.

use std::collections::VecDeque;
use std::time::Duration;

use crate::core::constants::{
    RECONNECT_BASE_DELAY, RECONNECT_FACTOR, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY,
};
use crate::core::io::LinkStatus;
use crate::core::protocol::Intent;

// =============================================================================
// BACKOFF
// =============================================================================

/// Reconnect backoff schedule. Defaults to 1s doubling up to 10s over
/// five attempts; the configuration layer can override the knobs.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: RECONNECT_BASE_DELAY,
            factor: RECONNECT_FACTOR,
            cap: RECONNECT_MAX_DELAY,
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

// =============================================================================
// DECISIONS
// =============================================================================

/// What the transport should do with an intent handed to `dispatch`.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// Connected: put it on the wire now.
    Now(Intent),
    /// Not connected: it joined the pending queue.
    Queued,
}

/// What the transport should do after a closure or failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Wait this long, then attempt to reconnect.
    After(Duration),
    /// Do not reconnect (clean close, or the race is already decided).
    No,
    /// Attempts exhausted; hold for a manual retry.
    GiveUp,
    /// The network itself is down; probe for connectivity without
    /// spending attempts.
    Offline,
}

// =============================================================================
// MANAGER
// =============================================================================

/// Link state, attempt counting and the FIFO pending-intent queue.
#[derive(Debug)]
pub struct ConnectionManager {
    policy: BackoffPolicy,
    status: LinkStatus,
    attempt: u32,
    offline: bool,
    ever_connected: bool,
    pending: VecDeque<Intent>,
}

impl ConnectionManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            status: LinkStatus::Disconnected,
            attempt: 0,
            offline: false,
            ever_connected: false,
            pending: VecDeque::new(),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Route an intent: straight through when connected, FIFO-queued
    /// otherwise. Queue order is never rearranged.
    pub fn dispatch(&mut self, intent: Intent) -> Dispatch {
        if self.status == LinkStatus::Connected {
            Dispatch::Now(intent)
        } else {
            self.pending.push_back(intent);
            Dispatch::Queued
        }
    }

    /// An attempt is starting.
    pub fn connecting(&mut self) {
        self.status = if self.ever_connected {
            LinkStatus::Reconnecting
        } else {
            LinkStatus::Connecting
        };
    }

    /// The socket opened. Resets the backoff and hands back every queued
    /// intent, in original order, for immediate flush.
    pub fn opened(&mut self) -> Vec<Intent> {
        self.status = LinkStatus::Connected;
        self.attempt = 0;
        self.offline = false;
        self.ever_connected = true;
        self.pending.drain(..).collect()
    }

    /// An established socket closed. `clean` means a normal-closure code
    /// from either side; `race_over` is the session's finished flag.
    /// Neither of those reconnects.
    pub fn closed(&mut self, clean: bool, race_over: bool) -> Retry {
        if clean || race_over {
            self.status = LinkStatus::Disconnected;
            return Retry::No;
        }
        self.next_attempt()
    }

    /// A connect attempt failed before the socket opened. While the
    /// network itself is unreachable, attempts are suppressed rather
    /// than spent; the first failure after connectivity returns starts
    /// a fresh round.
    pub fn connect_failed(&mut self, network_down: bool) -> Retry {
        if network_down {
            self.offline = true;
            self.status = LinkStatus::Reconnecting;
            return Retry::Offline;
        }
        if self.offline {
            self.offline = false;
            self.attempt = 0;
        }
        self.next_attempt()
    }

    /// Manual retry from the terminal failed state: the counter resets
    /// to zero and a fresh round is scheduled.
    pub fn manual_retry(&mut self) -> Retry {
        self.attempt = 0;
        self.offline = false;
        self.next_attempt()
    }

    /// Unmount: queued intents are dropped, never sent later.
    pub fn shutdown(&mut self) {
        self.status = LinkStatus::Disconnected;
        self.pending.clear();
    }

    fn next_attempt(&mut self) -> Retry {
        if self.attempt >= self.policy.max_attempts {
            self.status = LinkStatus::Failed;
            return Retry::GiveUp;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.status = LinkStatus::Reconnecting;
        Retry::After(delay)
    }
}
