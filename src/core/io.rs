//! I/O trait seams
//!
//! The session core never touches sockets, disks or HTTP directly; it is
//! generic over the traits here. `net` provides the real implementations,
//! tests use the mocks at the bottom of this module.

use crate::core::error::{DirectoryError, StoreError, TransportError};
use crate::core::identity::SelfRecord;
use crate::core::protocol::{Event, Intent, QuickMatch, RaceSnapshot};

// =============================================================================
// LINK STATUS
// =============================================================================

/// Connection lifecycle as observed by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection attempts are exhausted; only a manual retry leaves
    /// this state.
    Failed,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkStatus::Connected)
    }
}

/// One item from the transport, in strict delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Status(LinkStatus),
    Envelope(Event),
    /// Transport-level fault detail, for the connection banner.
    Fault(String),
}

// =============================================================================
// TRAITS
// =============================================================================

/// Sends intents toward the server. Queueing while disconnected is the
/// transport's concern; the session just hands intents over.
pub trait IntentSink {
    fn send(&mut self, intent: Intent) -> Result<(), TransportError>;

    /// Drop and re-establish the connection. From the terminal failed
    /// state this acts as the manual retry and resets the attempt
    /// counter.
    fn request_reconnect(&mut self);

    /// Mark the race decided, so an unclean closure after this point no
    /// longer reconnects.
    fn mark_race_over(&mut self);

    /// Close cleanly; no reconnection will follow and queued intents are
    /// discarded.
    fn close(&mut self);
}

/// Receives wire events, non-blocking.
pub trait EventSource {
    fn poll_event(&mut self) -> Option<WireEvent>;
}

/// Durable self-identity records, one per race id.
pub trait IdentityStore {
    fn load(&self, race_id: &str) -> Option<SelfRecord>;
    fn save(&mut self, record: &SelfRecord) -> Result<(), StoreError>;
    fn clear(&mut self, race_id: &str) -> Result<(), StoreError>;
}

/// REST collaborators: race snapshots and quick-match creation.
pub trait RaceDirectory {
    fn fetch_race(&self, race_id: &str) -> Result<RaceSnapshot, DirectoryError>;
    fn quick_match(&self) -> Result<QuickMatch, DirectoryError>;
}

// =============================================================================
// MOCKS (for tests)
// =============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;

    /// Sink that records everything it is handed.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub sent: Vec<Intent>,
        pub reconnect_requests: u32,
        pub race_over_marks: u32,
        pub close_calls: u32,
        /// When set, `send` reports a full queue without recording.
        pub fail_sends: bool,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Tag names of everything sent, in order.
        pub fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent.iter().map(|i| i.kind()).collect()
        }

        pub fn count_kind(&self, kind: &str) -> usize {
            self.sent.iter().filter(|i| i.kind() == kind).count()
        }
    }

    impl IntentSink for RecordingSink {
        fn send(&mut self, intent: Intent) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::QueueFull);
            }
            self.sent.push(intent);
            Ok(())
        }

        fn request_reconnect(&mut self) {
            self.reconnect_requests += 1;
        }

        fn mark_race_over(&mut self) {
            self.race_over_marks += 1;
        }

        fn close(&mut self) {
            self.close_calls += 1;
        }
    }

    /// Source that replays a scripted wire sequence.
    #[derive(Debug, Default)]
    pub struct ScriptedSource {
        pub queue: VecDeque<WireEvent>,
    }

    impl ScriptedSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, item: WireEvent) {
            self.queue.push_back(item);
        }

        pub fn push_envelope(&mut self, event: Event) {
            self.queue.push_back(WireEvent::Envelope(event));
        }

        pub fn push_status(&mut self, status: LinkStatus) {
            self.queue.push_back(WireEvent::Status(status));
        }
    }

    impl EventSource for ScriptedSource {
        fn poll_event(&mut self) -> Option<WireEvent> {
            self.queue.pop_front()
        }
    }

    /// Directory serving canned responses, with call counters.
    #[derive(Debug, Default)]
    pub struct MemoryDirectory {
        pub snapshot: Option<RaceSnapshot>,
        pub quick: Option<QuickMatch>,
        pub fetch_calls: Cell<u32>,
        pub quick_calls: Cell<u32>,
    }

    impl RaceDirectory for MemoryDirectory {
        fn fetch_race(&self, _race_id: &str) -> Result<RaceSnapshot, DirectoryError> {
            self.fetch_calls.set(self.fetch_calls.get() + 1);
            self.snapshot
                .clone()
                .ok_or(DirectoryError::Status(404))
        }

        fn quick_match(&self) -> Result<QuickMatch, DirectoryError> {
            self.quick_calls.set(self.quick_calls.get() + 1);
            self.quick.clone().ok_or(DirectoryError::Status(503))
        }
    }
}
