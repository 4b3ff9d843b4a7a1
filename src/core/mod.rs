//! Core module - platform-independent race engine
//!
//! Pure state machines and the wire protocol. Nothing in here opens a
//! socket or touches the filesystem; the trait seams in [`io`] are the
//! only way in or out.

pub mod connection;
pub mod constants;
pub mod error;
pub mod identity;
pub mod io;
pub mod metrics;
pub mod protocol;
pub mod race;
pub mod rematch;
pub mod roster;
pub mod session;
pub mod timers;
pub mod typing;

pub use connection::{BackoffPolicy, ConnectionManager, Retry};
pub use io::{EventSource, IdentityStore, IntentSink, LinkStatus, RaceDirectory, WireEvent};
pub use protocol::{Event, Intent, Participant, RaceInfo, Standing};
pub use race::{Phase, RaceMachine, ResultsSource};
pub use roster::Roster;
pub use session::{RaceSession, SessionEvent};
pub use typing::{InputEvent, TypingTracker};
