// KeySprint race engine

//! Client-side synchronization engine for multiplayer typing races.
//!
//! The [`core`] module holds the pure state machines: connection
//! lifecycle, protocol codec, race phases, roster, typing tracker and
//! the [`core::session::RaceSession`] that ties them together. The
//! [`net`] module provides the real WebSocket, REST and storage
//! adapters behind the `core::io` traits.

pub mod core;
pub mod net;
