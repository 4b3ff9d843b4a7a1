//! Native adapters
//!
//! Real implementations of the `core::io` trait seams: the threaded
//! WebSocket client, the REST directory, the file identity store, plus
//! configuration and logging setup for embedders.

pub mod config;
pub mod logging;
pub mod rest;
pub mod storage;
pub mod websocket;

pub use config::{ConfigError, EngineConfig};
pub use logging::init_logging;
pub use rest::HttpRaceDirectory;
pub use storage::FileIdentityStore;
pub use websocket::RaceClient;
