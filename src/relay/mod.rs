//! Relay between a client WebSocket and the configured upstream
//!
//! The relay is split the same way as a sans-io protocol layer: a pure state
//! machine ([`Relay`]) that consumes [`RelayEvent`]s and emits
//! [`RelayCommand`]s, and an async driver ([`ConnectionPair`]) that owns the
//! sockets and translates between the two.

pub mod commands;
pub mod events;
pub mod machine;
pub mod pair;

pub use commands::RelayCommand;
pub use events::RelayEvent;
pub use machine::{Relay, RelayState};
pub use pair::{connect_upstream, ConnectionPair, UpstreamSocket};
