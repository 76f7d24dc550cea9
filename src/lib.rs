pub mod config;
pub mod connection;
pub mod error;
pub mod intercept;
pub mod relay;
pub mod server;
pub mod websocket;

pub use config::Config;
pub use error::{Error, Result};
pub use intercept::Interceptor;
pub use relay::{ConnectionPair, Relay};
pub use server::RelayServer;
