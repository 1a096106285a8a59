#![doc = include_str!("../README.md")]

pub mod channel;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod limiter;
pub mod lock;
pub mod message;
pub mod store;

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
