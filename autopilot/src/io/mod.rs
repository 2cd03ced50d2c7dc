//! Side-effecting helpers: configuration files and the host control channel.

pub mod channel;
pub mod config;
pub mod replay;
