//! machined: per-host cluster membership and process management over UDP.

pub mod client;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod launcher;
pub mod listeners;
pub mod probe;
pub mod registry;
pub mod service;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod users;
pub mod wire;
