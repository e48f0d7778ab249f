//! Keeps the per-repository editor and terminal daemons of a workspace
//! sandbox running: port assignment, restart, health probing and the health
//! state machine, plus the HTTP surface and CLI on top of them.

pub mod cli;
pub mod config;
pub mod executor;
pub mod health;
pub mod health_state;
pub mod lifecycle;
pub mod metadata;
pub mod monitor;
pub mod ports;
pub mod provider;
pub mod router;
pub mod services;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
