//! stream-my-command: run a command once, stream its output to every client.
//!
//! Library exposing the server's modules for testing and reuse. The binary in
//! `main.rs` wires them to configuration and a TCP listener.

pub mod arguments;
pub mod command;
pub mod registry;
pub mod rfc7233;
pub mod telemetry;
pub mod web;

pub use web::{router, AppState};
