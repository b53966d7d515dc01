//! The bridge server.
//!
//! This module provides:
//! - The lifecycle orchestrator (`bridge`)
//! - Listener and TLS construction (`listener`)
//! - The control-plane gRPC service (`control`)
//! - Configuration types (`config`)
//!
//! # Transports
//!
//! TCP and, on Unix, Unix domain sockets. TLS applies to both.

mod bridge;
pub mod config;
pub mod control;
pub mod listener;

pub use bridge::{Bridge, BridgeState, ServerOption, StopHandle};
pub use control::ControlServer;
pub use listener::ListenAddr;
