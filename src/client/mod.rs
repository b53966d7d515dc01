//! Client library for talking to a running bridge.
//!
//! Provides [`BridgeClient`], which calls proxied methods with raw message
//! bytes and drives the control service.

mod bridge_client;

pub use bridge_client::BridgeClient;
