//! Bifrost - gRPC bridge to a pool of worker processes
//!
//! Bifrost reads the services declared in a `.proto` file at startup and
//! serves them over gRPC without compiling any message types. Every call
//! is forwarded, still encoded, to one of a pool of worker processes; the
//! worker's encoded reply goes back to the client untouched.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bifrost::Bridge;
//! use bifrost::server::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> bifrost::Result<()> {
//!     let config = Config::parse(r#"
//!         [server]
//!         listen = "tcp://127.0.0.1:9001"
//!         proto = "proto/greeter.proto"
//!
//!         [workers]
//!         command = ["php", "worker.php"]
//!         num_workers = 4
//!     "#)?;
//!
//!     let bridge = Bridge::new(config);
//!     bridge.add_listener(Arc::new(bifrost::events::log_event))?;
//!     bridge.serve().await
//! }
//! ```
//!
//! # Pieces
//!
//! - [`protocol`]: service descriptors from `.proto` files
//! - [`codec`]: pass-through gRPC codec
//! - [`proxy`]: per-service method tables that forward calls
//! - [`worker`]: the worker channel and the default process pool
//! - [`server`]: the bridge lifecycle, listeners, TLS and control plane
//! - [`client`]: calling a running bridge

pub mod client;
pub mod codec;
pub mod env;
pub mod error;
pub mod events;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod telemetry;
pub mod version;
pub mod worker;

// Re-export main types at crate root
pub use codec::{RawCodec, RawMessage, Typed};
pub use env::{EnvironmentProvider, StaticEnvironment};
pub use error::{BifrostError, Result};
pub use events::{Event, EventKind, EventListener};
pub use protocol::{MethodDescriptor, ProtoFileRegistry, ProtocolRegistry, ServiceDescriptor};
pub use proxy::{CallShape, MethodKey, ProxyService};
pub use server::{Bridge, BridgeState, ServerOption, StopHandle};
pub use version::{BuildInfo, PKG_VERSION, version_string};
pub use worker::{ChannelFactory, ProcessPool, WorkerChannel, WorkerRequest};
