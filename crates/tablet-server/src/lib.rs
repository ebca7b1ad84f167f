//! # tablet-server
//!
//! Server side of the tablet query protocol.
//!
//! This crate provides:
//!
//! - **Tablet**: [`TabletServer`], the query service itself. It validates
//!   sessions and transactions, runs statements, batches and streams
//!   through the [`SqlEngine`] collaborator, and splits full-table scans.
//!
//! - **Collaborators**: the [`SqlEngine`] and [`Topology`] traits, plus a
//!   fixture-driven [`MemoryEngine`] and a [`StaticTopology`].
//!
//! - **Panic Guard**: [`PanicGuard`] turns a panic inside any call into an
//!   `Internal` error for that call.
//!
//! - **RPC Server**: [`RpcServer`] serves any query service over TCP and
//!   applies the v1/v2 error delivery convention.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tablet_server::{MemoryEngine, RpcServer, ServerConfig, StaticTopology, TabletServer};
//!
//! let config = ServerConfig::default();
//! let topology = Arc::new(StaticTopology::from_config(&config)?);
//! let tablet = Arc::new(TabletServer::new(config, Arc::new(MemoryEngine::new()), topology));
//! let server = RpcServer::bind("127.0.0.1:15991", tablet, false).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Server configuration.
pub mod config;

/// SQL engine collaborator and the in-memory engine.
pub mod engine;

/// Panic containment middleware.
pub mod guard;

/// TCP front end.
pub mod rpc;

/// The tablet query server.
pub mod tablet;

/// Topology collaborator.
pub mod topology;

// Re-export commonly used types
pub use config::{ServerConfig, ServerConfigBuilder};
pub use engine::{EngineError, EngineResult, Fixture, FixtureSet, MemoryEngine, RowSink, SqlEngine, TableStats};
pub use guard::PanicGuard;
pub use rpc::{RpcError, RpcResult, RpcServer, RpcStats};
pub use tablet::{ServerStats, TabletServer};
pub use topology::{StaticTopology, Topology};
