//! # tablet-client
//!
//! Client library for the tablet query protocol.
//!
//! A [`TabletConn`] is one TCP connection bound to one session. Calls on
//! the same connection run concurrently. Both method generations are
//! available (`begin`/`begin2`, `commit`/`commit2`, ...); whichever way
//! the server delivers an error, the caller gets the same
//! [`ClientError::Tablet`] back.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tablet_client::{ClientConfig, TabletConn};
//! use tablet_proto::{BoundQuery, CallContext};
//!
//! let ctx = CallContext::background();
//! let conn = TabletConn::dial("127.0.0.1:15991", "test_keyspace", "0", ClientConfig::default()).await?;
//!
//! let txn = conn.begin2(&ctx).await?;
//! conn.execute(&ctx, BoundQuery::new("insert into t values (1)"), txn).await?;
//! conn.commit2(&ctx, txn).await?;
//!
//! let mut stream = conn.stream_execute2(&ctx, BoundQuery::new("select * from t"), txn).await?;
//! while let Some(chunk) = stream.next().await {
//!     println!("{} rows", chunk.rows.len());
//! }
//! if let Some(err) = stream.err() {
//!     eprintln!("stream failed: {err}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types.
pub mod error;

/// Client connection.
pub mod client;

// Re-export commonly used types
pub use client::{ClientConfig, TabletConn};
pub use error::{ClientError, ClientResult};
