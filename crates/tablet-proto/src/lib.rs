//! # tablet-proto
//!
//! The tablet query protocol: everything a caller and a server must agree
//! on.
//!
//! - **Values**: [`Value`], [`Field`], [`QueryResult`], [`BoundQuery`],
//!   [`QuerySplit`]
//! - **Service**: the [`QueryService`] trait every server implements
//! - **Streaming**: [`QueryStream`], a lazy chunk sequence with a
//!   terminal result read after close
//! - **Containment**: [`guard`] helpers turning panics into `Internal`
//!   errors
//! - **Wire**: [`rpc`] messages, the error delivery convention, and the
//!   [`frame`] codec
//!
//! ## Example
//!
//! ```rust
//! use tablet_proto::{BoundQuery, Value};
//!
//! let query = BoundQuery::new("select * from users where id = :id").bind("id", 7i64);
//! assert_eq!(query.bind_variables["id"], Value::Int(7));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod frame;
pub mod guard;
pub mod rpc;
pub mod service;
pub mod stream;
pub mod value;

pub use context::CallContext;
pub use rpc::{ApiVersion, ErrorDelivery, Reply, Request, RequestEnvelope, Response};
pub use service::QueryService;
pub use stream::{ChunkSender, Completer, QueryStream};
pub use value::{BoundQuery, Field, QueryResult, QuerySplit, Row, Value};
