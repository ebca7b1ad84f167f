//! RPC messages and the error delivery convention.
//!
//! Begin, Commit, Rollback and StreamExecute exist in two generations.
//! Both run the same operation; they differ only in how a failure reaches
//! the caller:
//!
//! - [`ErrorDelivery::InReply`]: the error rides inside an otherwise
//!   normal reply (`Reply::Commit { error: Some(..) }`).
//! - [`ErrorDelivery::CallFailure`]: the call itself fails (`Err(..)`).
//!
//! v2 calls always use `CallFailure`. v1 calls use `InReply` when the
//! server runs with `legacy_errors_in_reply`. Callers fold both channels
//! back into one [`TabletError`] with [`Reply::into_result`].

use serde::{Deserialize, Serialize};
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{SessionId, TransactionId};

use crate::value::{BoundQuery, QueryResult, QuerySplit};

/// Method generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiVersion {
    /// Legacy form, may embed errors in the reply.
    V1,
    /// Current form, errors are always call failures.
    V2,
}

/// How a failed call reports its error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDelivery {
    /// Error embedded in the reply payload.
    InReply,
    /// Error returned as the call's failure.
    CallFailure,
}

impl ErrorDelivery {
    /// Picks the convention for a call of the given generation.
    #[must_use]
    pub const fn select(version: ApiVersion, legacy_errors_in_reply: bool) -> Self {
        match version {
            ApiVersion::V1 if legacy_errors_in_reply => Self::InReply,
            _ => Self::CallFailure,
        }
    }

    /// Shapes the response to a Begin call.
    #[must_use]
    pub fn begin(self, result: TabletResult<TransactionId>) -> Response {
        match (self, result) {
            (_, Ok(transaction_id)) => Ok(Reply::Begin {
                transaction_id,
                error: None,
            }),
            (Self::InReply, Err(e)) => Ok(Reply::Begin {
                transaction_id: TransactionId::NONE,
                error: Some(e),
            }),
            (Self::CallFailure, Err(e)) => Err(e),
        }
    }

    /// Shapes the response to a Commit call.
    #[must_use]
    pub fn commit(self, result: TabletResult<()>) -> Response {
        self.unit(result, |error| Reply::Commit { error })
    }

    /// Shapes the response to a Rollback call.
    #[must_use]
    pub fn rollback(self, result: TabletResult<()>) -> Response {
        self.unit(result, |error| Reply::Rollback { error })
    }

    /// Shapes the final frame of a StreamExecute call.
    #[must_use]
    pub fn stream_end(self, result: TabletResult<()>) -> Response {
        self.unit(result, |error| Reply::StreamEnd { error })
    }

    fn unit(
        self,
        result: TabletResult<()>,
        reply: impl FnOnce(Option<TabletError>) -> Reply,
    ) -> Response {
        match (self, result) {
            (_, Ok(())) => Ok(reply(None)),
            (Self::InReply, Err(e)) => Ok(reply(Some(e))),
            (Self::CallFailure, Err(e)) => Err(e),
        }
    }
}

/// A call as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Open a session on a keyspace/shard.
    GetSessionId {
        /// Target keyspace.
        keyspace: String,
        /// Target shard.
        shard: String,
    },
    /// Invalidate a session.
    CloseSession {
        /// Session to close.
        session_id: SessionId,
    },
    /// Start a transaction.
    Begin {
        /// Method generation.
        version: ApiVersion,
        /// Calling session.
        session_id: SessionId,
        /// Must be zero.
        transaction_id: TransactionId,
    },
    /// Commit a transaction.
    Commit {
        /// Method generation.
        version: ApiVersion,
        /// Calling session.
        session_id: SessionId,
        /// Transaction to commit.
        transaction_id: TransactionId,
    },
    /// Roll back a transaction.
    Rollback {
        /// Method generation.
        version: ApiVersion,
        /// Calling session.
        session_id: SessionId,
        /// Transaction to roll back.
        transaction_id: TransactionId,
    },
    /// Execute one statement.
    Execute {
        /// Calling session.
        session_id: SessionId,
        /// Zero for autocommit.
        transaction_id: TransactionId,
        /// Statement.
        query: BoundQuery,
    },
    /// Execute statements in order.
    ExecuteBatch {
        /// Calling session.
        session_id: SessionId,
        /// Zero for autocommit.
        transaction_id: TransactionId,
        /// Statements.
        queries: Vec<BoundQuery>,
    },
    /// Execute a statement and stream the result.
    StreamExecute {
        /// Method generation.
        version: ApiVersion,
        /// Calling session.
        session_id: SessionId,
        /// Zero for autocommit.
        transaction_id: TransactionId,
        /// Statement.
        query: BoundQuery,
    },
    /// Partition a full-table query.
    SplitQuery {
        /// Calling session.
        session_id: SessionId,
        /// Query to split.
        query: BoundQuery,
        /// Requested number of splits.
        split_count: i64,
    },
    /// Abandon the call with the same call id.
    Cancel,
    /// Let the streaming call with the same call id send this many more
    /// chunks.
    Credit(u32),
}

impl Request {
    /// Returns the method name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetSessionId { .. } => "GetSessionId",
            Self::CloseSession { .. } => "CloseSession",
            Self::Begin { version: ApiVersion::V1, .. } => "Begin",
            Self::Begin { .. } => "Begin2",
            Self::Commit { version: ApiVersion::V1, .. } => "Commit",
            Self::Commit { .. } => "Commit2",
            Self::Rollback { version: ApiVersion::V1, .. } => "Rollback",
            Self::Rollback { .. } => "Rollback2",
            Self::Execute { .. } => "Execute",
            Self::ExecuteBatch { .. } => "ExecuteBatch",
            Self::StreamExecute { version: ApiVersion::V1, .. } => "StreamExecute",
            Self::StreamExecute { .. } => "StreamExecute2",
            Self::SplitQuery { .. } => "SplitQuery",
            Self::Cancel => "Cancel",
            Self::Credit(_) => "Credit",
        }
    }
}

/// A request plus its call options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Deadline for the call, relative to its arrival at the server.
    pub timeout_ms: Option<u64>,
    /// Chunks a streaming call may send before waiting for [`Request::Credit`].
    /// `None` streams without flow control.
    pub stream_window: Option<u32>,
    /// The call.
    pub request: Request,
}

impl RequestEnvelope {
    /// Wraps a request without a timeout.
    #[must_use]
    pub const fn new(request: Request) -> Self {
        Self {
            timeout_ms: None,
            stream_window: None,
            request,
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sets the stream window.
    #[must_use]
    pub fn with_stream_window(mut self, stream_window: Option<u32>) -> Self {
        self.stream_window = stream_window;
        self
    }
}

/// A successful reply. Some variants can carry an embedded error under
/// [`ErrorDelivery::InReply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Session opened.
    SessionId(SessionId),
    /// Session closed.
    SessionClosed,
    /// Begin outcome.
    Begin {
        /// New transaction, zero when `error` is set.
        transaction_id: TransactionId,
        /// Embedded error.
        error: Option<TabletError>,
    },
    /// Commit outcome.
    Commit {
        /// Embedded error.
        error: Option<TabletError>,
    },
    /// Rollback outcome.
    Rollback {
        /// Embedded error.
        error: Option<TabletError>,
    },
    /// Execute result.
    Execute(QueryResult),
    /// ExecuteBatch results, in request order.
    ExecuteBatch(Vec<QueryResult>),
    /// One streamed chunk.
    StreamChunk(QueryResult),
    /// Last frame of a stream.
    StreamEnd {
        /// Embedded terminal error.
        error: Option<TabletError>,
    },
    /// SplitQuery result.
    SplitQuery(Vec<QuerySplit>),
}

impl Reply {
    /// Moves an embedded error into the `Err` channel so both delivery
    /// conventions look the same to the caller.
    ///
    /// # Errors
    ///
    /// Returns the embedded error, if any.
    pub fn into_result(self) -> TabletResult<Self> {
        match self {
            Self::Begin { error: Some(e), .. }
            | Self::Commit { error: Some(e) }
            | Self::Rollback { error: Some(e) }
            | Self::StreamEnd { error: Some(e) } => Err(e),
            reply => Ok(reply),
        }
    }
}

/// What the server sends back for one call frame.
pub type Response = Result<Reply, TabletError>;

/// Folds a response from either delivery convention into one result.
///
/// # Errors
///
/// Returns the call failure or the embedded error.
pub fn fold(response: Response) -> TabletResult<Reply> {
    response.and_then(Reply::into_result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic_error() -> TabletError {
        TabletError::execution_failed("generic error")
    }

    #[test]
    fn test_select() {
        assert_eq!(ErrorDelivery::select(ApiVersion::V1, true), ErrorDelivery::InReply);
        assert_eq!(ErrorDelivery::select(ApiVersion::V1, false), ErrorDelivery::CallFailure);
        assert_eq!(ErrorDelivery::select(ApiVersion::V2, true), ErrorDelivery::CallFailure);
        assert_eq!(ErrorDelivery::select(ApiVersion::V2, false), ErrorDelivery::CallFailure);
    }

    #[test]
    fn test_in_reply_embeds_error() {
        let response = ErrorDelivery::InReply.commit(Err(generic_error()));
        assert_eq!(
            response,
            Ok(Reply::Commit {
                error: Some(generic_error())
            })
        );
        let response = ErrorDelivery::CallFailure.commit(Err(generic_error()));
        assert_eq!(response, Err(generic_error()));
    }

    #[test]
    fn test_fold_parity() {
        for delivery in [ErrorDelivery::InReply, ErrorDelivery::CallFailure] {
            let err = fold(delivery.begin(Err(generic_error()))).unwrap_err();
            assert_eq!(err, generic_error());
            let err = fold(delivery.rollback(Err(generic_error()))).unwrap_err();
            assert_eq!(err.to_string(), "error: generic error");
            let err = fold(delivery.stream_end(Err(generic_error()))).unwrap_err();
            assert_eq!(err.kind(), generic_error().kind());

            let ok = fold(delivery.begin(Ok(TransactionId::new(9990)))).unwrap();
            assert_eq!(
                ok,
                Reply::Begin {
                    transaction_id: TransactionId::new(9990),
                    error: None
                }
            );
        }
    }

    #[test]
    fn test_request_names() {
        let begin2 = Request::Begin {
            version: ApiVersion::V2,
            session_id: SessionId::new(1),
            transaction_id: TransactionId::NONE,
        };
        assert_eq!(begin2.name(), "Begin2");
        assert_eq!(Request::Cancel.name(), "Cancel");
        assert_eq!(Request::Credit(4).name(), "Credit");
    }
}
