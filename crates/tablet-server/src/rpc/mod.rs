//! TCP front end.
//!
//! Each connection carries many concurrent calls, multiplexed by call id.
//! A reader loop decodes [`RequestEnvelope`] frames and spawns one task
//! per call; replies funnel through a bounded outbox drained by a writer
//! task. Streams send one `StreamChunk` frame per chunk followed by a
//! `StreamEnd` (or a call failure).
//!
//! A stream opened with a window sends at most that many chunks ahead of
//! the client's `Credit` frames, so a stalled reader never holds up the
//! shared outbox.
//!
//! Every service handed to [`RpcServer::bind`] is wrapped in a
//! [`PanicGuard`]. Closing a connection cancels all of its calls.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tablet_common::types::{SessionId, TransactionId};
use tablet_proto::frame::{write_frame, FrameError, FrameReader};
use tablet_proto::{
    ApiVersion, BoundQuery, CallContext, ErrorDelivery, QueryService, Reply, Request,
    RequestEnvelope, Response,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::guard::PanicGuard;

/// Replies buffered per connection before calls wait on the writer.
const OUTBOX_SIZE: usize = 64;

/// RPC server errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// RPC server result type.
pub type RpcResult<T> = Result<T, RpcError>;

/// Connection and call counters.
#[derive(Debug, Default)]
pub struct RpcStats {
    /// Connections accepted.
    pub connections: AtomicU64,
    /// Calls received.
    pub calls: AtomicU64,
    /// Calls cancelled by clients.
    pub cancelled: AtomicU64,
}

/// A listening tablet server.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    stats: Arc<RpcStats>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl RpcServer {
    /// Binds `addr` and starts serving `service`.
    ///
    /// `legacy_errors_in_reply` selects how v1 calls report errors.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        service: Arc<dyn QueryService>,
        legacy_errors_in_reply: bool,
    ) -> RpcResult<Self> {
        let service: Arc<dyn QueryService> = Arc::new(PanicGuard::new(service));
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, legacy_errors_in_reply, "tablet server listening");

        let shutdown = CancellationToken::new();
        let stats = Arc::new(RpcStats::default());

        let accept_task = {
            let shutdown = shutdown.clone();
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => match result {
                            Ok((stream, peer)) => {
                                debug!(%peer, "accepted connection");
                                stats.connections.fetch_add(1, Ordering::Relaxed);
                                let conn = Connection::new(
                                    Arc::clone(&service),
                                    legacy_errors_in_reply,
                                    Arc::clone(&stats),
                                );
                                let shutdown = shutdown.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = conn.run(stream, shutdown).await {
                                        warn!(%peer, error = %e, "connection error");
                                    }
                                    debug!(%peer, "connection closed");
                                });
                            }
                            Err(e) => error!(error = %e, "accept error"),
                        },
                        () = shutdown.cancelled() => {
                            info!("tablet server shutting down");
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            local_addr,
            shutdown,
            accept_task: Some(accept_task),
            stats,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns connection and call counters.
    pub fn stats(&self) -> &RpcStats {
        &self.stats
    }

    /// Stops accepting, closes every connection and waits for the accept
    /// loop to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Per-connection state shared by its call tasks.
struct Connection {
    service: Arc<dyn QueryService>,
    legacy_errors_in_reply: bool,
    stats: Arc<RpcStats>,
    /// Cancelled when the connection goes away.
    ctx: CallContext,
    /// In-flight calls by call id.
    calls: DashMap<u64, CallSlot>,
}

/// Server-side handle on one in-flight call.
struct CallSlot {
    ctx: CallContext,
    /// Chunks the client has room for, for windowed streams.
    credits: Option<Arc<Semaphore>>,
}

type Outbox = mpsc::Sender<(u64, Response)>;

impl Connection {
    fn new(service: Arc<dyn QueryService>, legacy_errors_in_reply: bool, stats: Arc<RpcStats>) -> Arc<Self> {
        Arc::new(Self {
            service,
            legacy_errors_in_reply,
            stats,
            ctx: CallContext::background(),
            calls: DashMap::new(),
        })
    }

    async fn run(self: Arc<Self>, stream: TcpStream, shutdown: CancellationToken) -> RpcResult<()> {
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let (outbox, mut outbox_rx) = mpsc::channel::<(u64, Response)>(OUTBOX_SIZE);

        // Writer task
        tokio::spawn(async move {
            while let Some((call_id, response)) = outbox_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, call_id, &response).await {
                    warn!(call_id, error = %e, "write error");
                    break;
                }
            }
        });

        let mut reader = FrameReader::new(read_half);
        let result = loop {
            tokio::select! {
                frame = reader.next::<RequestEnvelope>() => match frame {
                    Ok(Some((call_id, envelope))) => self.dispatch(call_id, envelope, &outbox),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                },
                () = shutdown.cancelled() => break Ok(()),
            }
        };

        self.ctx.cancel();
        result
    }

    fn dispatch(self: &Arc<Self>, call_id: u64, envelope: RequestEnvelope, outbox: &Outbox) {
        match envelope.request {
            Request::Cancel => {
                if let Some((_, slot)) = self.calls.remove(&call_id) {
                    debug!(call_id, "call cancelled by client");
                    self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    slot.ctx.cancel();
                }
                return;
            }
            Request::Credit(granted) => {
                if let Some(credits) = self.calls.get(&call_id).and_then(|slot| slot.credits.clone()) {
                    let room = Semaphore::MAX_PERMITS - credits.available_permits();
                    credits.add_permits((granted as usize).min(room));
                }
                return;
            }
            _ => {}
        }

        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let ctx = match envelope.timeout_ms {
            Some(ms) => self.ctx.child().timeout(Duration::from_millis(ms)),
            None => self.ctx.child(),
        };
        let credits = match (&envelope.request, envelope.stream_window) {
            (Request::StreamExecute { .. }, Some(window)) => {
                Some(Arc::new(Semaphore::new(window.max(1) as usize)))
            }
            _ => None,
        };
        self.calls.insert(
            call_id,
            CallSlot {
                ctx: ctx.clone(),
                credits: credits.clone(),
            },
        );

        let conn = Arc::clone(self);
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let method = envelope.request.name();
            debug!(call_id, method, "call started");
            conn.serve(call_id, &ctx, envelope.request, credits, &outbox).await;
            conn.calls.remove(&call_id);
            debug!(call_id, method, "call finished");
        });
    }

    fn delivery(&self, version: ApiVersion) -> ErrorDelivery {
        ErrorDelivery::select(version, self.legacy_errors_in_reply)
    }

    async fn serve(
        &self,
        call_id: u64,
        ctx: &CallContext,
        request: Request,
        credits: Option<Arc<Semaphore>>,
        outbox: &Outbox,
    ) {
        let service = &self.service;
        let response = match request {
            Request::GetSessionId { keyspace, shard } => service
                .get_session_id(ctx, &keyspace, &shard)
                .await
                .map(Reply::SessionId),
            Request::CloseSession { session_id } => service
                .close_session(ctx, session_id)
                .await
                .map(|()| Reply::SessionClosed),
            Request::Begin {
                version,
                session_id,
                transaction_id,
            } => self
                .delivery(version)
                .begin(service.begin(ctx, session_id, transaction_id).await),
            Request::Commit {
                version,
                session_id,
                transaction_id,
            } => self
                .delivery(version)
                .commit(service.commit(ctx, session_id, transaction_id).await),
            Request::Rollback {
                version,
                session_id,
                transaction_id,
            } => self
                .delivery(version)
                .rollback(service.rollback(ctx, session_id, transaction_id).await),
            Request::Execute {
                session_id,
                transaction_id,
                query,
            } => service
                .execute(ctx, session_id, transaction_id, query)
                .await
                .map(Reply::Execute),
            Request::ExecuteBatch {
                session_id,
                transaction_id,
                queries,
            } => service
                .execute_batch(ctx, session_id, transaction_id, queries)
                .await
                .map(Reply::ExecuteBatch),
            Request::SplitQuery {
                session_id,
                query,
                split_count,
            } => service
                .split_query(ctx, session_id, query, split_count)
                .await
                .map(Reply::SplitQuery),
            Request::StreamExecute {
                version,
                session_id,
                transaction_id,
                query,
            } => {
                let target = (session_id, transaction_id);
                self.stream(call_id, ctx, version, target, query, credits, outbox)
                    .await;
                return;
            }
            Request::Cancel | Request::Credit(_) => return,
        };
        let _ = outbox.send((call_id, response)).await;
    }

    async fn stream(
        &self,
        call_id: u64,
        ctx: &CallContext,
        version: ApiVersion,
        (session_id, transaction_id): (SessionId, TransactionId),
        query: BoundQuery,
        credits: Option<Arc<Semaphore>>,
        outbox: &Outbox,
    ) {
        let delivery = self.delivery(version);
        let mut stream = match self
            .service
            .stream_execute(ctx, session_id, transaction_id, query)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = outbox.send((call_id, delivery.stream_end(Err(e)))).await;
                return;
            }
        };

        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            if let Some(credits) = &credits {
                tokio::select! {
                    permit = credits.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                    }
                    err = ctx.done() => {
                        debug!(call_id, chunks, "stream cancelled while waiting for credit");
                        stream.cancel();
                        let _ = outbox.send((call_id, delivery.stream_end(Err(err)))).await;
                        return;
                    }
                }
            }
            if outbox.send((call_id, Ok(Reply::StreamChunk(chunk)))).await.is_err() {
                stream.cancel();
                return;
            }
            chunks += 1;
        }

        let result = stream.err().cloned().map_or(Ok(()), Err);
        if let Err(e) = &result {
            debug!(call_id, chunks, error = %e, "stream ended with error");
        }
        let _ = outbox.send((call_id, delivery.stream_end(result))).await;
    }
}
