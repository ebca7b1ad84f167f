//! Streamed query results.
//!
//! A streaming call hands back a [`QueryStream`]: a lazy, single-pass
//! sequence of [`QueryResult`] chunks plus a terminal result that is set
//! exactly once when the producer completes. The producer side is a
//! [`ChunkSender`] feeding a bounded queue and a [`Completer`] that
//! records the outcome.
//!
//! ```text
//!  producer                           consumer
//!  ────────                           ────────
//!  ChunkSender ──▶ [bounded queue] ──▶ QueryStream::next()
//!  Completer   ──▶ [one-shot cell] ──▶ QueryStream::err() after close
//! ```
//!
//! Dropping the stream cancels the producer. A producer blocked on a full
//! queue wakes up as soon as the consumer goes away.

use std::future::Future;

use tablet_common::error::{TabletError, TabletResult};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::context::CallContext;
use crate::guard::panic_message;
use crate::value::QueryResult;

/// Creates the two ends of a result stream.
///
/// `buffer` bounds how many chunks the producer may run ahead of the
/// consumer. The stream is cancelled together with `ctx`.
#[must_use]
pub fn channel(ctx: &CallContext, buffer: usize) -> (ChunkSender, Completer, QueryStream) {
    let (chunk_tx, chunk_rx) = mpsc::channel(buffer.max(1));
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let ctx = ctx.child();

    let sender = ChunkSender {
        chunks: chunk_tx,
        ctx: ctx.clone(),
        sent: 0,
    };
    let completer = Completer {
        outcome: Some(outcome_tx),
    };
    let stream = QueryStream {
        chunks: chunk_rx,
        peeked: None,
        outcome: Some(outcome_rx),
        terminal: None,
        ctx,
    };
    (sender, completer, stream)
}

/// Spawns an async producer and returns the stream it feeds.
///
/// The producer's return value becomes the terminal result. A panic in
/// the producer is caught and reported as an `Internal` error through the
/// terminal result.
pub fn spawn_stream<F, Fut>(ctx: &CallContext, buffer: usize, produce: F) -> QueryStream
where
    F: FnOnce(ChunkSender) -> Fut + Send + 'static,
    Fut: Future<Output = TabletResult<()>> + Send + 'static,
{
    let (sender, completer, stream) = channel(ctx, buffer);
    let task = tokio::spawn(produce(sender));
    tokio::spawn(async move {
        completer.complete(join_outcome(task.await));
    });
    stream
}

/// Spawns a blocking producer on the blocking thread pool.
///
/// Use [`ChunkSender::blocking_send`] from inside `produce`.
pub fn spawn_blocking_stream<F>(ctx: &CallContext, buffer: usize, produce: F) -> QueryStream
where
    F: FnOnce(ChunkSender) -> TabletResult<()> + Send + 'static,
{
    let (sender, completer, stream) = channel(ctx, buffer);
    let task = tokio::task::spawn_blocking(move || produce(sender));
    tokio::spawn(async move {
        completer.complete(join_outcome(task.await));
    });
    stream
}

fn join_outcome(joined: Result<TabletResult<()>, tokio::task::JoinError>) -> TabletResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(&*e.into_panic());
            error!(%message, "stream producer panicked");
            Err(TabletError::caught_panic(message))
        }
        Err(_) => Err(TabletError::cancelled("stream producer was aborted")),
    }
}

// =============================================================================
// Producer side
// =============================================================================

/// Producer half of a result stream.
///
/// Enforces the chunk shape: the first chunk carries fields and no rows,
/// every later chunk carries rows and no fields.
#[derive(Debug)]
pub struct ChunkSender {
    chunks: mpsc::Sender<QueryResult>,
    ctx: CallContext,
    sent: usize,
}

impl ChunkSender {
    /// Sends one chunk, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the consumer has gone away or the call was
    /// cancelled, and `Internal` if the chunk breaks the shape rules.
    pub async fn send(&mut self, chunk: QueryResult) -> TabletResult<()> {
        self.check_shape(&chunk)?;
        tokio::select! {
            biased;
            err = self.ctx.done() => {
                debug!(sent = self.sent, "stream cancelled while sending");
                Err(err)
            }
            sent = self.chunks.send(chunk) => {
                sent.map_err(|_| TabletError::cancelled("stream consumer went away"))?;
                self.sent += 1;
                Ok(())
            }
        }
    }

    /// Sends one chunk from a blocking thread.
    ///
    /// Must not be called from inside an async task.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkSender::send`], plus `Internal` when called outside a
    /// runtime.
    pub fn blocking_send(&mut self, chunk: QueryResult) -> TabletResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TabletError::internal(format!("no runtime for stream: {e}")))?;
        handle.block_on(self.send(chunk))
    }

    /// Returns the context the stream runs under.
    #[must_use]
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn check_shape(&self, chunk: &QueryResult) -> TabletResult<()> {
        if self.sent == 0 && !chunk.rows.is_empty() {
            return Err(TabletError::internal(
                "first stream chunk must carry fields only",
            ));
        }
        if self.sent > 0 && !chunk.fields.is_empty() {
            return Err(TabletError::internal(
                "fields sent after the first stream chunk",
            ));
        }
        Ok(())
    }
}

/// Records the terminal result of a stream exactly once.
#[derive(Debug)]
pub struct Completer {
    outcome: Option<oneshot::Sender<TabletResult<()>>>,
}

impl Completer {
    /// Sets the terminal result.
    pub fn complete(mut self, result: TabletResult<()>) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(tx) = self.outcome.take() {
            let err = if std::thread::panicking() {
                TabletError::caught_panic("stream producer panicked")
            } else {
                TabletError::internal("stream producer exited without a result")
            };
            let _ = tx.send(Err(err));
        }
    }
}

// =============================================================================
// Consumer side
// =============================================================================

/// Consumer half of a result stream.
#[derive(Debug)]
pub struct QueryStream {
    chunks: mpsc::Receiver<QueryResult>,
    peeked: Option<QueryResult>,
    outcome: Option<oneshot::Receiver<TabletResult<()>>>,
    terminal: Option<TabletResult<()>>,
    ctx: CallContext,
}

impl QueryStream {
    /// Builds an already-produced stream. Handy for tests and fakes.
    #[must_use]
    pub fn from_parts(chunks: Vec<QueryResult>, result: TabletResult<()>) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = chunk_tx.try_send(chunk);
        }
        drop(chunk_tx);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let _ = outcome_tx.send(result);
        Self {
            chunks: chunk_rx,
            peeked: None,
            outcome: Some(outcome_rx),
            terminal: None,
            ctx: CallContext::background(),
        }
    }

    /// Returns the next chunk, or `None` once the stream is closed.
    ///
    /// After `None`, consult [`QueryStream::err`] to tell a clean finish
    /// from a failure.
    pub async fn next(&mut self) -> Option<QueryResult> {
        if let Some(chunk) = self.peeked.take() {
            return Some(chunk);
        }
        if self.terminal.is_some() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.ctx.cancelled() => {
                self.abandon().await;
                None
            }
            chunk = self.chunks.recv() => match chunk {
                Some(chunk) => Some(chunk),
                None => {
                    self.close().await;
                    None
                }
            },
        }
    }

    /// Waits for the first chunk so a failure before any output is
    /// reported as the call's own error.
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the stream closed without a chunk.
    pub async fn prime(mut self) -> TabletResult<Self> {
        match self.next().await {
            Some(chunk) => {
                self.peeked = Some(chunk);
                Ok(self)
            }
            None => {
                if let Some(Err(e)) = &self.terminal {
                    return Err(e.clone());
                }
                Ok(self)
            }
        }
    }

    /// Returns true once the sequence has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.terminal.is_some() && self.peeked.is_none()
    }

    /// Returns the terminal error. Only meaningful once the stream is
    /// closed; `None` while open or after a clean finish.
    #[must_use]
    pub fn err(&self) -> Option<&TabletError> {
        match &self.terminal {
            Some(Err(e)) if self.peeked.is_none() => Some(e),
            _ => None,
        }
    }

    /// Closes the stream and returns its terminal result.
    ///
    /// A stream that is still open is abandoned: the producer is cancelled
    /// and undelivered chunks are discarded.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the stream.
    pub async fn finish(mut self) -> TabletResult<()> {
        if self.terminal.is_none() || self.peeked.is_some() {
            self.abandon().await;
        }
        self.terminal.take().unwrap_or(Ok(()))
    }

    /// Drains the stream into a vector of chunks.
    ///
    /// # Errors
    ///
    /// Returns the terminal error, discarding the chunks received.
    pub async fn collect(mut self) -> TabletResult<Vec<QueryResult>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk);
        }
        self.terminal.take().unwrap_or(Ok(())).map(|()| chunks)
    }

    /// Cancels the producer.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    async fn close(&mut self) {
        let result = match self.outcome.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(TabletError::internal("stream producer vanished"))),
            None => Ok(()),
        };
        self.terminal = Some(result);
    }

    async fn abandon(&mut self) {
        let cause = self.ctx.err();
        let mut discarded = usize::from(self.peeked.take().is_some());
        let producer_done = loop {
            match self.chunks.try_recv() {
                Ok(_) => discarded += 1,
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };
        self.ctx.cancel();
        self.chunks.close();

        // A producer that already let go of the queue is about to post its
        // result; a clean finish must not be reported as cancelled.
        let outcome = match self.outcome.take() {
            Some(rx) if producer_done && discarded == 0 => rx.await.ok(),
            Some(mut rx) => rx.try_recv().ok(),
            None => None,
        };
        let result = match outcome {
            Some(Err(e)) => Err(e),
            Some(Ok(())) if discarded == 0 => Ok(()),
            _ => Err(cause.unwrap_or_else(|| TabletError::cancelled("stream abandoned"))),
        };
        debug!(discarded, producer_done, "stream abandoned");
        self.terminal = Some(result);
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        if self.terminal.is_none() {
            self.ctx.cancel();
        }
    }
}
