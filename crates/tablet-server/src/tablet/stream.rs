//! Bridge from engine row callbacks to a result stream.

use tablet_common::error::{ErrorKind, TabletError, TabletResult};
use tablet_proto::{ChunkSender, Field, QueryResult, Row};
use tracing::debug;

use crate::engine::{EngineError, EngineResult, RowSink};

/// Collects engine rows into chunks of at most `batch_rows` and forwards
/// them to the stream consumer.
///
/// Runs on a blocking thread. Once a send fails the sink refuses every
/// further row, so the engine unwinds and drops its cursor.
pub struct ChunkSink {
    sender: ChunkSender,
    batch_rows: usize,
    pending: Vec<Row>,
    header_sent: bool,
    rows: u64,
    failure: Option<TabletError>,
}

impl ChunkSink {
    /// Creates a sink feeding `sender`.
    pub fn new(sender: ChunkSender, batch_rows: usize) -> Self {
        let batch_rows = batch_rows.max(1);
        Self {
            sender,
            batch_rows,
            pending: Vec::with_capacity(batch_rows),
            header_sent: false,
            rows: 0,
            failure: None,
        }
    }

    /// Rows accepted from the engine so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flushes buffered rows and converts the engine outcome into the
    /// stream's terminal result.
    pub fn finish(mut self, outcome: EngineResult<()>) -> TabletResult<()> {
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        match outcome {
            Ok(()) => {
                if !self.header_sent {
                    self.send(QueryResult::header(Vec::new()))?;
                    self.header_sent = true;
                }
                self.flush()
            }
            Err(EngineError::Failed(message)) => {
                // Rows produced before the failure still reach the consumer.
                self.flush()?;
                Err(TabletError::execution_failed(message))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> TabletResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_rows));
        self.send(QueryResult::rows(rows))
    }

    fn send(&mut self, chunk: QueryResult) -> TabletResult<()> {
        self.sender.blocking_send(chunk)
    }

    fn record(&mut self, err: TabletError) -> EngineError {
        debug!(rows = self.rows, error = %err, "stream send failed");
        let mapped = if err.kind() == ErrorKind::Cancelled {
            EngineError::Abandoned
        } else {
            EngineError::Contract(err.message().to_string())
        };
        self.failure = Some(err);
        mapped
    }
}

impl RowSink for ChunkSink {
    fn fields(&mut self, fields: Vec<Field>) -> EngineResult<()> {
        if self.header_sent {
            return Err(EngineError::Contract("fields sent twice".to_string()));
        }
        self.header_sent = true;
        self.send(QueryResult::header(fields))
            .map_err(|e| self.record(e))
    }

    fn row(&mut self, row: Row) -> EngineResult<()> {
        if let Some(failure) = &self.failure {
            return Err(if failure.kind() == ErrorKind::Cancelled {
                EngineError::Abandoned
            } else {
                EngineError::Contract(failure.message().to_string())
            });
        }
        if !self.header_sent {
            return Err(EngineError::Contract("row sent before fields".to_string()));
        }
        self.pending.push(row);
        self.rows += 1;
        if self.pending.len() >= self.batch_rows {
            self.flush().map_err(|e| self.record(e))?;
        }
        Ok(())
    }
}
