use std::future::Future;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;

use crate::error::SinkError;
use crate::metrics_consts::{BATCH_FLUSHES, BATCH_SIZE};
use crate::sink::SubmissionSink;
use crate::types::ParsedSubmission;

/// Flush triggers for the per-file, per-table accumulators.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            flush_timeout: Duration::from_secs(2),
        }
    }
}

struct TableBuffer<T> {
    rows: Vec<T>,
    last_flush: Instant,
}

impl<T> TableBuffer<T> {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            last_flush: Instant::now(),
        }
    }
}

/// Accumulates one file's records per table and flushes a batch when the
/// table reaches the batch size, when the flush timeout for that table has
/// elapsed, and always at end of file. Tables flush in dependency order
/// because records are pushed in `TableKind::ALL` order.
pub struct Accumulator<'s> {
    settings: BatchSettings,
    sink: &'s dyn SubmissionSink,
}

impl<'s> Accumulator<'s> {
    pub fn new(settings: BatchSettings, sink: &'s dyn SubmissionSink) -> Self {
        Self { settings, sink }
    }

    /// Drain a parsed submission into the sink. Returns on the first
    /// storage error; the caller classifies the whole file as retryable.
    pub async fn ingest(&self, parsed: ParsedSubmission) -> Result<(), SinkError> {
        let sink = self.sink;
        self.drain_table(parsed.issues, "issues", |batch| sink.upsert_issues(batch))
            .await?;
        self.drain_table(parsed.checkouts, "checkouts", |batch| {
            sink.upsert_checkouts(batch)
        })
        .await?;
        self.drain_table(parsed.builds, "builds", |batch| sink.upsert_builds(batch))
            .await?;
        self.drain_table(parsed.tests, "tests", |batch| sink.upsert_tests(batch))
            .await?;
        self.drain_table(parsed.incidents, "incidents", |batch| {
            sink.upsert_incidents(batch)
        })
        .await?;
        Ok(())
    }

    async fn drain_table<T, F, Fut>(
        &self,
        rows: Vec<T>,
        table: &'static str,
        mut flush: F,
    ) -> Result<(), SinkError>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), SinkError>>,
    {
        let mut buffer = TableBuffer::new();
        for row in rows {
            buffer.rows.push(row);

            let full = buffer.rows.len() >= self.settings.batch_size;
            let stale = buffer.last_flush.elapsed() >= self.settings.flush_timeout;
            if full || stale {
                Self::flush_buffer(&mut buffer, table, &mut flush).await?;
            }
        }
        // End of file: the final partial batch always flushes.
        Self::flush_buffer(&mut buffer, table, &mut flush).await
    }

    async fn flush_buffer<T, F, Fut>(
        buffer: &mut TableBuffer<T>,
        table: &'static str,
        flush: &mut F,
    ) -> Result<(), SinkError>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), SinkError>>,
    {
        buffer.last_flush = Instant::now();
        if buffer.rows.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut buffer.rows);
        histogram!(BATCH_SIZE, "table" => table).record(batch.len() as f64);
        counter!(BATCH_FLUSHES, "table" => table).increment(1);
        flush(batch).await
    }
}
