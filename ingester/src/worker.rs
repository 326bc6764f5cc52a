use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use ingest_common::health::Heartbeat;
use ingest_common::spool::{ClaimedFile, Disposition, SpoolDir};

use crate::batch::{Accumulator, BatchSettings};
use crate::error::{FileError, SinkError, WorkerError};
use crate::excerpt::ExcerptConverter;
use crate::metrics_consts::{
    FILES_PROCESSED, FILE_PROCESSING_TIME, QUEUE_DEPTH, RETRIES_QUARANTINED, RETRIES_REQUEUED,
    WORKERS_BUSY,
};
use crate::parse::{parse_submission, KnownTrees};
use crate::sink::SubmissionSink;

/// How many poll cycles pass between `pending_retry/` requeue sweeps.
const RETRY_SWEEP_EVERY: u64 = 10;

/// Classification of one processed submission file, deciding which spool
/// sub-directory it is routed to.
#[derive(Debug)]
pub enum IngestionOutcome {
    /// Parsing completed; per-item skips do not demote the file.
    Archived { accepted: usize, rejected: usize },
    /// The file can never parse: quarantined without any insert attempt.
    Failed { error: FileError },
    /// A storage failure mid-flush; a later cycle re-attempts the file.
    PendingRetry { accepted: usize, error: SinkError },
}

impl IngestionOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            IngestionOutcome::Archived { .. } => Disposition::Archive,
            IngestionOutcome::Failed { .. } => Disposition::Failed,
            IngestionOutcome::PendingRetry { .. } => Disposition::PendingRetry,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            IngestionOutcome::Archived { .. } => "archived",
            IngestionOutcome::Failed { .. } => "failed",
            IngestionOutcome::PendingRetry { .. } => "pending_retry",
        }
    }
}

/// One file-processing pipeline: claim, parse, convert excerpts, flush
/// batches, classify and route. Cheap to clone; every clone shares the sink,
/// converter and trees.
#[derive(Clone)]
pub struct IngestWorker {
    spool: SpoolDir,
    sink: Arc<dyn SubmissionSink>,
    converter: Option<Arc<ExcerptConverter>>,
    trees: Arc<KnownTrees>,
    batch: BatchSettings,
}

impl IngestWorker {
    pub fn new(
        spool: SpoolDir,
        sink: Arc<dyn SubmissionSink>,
        converter: Option<Arc<ExcerptConverter>>,
        trees: Arc<KnownTrees>,
        batch: BatchSettings,
    ) -> Self {
        Self {
            spool,
            sink,
            converter,
            trees,
            batch,
        }
    }

    /// Claim and fully process one spooled file. Returns `Ok(None)` when
    /// another worker claimed it first. Spool move failures propagate: a
    /// worker must stop rather than lose track of a claimed file.
    pub async fn process_file(&self, name: &str) -> Result<Option<IngestionOutcome>, WorkerError> {
        let Some(claimed) = self.spool.claim(name)? else {
            return Ok(None);
        };

        let started = tokio::time::Instant::now();
        let outcome = self.run_pipeline(&claimed).await?;
        self.spool.route(&claimed, outcome.disposition())?;

        let elapsed = started.elapsed();
        counter!(FILES_PROCESSED, "outcome" => outcome.label()).increment(1);
        histogram!(FILE_PROCESSING_TIME, "outcome" => outcome.label())
            .record(elapsed.as_secs_f64());

        match &outcome {
            IngestionOutcome::Archived { accepted, rejected } => info!(
                "archived {} in {:?}: {} accepted, {} rejected",
                claimed.name, elapsed, accepted, rejected
            ),
            IngestionOutcome::Failed { error } => {
                warn!("quarantined {}: {}", claimed.name, error)
            }
            IngestionOutcome::PendingRetry { error, .. } => warn!(
                "deferring {} (attempt {}): {}",
                claimed.name, claimed.attempt, error
            ),
        }

        Ok(Some(outcome))
    }

    async fn run_pipeline(&self, claimed: &ClaimedFile) -> Result<IngestionOutcome, WorkerError> {
        let raw = std::fs::read(&claimed.path).map_err(|error| WorkerError::ReadFile {
            path: claimed.path.clone(),
            error,
        })?;

        let mut parsed = match parse_submission(&raw, &self.trees) {
            Ok(parsed) => parsed,
            Err(error) => return Ok(IngestionOutcome::Failed { error }),
        };
        let accepted = parsed.accepted();
        let rejected = parsed.rejected;

        if let Some(converter) = &self.converter {
            converter.convert_submission(&mut parsed).await;
        }

        match Accumulator::new(self.batch, self.sink.as_ref())
            .ingest(parsed)
            .await
        {
            Ok(()) => Ok(IngestionOutcome::Archived { accepted, rejected }),
            Err(error) => Ok(IngestionOutcome::PendingRetry { accepted, error }),
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<String>>>;

async fn worker_loop(
    worker: IngestWorker,
    rx: SharedReceiver,
    index: usize,
) -> Result<(), WorkerError> {
    loop {
        // Hold the lock only for the dequeue, not while processing.
        let name = { rx.lock().await.recv().await };
        let Some(name) = name else {
            return Ok(());
        };

        gauge!(WORKERS_BUSY).increment(1.0);
        let result = worker.process_file(&name).await;
        gauge!(WORKERS_BUSY).decrement(1.0);

        if let Err(worker_error) = result {
            error!("worker {} stopping: {}", index, worker_error);
            return Err(worker_error);
        }
    }
}

/// The poll loop: snapshots the spool every interval, publishes the
/// queue-depth gauge, and feeds filenames to the worker pool through a
/// bounded channel whose capacity is the in-flight file limit. A full
/// channel blocks the coordinator instead of growing memory.
pub struct Coordinator {
    spool: SpoolDir,
    worker: IngestWorker,
    interval: Duration,
    max_workers: usize,
    queue_maxsize: usize,
    max_retries: u32,
    heartbeat: Heartbeat,
}

impl Coordinator {
    pub fn new(
        spool: SpoolDir,
        worker: IngestWorker,
        interval: Duration,
        max_workers: usize,
        queue_maxsize: usize,
        max_retries: u32,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            spool,
            worker,
            interval,
            max_workers,
            queue_maxsize,
            max_retries,
            heartbeat,
        }
    }

    /// Run until `shutdown` resolves. After shutdown, no new file is
    /// dispatched; in-flight workers finish their current file before this
    /// returns.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), WorkerError> {
        let (tx, rx) = mpsc::channel::<String>(self.queue_maxsize);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.max_workers);
        for index in 0..self.max_workers {
            handles.push(tokio::spawn(worker_loop(
                self.worker.clone(),
                rx.clone(),
                index,
            )));
        }
        // The workers hold the only receiver handles now, so the channel
        // closes for good once they all stop.
        drop(rx);

        let mut interval = tokio::time::interval(self.interval);
        let mut cycles: u64 = 0;
        tokio::pin!(shutdown);

        let result = 'poll: loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    info!("shutdown requested, draining in-flight work");
                    break 'poll Ok(());
                }
            }

            self.heartbeat.beat();
            cycles += 1;

            if cycles % RETRY_SWEEP_EVERY == 0 {
                let sweep = self.spool.requeue_pending_retries(self.max_retries)?;
                if sweep.requeued > 0 || sweep.quarantined > 0 {
                    info!(
                        "retry sweep: {} requeued, {} quarantined",
                        sweep.requeued, sweep.quarantined
                    );
                    counter!(RETRIES_REQUEUED).increment(sweep.requeued as u64);
                    counter!(RETRIES_QUARANTINED).increment(sweep.quarantined as u64);
                }
            }

            let pending = self.spool.list_pending()?;
            gauge!(QUEUE_DEPTH).set(pending.len() as f64);

            for name in pending {
                if tx.send(name).await.is_err() {
                    break 'poll Err(WorkerError::WorkersStopped);
                }
            }
        };

        // Closing the channel lets each worker drain and exit.
        drop(tx);
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(worker_error)) => error!("worker exited with: {}", worker_error),
                Err(join_error) => error!("worker panicked: {}", join_error),
            }
        }
        result
    }
}
