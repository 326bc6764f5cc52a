use ingest_common::spool::SpoolError;
use thiserror::Error;

/// Enumeration of errors that fail an entire submission file before any
/// insert is attempted. Routed to `failed/`: the file will never parse
/// differently on a retry.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("submission is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("submission top level is not a JSON object")]
    NotAnObject,
}

/// Enumeration of errors from the storage layer during a batch flush.
/// All variants are treated as transient: the file is routed to
/// `pending_retry/` and re-attempted on a later cycle.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to create connection pool: {error}")]
    PoolCreation { error: sqlx::Error },
    #[error("{table} upsert failed: {error}")]
    Upsert {
        table: &'static str,
        error: sqlx::Error,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Enumeration of errors for the log-excerpt upload step. Never fatal to a
/// file: a failed upload leaves the excerpt inline.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to compress excerpt: {0}")]
    Compress(std::io::Error),
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upload rejected with status {0}")]
    Status(reqwest::StatusCode),
}

/// Enumeration of errors that abort the ingestion process. Only filesystem
/// failures on the spool escalate this far; everything else resolves to a
/// per-file outcome.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("spool filesystem error: {0}")]
    Spool(#[from] SpoolError),
    #[error("failed to read {path}: {error}")]
    ReadFile {
        path: std::path::PathBuf,
        error: std::io::Error,
    },
    #[error("all ingestion workers have stopped")]
    WorkersStopped,
}
