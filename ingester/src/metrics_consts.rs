pub const QUEUE_DEPTH: &str = "ingest_spool_queue_depth";
pub const RECORDS_ACCEPTED: &str = "ingest_records_accepted_total";
pub const RECORDS_REJECTED: &str = "ingest_records_rejected_total";
pub const FILES_PROCESSED: &str = "ingest_files_processed_total";
pub const FILE_PROCESSING_TIME: &str = "ingest_file_processing_duration_seconds";
pub const BATCH_FLUSHES: &str = "ingest_batch_flushes_total";
pub const BATCH_SIZE: &str = "ingest_batch_size";
pub const EXCERPTS_UPLOADED: &str = "ingest_log_excerpts_uploaded_total";
pub const EXCERPTS_DEDUPED: &str = "ingest_log_excerpts_deduped_total";
pub const EXCERPT_UPLOAD_FAILURES: &str = "ingest_log_excerpt_upload_failures_total";
pub const RETRIES_REQUEUED: &str = "ingest_retries_requeued_total";
pub const RETRIES_QUARANTINED: &str = "ingest_retries_quarantined_total";
pub const WORKERS_BUSY: &str = "ingest_workers_busy";
