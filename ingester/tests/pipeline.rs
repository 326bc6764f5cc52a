//! End-to-end pipeline tests: spool in a tempdir, in-memory sink, counting
//! excerpt store. No network, no database.
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;

use ingest_common::health::Heartbeat;
use ingest_common::logcache::LogCache;
use ingest_common::spool::{Disposition, SpoolDir};
use ingester::batch::BatchSettings;
use ingester::error::UploadError;
use ingester::excerpt::{ExcerptConverter, ExcerptStore};
use ingester::parse::KnownTrees;
use ingester::sink::MemorySink;
use ingester::worker::{Coordinator, IngestWorker};

struct CountingStore {
    uploads: Mutex<Vec<String>>,
}

impl CountingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            uploads: Mutex::new(Vec::new()),
        })
    }

    fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl ExcerptStore for CountingStore {
    async fn upload(&self, digest: &str, _gzipped: Vec<u8>) -> Result<String, UploadError> {
        self.uploads.lock().unwrap().push(digest.to_owned());
        Ok(format!("https://files.example/logexcerpt/{digest}"))
    }
}

struct Pipeline {
    _dir: tempfile::TempDir,
    spool: SpoolDir,
    sink: Arc<MemorySink>,
    store: Arc<CountingStore>,
    worker: IngestWorker,
}

fn pipeline(excerpt_threshold: usize) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolDir::ensure(dir.path()).unwrap();
    let sink = Arc::new(MemorySink::new());
    let store = CountingStore::new();
    let converter = Arc::new(ExcerptConverter::new(
        excerpt_threshold,
        Arc::new(LogCache::new(1000)),
        store.clone(),
    ));
    let worker = IngestWorker::new(
        spool.clone(),
        sink.clone(),
        Some(converter),
        Arc::new(KnownTrees::default()),
        BatchSettings::default(),
    );
    Pipeline {
        _dir: dir,
        spool,
        sink,
        store,
        worker,
    }
}

fn coordinator(p: &Pipeline, max_workers: usize, interval: Duration) -> Coordinator {
    Coordinator::new(
        p.spool.clone(),
        p.worker.clone(),
        interval,
        max_workers,
        64,
        5,
        Heartbeat::new(ChronoDuration::seconds(30)),
    )
}

fn drop_file(spool: &SpoolDir, name: &str, contents: &str) {
    fs::write(spool.root().join(name), contents).unwrap();
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn run_until<F: FnMut() -> bool>(p: &Pipeline, max_workers: usize, check: F) {
    let coordinator = coordinator(p, max_workers, Duration::from_millis(5));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        coordinator
            .run(async move {
                _ = stop_rx.await;
            })
            .await
    });

    wait_until(check).await;

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn single_worker_drains_two_files() {
    let p = pipeline(256);
    drop_file(
        &p.spool,
        "first.json",
        r#"{"checkouts": [{"id": "c1", "origin": "maestro"}],
            "builds": [{"id": "b1", "checkout_id": "c1", "origin": "maestro", "status": "PASS"}]}"#,
    );
    drop_file(
        &p.spool,
        "second.json",
        r#"{"tests": [{"id": "t1", "build_id": "b1", "origin": "maestro", "status": "FAIL"}]}"#,
    );

    let spool = p.spool.clone();
    run_until(&p, 1, move || {
        spool.dir_for(Disposition::Archive).join("first.json").is_file()
            && spool
                .dir_for(Disposition::Archive)
                .join("second.json")
                .is_file()
    })
    .await;

    assert!(p.spool.list_pending().unwrap().is_empty());
    assert_eq!(p.sink.row_count(), 3);
    // The checkout flushed before the build that references it.
    let calls = p.sink.calls();
    let checkout_pos = calls.iter().position(|c| c.0 == "checkouts").unwrap();
    let build_pos = calls.iter().position(|c| c.0 == "builds").unwrap();
    assert!(checkout_pos < build_pos);
}

#[tokio::test]
async fn fatal_file_is_quarantined_with_no_partial_rows() {
    let p = pipeline(256);
    drop_file(&p.spool, "fatal.json", r#"[{"id": "c1"}]"#);

    let spool = p.spool.clone();
    run_until(&p, 2, move || {
        spool.dir_for(Disposition::Failed).join("fatal.json").is_file()
    })
    .await;

    assert_eq!(p.sink.row_count(), 0);
}

#[tokio::test]
async fn identical_excerpts_across_files_upload_once() {
    let p = pipeline(8);
    let excerpt = "Oops: general protection fault in kunit_test";
    let submission = |test_id: &str| {
        format!(
            r#"{{"tests": [{{"id": "{test_id}", "build_id": "b1", "origin": "maestro",
                "log_excerpt": "{excerpt}"}}]}}"#
        )
    };
    drop_file(&p.spool, "a.json", &submission("t1"));
    drop_file(&p.spool, "b.json", &submission("t2"));

    // One worker: concurrent workers may legitimately race a brand-new
    // excerpt into two uploads, which the cache design tolerates.
    let spool = p.spool.clone();
    run_until(&p, 1, move || {
        spool.dir_for(Disposition::Archive).join("a.json").is_file()
            && spool.dir_for(Disposition::Archive).join("b.json").is_file()
    })
    .await;

    assert_eq!(p.store.upload_count(), 1);

    let tests = p.sink.tests();
    assert_eq!(tests.len(), 2);
    let references: Vec<_> = tests
        .iter()
        .map(|t| t.output_files.clone().expect("excerpt reference missing"))
        .collect();
    assert_eq!(references[0], references[1]);
    for test in &tests {
        assert_eq!(test.log_excerpt.as_deref(), Some(""));
    }
}

#[tokio::test]
async fn transient_storage_failure_is_retried_to_success() {
    let p = pipeline(256);
    p.sink.fail_next(1);
    drop_file(
        &p.spool,
        "flaky.json",
        r#"{"issues": [{"id": "i1", "origin": "maestro", "version": 1}]}"#,
    );

    // First pass defers to pending_retry/; a later sweep requeues it as
    // flaky.retry-1.json and the second pass archives it.
    let spool = p.spool.clone();
    run_until(&p, 1, move || {
        spool
            .dir_for(Disposition::Archive)
            .join("flaky.retry-1.json")
            .is_file()
    })
    .await;

    assert_eq!(p.sink.row_count(), 1);
    assert!(p.spool.list_pending().unwrap().is_empty());
}

#[tokio::test]
async fn short_excerpts_are_not_uploaded() {
    let p = pipeline(256);
    drop_file(
        &p.spool,
        "short.json",
        r#"{"builds": [{"id": "b1", "checkout_id": "c1", "origin": "maestro",
            "log_excerpt": "ok"}]}"#,
    );

    let spool = p.spool.clone();
    run_until(&p, 1, move || {
        spool.dir_for(Disposition::Archive).join("short.json").is_file()
    })
    .await;

    assert_eq!(p.store.upload_count(), 0);
    let builds = p.sink.builds();
    assert_eq!(builds[0].log_excerpt.as_deref(), Some("ok"));
    assert_eq!(builds[0].output_files, None);
}
