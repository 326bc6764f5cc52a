use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::types::{Build, Checkout, Incident, Issue, Test};

/// Destination for parsed record batches: one upsert operation per table.
/// Batches for one table arrive in submission order; batches across tables
/// arrive in dependency order (issues, checkouts, builds, tests, incidents).
#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn upsert_issues(&self, batch: Vec<Issue>) -> Result<(), SinkError>;
    async fn upsert_checkouts(&self, batch: Vec<Checkout>) -> Result<(), SinkError>;
    async fn upsert_builds(&self, batch: Vec<Build>) -> Result<(), SinkError>;
    async fn upsert_tests(&self, batch: Vec<Test>) -> Result<(), SinkError>;
    async fn upsert_incidents(&self, batch: Vec<Incident>) -> Result<(), SinkError>;
}

#[derive(Default)]
struct MemoryStore {
    issues: Vec<Issue>,
    checkouts: Vec<Checkout>,
    builds: Vec<Build>,
    tests: Vec<Test>,
    incidents: Vec<Incident>,
    /// (table, batch size) per upsert call, in arrival order.
    calls: Vec<(&'static str, usize)>,
    fail_remaining: u32,
}

/// In-memory sink for tests: records every batch and can inject a number of
/// transient failures before accepting writes again.
#[derive(Default)]
pub struct MemorySink {
    store: Mutex<MemoryStore>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` upsert calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.store.lock().expect("poisoned MemorySink mutex").fail_remaining = count;
    }

    pub fn calls(&self) -> Vec<(&'static str, usize)> {
        self.store.lock().expect("poisoned MemorySink mutex").calls.clone()
    }

    pub fn row_count(&self) -> usize {
        let store = self.store.lock().expect("poisoned MemorySink mutex");
        store.issues.len()
            + store.checkouts.len()
            + store.builds.len()
            + store.tests.len()
            + store.incidents.len()
    }

    pub fn checkouts(&self) -> Vec<Checkout> {
        self.store.lock().expect("poisoned MemorySink mutex").checkouts.clone()
    }

    pub fn builds(&self) -> Vec<Build> {
        self.store.lock().expect("poisoned MemorySink mutex").builds.clone()
    }

    pub fn tests(&self) -> Vec<Test> {
        self.store.lock().expect("poisoned MemorySink mutex").tests.clone()
    }

    fn record<T>(
        &self,
        table: &'static str,
        batch: Vec<T>,
        select: impl FnOnce(&mut MemoryStore) -> &mut Vec<T>,
    ) -> Result<(), SinkError> {
        let mut store = self.store.lock().expect("poisoned MemorySink mutex");
        if store.fail_remaining > 0 {
            store.fail_remaining -= 1;
            return Err(SinkError::Unavailable("injected failure".to_owned()));
        }
        store.calls.push((table, batch.len()));
        select(&mut store).extend(batch);
        Ok(())
    }
}

#[async_trait]
impl SubmissionSink for MemorySink {
    async fn upsert_issues(&self, batch: Vec<Issue>) -> Result<(), SinkError> {
        self.record("issues", batch, |s| &mut s.issues)
    }

    async fn upsert_checkouts(&self, batch: Vec<Checkout>) -> Result<(), SinkError> {
        self.record("checkouts", batch, |s| &mut s.checkouts)
    }

    async fn upsert_builds(&self, batch: Vec<Build>) -> Result<(), SinkError> {
        self.record("builds", batch, |s| &mut s.builds)
    }

    async fn upsert_tests(&self, batch: Vec<Test>) -> Result<(), SinkError> {
        self.record("tests", batch, |s| &mut s.tests)
    }

    async fn upsert_incidents(&self, batch: Vec<Incident>) -> Result<(), SinkError> {
        self.record("incidents", batch, |s| &mut s.incidents)
    }
}
