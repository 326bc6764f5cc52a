use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};

/// Liveness tracking for the coordinator loop.
///
/// The process can only be trusted with spooled submissions if the poll loop
/// is actually running, so the coordinator beats once per cycle and the
/// liveness probe fails when the last beat is older than the deadline.
#[derive(Clone)]
pub struct Heartbeat {
    stale_after: Duration,
    last_beat: Arc<RwLock<DateTime<Utc>>>,
}

#[derive(Debug)]
pub struct HeartbeatStatus {
    pub alive: bool,
    pub last_beat: DateTime<Utc>,
}

impl IntoResponse for HeartbeatStatus {
    /// 200 while the coordinator is beating, 500 once it stalls. The body
    /// carries the last beat time for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.alive {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

impl Heartbeat {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            last_beat: Arc::new(RwLock::new(Utc::now())),
        }
    }

    /// Record one coordinator cycle. Must be called more frequently than the
    /// configured deadline.
    pub fn beat(&self) {
        let mut last = self.last_beat.write().expect("poisoned Heartbeat lock");
        *last = Utc::now();
    }

    pub fn status(&self) -> HeartbeatStatus {
        let last_beat = *self.last_beat.read().expect("poisoned Heartbeat lock");
        HeartbeatStatus {
            alive: Utc::now() - last_beat < self.stale_after,
            last_beat,
        }
    }
}
