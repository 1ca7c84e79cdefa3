//! Liveness reporting for the supervisor loop.
//!
//! The loop reports on every iteration; the HTTP probe turns unhealthy
//! when a report has not arrived within the deadline. Readiness and
//! liveness stay separate at the route level so the two k8s concepts
//! are never merged into one state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};

#[derive(Clone)]
pub struct Liveness {
    last_beat_micros: Arc<AtomicI64>,
    deadline: chrono::Duration,
}

impl Liveness {
    pub fn new(deadline: chrono::Duration) -> Self {
        Self {
            last_beat_micros: Arc::new(AtomicI64::new(Utc::now().timestamp_micros())),
            deadline,
        }
    }

    /// Record a heartbeat. Must be called more frequently than the
    /// configured deadline.
    pub fn report_healthy(&self) {
        self.last_beat_micros
            .store(Utc::now().timestamp_micros(), Ordering::Relaxed);
    }

    pub fn status(&self) -> HealthStatus {
        let micros = self.last_beat_micros.load(Ordering::Relaxed);
        let last_beat = DateTime::<Utc>::from_timestamp_micros(micros)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        HealthStatus {
            healthy: Utc::now() - last_beat <= self.deadline,
            last_beat,
        }
    }
}

#[derive(Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_beat: DateTime<Utc>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("healthy: {}, last heartbeat: {}", self.healthy, self.last_beat);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_liveness_is_healthy() {
        let liveness = Liveness::new(chrono::Duration::seconds(30));
        assert!(liveness.status().healthy);
    }

    #[test]
    fn test_stalled_liveness_goes_unhealthy() {
        let liveness = Liveness::new(chrono::Duration::microseconds(-1));
        assert!(!liveness.status().healthy);

        liveness.report_healthy();
        // Deadline is negative, so even a fresh beat is already stale.
        assert!(!liveness.status().healthy);
    }

    #[test]
    fn test_report_refreshes_the_beat() {
        let liveness = Liveness::new(chrono::Duration::seconds(30));
        let before = liveness.status().last_beat;
        liveness.report_healthy();
        assert!(liveness.status().last_beat >= before);
    }
}
