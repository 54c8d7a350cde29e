//! HTTP surface of the controller: index, health checks and Prometheus metrics.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::time::Instant;

// about 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Nothing reported yet
    Starting,
    /// Finished a cycle recently, must report again before the deadline
    HealthyUntil(Instant),
    /// The controller stopped on an error that needs an operator
    Halted,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            HealthStatus::HealthyUntil(until) => *until > Instant::now(),
            _ => false,
        }
    }
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = match self {
            HealthStatus::HealthyUntil(_) if self.is_healthy() => "healthy".to_string(),
            HealthStatus::HealthyUntil(_) => "stalled".to_string(),
            other => format!("{other:?}").to_lowercase(),
        };
        match self.is_healthy() {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// Liveness of the commit loop, reported by the controller after every cycle.
#[derive(Clone)]
pub struct ControllerHealth {
    status: Arc<RwLock<HealthStatus>>,
}

impl Default for ControllerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerHealth {
    pub fn new() -> Self {
        Self {
            status: Arc::new(RwLock::new(HealthStatus::Starting)),
        }
    }

    pub fn report_healthy(&self, deadline: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(deadline)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.set(HealthStatus::HealthyUntil(until));
    }

    pub fn report_halted(&self) {
        self.set(HealthStatus::Halted);
    }

    pub fn status(&self) -> HealthStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, status: HealthStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

pub async fn index() -> &'static str {
    "merge committer"
}

/// Build the router serving `/`, `/_readiness`, `/_liveness` and `/metrics`.
pub fn router(health: ControllerHealth, recorder: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(health.status())))
        .route(
            "/metrics",
            get(move || std::future::ready(recorder.render())),
        )
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // durations are recorded in milliseconds
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 30000.0, 60000.0, 120000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_health_expires_without_reports() {
        let health = ControllerHealth::new();
        assert!(!health.status().is_healthy());

        health.report_healthy(Duration::from_secs(10));
        assert!(health.status().is_healthy());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!health.status().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_halted_is_unhealthy() {
        let health = ControllerHealth::new();
        health.report_healthy(Duration::from_secs(10));
        health.report_halted();

        assert_eq!(health.status(), HealthStatus::Halted);
        assert_eq!(
            health.status().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_deadline_stays_healthy() {
        let health = ControllerHealth::new();
        health.report_healthy(Duration::MAX);

        tokio::time::advance(Duration::from_secs(86400)).await;
        assert!(health.status().is_healthy());
    }
}
