//! Per-route request metrics.

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
struct RouteCounters {
    requests: u64,
    errors: u64,
    total: Duration,
    max: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteMetrics {
    pub requests: u64,
    /// Responses with a 4xx or 5xx status.
    pub errors: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub routes: BTreeMap<String, RouteMetrics>,
}

/// Request counters keyed by `METHOD /matched/path`.
pub struct PerformanceMetrics {
    started: Instant,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    routes: Mutex<HashMap<String, RouteCounters>>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, route: &str, is_error: bool, elapsed: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = routes.entry(route.to_string()).or_default();
        counters.requests += 1;
        if is_error {
            counters.errors += 1;
        }
        counters.total += elapsed;
        counters.max = counters.max.max(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let routes = routes
            .iter()
            .map(|(route, c)| {
                let avg_ms = if c.requests == 0 {
                    0.0
                } else {
                    c.total.as_secs_f64() * 1000.0 / c.requests as f64
                };
                (
                    route.clone(),
                    RouteMetrics {
                        requests: c.requests,
                        errors: c.errors,
                        avg_ms,
                        max_ms: c.max.as_secs_f64() * 1000.0,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            routes,
        }
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Middleware recording latency and status per matched route. Install with
/// `route_layer` so the matched path is known.
pub async fn track_metrics(
    State(metrics): State<Arc<PerformanceMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let route = match request.extensions().get::<MatchedPath>() {
        Some(path) => format!("{} {}", request.method(), path.as_str()),
        None => format!("{} (unmatched)", request.method()),
    };
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    metrics.record(&route, status.is_client_error() || status.is_server_error(), started.elapsed());
    response
}
