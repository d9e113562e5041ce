//! Stats and health HTTP server
//!
//! Read-only endpoints over a running [`Federation`] for dashboards and
//! container orchestration probes.

use crate::scheduler::Federation;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP stats server
pub struct StatsServer {
    federation: Arc<Federation>,
    port: u16,
}

impl StatsServer {
    pub fn new(federation: Arc<Federation>, port: u16) -> Self {
        Self { federation, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, without binding a socket
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_federation = self.federation.clone();
        let stats_federation = self.federation.clone();
        let metrics_federation = self.federation.clone();
        let workers_federation = self.federation.clone();

        // GET /health - 503 until at least one worker is online
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let federation = health_federation.clone();
                async move {
                    let status = health_status(&federation);
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /stats - federation totals and per-worker statistics
        let stats_route = warp::path("stats")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let federation = stats_federation.clone();
                async move { Ok::<_, Infallible>(warp::reply::json(&federation.stats())) }
            });

        // GET /metrics - scheduler and transport counters
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let federation = metrics_federation.clone();
                async move { Ok::<_, Infallible>(warp::reply::json(&federation.metrics().snapshot())) }
            });

        // GET /workers - per-worker liveness
        let workers_route = warp::path("workers")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let federation = workers_federation.clone();
                async move { Ok::<_, Infallible>(warp::reply::json(&federation.health_snapshots())) }
            });

        // GET /live - process liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Overall health, 503 while no worker is online"),
                ("/stats", "Federation and per-worker statistics"),
                ("/metrics", "Scheduler and transport counters"),
                ("/workers", "Per-worker liveness snapshots"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health_route
            .or(stats_route)
            .or(metrics_route)
            .or(workers_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        tracing::info!(port = self.port, "Starting stats server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], self.port)).await;
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    timestamp: u64,
    federation_id: String,
    uptime_seconds: u64,
    total_workers: usize,
    online_workers: usize,
    mqtt_connected: bool,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn health_status(federation: &Federation) -> HealthStatus {
    let snapshot = federation.metrics().snapshot();
    let registry = federation.registry();
    let online_workers = registry.online_count();

    HealthStatus {
        status: if online_workers > 0 {
            "healthy"
        } else {
            "degraded"
        },
        timestamp: snapshot.timestamp,
        federation_id: federation.config().federation.id.clone(),
        uptime_seconds: snapshot.uptime_seconds,
        total_workers: registry.len(),
        online_workers,
        mqtt_connected: snapshot.transport.connected,
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
