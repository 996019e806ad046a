//! HTTP handlers for the admin interface

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info};

use crate::manager::{ReplicationManager, ReplicationStatus};

/// Shared application state
pub type AppState = Arc<ReplicationManager>;

/// Memory figures for the host and this process
#[derive(Debug, Serialize)]
pub struct ProcessStats {
    /// Total system memory in MB
    pub total_memory_mb: f64,
    /// Free system memory in MB
    pub free_memory_mb: f64,
    /// Resident memory of this process in MB
    pub process_memory_mb: f64,
}

/// Body of `GET /status`
#[derive(Debug, Serialize)]
pub struct AdminStatus {
    pub replication: ReplicationStatus,
    pub process: ProcessStats,
}

/// Outcome of an operator control
#[derive(Debug, Serialize)]
struct ControlResponse {
    success: bool,
    result: String,
}

fn ok(result: impl Into<String>) -> (StatusCode, Json<ControlResponse>) {
    (
        StatusCode::OK,
        Json(ControlResponse {
            success: true,
            result: result.into(),
        }),
    )
}

fn process_stats() -> ProcessStats {
    let mut sys = System::new();
    sys.refresh_memory();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process_mem_bytes = sys.process(pid).map(|p| p.memory()).unwrap_or(0);

    ProcessStats {
        total_memory_mb: sys.total_memory() as f64 / 1024.0 / 1024.0,
        free_memory_mb: sys.available_memory() as f64 / 1024.0 / 1024.0,
        process_memory_mb: process_mem_bytes as f64 / 1024.0 / 1024.0,
    }
}

/// Replication state plus process memory
pub async fn status_handler(State(manager): State<AppState>) -> impl IntoResponse {
    debug!("Status requested");
    let status = AdminStatus {
        replication: manager.status(),
        process: process_stats(),
    };
    (StatusCode::OK, Json(status))
}

pub async fn force_snapshot_handler(State(manager): State<AppState>) -> impl IntoResponse {
    if !manager.snapshots_enabled() {
        return (
            StatusCode::CONFLICT,
            Json(ControlResponse {
                success: false,
                result: "storage engine does not support snapshots".to_string(),
            }),
        );
    }
    manager.force_snapshot_creation();
    ok("snapshot pass requested")
}

pub async fn drop_snapshots_handler(State(manager): State<AppState>) -> impl IntoResponse {
    info!("Operator dropped all snapshots");
    manager.drop_all_snapshots();
    ok("all snapshots dropped")
}

pub async fn reselect_handler(State(manager): State<AppState>) -> impl IntoResponse {
    let previous = manager.current_sync_source();
    info!("Operator requested a new sync source (was {:?})", previous.map(|h| h.to_string()));
    manager.signal_choose_new_sync_source();
    ok("sync source reselection requested")
}

pub async fn cancel_fetcher_handler(State(manager): State<AppState>) -> impl IntoResponse {
    info!("Operator cancelled the in-flight fetch");
    manager.signal_cancel_fetcher();
    ok("fetch cancelled")
}
