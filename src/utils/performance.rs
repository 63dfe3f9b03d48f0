use crate::server::database::Database;
use chrono::Utc;
use log::{error, info, warn};
use std::{fs::OpenOptions, io::Write, path::Path, sync::Arc, time::Duration};
use sysinfo::System;
use tokio::time;

/// Point-in-time counters written by the performance logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub users: i64,
    pub groups: i64,
    pub pending_requests: i64,
}

async fn count(db: &Database, label: &str, sql: &str) -> i64 {
    match sqlx::query_scalar::<_, i64>(sql).fetch_one(&db.pool).await {
        Ok(count) => count,
        Err(e) => {
            warn!("[PERF] Failed to query {}: {}", label, e);
            -1
        }
    }
}

/// Failed queries are reported as -1 rather than aborting the logger.
pub async fn snapshot(db: &Database) -> Snapshot {
    Snapshot {
        users: count(db, "users", "SELECT COUNT(*) FROM users").await,
        groups: count(db, "groups", "SELECT COUNT(*) FROM study_groups").await,
        pending_requests: count(
            db,
            "pending requests",
            "SELECT COUNT(*) FROM join_requests WHERE status = 'pending'",
        )
        .await,
    }
}

pub async fn start_performance_logger(db: Arc<Database>, log_path: &str, interval: Duration) {
    let mut system = System::new_all();

    if let Some(parent) = Path::new(log_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("[PERF] Unable to create directory for '{}': {}", log_path, e);
                return;
            }
        }
    }
    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("[PERF] Unable to open performance log file '{}': {}", log_path, e);
            return;
        }
    };

    // Header only for a fresh file
    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if let Err(e) = writeln!(
            file,
            "# PeerLink Server Performance Log\n# Timestamp, Users, Groups, Pending_Requests, CPU_Usage"
        ) {
            error!("[PERF] Failed to write header to performance log: {}", e);
            return;
        }
        info!("[PERF] Performance log initialized: {}", log_path);
    }

    loop {
        system.refresh_cpu();
        let cpus = system.cpus();
        let cpu_usage = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let stats = snapshot(&db).await;

        info!(
            "[PERF] Users: {}, Groups: {}, Pending requests: {}, CPU: {:.1}%",
            stats.users, stats.groups, stats.pending_requests, cpu_usage
        );
        if let Err(e) = writeln!(
            file,
            "{}, {}, {}, {}, {:.1}%",
            timestamp, stats.users, stats.groups, stats.pending_requests, cpu_usage
        ) {
            error!("[PERF] Failed to write to performance log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("[PERF] Failed to flush performance log: {}", e);
        }

        time::sleep(interval).await;
    }
}
