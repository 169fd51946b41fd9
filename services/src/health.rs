use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use clubprint_edge_db::print_jobs::PrintJob;

use crate::breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::cache::{CacheUtilization, ResponseCache};
use crate::error::ServiceError;
use crate::memory::{MemoryMonitor, MemorySample};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub store: StoreCheck,
    pub breakers: Vec<BreakerSnapshot>,
    pub cache: CacheUtilization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySample>,
    pub jobs: BTreeMap<String, i64>,
    pub armed_timers: usize,
}

/// Builds the periodic health snapshot and rewrites `service-health.json`
/// atomically. An out-of-process watchdog keys on the file's mtime.
pub struct HealthReporter {
    database_path: String,
    health_file: PathBuf,
    breakers: Vec<Arc<CircuitBreaker>>,
    cache: Arc<ResponseCache>,
    memory: Arc<MemoryMonitor>,
    scheduler: Arc<Scheduler>,
    failed_job_threshold: i64,
}

impl HealthReporter {
    pub fn new(
        database_path: &str,
        health_file: PathBuf,
        breakers: Vec<Arc<CircuitBreaker>>,
        cache: Arc<ResponseCache>,
        memory: Arc<MemoryMonitor>,
        scheduler: Arc<Scheduler>,
        failed_job_threshold: i64,
    ) -> Self {
        Self {
            database_path: database_path.to_string(),
            health_file,
            breakers,
            cache,
            memory,
            scheduler,
            failed_job_threshold,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        // The job count query doubles as the store liveness probe.
        let (store, jobs) = match PrintJob::counts_by_status(&self.database_path) {
            Ok(rows) => {
                let jobs = rows
                    .into_iter()
                    .map(|(status, count)| (status.as_str().to_string(), count))
                    .collect();
                (
                    StoreCheck {
                        ok: true,
                        error: None,
                    },
                    jobs,
                )
            }
            Err(err) => (
                StoreCheck {
                    ok: false,
                    error: Some(err.to_string()),
                },
                BTreeMap::new(),
            ),
        };
        let breakers: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|b| b.snapshot()).collect();
        let failed_jobs = jobs.get("failed").copied().unwrap_or(0);

        let status = if !store.ok {
            HealthStatus::Unhealthy
        } else if breakers.iter().any(|b| b.state == BreakerState::Open)
            || failed_jobs > self.failed_job_threshold
            || self.memory.above_warning()
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSnapshot {
            status,
            timestamp: Utc::now(),
            store,
            breakers,
            cache: self.cache.utilization(),
            memory: self.memory.latest(),
            jobs,
            armed_timers: self.scheduler.armed_count(),
        }
    }

    /// Write the snapshot via a temp file in the same directory plus rename,
    /// so the watchdog never observes a torn file.
    pub fn write_snapshot(&self) -> Result<HealthStatus, ServiceError> {
        let snapshot = self.snapshot();
        let dir = self
            .health_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut staged, &snapshot)?;
        staged.flush()?;
        staged
            .persist(&self.health_file)
            .map_err(|err| ServiceError::IoError(err.error))?;
        debug!("Health snapshot written: {:?}", snapshot.status);
        Ok(snapshot.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::club_api::ClubApi;
    use crate::models::{Attendee, ClubEvent};
    use crate::sink::MockPrintSink;
    use crate::webhook::WebhookNotifier;
    use async_trait::async_trait;
    use clubprint_edge_db::connection::run_migrations;
    use clubprint_settings::ClubPrintSettings;

    struct EmptyApi;

    #[async_trait]
    impl ClubApi for EmptyApi {
        async fn list_upcoming_events(
            &self,
            _window_hours: u32,
        ) -> Result<Vec<ClubEvent>, ServiceError> {
            Ok(Vec::new())
        }

        async fn get_attendees(
            &self,
            _event_id: &str,
            _accept_stale: bool,
        ) -> Result<Vec<Attendee>, ServiceError> {
            Ok(Vec::new())
        }
    }

    fn reporter(dir: &Path, database_path: &str) -> (HealthReporter, Arc<CircuitBreaker>) {
        let mut settings = ClubPrintSettings::default();
        settings.paths.data_dir = dir.to_path_buf();
        settings.paths.run_dir = dir.to_path_buf();
        let breaker = Arc::new(CircuitBreaker::new("api", CircuitBreakerConfig::default()));
        let scheduler = Scheduler::new(
            settings.clone(),
            Arc::new(EmptyApi),
            Arc::new(MockPrintSink::new()),
            Arc::new(WebhookNotifier::disabled()),
        );
        let reporter = HealthReporter::new(
            database_path,
            settings.paths.health_file(),
            vec![breaker.clone()],
            Arc::new(ResponseCache::default()),
            Arc::new(MemoryMonitor::new(&settings.monitoring)),
            scheduler,
            settings.monitoring.failed_job_threshold,
        );
        (reporter, breaker)
    }

    #[tokio::test]
    async fn test_healthy_when_store_answers() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("clubprint.db").display().to_string();
        run_migrations(&db).unwrap();
        let (reporter, _) = reporter(dir.path(), &db);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert!(snapshot.store.ok);
        assert_eq!(snapshot.armed_timers, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("clubprint.db").display().to_string();
        run_migrations(&db).unwrap();
        let (reporter, breaker) = reporter(dir.path(), &db);

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(reporter.snapshot().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_broken_store_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        // Point at a directory: the probe query cannot succeed.
        let bogus = dir.path().display().to_string();
        let (reporter, _) = reporter(dir.path(), &bogus);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.status, HealthStatus::Unhealthy);
        assert!(!snapshot.store.ok);
    }

    #[tokio::test]
    async fn test_write_snapshot_is_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("clubprint.db").display().to_string();
        run_migrations(&db).unwrap();
        let (reporter, _) = reporter(dir.path(), &db);

        let status = reporter.write_snapshot().unwrap();
        assert_eq!(status, HealthStatus::Healthy);

        let raw = std::fs::read_to_string(dir.path().join("service-health.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["status"], "healthy");
        assert!(parsed["timestamp"].is_string());
    }
}
