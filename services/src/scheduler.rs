use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use clubprint_edge_db::enums::JobStatus;
use clubprint_edge_db::error::EdgeDbError;
use clubprint_edge_db::events::{Event, NewEvent};
use clubprint_edge_db::print_jobs::PrintJob;
use clubprint_settings::ClubPrintSettings;

use crate::club_api::ClubApi;
use crate::error::ServiceError;
use crate::models::ClubEvent;
use crate::pdf::{build_attendee_sheet, SheetEvent};
use crate::sink::{PrintJobContext, PrintSink};
use crate::timer::sleep_until_wall_clock;
use crate::webhook::{EventNotifier, WebhookEvent};

pub const MISSED_WINDOW_MESSAGE: &str = "missed scheduled time";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed,
    Skipped,
    MissedWindow,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscoveryOutcome {
    pub fetched: usize,
    pub retained: usize,
    pub inserted: usize,
    pub armed: usize,
}

/// Two-phase pipeline: discovery upserts events and arms one-shot timers;
/// timer fire materialises the roster, renders the sheet and drives the
/// delivery plus its retry ladder. Owns the armed-timer map.
pub struct Scheduler {
    settings: ClubPrintSettings,
    database_path: String,
    api: Arc<dyn ClubApi>,
    sink: Arc<dyn PrintSink>,
    notifier: Arc<dyn EventNotifier>,
    armed: Mutex<HashMap<String, JoinHandle<()>>>,
    in_flight: AtomicUsize,
    // Handed to spawned timer tasks so they can call back into process().
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        settings: ClubPrintSettings,
        api: Arc<dyn ClubApi>,
        sink: Arc<dyn PrintSink>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Arc<Self> {
        let database_path = settings.paths.db().display().to_string();
        Arc::new_cyclic(|weak_self| Self {
            settings,
            database_path,
            api,
            sink,
            notifier,
            armed: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn database_path(&self) -> &str {
        &self.database_path
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().len()
    }

    pub fn is_armed(&self, event_id: &str) -> bool {
        self.armed.lock().contains_key(event_id)
    }

    fn pre_event_lead(&self) -> Duration {
        Duration::minutes(i64::from(self.settings.pre_event_query_minutes))
    }

    fn past_grace(&self, scheduled_time: DateTime<Utc>) -> bool {
        let grace = Duration::minutes(i64::from(self.settings.grace_window_minutes));
        scheduled_time < Utc::now() - grace
    }

    /// One discovery pass: fetch the window, apply the category allow-list,
    /// dedupe, upsert and arm whatever is not terminal or already armed.
    pub async fn run_discovery(&self) -> Result<DiscoveryOutcome, ServiceError> {
        let events = self
            .api
            .list_upcoming_events(self.settings.fetch_window_hours)
            .await?;
        let fetched = events.len();

        // Filter first so the allow-list sees every category the event
        // carries, then dedupe by id.
        let mut seen = HashSet::new();
        let mut retained = Vec::new();
        for event in events {
            if !event.matches_categories(&self.settings.categories) {
                continue;
            }
            if !seen.insert(event.id.clone()) {
                continue;
            }
            retained.push(event);
        }

        let mut rows = Vec::with_capacity(retained.len());
        for event in &retained {
            rows.push(NewEvent::new(
                &event.id,
                &event.name,
                event.start_time,
                &event.categories,
            )?);
        }
        let inserted = Event::upsert_many(&self.database_path, &rows)?;

        let mut armed = 0;
        for event in &retained {
            match Event::get_by_id(&self.database_path, &event.id) {
                Ok(row) if row.status.is_terminal() => continue,
                Ok(_) => {}
                Err(err) => {
                    error!("Failed to read event {} after upsert: {}", event.id, err);
                    continue;
                }
            }
            if self.arm(event).await == ArmOutcome::Armed {
                armed += 1;
            }
        }
        let outcome = DiscoveryOutcome {
            fetched,
            retained: retained.len(),
            inserted,
            armed,
        };
        info!(
            "Discovery pass: {} fetched, {} retained, {} new, {} armed",
            outcome.fetched, outcome.retained, outcome.inserted, outcome.armed
        );
        Ok(outcome)
    }

    /// Arm a one-shot timer at `start_time - pre_event_lead`. Events whose
    /// slot passed beyond the grace window fail terminally; events inside
    /// the window fire immediately.
    pub async fn arm(&self, event: &ClubEvent) -> ArmOutcome {
        let scheduled_time = event.start_time - self.pre_event_lead();
        if self.past_grace(scheduled_time) {
            self.mark_missed(&event.id, &event.name, scheduled_time)
                .await;
            return ArmOutcome::MissedWindow;
        }
        if self.is_armed(&event.id) {
            return ArmOutcome::Skipped;
        }
        match PrintJob::arm(&self.database_path, &event.id, &event.name, scheduled_time) {
            Ok(_) => {}
            Err(EdgeDbError::AlreadyScheduled { .. }) => {
                debug!("Event {} already has an active job", event.id);
                return ArmOutcome::Skipped;
            }
            Err(err) => {
                // Losing the row risks a duplicate print after a restart;
                // losing the timer loses the print entirely.
                error!(
                    "Failed to persist job for event {}: {}; arming in-memory timer anyway",
                    event.id, err
                );
            }
        }
        self.install_timer(event.clone(), scheduled_time);
        ArmOutcome::Armed
    }

    async fn mark_missed(&self, event_id: &str, event_name: &str, scheduled_time: DateTime<Utc>) {
        warn!(
            "Event {} ({}) was scheduled for {} and missed its window",
            event_id, event_name, scheduled_time
        );
        match PrintJob::arm(&self.database_path, event_id, event_name, scheduled_time) {
            Ok(_) | Err(EdgeDbError::AlreadyScheduled { .. }) => {}
            Err(err) => {
                error!("Failed to record missed job for {}: {}", event_id, err);
                return;
            }
        }
        if let Err(err) =
            PrintJob::fail_with_event(&self.database_path, event_id, MISSED_WINDOW_MESSAGE)
        {
            error!("Failed to mark {} as missed: {}", event_id, err);
        }
        self.notifier
            .notify(
                WebhookEvent::EventFailed,
                json!({"eventId": event_id, "eventName": event_name, "error": MISSED_WINDOW_MESSAGE}),
            )
            .await;
    }

    fn install_timer(&self, event: ClubEvent, fire_at: DateTime<Utc>) {
        let scheduler = match self.weak_self.upgrade() {
            Some(scheduler) => scheduler,
            None => return,
        };
        let event_id = event.id.clone();
        // Hold the map lock across the spawn: a timer that fires immediately
        // must not reach its own removal before the handle is inserted.
        let mut armed = self.armed.lock();
        let handle = tokio::spawn(async move {
            sleep_until_wall_clock(fire_at).await;
            scheduler.fire(event).await;
        });
        if let Some(stale) = armed.insert(event_id, handle) {
            // Stale handle from a previous recovery pass.
            stale.abort();
        }
    }

    async fn fire(self: Arc<Self>, event: ClubEvent) {
        self.armed.lock().remove(&event.id);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.process(&event).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Materialise and deliver: roster -> PDF -> sink, then commit the
    /// outcome. Failures walk the retry ladder; a 401 short-circuits it.
    pub async fn process(&self, event: &ClubEvent) {
        info!("Processing event {} ({})", event.id, event.name);
        if let Err(err) = PrintJob::update_status(
            &self.database_path,
            &event.id,
            JobStatus::Processing,
            None,
        ) {
            error!("Failed to mark job processing for {}: {}", event.id, err);
        }
        match self.deliver_once(event).await {
            Ok(()) => {
                if let Err(err) = PrintJob::complete_with_event(&self.database_path, &event.id) {
                    error!(
                        "Delivery for {} succeeded but the outcome could not be stored: {}",
                        event.id, err
                    );
                }
                info!("Event {} processed", event.id);
                self.notifier
                    .notify(
                        WebhookEvent::EventProcessed,
                        json!({"eventId": event.id, "eventName": event.name}),
                    )
                    .await;
            }
            Err(err) if err.is_fatal_auth() => {
                error!("Auth failure while processing {}: {}", event.id, err);
                self.fail_terminally(event, &err, WebhookEvent::EventFailed)
                    .await;
            }
            Err(err) => {
                let retry_count = match PrintJob::get_by_event_id(&self.database_path, &event.id) {
                    Ok(job) => job.retry_count.max(0) as u32,
                    Err(db_err) => {
                        error!("Failed to read retry count for {}: {}", event.id, db_err);
                        0
                    }
                };
                if retry_count < self.settings.retry.max_attempts {
                    let delay = self.settings.retry_delay(retry_count);
                    warn!(
                        "Delivery failed for {} (retry {} of {} in {:?}): {}",
                        event.id,
                        retry_count + 1,
                        self.settings.retry.max_attempts,
                        delay,
                        err
                    );
                    if let Err(db_err) = PrintJob::increment_retry(&self.database_path, &event.id)
                    {
                        error!("Failed to bump retry count for {}: {}", event.id, db_err);
                    }
                    if let Err(db_err) = PrintJob::update_status(
                        &self.database_path,
                        &event.id,
                        JobStatus::Retrying,
                        Some(&err.to_string()),
                    ) {
                        error!("Failed to mark job retrying for {}: {}", event.id, db_err);
                    }
                    self.notifier
                        .notify(
                            WebhookEvent::JobRetry,
                            json!({
                                "eventId": event.id,
                                "retryCount": retry_count + 1,
                                "delaySeconds": delay.as_secs(),
                                "error": err.to_string(),
                            }),
                        )
                        .await;
                    let fire_at = Utc::now()
                        + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
                    self.install_timer(event.clone(), fire_at);
                } else {
                    error!(
                        "Delivery failed for {} after {} attempts: {}",
                        event.id,
                        retry_count + 1,
                        err
                    );
                    self.fail_terminally(event, &err, WebhookEvent::JobPermanentFailure)
                        .await;
                }
            }
        }
    }

    async fn fail_terminally(&self, event: &ClubEvent, err: &ServiceError, webhook: WebhookEvent) {
        if let Err(db_err) =
            PrintJob::fail_with_event(&self.database_path, &event.id, &err.to_string())
        {
            error!("Failed to store terminal failure for {}: {}", event.id, db_err);
        }
        self.notifier
            .notify(
                webhook,
                json!({"eventId": event.id, "eventName": event.name, "error": err.to_string()}),
            )
            .await;
    }

    async fn deliver_once(&self, event: &ClubEvent) -> Result<(), ServiceError> {
        let attendees = self.api.get_attendees(&event.id, true).await?;
        let pdf = build_attendee_sheet(
            &self.settings.pdf,
            &SheetEvent {
                name: event.name.clone(),
                start_time: event.start_time,
            },
            &attendees,
        )?;
        self.sink
            .deliver(
                PrintJobContext {
                    event_id: event.id.clone(),
                    event_name: event.name.clone(),
                    output_filename: self.settings.output_filename.clone(),
                },
                pdf,
            )
            .await
    }

    /// Startup recovery from the persisted queue. The stored scheduled_time
    /// is honoured as-is; the already-scheduled guard is bypassed because
    /// the row exists but no in-memory timer does.
    pub async fn recover(&self) -> Result<usize, ServiceError> {
        let jobs = PrintJob::list_active(&self.database_path)?;
        info!("Recovering {} persisted jobs", jobs.len());
        let mut rearmed = 0;
        for job in jobs {
            if self.past_grace(job.scheduled_time) {
                warn!(
                    "Job for event {} missed its window during downtime",
                    job.event_id
                );
                if let Err(err) = PrintJob::fail_with_event(
                    &self.database_path,
                    &job.event_id,
                    MISSED_WINDOW_MESSAGE,
                ) {
                    error!("Failed to mark {} as missed: {}", job.event_id, err);
                }
                self.notifier
                    .notify(
                        WebhookEvent::EventFailed,
                        json!({"eventId": job.event_id, "eventName": job.event_name, "error": MISSED_WINDOW_MESSAGE}),
                    )
                    .await;
                continue;
            }
            let event = match Event::get_by_id(&self.database_path, &job.event_id) {
                Ok(row) => ClubEvent {
                    id: row.id.clone(),
                    name: row.name.clone(),
                    start_time: row.start_time,
                    categories: row.category_names(),
                },
                Err(err) => {
                    // Job without an event row: fall back to the snapshot.
                    warn!(
                        "No event row for recovered job {}: {}; using job snapshot",
                        job.event_id, err
                    );
                    ClubEvent {
                        id: job.event_id.clone(),
                        name: job.event_name.clone(),
                        start_time: job.scheduled_time + self.pre_event_lead(),
                        categories: Vec::new(),
                    }
                }
            };
            self.install_timer(event, job.scheduled_time);
            rearmed += 1;
        }
        Ok(rearmed)
    }

    /// Cancel every armed timer, then wait up to `drain` for in-flight
    /// deliveries to commit their outcome.
    pub async fn shutdown(&self, drain: StdDuration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut armed = self.armed.lock();
            armed.drain().map(|(_, handle)| handle).collect()
        };
        info!("Cancelling {} armed timers", handles.len());
        for handle in handles {
            handle.abort();
        }
        let deadline = tokio::time::Instant::now() + drain;
        while self.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("{} deliveries still in flight at shutdown", remaining);
        }
    }
}
