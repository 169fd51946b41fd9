use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;

use crate::connection::{establish_sqlite_connection, with_busy_retry};
use crate::enums::{EventStatus, JobStatus};
use crate::error::EdgeDbError;
use crate::schema::{events, print_jobs};

#[derive(Queryable, Identifiable, Clone, Debug, PartialEq)]
#[diesel(table_name = print_jobs, primary_key(event_id))]
pub struct PrintJob {
    pub event_id: String,
    pub event_name: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = print_jobs)]
struct NewPrintJob<'a> {
    event_id: &'a str,
    event_name: &'a str,
    scheduled_time: DateTime<Utc>,
    status: JobStatus,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const TERMINAL_JOB_STATUSES: [JobStatus; 2] = [JobStatus::Completed, JobStatus::Failed];
const ACTIVE_JOB_STATUSES: [JobStatus; 3] = [
    JobStatus::Scheduled,
    JobStatus::Processing,
    JobStatus::Retrying,
];

impl PrintJob {
    /// Insert a `scheduled` row for the event. The existence check and the
    /// insert share one immediate transaction, so two concurrent arms cannot
    /// both succeed.
    pub fn arm(
        database_path: &str,
        event_id: &str,
        event_name: &str,
        scheduled_time: DateTime<Utc>,
    ) -> Result<PrintJob, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            connection.immediate_transaction::<PrintJob, EdgeDbError, _>(|conn| {
                let existing = print_jobs::table
                    .find(event_id)
                    .first::<PrintJob>(conn)
                    .optional()?;
                if existing.is_some() {
                    return Err(EdgeDbError::AlreadyScheduled {
                        event_id: event_id.to_string(),
                    });
                }
                let now = Utc::now();
                diesel::insert_into(print_jobs::table)
                    .values(&NewPrintJob {
                        event_id,
                        event_name,
                        scheduled_time,
                        status: JobStatus::Scheduled,
                        retry_count: 0,
                        created_at: now,
                        updated_at: now,
                    })
                    .execute(conn)?;
                Ok(print_jobs::table.find(event_id).first::<PrintJob>(conn)?)
            })
        })
    }

    pub fn get_by_event_id(database_path: &str, event_id: &str) -> Result<PrintJob, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            print_jobs::table
                .find(event_id)
                .first::<PrintJob>(&mut connection)
                .optional()?
                .ok_or_else(|| EdgeDbError::JobNotFound {
                    event_id: event_id.to_string(),
                })
        })
    }

    pub fn update_status(
        database_path: &str,
        event_id: &str,
        new_status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            let updated = diesel::update(print_jobs::table.find(event_id))
                .set((
                    print_jobs::status.eq(new_status),
                    print_jobs::error_message.eq(error_message),
                    print_jobs::updated_at.eq(Utc::now()),
                ))
                .execute(&mut connection)?;
            if updated == 0 {
                return Err(EdgeDbError::JobNotFound {
                    event_id: event_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Returns the retry count after the increment.
    pub fn increment_retry(database_path: &str, event_id: &str) -> Result<i32, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            connection.immediate_transaction::<i32, EdgeDbError, _>(|conn| {
                let job = print_jobs::table
                    .find(event_id)
                    .first::<PrintJob>(conn)
                    .optional()?
                    .ok_or_else(|| EdgeDbError::JobNotFound {
                        event_id: event_id.to_string(),
                    })?;
                let next = job.retry_count + 1;
                diesel::update(print_jobs::table.find(event_id))
                    .set((
                        print_jobs::retry_count.eq(next),
                        print_jobs::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)?;
                Ok(next)
            })
        })
    }

    /// Atomic terminal pair: job -> completed, event -> processed.
    pub fn complete_with_event(database_path: &str, event_id: &str) -> Result<(), EdgeDbError> {
        Self::terminal_pair(
            database_path,
            event_id,
            JobStatus::Completed,
            EventStatus::Processed,
            None,
        )
    }

    /// Atomic terminal pair: job -> failed, event -> failed.
    pub fn fail_with_event(
        database_path: &str,
        event_id: &str,
        error_message: &str,
    ) -> Result<(), EdgeDbError> {
        Self::terminal_pair(
            database_path,
            event_id,
            JobStatus::Failed,
            EventStatus::Failed,
            Some(error_message),
        )
    }

    fn terminal_pair(
        database_path: &str,
        event_id: &str,
        job_status: JobStatus,
        event_status: EventStatus,
        error_message: Option<&str>,
    ) -> Result<(), EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            connection.immediate_transaction::<(), EdgeDbError, _>(|conn| {
                let now = Utc::now();
                let jobs = diesel::update(print_jobs::table.find(event_id))
                    .set((
                        print_jobs::status.eq(job_status),
                        print_jobs::error_message.eq(error_message),
                        print_jobs::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                if jobs == 0 {
                    return Err(EdgeDbError::JobNotFound {
                        event_id: event_id.to_string(),
                    });
                }
                let updated = diesel::update(events::table.find(event_id))
                    .set((
                        events::status.eq(event_status),
                        events::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                if updated == 0 {
                    return Err(EdgeDbError::EventNotFound {
                        event_id: event_id.to_string(),
                    });
                }
                Ok(())
            })
        })
    }

    /// Jobs a restart has to deal with: scheduled, processing or retrying.
    pub fn list_active(database_path: &str) -> Result<Vec<PrintJob>, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            let rows = print_jobs::table
                .filter(print_jobs::status.eq_any(ACTIVE_JOB_STATUSES))
                .order(print_jobs::scheduled_time.asc())
                .load::<PrintJob>(&mut connection)?;
            Ok(rows)
        })
    }

    pub fn counts_by_status(database_path: &str) -> Result<Vec<(JobStatus, i64)>, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            let rows = print_jobs::table
                .group_by(print_jobs::status)
                .select((print_jobs::status, count_star()))
                .load::<(JobStatus, i64)>(&mut connection)?;
            Ok(rows)
        })
    }

    /// Prune terminal jobs and their events whose updated_at is older than
    /// the cutoff. Jobs go first so the event delete never breaks the
    /// foreign key.
    pub fn cleanup_older_than(
        database_path: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            connection.immediate_transaction::<usize, EdgeDbError, _>(|conn| {
                let jobs = diesel::delete(
                    print_jobs::table.filter(
                        print_jobs::status
                            .eq_any(TERMINAL_JOB_STATUSES)
                            .and(print_jobs::updated_at.lt(cutoff)),
                    ),
                )
                .execute(conn)?;
                let events_deleted = diesel::delete(
                    events::table.filter(
                        events::status
                            .eq_any([EventStatus::Processed, EventStatus::Failed])
                            .and(events::updated_at.lt(cutoff))
                            .and(events::id.ne_all(print_jobs::table.select(print_jobs::event_id))),
                    ),
                )
                .execute(conn)?;
                Ok(jobs + events_deleted)
            })
        })
    }

    /// Repair rows written by pre-atomic code paths: a terminal job next to
    /// a still-pending event. The job row is the newer fact, so the event is
    /// updated to match. Returns the number of events repaired.
    pub fn reconcile(database_path: &str) -> Result<usize, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            connection.immediate_transaction::<usize, EdgeDbError, _>(|conn| {
                let orphans: Vec<(String, JobStatus)> = print_jobs::table
                    .inner_join(events::table)
                    .filter(
                        print_jobs::status
                            .eq_any(TERMINAL_JOB_STATUSES)
                            .and(events::status.eq(EventStatus::Pending)),
                    )
                    .select((print_jobs::event_id, print_jobs::status))
                    .load(conn)?;
                for (event_id, job_status) in &orphans {
                    let event_status = match job_status {
                        JobStatus::Completed => EventStatus::Processed,
                        _ => EventStatus::Failed,
                    };
                    diesel::update(events::table.find(event_id.as_str()))
                        .set((
                            events::status.eq(event_status),
                            events::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)?;
                }
                Ok(orphans.len())
            })
        })
    }
}
