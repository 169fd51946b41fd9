use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::connection::{establish_sqlite_connection, with_busy_retry};
use crate::enums::EventStatus;
use crate::error::EdgeDbError;
use crate::schema::events;

#[derive(Queryable, Identifiable, Clone, Debug, PartialEq)]
#[diesel(table_name = events)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub categories: String,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = events)]
pub struct NewEvent {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub categories: String,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        id: &str,
        name: &str,
        start_time: DateTime<Utc>,
        categories: &[String],
    ) -> Result<Self, EdgeDbError> {
        let now = Utc::now();
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            start_time,
            categories: serde_json::to_string(categories)?,
            status: EventStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }
}

impl Event {
    /// INSERT OR IGNORE: existing rows keep their first-seen start_time and
    /// any terminal status. Returns the number of rows actually inserted.
    pub fn upsert_many(database_path: &str, rows: &[NewEvent]) -> Result<usize, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            let inserted = diesel::insert_or_ignore_into(events::table)
                .values(rows)
                .execute(&mut connection)?;
            Ok(inserted)
        })
    }

    pub fn get_by_id(database_path: &str, event_id: &str) -> Result<Event, EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            events::table
                .find(event_id)
                .first::<Event>(&mut connection)
                .optional()?
                .ok_or_else(|| EdgeDbError::EventNotFound {
                    event_id: event_id.to_string(),
                })
        })
    }

    pub fn update_status(
        database_path: &str,
        event_id: &str,
        new_status: EventStatus,
    ) -> Result<(), EdgeDbError> {
        let mut connection = establish_sqlite_connection(database_path)?;
        with_busy_retry(|| {
            let updated = diesel::update(events::table.find(event_id))
                .set((
                    events::status.eq(new_status),
                    events::updated_at.eq(Utc::now()),
                ))
                .execute(&mut connection)?;
            if updated == 0 {
                return Err(EdgeDbError::EventNotFound {
                    event_id: event_id.to_string(),
                });
            }
            Ok(())
        })
    }

    pub fn category_names(&self) -> Vec<String> {
        serde_json::from_str(&self.categories).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::run_migrations;
    use chrono::Duration;

    fn test_db() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.db").display().to_string();
        run_migrations(&path).unwrap();
        (dir, path)
    }

    fn practice_event(id: &str, start_time: DateTime<Utc>) -> NewEvent {
        NewEvent::new(id, "Practice", start_time, &["Sports".to_string()]).unwrap()
    }

    #[test]
    fn test_upsert_many_is_insert_only() {
        let (_dir, db) = test_db();
        let start = Utc::now() + Duration::hours(1);

        let inserted = Event::upsert_many(&db, &[practice_event("E1", start)]).unwrap();
        assert_eq!(inserted, 1);

        // A second discovery pass with a moved start time changes nothing.
        let moved = practice_event("E1", start + Duration::hours(2));
        let inserted = Event::upsert_many(&db, &[moved]).unwrap();
        assert_eq!(inserted, 0);

        let row = Event::get_by_id(&db, "E1").unwrap();
        assert_eq!(row.start_time.timestamp(), start.timestamp());
        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.category_names(), vec!["Sports".to_string()]);
    }

    #[test]
    fn test_update_status_unknown_event() {
        let (_dir, db) = test_db();
        let result = Event::update_status(&db, "missing", EventStatus::Processed);
        assert!(matches!(result, Err(EdgeDbError::EventNotFound { .. })));
    }

    #[test]
    fn test_update_status_round_trip() {
        let (_dir, db) = test_db();
        let start = Utc::now() + Duration::hours(1);
        Event::upsert_many(&db, &[practice_event("E1", start)]).unwrap();

        Event::update_status(&db, "E1", EventStatus::Processed).unwrap();
        let row = Event::get_by_id(&db, "E1").unwrap();
        assert_eq!(row.status, EventStatus::Processed);
    }
}
