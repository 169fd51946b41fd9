use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::warn;

use crate::error::EdgeDbError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE: Duration = Duration::from_millis(10);

pub fn establish_sqlite_connection(database_path: &str) -> Result<SqliteConnection, EdgeDbError> {
    let mut connection = SqliteConnection::establish(database_path)?;
    // WAL keeps readers from blocking the single writer; busy_timeout covers
    // the window where the retry wrapper has not kicked in yet.
    connection.batch_execute(
        "PRAGMA busy_timeout = 1000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
    )?;
    Ok(connection)
}

pub fn run_migrations(database_path: &str) -> Result<(), EdgeDbError> {
    let mut connection = establish_sqlite_connection(database_path)?;
    connection
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| EdgeDbError::Migration(e.to_string()))?;
    Ok(())
}

/// Flush the WAL into the main database file. Called once during shutdown.
pub fn checkpoint(database_path: &str) -> Result<(), EdgeDbError> {
    let mut connection = establish_sqlite_connection(database_path)?;
    connection.batch_execute("PRAGMA wal_checkpoint(TRUNCATE);")?;
    Ok(())
}

fn is_busy(error: &EdgeDbError) -> bool {
    match error {
        EdgeDbError::Diesel(diesel::result::Error::DatabaseError(_, info)) => {
            let message = info.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

/// Runs `op`, retrying on SQLite lock contention with doubling backoff
/// (10 ms -> 160 ms, 5 attempts). Non-contention errors return immediately.
pub fn with_busy_retry<T, F>(mut op: F) -> Result<T, EdgeDbError>
where
    F: FnMut() -> Result<T, EdgeDbError>,
{
    let mut delay = BUSY_RETRY_BASE;
    let mut attempt: u32 = 1;
    loop {
        match op() {
            Err(error) if is_busy(&error) && attempt < BUSY_RETRY_ATTEMPTS => {
                warn!(
                    "Database busy (attempt {}/{}), retrying in {:?}",
                    attempt, BUSY_RETRY_ATTEMPTS, delay
                );
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}
