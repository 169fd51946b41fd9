use thiserror::Error;

#[derive(Error, Debug)]
pub enum EdgeDbError {
    #[error("Print job for event id={event_id} is already scheduled")]
    AlreadyScheduled { event_id: String },
    #[error("No print job found for event id={event_id}")]
    JobNotFound { event_id: String },
    #[error("No event found for id={event_id}")]
    EventNotFound { event_id: String },
    #[error("Failed to run database migrations: {0}")]
    Migration(String),
    #[error(transparent)]
    Diesel(#[from] diesel::result::Error),
    #[error(transparent)]
    Connection(#[from] diesel::result::ConnectionError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}
