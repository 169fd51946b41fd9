use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Upstream rejected the API token (HTTP 401)")]
    Auth,
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },
    #[error("Upstream unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("All {total} records in the response failed validation")]
    AllRecordsInvalid { total: usize },
    #[error("Print sink '{sink}' failure: {reason}")]
    Sink { sink: String, reason: String },
    #[error("Failed to build PDF: {0}")]
    Pdf(String),
    #[error("Webhook url rejected: {reason}")]
    WebhookUrl { reason: String },
    #[error(transparent)]
    EdgeDb(#[from] clubprint_edge_db::EdgeDbError),
    #[error(transparent)]
    Settings(#[from] clubprint_settings::ClubPrintSettingsError),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl ServiceError {
    /// A 401 is a misconfigured token: retrying cannot help, so the retry
    /// ladder is short-circuited to a terminal failure.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(self, ServiceError::Auth)
    }
}
