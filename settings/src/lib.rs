pub mod clubprint;
pub mod error;
pub mod paths;
pub mod secrets;

pub use clubprint::{ClubPrintSettings, PrintMode};
pub use error::ClubPrintSettingsError;
pub use paths::ClubPrintPaths;
pub use secrets::{Secrets, SmtpSecrets};
