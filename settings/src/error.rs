use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClubPrintSettingsError {
    #[error("Failed to handle invalid config value {field}={value:?}")]
    InvalidValue { field: String, value: String },
    #[error("Missing required environment variable {var}")]
    MissingSecret { var: String },
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    TomlSerError(#[from] toml::ser::Error),
    #[error(transparent)]
    FigmentError(#[from] figment::error::Error),
}
