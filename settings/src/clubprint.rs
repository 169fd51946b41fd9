use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ClubPrintSettingsError;
use crate::paths::ClubPrintPaths;

pub const DEFAULT_CLUBPRINT_SETTINGS_FILE: &str = "/etc/clubprint/clubprint.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintMode {
    Local,
    Email,
}

impl Default for PrintMode {
    fn default() -> Self {
        PrintMode::Local
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PdfColumn {
    pub id: String,
    pub header: String,
    pub width: f32, // mm
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PdfSettings {
    pub logo: Option<PathBuf>,
    pub font_size: f32,
    pub columns: Vec<PdfColumn>,
}

impl Default for PdfSettings {
    fn default() -> Self {
        let column = |id: &str, header: &str, width: f32| PdfColumn {
            id: id.to_string(),
            header: header.to_string(),
            width,
        };
        Self {
            logo: None,
            font_size: 10.0,
            columns: vec![
                column("name", "Name", 60.0),
                column("phone", "Phone", 35.0),
                column("sign_up_date", "Signed up", 35.0),
                column("fee", "Fee", 25.0),
                column("status", "Status", 25.0),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_minutes: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApiSettings {
    pub base_url: String,
    pub pagination_limit: u32,
    pub pagination_delay_ms: u64,
    pub cache_fresh_seconds: u64,
    pub cache_stale_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.helloclub.com".to_string(),
            pagination_limit: 100,
            pagination_delay_ms: 1000,
            cache_fresh_seconds: 120,
            cache_stale_seconds: 1800,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            timeout_ms: 10_000,
            max_retries: 2,
            retry_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitoringSettings {
    pub health_interval_seconds: u64,
    pub memory_sample_minutes: u64,
    pub memory_warn_mb: u64,
    pub rss_warn_mb: u64,
    pub failed_job_threshold: i64,
    pub retention_days: i64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            health_interval_seconds: 60,
            memory_sample_minutes: 5,
            memory_warn_mb: 300,
            rss_warn_mb: 400,
            failed_job_threshold: 10,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrinterSettings {
    pub queue: Option<String>, // local spooler queue name, e.g. "HP_LaserJet"
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClubPrintSettings {
    pub categories: Vec<String>,
    pub fetch_window_hours: u32,
    pub pre_event_query_minutes: u32,
    pub service_run_interval_hours: f64,
    pub grace_window_minutes: u32,
    pub print_mode: PrintMode,
    pub output_filename: String,
    pub pdf: PdfSettings,
    pub retry: RetrySettings,
    pub api: ApiSettings,
    pub webhook: WebhookSettings,
    pub monitoring: MonitoringSettings,
    pub printer: PrinterSettings,
    pub paths: ClubPrintPaths,
}

impl Default for ClubPrintSettings {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            fetch_window_hours: 24,
            pre_event_query_minutes: 5,
            service_run_interval_hours: 1.0,
            grace_window_minutes: 60,
            print_mode: PrintMode::default(),
            output_filename: "attendance.pdf".to_string(),
            pdf: PdfSettings::default(),
            retry: RetrySettings::default(),
            api: ApiSettings::default(),
            webhook: WebhookSettings::default(),
            monitoring: MonitoringSettings::default(),
            printer: PrinterSettings::default(),
            paths: ClubPrintPaths::default(),
        }
    }
}

impl ClubPrintSettings {
    pub fn new() -> Result<Self, ClubPrintSettingsError> {
        Self::from_file(Path::new(&Self::settings_file()))
    }

    pub fn from_file(settings_file: &Path) -> Result<Self, ClubPrintSettingsError> {
        let figment = Self::figment(settings_file);
        let result: ClubPrintSettings = figment.extract()?;
        debug!("Initialized settings {:?}", result);
        result.validate()?;
        Ok(result)
    }

    pub fn settings_file() -> String {
        Env::var_or("CLUBPRINT_SETTINGS", DEFAULT_CLUBPRINT_SETTINGS_FILE)
    }

    pub fn figment(settings_file: &Path) -> Figment {
        Figment::from(Serialized::defaults(ClubPrintSettings::default()))
            .merge(Toml::file(settings_file))
            .merge(Env::prefixed("CLUBPRINT_").split("__"))
    }

    fn validate(&self) -> Result<(), ClubPrintSettingsError> {
        let invalid = |field: &str, value: String| {
            Err(ClubPrintSettingsError::InvalidValue {
                field: field.to_string(),
                value,
            })
        };
        if self.fetch_window_hours == 0 {
            return invalid("fetch_window_hours", self.fetch_window_hours.to_string());
        }
        if self.pre_event_query_minutes == 0 {
            return invalid(
                "pre_event_query_minutes",
                self.pre_event_query_minutes.to_string(),
            );
        }
        if self.service_run_interval_hours <= 0.0 {
            return invalid(
                "service_run_interval_hours",
                self.service_run_interval_hours.to_string(),
            );
        }
        if self.pdf.columns.is_empty() {
            return invalid("pdf.columns", "[]".to_string());
        }
        if self.webhook.enabled && self.webhook.url.is_none() {
            return invalid("webhook.url", "None".to_string());
        }
        Ok(())
    }

    /// Retry delay for the given attempt: base * 2^retry_count.
    pub fn retry_delay(&self, retry_count: u32) -> std::time::Duration {
        let minutes = self.retry.base_delay_minutes * 2u64.pow(retry_count);
        std::time::Duration::from_secs(minutes * 60)
    }
}
