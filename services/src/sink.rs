use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::info;

use clubprint_settings::SmtpSecrets;

use crate::breaker::CircuitBreaker;
use crate::error::ServiceError;

const SMTP_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJobContext {
    pub event_id: String,
    pub event_name: String,
    pub output_filename: String,
}

/// A delivery endpoint for the rendered sheet. Sinks never retry; the
/// scheduler owns the retry ladder.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrintSink: Send + Sync {
    async fn deliver(&self, job: PrintJobContext, pdf: Vec<u8>) -> Result<(), ServiceError>;
    fn name(&self) -> &'static str;
}

/// Submits the sheet to the OS spooler via `lp`, optionally against a named
/// queue. Returns once the spooler has accepted the job.
pub struct LocalPrintSink {
    queue: Option<String>,
    breaker: Arc<CircuitBreaker>,
}

impl LocalPrintSink {
    pub fn new(queue: Option<String>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { queue, breaker }
    }

    fn sink_error(&self, reason: String) -> ServiceError {
        ServiceError::Sink {
            sink: "local".to_string(),
            reason,
        }
    }
}

#[async_trait]
impl PrintSink for LocalPrintSink {
    async fn deliver(&self, job: PrintJobContext, pdf: Vec<u8>) -> Result<(), ServiceError> {
        self.breaker.preflight()?;
        let result = async {
            let mut spool_file = tempfile::Builder::new()
                .prefix("clubprint-")
                .suffix(".pdf")
                .tempfile()?;
            spool_file.write_all(&pdf)?;
            spool_file.flush()?;

            let mut command = tokio::process::Command::new("lp");
            if let Some(queue) = &self.queue {
                command.arg("-d").arg(queue);
            }
            command.arg("-t").arg(&job.output_filename);
            command.arg(spool_file.path());
            let output = command.output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(self.sink_error(format!("lp exited {}: {}", output.status, stderr)));
            }
            info!(
                "Spooled {} bytes for event {} ({})",
                pdf.len(),
                job.event_id,
                job.event_name
            );
            Ok(())
        }
        .await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Emails the sheet to a printer-by-email gateway. A fresh SMTP session per
/// delivery; the transport is dropped (and the session closed) on both paths.
pub struct EmailPrintSink {
    smtp: SmtpSecrets,
    breaker: Arc<CircuitBreaker>,
}

impl EmailPrintSink {
    pub fn new(smtp: SmtpSecrets, breaker: Arc<CircuitBreaker>) -> Self {
        Self { smtp, breaker }
    }

    fn sink_error(&self, reason: String) -> ServiceError {
        ServiceError::Sink {
            sink: "email".to_string(),
            reason,
        }
    }

    fn build_message(&self, job: &PrintJobContext, pdf: Vec<u8>) -> Result<Message, ServiceError> {
        let content_type = ContentType::parse("application/pdf")
            .map_err(|e| self.sink_error(e.to_string()))?;
        Message::builder()
            .from(
                self.smtp
                    .from
                    .parse()
                    .map_err(|e| self.sink_error(format!("from address: {}", e)))?,
            )
            .to(self
                .smtp
                .printer_email
                .parse()
                .map_err(|e| self.sink_error(format!("printer address: {}", e)))?)
            .subject(format!("Print Job: {}", job.event_name))
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(format!(
                        "Attendance sheet for {}.",
                        job.event_name
                    )))
                    .singlepart(
                        Attachment::new(job.output_filename.clone()).body(pdf, content_type),
                    ),
            )
            .map_err(|e| self.sink_error(e.to_string()))
    }
}

#[async_trait]
impl PrintSink for EmailPrintSink {
    async fn deliver(&self, job: PrintJobContext, pdf: Vec<u8>) -> Result<(), ServiceError> {
        self.breaker.preflight()?;
        let result = async {
            let message = self.build_message(&job, pdf)?;
            let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp.host)
                .map_err(|e| self.sink_error(e.to_string()))?
                .port(self.smtp.port)
                .credentials(Credentials::new(
                    self.smtp.username.clone(),
                    self.smtp.password.clone(),
                ))
                .timeout(Some(SMTP_SOCKET_TIMEOUT))
                .build();
            transport
                .send(message)
                .await
                .map_err(|e| self.sink_error(e.to_string()))?;
            info!(
                "Emailed print job for event {} to printer gateway",
                job.event_id
            );
            Ok(())
        }
        .await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerState, CircuitBreakerConfig};

    fn smtp_secrets() -> SmtpSecrets {
        SmtpSecrets {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "club".to_string(),
            password: "hunter2".to_string(),
            from: "club@example.com".to_string(),
            printer_email: "printer@print.example.com".to_string(),
        }
    }

    #[test]
    fn test_email_message_shape() {
        let breaker = Arc::new(CircuitBreaker::new("email", CircuitBreakerConfig::default()));
        let sink = EmailPrintSink::new(smtp_secrets(), breaker);
        let job = PrintJobContext {
            event_id: "E1".to_string(),
            event_name: "Practice".to_string(),
            output_filename: "attendance.pdf".to_string(),
        };
        let message = sink.build_message(&job, b"%PDF-1.4".to_vec()).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: Print Job: Practice"));
        assert!(formatted.contains("application/pdf"));
        assert!(formatted.contains("attendance.pdf"));
    }

    #[test]
    fn test_email_message_rejects_bad_address() {
        let breaker = Arc::new(CircuitBreaker::new("email", CircuitBreakerConfig::default()));
        let mut secrets = smtp_secrets();
        secrets.printer_email = "not-an-address".to_string();
        let sink = EmailPrintSink::new(secrets, breaker);
        let job = PrintJobContext {
            event_id: "E1".to_string(),
            event_name: "Practice".to_string(),
            output_filename: "attendance.pdf".to_string(),
        };
        assert!(matches!(
            sink.build_message(&job, Vec::new()),
            Err(ServiceError::Sink { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_sink_open_breaker_rejects_without_spooling() {
        let breaker = Arc::new(CircuitBreaker::new(
            "printer",
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
                success_threshold: 1,
            },
        ));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        let sink = LocalPrintSink::new(None, breaker);
        let job = PrintJobContext {
            event_id: "E1".to_string(),
            event_name: "Practice".to_string(),
            output_filename: "attendance.pdf".to_string(),
        };
        let result = sink.deliver(job, b"%PDF-1.4".to_vec()).await;
        assert!(matches!(result, Err(ServiceError::CircuitOpen { .. })));
    }
}
