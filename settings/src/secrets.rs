use std::env;

use crate::clubprint::PrintMode;
use crate::error::ClubPrintSettingsError;

pub const API_TOKEN_VAR: &str = "CLUBPRINT_API_TOKEN";
pub const SMTP_HOST_VAR: &str = "CLUBPRINT_SMTP_HOST";
pub const SMTP_PORT_VAR: &str = "CLUBPRINT_SMTP_PORT";
pub const SMTP_USERNAME_VAR: &str = "CLUBPRINT_SMTP_USERNAME";
pub const SMTP_PASSWORD_VAR: &str = "CLUBPRINT_SMTP_PASSWORD";
pub const SMTP_FROM_VAR: &str = "CLUBPRINT_SMTP_FROM";
pub const PRINTER_EMAIL_VAR: &str = "CLUBPRINT_PRINTER_EMAIL";

/// Credentials supplied out-of-band via the environment. Deliberately not
/// part of the serialized settings value.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub api_token: String,
    pub smtp: Option<SmtpSecrets>,
}

#[derive(Debug, Clone)]
pub struct SmtpSecrets {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub printer_email: String,
}

fn required(var: &str) -> Result<String, ClubPrintSettingsError> {
    env::var(var).map_err(|_| ClubPrintSettingsError::MissingSecret {
        var: var.to_string(),
    })
}

impl Secrets {
    /// SMTP credentials are only demanded when the email sink is selected.
    pub fn from_env(print_mode: PrintMode) -> Result<Self, ClubPrintSettingsError> {
        let api_token = required(API_TOKEN_VAR)?;
        let smtp = match print_mode {
            PrintMode::Email => Some(SmtpSecrets::from_env()?),
            PrintMode::Local => None,
        };
        Ok(Self { api_token, smtp })
    }
}

impl SmtpSecrets {
    pub fn from_env() -> Result<Self, ClubPrintSettingsError> {
        let port = match env::var(SMTP_PORT_VAR) {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ClubPrintSettingsError::InvalidValue {
                    field: SMTP_PORT_VAR.to_string(),
                    value: raw,
                })?,
            Err(_) => 587,
        };
        Ok(Self {
            host: required(SMTP_HOST_VAR)?,
            port,
            username: required(SMTP_USERNAME_VAR)?,
            password: required(SMTP_PASSWORD_VAR)?,
            from: required(SMTP_FROM_VAR)?,
            printer_email: required(PRINTER_EMAIL_VAR)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_mode_skips_smtp() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(API_TOKEN_VAR, "token-123");
            let secrets = Secrets::from_env(PrintMode::Local).expect("secrets");
            assert_eq!(secrets.api_token, "token-123");
            assert!(secrets.smtp.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_email_mode_requires_smtp() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(API_TOKEN_VAR, "token-123");
            let result = Secrets::from_env(PrintMode::Email);
            assert!(matches!(
                result,
                Err(ClubPrintSettingsError::MissingSecret { .. })
            ));
            Ok(())
        });
    }

    #[test]
    fn test_email_mode_full_set() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(API_TOKEN_VAR, "token-123");
            jail.set_env(SMTP_HOST_VAR, "smtp.example.com");
            jail.set_env(SMTP_USERNAME_VAR, "club");
            jail.set_env(SMTP_PASSWORD_VAR, "hunter2");
            jail.set_env(SMTP_FROM_VAR, "club@example.com");
            jail.set_env(PRINTER_EMAIL_VAR, "printer@print.example.com");
            let secrets = Secrets::from_env(PrintMode::Email).expect("secrets");
            let smtp = secrets.smtp.expect("smtp");
            assert_eq!(smtp.port, 587);
            assert_eq!(smtp.printer_email, "printer@print.example.com");
            Ok(())
        });
    }
}
