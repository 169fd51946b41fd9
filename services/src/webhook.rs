use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use url::{Host, Url};

use clubprint_settings::clubprint::WebhookSettings;

use crate::breaker::CircuitBreaker;
use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WebhookEvent {
    #[serde(rename = "event.processed")]
    EventProcessed,
    #[serde(rename = "event.failed")]
    EventFailed,
    #[serde(rename = "job.retry")]
    JobRetry,
    #[serde(rename = "job.permanent_failure")]
    JobPermanentFailure,
    #[serde(rename = "service.started")]
    ServiceStarted,
}

/// Outbound notification seam. Failures are warn-only by contract; nothing
/// downstream of a notify call may depend on its outcome.
#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn notify(&self, event: WebhookEvent, data: Value);
}

pub struct WebhookNotifier {
    settings: WebhookSettings,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Reject targets that are, or resolve to, loopback or RFC 1918 / link-local
/// ranges. Resolution happens per send so DNS changes cannot smuggle a
/// private target past a startup-only check.
async fn check_url_allowed(raw: &str) -> Result<Url, ServiceError> {
    let parsed = Url::parse(raw).map_err(|e| ServiceError::WebhookUrl {
        reason: format!("{}: {}", raw, e),
    })?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(ServiceError::WebhookUrl {
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    let port = parsed.port_or_known_default().unwrap_or(443);
    match parsed.host() {
        Some(Host::Ipv4(ip)) => {
            if is_disallowed_ip(IpAddr::V4(ip)) {
                return Err(ServiceError::WebhookUrl {
                    reason: format!("{} targets a private address", raw),
                });
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_disallowed_ip(IpAddr::V6(ip)) {
                return Err(ServiceError::WebhookUrl {
                    reason: format!("{} targets a private address", raw),
                });
            }
        }
        Some(Host::Domain(domain)) => {
            let addrs = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| ServiceError::WebhookUrl {
                    reason: format!("{} did not resolve: {}", domain, e),
                })?;
            for addr in addrs {
                if is_disallowed_ip(addr.ip()) {
                    return Err(ServiceError::WebhookUrl {
                        reason: format!("{} resolves to private address {}", domain, addr.ip()),
                    });
                }
            }
        }
        None => {
            return Err(ServiceError::WebhookUrl {
                reason: format!("{} has no host", raw),
            })
        }
    }
    Ok(parsed)
}

impl WebhookNotifier {
    pub fn new(
        settings: WebhookSettings,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self {
            settings,
            client,
            breaker,
        })
    }

    /// A notifier that never sends; used when the webhook is not configured.
    pub fn disabled() -> Self {
        Self {
            settings: WebhookSettings::default(),
            client: reqwest::Client::new(),
            breaker: Arc::new(CircuitBreaker::new(
                "webhook",
                crate::breaker::CircuitBreakerConfig::default(),
            )),
        }
    }

    async fn try_notify(&self, url: &str, event: WebhookEvent, data: &Value) -> Result<(), ServiceError> {
        let target = check_url_allowed(url).await?;
        self.breaker.preflight()?;
        let payload = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        let attempts = self.settings.max_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
            }
            let sent = self.client.post(target.clone()).json(&payload).send().await;
            match sent {
                Ok(response) if response.status().is_success() => {
                    self.breaker.record_success();
                    debug!("Webhook {:?} delivered on attempt {}", event, attempt);
                    return Ok(());
                }
                Ok(response) => {
                    last_error = Some(ServiceError::Unavailable {
                        reason: format!("webhook returned HTTP {}", response.status()),
                    });
                }
                Err(err) => {
                    last_error = Some(ServiceError::Unavailable {
                        reason: err.to_string(),
                    });
                }
            }
        }
        self.breaker.record_failure();
        Err(last_error.unwrap_or(ServiceError::Unavailable {
            reason: "webhook delivery failed".to_string(),
        }))
    }
}

#[async_trait]
impl EventNotifier for WebhookNotifier {
    async fn notify(&self, event: WebhookEvent, data: Value) {
        if !self.settings.enabled {
            return;
        }
        let url = match &self.settings.url {
            Some(url) => url.clone(),
            None => return,
        };
        if let Err(err) = self.try_notify(&url, event, &data).await {
            warn!("Webhook {:?} not delivered: {}", event, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_on_the_wire() {
        let name = serde_json::to_string(&WebhookEvent::JobPermanentFailure).unwrap();
        assert_eq!(name, "\"job.permanent_failure\"");
        let name = serde_json::to_string(&WebhookEvent::ServiceStarted).unwrap();
        assert_eq!(name, "\"service.started\"");
    }

    #[test]
    fn test_disallowed_ranges() {
        assert!(is_disallowed_ip("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed_ip("10.1.2.3".parse().unwrap()));
        assert!(is_disallowed_ip("172.16.0.9".parse().unwrap()));
        assert!(is_disallowed_ip("192.168.1.10".parse().unwrap()));
        assert!(is_disallowed_ip("169.254.0.1".parse().unwrap()));
        assert!(is_disallowed_ip("::1".parse().unwrap()));
        assert!(is_disallowed_ip("fe80::1".parse().unwrap()));
        assert!(is_disallowed_ip("fd00::1".parse().unwrap()));
        assert!(!is_disallowed_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_disallowed_ip("2606:2800:220:1::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_private_urls_rejected() {
        for url in [
            "https://127.0.0.1/hook",
            "https://192.168.1.20:8443/hook",
            "http://10.0.0.5/hook",
        ] {
            let result = check_url_allowed(url).await;
            assert!(
                matches!(result, Err(ServiceError::WebhookUrl { .. })),
                "{} should be rejected",
                url
            );
        }
    }

    #[tokio::test]
    async fn test_non_http_scheme_rejected() {
        let result = check_url_allowed("ftp://example.com/hook").await;
        assert!(matches!(result, Err(ServiceError::WebhookUrl { .. })));
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_a_no_op() {
        let notifier = WebhookNotifier::disabled();
        // Must return quickly and never error.
        notifier
            .notify(WebhookEvent::ServiceStarted, json!({"ok": true}))
            .await;
    }
}
