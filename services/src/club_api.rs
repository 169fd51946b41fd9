use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde_json::Value;

use clubprint_settings::clubprint::ApiSettings;

use crate::breaker::CircuitBreaker;
use crate::cache::ResponseCache;
use crate::error::ServiceError;
use crate::models::{
    validate_attendee, validate_event, Attendee, AttendeeListResponse, ClubEvent,
    EventListResponse,
};

const MAX_ATTENDEE_PAGES: u32 = 100;

#[async_trait]
pub trait ClubApi: Send + Sync {
    async fn list_upcoming_events(&self, window_hours: u32) -> Result<Vec<ClubEvent>, ServiceError>;
    async fn get_attendees(
        &self,
        event_id: &str,
        accept_stale: bool,
    ) -> Result<Vec<Attendee>, ServiceError>;
}

/// Hello Club API client: bearer auth, circuit breaking, per-record
/// validation and a fresh/stale response cache.
pub struct ApiService {
    base_url: String,
    api_token: String,
    client: reqwest::Client,
    settings: ApiSettings,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
}

impl ApiService {
    pub fn new(
        settings: &ApiSettings,
        api_token: &str,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<ResponseCache>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            client,
            settings: settings.clone(),
            breaker,
            cache,
        })
    }

    fn fresh_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.cache_fresh_seconds)
    }

    fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.cache_stale_seconds)
    }

    async fn get_json(&self, path_and_query: &str) -> Result<Value, ServiceError> {
        self.breaker.preflight()?;
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!("GET {}", url);
        let sent = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                self.breaker.record_failure();
                return Err(ServiceError::Unavailable {
                    reason: err.to_string(),
                });
            }
        };
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // The dependency answered; the failure is local configuration.
            self.breaker.record_success();
            return Err(ServiceError::Auth);
        }
        if !status.is_success() {
            self.breaker.record_failure();
            return Err(ServiceError::Unavailable {
                reason: format!("{} returned HTTP {}", url, status),
            });
        }
        match response.json::<Value>().await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(ServiceError::Unavailable {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn fetch_events(&self, window_hours: u32) -> Result<Vec<ClubEvent>, ServiceError> {
        let from = Utc::now();
        let to = from + chrono::Duration::hours(window_hours as i64);
        let path = format!(
            "/event?fromDate={}&toDate={}&sort=startDate",
            from.to_rfc3339_opts(SecondsFormat::Secs, true),
            to.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let value = self.get_json(&path).await?;
        let response: EventListResponse =
            serde_json::from_value(value).map_err(|err| ServiceError::Unavailable {
                reason: format!("malformed event payload: {}", err),
            })?;
        let total = response.events.len();
        let events: Vec<ClubEvent> = response
            .events
            .into_iter()
            .filter_map(validate_event)
            .collect();
        if total > 0 && events.is_empty() {
            return Err(ServiceError::AllRecordsInvalid { total });
        }
        info!("Fetched {} upcoming events ({} valid)", total, events.len());
        Ok(events)
    }

    async fn fetch_all_attendees(&self, event_id: &str) -> Result<Vec<Attendee>, ServiceError> {
        let limit = self.settings.pagination_limit;
        let mut offset: u32 = 0;
        let mut valid = Vec::new();
        let mut raw_total: usize = 0;
        for page in 0..MAX_ATTENDEE_PAGES {
            if page > 0 {
                tokio::time::sleep(Duration::from_millis(self.settings.pagination_delay_ms)).await;
            }
            let value = self
                .get_json(&format!(
                    "/eventAttendee?event={}&limit={}&offset={}",
                    event_id, limit, offset
                ))
                .await?;
            let response: AttendeeListResponse =
                serde_json::from_value(value).map_err(|err| ServiceError::Unavailable {
                    reason: format!("malformed attendee payload: {}", err),
                })?;
            let fetched = response.attendees.len();
            raw_total += fetched;
            valid.extend(response.attendees.into_iter().filter_map(validate_attendee));
            offset += limit;
            if fetched == 0 || i64::from(offset) >= response.meta.total {
                break;
            }
            if page + 1 == MAX_ATTENDEE_PAGES {
                warn!(
                    "Attendee pagination for event {} hit the {}-page cap",
                    event_id, MAX_ATTENDEE_PAGES
                );
            }
        }
        if raw_total > 0 && valid.is_empty() {
            return Err(ServiceError::AllRecordsInvalid { total: raw_total });
        }
        Ok(valid)
    }

    fn stale_fallback<T: serde::de::DeserializeOwned>(
        &self,
        fingerprint: &str,
        accept_stale: bool,
        err: ServiceError,
    ) -> Result<T, ServiceError> {
        if accept_stale {
            if let Some(hit) = self.cache.get(fingerprint, true) {
                if let Ok(value) = serde_json::from_value(hit.value) {
                    warn!(
                        "Serving stale cached response for {} after: {}",
                        fingerprint, err
                    );
                    return Ok(value);
                }
            }
        }
        Err(err)
    }

    fn cache_put<T: serde::Serialize>(&self, fingerprint: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self
                .cache
                .set(fingerprint, json, self.fresh_ttl(), self.stale_ttl()),
            Err(err) => warn!("Failed to cache response for {}: {}", fingerprint, err),
        }
    }
}

#[async_trait]
impl ClubApi for ApiService {
    async fn list_upcoming_events(&self, window_hours: u32) -> Result<Vec<ClubEvent>, ServiceError> {
        let fingerprint = format!("events:{}h", window_hours);
        if let Some(hit) = self.cache.get(&fingerprint, false) {
            if let Ok(events) = serde_json::from_value::<Vec<ClubEvent>>(hit.value) {
                debug!("Event list served from fresh cache");
                return Ok(events);
            }
        }
        match self.fetch_events(window_hours).await {
            Ok(events) => {
                self.cache_put(&fingerprint, &events);
                Ok(events)
            }
            Err(err) if err.is_fatal_auth() => Err(err),
            Err(err) => self.stale_fallback(&fingerprint, true, err),
        }
    }

    async fn get_attendees(
        &self,
        event_id: &str,
        accept_stale: bool,
    ) -> Result<Vec<Attendee>, ServiceError> {
        let fingerprint = format!("attendees:{}", event_id);
        if let Some(hit) = self.cache.get(&fingerprint, false) {
            if let Ok(attendees) = serde_json::from_value::<Vec<Attendee>>(hit.value) {
                debug!("Attendee roster for {} served from fresh cache", event_id);
                return Ok(attendees);
            }
        }
        match self.fetch_all_attendees(event_id).await {
            Ok(attendees) => {
                self.cache_put(&fingerprint, &attendees);
                Ok(attendees)
            }
            Err(err) if err.is_fatal_auth() => Err(err),
            Err(err) => self.stale_fallback(&fingerprint, accept_stale, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerState, CircuitBreakerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal canned HTTP/1.1 server: serves the given (status, body) pairs
    /// to sequential connections, then stops accepting.
    async fn serve_canned(responses: Vec<(u16, String)>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    fn test_settings(addr: std::net::SocketAddr) -> ApiSettings {
        ApiSettings {
            base_url: format!("http://{}", addr),
            pagination_limit: 2,
            pagination_delay_ms: 0,
            cache_fresh_seconds: 60,
            cache_stale_seconds: 300,
            request_timeout_seconds: 5,
        }
    }

    fn service(settings: &ApiSettings) -> (ApiService, Arc<CircuitBreaker>, Arc<ResponseCache>) {
        let breaker = Arc::new(CircuitBreaker::new(
            "api",
            CircuitBreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_secs(60),
                success_threshold: 2,
            },
        ));
        let cache = Arc::new(ResponseCache::new(16));
        let api = ApiService::new(settings, "token", breaker.clone(), cache.clone()).unwrap();
        (api, breaker, cache)
    }

    #[tokio::test]
    async fn test_list_events_drops_invalid_records() {
        let body = serde_json::json!({
            "events": [
                {"id": "E1", "name": "Practice", "startDate": "2026-08-01T18:00:00Z",
                 "categories": [{"name": "Sports"}]},
                {"id": "E2", "name": "Broken", "startDate": "not-a-date"},
            ]
        })
        .to_string();
        let addr = serve_canned(vec![(200, body)]).await;
        let settings = test_settings(addr);
        let (api, _, _) = service(&settings);

        let events = api.list_upcoming_events(24).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "E1");
    }

    #[tokio::test]
    async fn test_list_events_fails_when_all_invalid() {
        let body = serde_json::json!({
            "events": [{"name": "No id"}, {"id": "E2"}]
        })
        .to_string();
        let addr = serve_canned(vec![(200, body)]).await;
        let settings = test_settings(addr);
        let (api, _, _) = service(&settings);

        let result = api.list_upcoming_events(24).await;
        assert!(matches!(
            result,
            Err(ServiceError::AllRecordsInvalid { total: 2 })
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal_and_uncached() {
        let addr = serve_canned(vec![(401, String::new())]).await;
        let settings = test_settings(addr);
        let (api, breaker, _) = service(&settings);

        let result = api.get_attendees("E1", true).await;
        assert!(matches!(result, Err(ServiceError::Auth)));
        // Config errors do not trip the breaker.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    fn attendee_page(names: &[&str], total: i64) -> String {
        let attendees: Vec<_> = names
            .iter()
            .map(|n| serde_json::json!({"firstName": n, "lastName": "Tester", "hasFee": false}))
            .collect();
        serde_json::json!({"attendees": attendees, "meta": {"total": total}}).to_string()
    }

    #[tokio::test]
    async fn test_attendee_pagination_sums_to_total() {
        // limit=2, total=5: three pages.
        let addr = serve_canned(vec![
            (200, attendee_page(&["A", "B"], 5)),
            (200, attendee_page(&["C", "D"], 5)),
            (200, attendee_page(&["E"], 5)),
        ])
        .await;
        let settings = test_settings(addr);
        let (api, _, _) = service(&settings);

        let attendees = api.get_attendees("E1", true).await.unwrap();
        assert_eq!(attendees.len(), 5);
        assert_eq!(attendees[4].name, "E Tester");
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_network() {
        let addr = serve_canned(vec![(200, attendee_page(&["A"], 1))]).await;
        let settings = test_settings(addr);
        let (api, _, _) = service(&settings);

        let first = api.get_attendees("E1", true).await.unwrap();
        // The canned server only answers once; a second call must hit cache.
        let second = api.get_attendees("E1", true).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_stale_cache_serves() {
        // Bind then drop to get a port that refuses connections.
        let refused = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let settings = test_settings(refused);
        let breaker = Arc::new(CircuitBreaker::new(
            "api",
            CircuitBreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_secs(60),
                success_threshold: 2,
            },
        ));
        let cache = Arc::new(ResponseCache::new(16));
        let api = ApiService::new(&settings, "token", breaker.clone(), cache.clone()).unwrap();

        // Seed the cache with a stale-band roster.
        let roster = vec![Attendee {
            name: "Ada Lovelace".to_string(),
            phone: String::new(),
            sign_up_date: None,
            fee: None,
            fee_status: crate::models::FeeStatus::NoFee,
        }];
        cache.set(
            "attendees:E1",
            serde_json::to_value(&roster).unwrap(),
            Duration::from_secs(0),
            Duration::from_secs(300),
        );

        // Five transport failures open the breaker; every call still serves
        // the stale roster.
        for _ in 0..5 {
            let served = api.get_attendees("E1", true).await.unwrap();
            assert_eq!(served, roster);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Breaker now rejects before dialing; stale cache still answers.
        let served = api.get_attendees("E1", true).await.unwrap();
        assert_eq!(served, roster);

        // Without stale consent the failure surfaces.
        let result = api.get_attendees("E2", false).await;
        assert!(matches!(result, Err(ServiceError::CircuitOpen { .. })));
    }
}
