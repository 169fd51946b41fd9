use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

// Raw payloads as the Hello Club API ships them. Every field is optional so
// a malformed record never fails the whole response; validation decides what
// survives.

#[derive(Debug, Clone, Deserialize)]
pub struct EventListResponse {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub categories: Vec<RawCategory>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCategory {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttendeeListResponse {
    #[serde(default)]
    pub attendees: Vec<RawAttendee>,
    pub meta: AttendeeListMeta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttendeeListMeta {
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAttendee {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub sign_up_date: Option<String>,
    #[serde(default)]
    pub has_fee: Option<bool>,
    #[serde(default)]
    pub is_paid: Option<bool>,
    #[serde(default)]
    pub rule: Option<RawAttendeeRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAttendeeRule {
    #[serde(default)]
    pub fee: Option<f64>,
}

// Validated records the rest of the engine works with.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClubEvent {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeStatus {
    Paid,
    Owing,
    NoFee,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub name: String,
    pub phone: String,
    pub sign_up_date: Option<DateTime<Utc>>,
    pub fee: Option<f64>,
    pub fee_status: FeeStatus,
}

impl ClubEvent {
    /// Category allow-list check; an empty list accepts everything.
    pub fn matches_categories(&self, allowed: &[String]) -> bool {
        allowed.is_empty() || self.categories.iter().any(|c| allowed.contains(c))
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(char::is_whitespace)
}

/// Per-record validation: drops the record (with a warning) instead of
/// failing the surrounding call.
pub fn validate_event(raw: RawEvent) -> Option<ClubEvent> {
    let id = match raw.id {
        Some(id) if valid_id(&id) => id,
        other => {
            warn!("Dropping event with invalid id: {:?}", other);
            return None;
        }
    };
    let name = match raw.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            warn!("Dropping event id={} with missing name", id);
            return None;
        }
    };
    let start_time = match raw.start_date.as_deref().and_then(parse_instant) {
        Some(start_time) => start_time,
        None => {
            warn!(
                "Dropping event id={} with unparseable startDate {:?}",
                id, raw.start_date
            );
            return None;
        }
    };
    let categories = raw
        .categories
        .into_iter()
        .filter_map(|c| c.name)
        .filter(|n| !n.is_empty())
        .collect();
    Some(ClubEvent {
        id,
        name,
        start_time,
        categories,
    })
}

pub fn validate_attendee(raw: RawAttendee) -> Option<Attendee> {
    let name = [raw.first_name.as_deref(), raw.last_name.as_deref()]
        .iter()
        .flatten()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        warn!("Dropping attendee record with no name");
        return None;
    }
    // A present-but-malformed date is a corrupt record; an absent date is a
    // blank cell on the sheet.
    let sign_up_date = match raw.sign_up_date.as_deref() {
        Some(date) => match parse_instant(date) {
            Some(parsed) => Some(parsed),
            None => {
                warn!(
                    "Dropping attendee '{}' with unparseable signUpDate {:?}",
                    name, date
                );
                return None;
            }
        },
        None => None,
    };
    let has_fee = raw.has_fee.unwrap_or(false);
    let fee_status = if !has_fee {
        FeeStatus::NoFee
    } else if raw.is_paid.unwrap_or(false) {
        FeeStatus::Paid
    } else {
        FeeStatus::Owing
    };
    Some(Attendee {
        name,
        phone: raw.phone.unwrap_or_default(),
        sign_up_date,
        fee: raw.rule.and_then(|r| r.fee).filter(|_| has_fee),
        fee_status,
    })
}
