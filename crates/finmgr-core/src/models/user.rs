use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// The authenticated user as returned by `/auth/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    pub is_active: bool,
    #[serde(deserialize_with = "utc_or_naive")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub company_id: Option<i64>,
}

impl UserProfile {
    pub fn company_display(&self) -> String {
        match self.company_id {
            Some(id) => format!("company #{}", id),
            None => "no company".to_string(),
        }
    }
}

/// The server emits naive timestamps in UTC; accept those as well as RFC 3339.
fn utc_or_naive<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Partial profile update; unset fields are left untouched by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.company_name.is_none()
    }
}
