//! Input record models for the two source file families.

use serde::{Deserialize, Deserializer, de};

/// One song metadata record from the song dataset.
///
/// Unknown fields (`num_songs` and friends) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct SongRecord {
    pub artist_id: String,
    pub artist_name: String,
    pub artist_location: Option<String>,
    pub artist_latitude: Option<f64>,
    pub artist_longitude: Option<f64>,
    pub song_id: String,
    pub title: String,
    pub year: i32,
    pub duration: f64,
}

/// One user-activity event from the log dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    /// Event timestamp, epoch milliseconds.
    pub ts: i64,
    pub page: String,
    #[serde(rename = "userId", default, deserialize_with = "de_user_id")]
    pub user_id: Option<i32>,
    #[serde(rename = "firstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub song: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(rename = "sessionId")]
    pub session_id: i32,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(rename = "userAgent", default)]
    pub user_agent: Option<String>,
}

/// The `userId` field shows up as a number, a numeric string, or an
/// empty string (logged-out sessions). Treat empty/null as missing.
fn de_user_id<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| de::Error::custom("user id out of range")),
        Some(serde_json::Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                trimmed.parse::<i32>().map(Some).map_err(de::Error::custom)
            }
        }
        Some(other) => Err(de::Error::custom(format!(
            "invalid user id: {other}"
        ))),
    }
}
