//! RetroAchievements web API client.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use roulette_storage::{FetchError, FetchedResponse, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://retroachievements.org/API";

/// Game that holds the event's own weekly achievement set.
pub const EVENT_SET_GAME_ID: u64 = 37967;

const SOURCE_ID: &str = "ra-api";

/// Static credentials sent as the `z` and `y` query parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub username: String,
    pub api_key: String,
}

impl ApiCredentials {
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            api_key: api_key.into(),
        }
    }

    pub fn masked_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
        format!("****{tail}")
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("username", &self.username)
            .field("api_key", &self.masked_key())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdTitle {
    #[serde(rename = "ID", deserialize_with = "lenient_id")]
    pub id: u64,
    #[serde(rename = "Title", deserialize_with = "lenient_string")]
    pub title: String,
}

/// Payload of `API_GetAchievementUnlocks.php`; only the owner fields are read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AchievementOwner {
    #[serde(rename = "Game")]
    pub game: IdTitle,
    #[serde(rename = "Console")]
    pub console: IdTitle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SetAchievement {
    #[serde(rename = "ID", deserialize_with = "lenient_id")]
    pub id: u64,
    #[serde(rename = "Title", deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(rename = "Description", deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(rename = "BadgeName", deserialize_with = "lenient_string")]
    pub badge_name: String,
    #[serde(rename = "DisplayOrder", deserialize_with = "lenient_id")]
    pub display_order: u64,
}

/// Payload of `API_GetGameExtended.php`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GameExtended {
    #[serde(rename = "ID", deserialize_with = "lenient_id")]
    pub id: u64,
    #[serde(rename = "Title", deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(rename = "ImageIcon", deserialize_with = "lenient_string")]
    pub image_icon: String,
    #[serde(rename = "ConsoleID", deserialize_with = "lenient_id")]
    pub console_id: u64,
    #[serde(rename = "ConsoleName", deserialize_with = "lenient_string")]
    pub console_name: String,
    #[serde(rename = "Achievements", deserialize_with = "achievement_set")]
    pub achievements: Vec<SetAchievement>,
}

impl GameExtended {
    pub fn achievement(&self, achievement_id: u64) -> Option<&SetAchievement> {
        self.achievements.iter().find(|a| a.id == achievement_id)
    }
}

/// Payload of `API_GetGame.php`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GameSummary {
    #[serde(rename = "Title", deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(rename = "ImageIcon", deserialize_with = "lenient_string")]
    pub image_icon: String,
    #[serde(rename = "ConsoleID", deserialize_with = "lenient_id")]
    pub console_id: u64,
    #[serde(rename = "ConsoleName", deserialize_with = "lenient_string")]
    pub console_name: String,
}

/// The three lookups enrichment is composed of. `Ok(None)` means the API
/// answered but knows nothing about the id.
#[async_trait]
pub trait RaApi: Send + Sync {
    async fn achievement_owner(&self, achievement_id: u64) -> Result<Option<AchievementOwner>, FetchError>;
    async fn game_extended(&self, game_id: u64) -> Result<Option<GameExtended>, FetchError>;
    async fn game_summary(&self, game_id: u64) -> Result<Option<GameSummary>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpRaApi {
    http: Arc<HttpFetcher>,
    base_url: String,
    credentials: ApiCredentials,
}

impl HttpRaApi {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, credentials: ApiCredentials) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// Credentials go first as `z` and `y`; every value is form-encoded.
    fn endpoint(&self, script: &str, params: &[(&str, String)]) -> Result<Url, FetchError> {
        let base = format!("{}/{}", self.base_url, script);
        let credentials = [
            ("z", self.credentials.username.as_str()),
            ("y", self.credentials.api_key.as_str()),
        ];
        let query = credentials
            .into_iter()
            .chain(params.iter().map(|(key, value)| (*key, value.as_str())));
        Url::parse_with_params(&base, query).map_err(|err| FetchError::InvalidUrl {
            url: base,
            reason: err.to_string(),
        })
    }

    async fn fetch_optional<T: DeserializeOwned>(&self, url: &Url) -> Result<Option<T>, FetchError> {
        match absent_on_not_found(self.http.fetch_bytes(SOURCE_ID, url.as_str()).await)? {
            Some(response) => decode_optional(&response.final_url, &response.body),
            None => Ok(None),
        }
    }
}

/// The API answers 404 for ids it does not know; that is an answer, not a
/// failure.
fn absent_on_not_found(result: Result<FetchedResponse, FetchError>) -> Result<Option<FetchedResponse>, FetchError> {
    match result {
        Ok(response) => Ok(Some(response)),
        Err(FetchError::HttpStatus { status: 404, url }) => {
            debug!(url, "api returned 404");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[async_trait]
impl RaApi for HttpRaApi {
    async fn achievement_owner(&self, achievement_id: u64) -> Result<Option<AchievementOwner>, FetchError> {
        let url = self.endpoint(
            "API_GetAchievementUnlocks.php",
            &[("a", achievement_id.to_string()), ("c", "1".to_string())],
        )?;
        let owner: Option<AchievementOwner> = self.fetch_optional(&url).await?;
        Ok(owner.filter(|o| o.game.id > 0))
    }

    async fn game_extended(&self, game_id: u64) -> Result<Option<GameExtended>, FetchError> {
        let url = self.endpoint("API_GetGameExtended.php", &[("i", game_id.to_string())])?;
        let game: Option<GameExtended> = self.fetch_optional(&url).await?;
        Ok(game.filter(|g| g.id > 0 || !g.achievements.is_empty()))
    }

    async fn game_summary(&self, game_id: u64) -> Result<Option<GameSummary>, FetchError> {
        let url = self.endpoint("API_GetGame.php", &[("i", game_id.to_string())])?;
        self.fetch_optional(&url).await
    }
}

/// Empty bodies, `null`, `[]` and `{}` all mean "nothing known".
pub fn decode_optional<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<Option<T>, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: JsonValue = serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })?;
    let empty = match &value {
        JsonValue::Null => true,
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(fields) => fields.is_empty(),
        _ => false,
    };
    if empty {
        debug!(url, "empty api payload");
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Float(f64),
        Text(String),
        #[allow(dead_code)]
        Other(JsonValue),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => n,
        Some(Raw::Float(f)) if f.is_finite() && f >= 0.0 => f as u64,
        Some(Raw::Text(text)) => text.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
        #[allow(dead_code)]
        Other(JsonValue),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(text)) => text,
        Some(Raw::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

fn achievement_set<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<SetAchievement>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Set {
        Keyed(BTreeMap<String, SetAchievement>),
        Listed(Vec<SetAchievement>),
        #[allow(dead_code)]
        Other(JsonValue),
    }

    let mut achievements = match Option::<Set>::deserialize(deserializer)? {
        Some(Set::Keyed(map)) => map.into_values().collect(),
        Some(Set::Listed(list)) => list,
        _ => Vec::new(),
    };
    achievements.sort_by_key(|a| (a.display_order, a.id));
    Ok(achievements)
}
