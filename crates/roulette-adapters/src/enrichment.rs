//! Turns a bare achievement id into a full [`Achievement`] record.

use std::sync::Arc;

use async_trait::async_trait;
use roulette_core::{Achievement, DEFAULT_BADGE_NAME};
use roulette_storage::FetchError;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ra_api::{GameSummary, RaApi};

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("achievement {id} not found: {reason}")]
    NotFound { id: u64, reason: String },
    #[error("achievement {id} lookup failed: {source}")]
    Transient {
        id: u64,
        #[source]
        source: FetchError,
    },
}

impl EnrichmentError {
    pub fn achievement_id(&self) -> u64 {
        match self {
            EnrichmentError::NotFound { id, .. } | EnrichmentError::Transient { id, .. } => *id,
        }
    }

    fn not_found(id: u64, reason: impl Into<String>) -> Self {
        EnrichmentError::NotFound {
            id,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait AchievementResolver: Send + Sync {
    async fn resolve_achievement(&self, achievement_id: u64) -> Result<Achievement, EnrichmentError>;
}

/// Resolver backed by the RetroAchievements API: owner lookup, then the
/// owning game's extended record, then the game summary when the extended
/// record lacks an icon or console name.
#[derive(Clone)]
pub struct RaEnrichmentClient {
    api: Arc<dyn RaApi>,
}

impl RaEnrichmentClient {
    pub fn new(api: Arc<dyn RaApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl AchievementResolver for RaEnrichmentClient {
    async fn resolve_achievement(&self, achievement_id: u64) -> Result<Achievement, EnrichmentError> {
        if achievement_id == 0 {
            return Err(EnrichmentError::not_found(0, "id 0 is never a real achievement"));
        }
        let transient = |source| EnrichmentError::Transient {
            id: achievement_id,
            source,
        };

        let owner = self
            .api
            .achievement_owner(achievement_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| EnrichmentError::not_found(achievement_id, "no owning game"))?;
        let game_id = owner.game.id;

        let game = self
            .api
            .game_extended(game_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| EnrichmentError::not_found(achievement_id, format!("game {game_id} unknown")))?;

        let entry = game.achievement(achievement_id).ok_or_else(|| {
            EnrichmentError::not_found(achievement_id, format!("absent from game {game_id}"))
        })?;

        let needs_summary = game.image_icon.is_empty()
            || (owner.console.title.is_empty() && game.console_name.is_empty());
        let summary = if needs_summary {
            match self.api.game_summary(game_id).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(game_id, error = %err, "game summary lookup failed; keeping partial metadata");
                    None
                }
            }
        } else {
            None
        };
        let summary = summary.unwrap_or_default();

        debug!(achievement_id, game_id, "resolved achievement");
        Ok(Achievement {
            achievement_id,
            achievement_title: entry.title.trim().to_string(),
            achievement_description: entry.description.clone(),
            achievement_badge_name: non_empty_or(&entry.badge_name, DEFAULT_BADGE_NAME),
            game_id,
            game_title: first_non_empty(&[&owner.game.title, &game.title, &summary.title]),
            game_image_icon: first_non_empty(&[&game.image_icon, &summary.image_icon]),
            console_id: [owner.console.id, game.console_id, summary.console_id]
                .into_iter()
                .find(|id| *id > 0)
                .unwrap_or(0),
            console_name: console_name(&owner.console.title, &game.console_name, &summary),
        })
    }
}

fn console_name(owner: &str, extended: &str, summary: &GameSummary) -> String {
    first_non_empty(&[owner, extended, &summary.console_name])
}

fn first_non_empty(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
