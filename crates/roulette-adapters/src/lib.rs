//! Candidate extractors, page fetchers and the RetroAchievements enrichment client.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roulette_core::{Candidate, SourceKind, WeekCandidates, ACHIEVEMENTS_PER_WEEK};
use roulette_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

mod enrichment;
mod pages;
mod ra_api;

pub use enrichment::{AchievementResolver, EnrichmentError, RaEnrichmentClient};
pub use pages::{parse_event_page, parse_forum_page};
pub use ra_api::{
    decode_optional, AchievementOwner, ApiCredentials, GameExtended, GameSummary, HttpRaApi, IdTitle, RaApi,
    SetAchievement, DEFAULT_API_BASE, EVENT_SET_GAME_ID,
};

pub const DEFAULT_EVENT_PAGE_URL: &str = "https://retroachievements.org/event/200-ra-roulette-2026";
pub const DEFAULT_FORUM_URL: &str = "https://retroachievements.org/forums/topic/34261";

/// Markers of an anti-bot interstitial served instead of the real page.
const CHALLENGE_MARKERS: [&str; 2] = ["Just a moment", "Checking your browser"];

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{url} answered with an anti-bot challenge")]
    Blocked { url: String },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ExtractContext {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self { run_id, started_at }
    }
}

/// One implementation per source. An `Err` means the source produced nothing
/// usable at all; partial pages come back as whatever weeks could be read.
#[async_trait]
pub trait CandidateExtractor: Send + Sync {
    fn source(&self) -> SourceKind;

    async fn extract_candidates(&self, ctx: &ExtractContext) -> Result<WeekCandidates, ExtractorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, source: SourceKind, url: &str) -> Result<FetchedPage, ExtractorError>;
}

#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    http: Arc<HttpFetcher>,
}

impl HttpPageFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, source: SourceKind, url: &str) -> Result<FetchedPage, ExtractorError> {
        let response = self.http.fetch_bytes(source.as_str(), url).await?;
        let body = String::from_utf8_lossy(&response.body).into_owned();
        if is_challenge_page(&body) {
            return Err(ExtractorError::Blocked {
                url: response.final_url,
            });
        }
        Ok(FetchedPage {
            url: response.final_url,
            body,
            fetched_at: Utc::now(),
        })
    }
}

pub fn is_challenge_page(body: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Serves saved pages from a directory; `<dir>/<last url segment>.html`.
#[derive(Debug, Clone)]
pub struct FixturePageFetcher {
    dir: PathBuf,
}

impl FixturePageFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        let without_query = url.split(['?', '#']).next().unwrap_or(url);
        let segment = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("index");
        self.dir.join(format!("{segment}.html"))
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch_page(&self, source: SourceKind, url: &str) -> Result<FetchedPage, ExtractorError> {
        let path = self.path_for(url);
        debug!(%source, path = %path.display(), "serving page fixture");
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ExtractorError::Message(format!("reading fixture {}: {e}", path.display())))?;
        if is_challenge_page(&body) {
            return Err(ExtractorError::Blocked { url: url.to_string() });
        }
        Ok(FetchedPage {
            url: url.to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }
}

pub struct EventPageExtractor {
    url: String,
    pages: Arc<dyn PageFetcher>,
}

impl EventPageExtractor {
    pub fn new(url: impl Into<String>, pages: Arc<dyn PageFetcher>) -> Self {
        Self { url: url.into(), pages }
    }
}

#[async_trait]
impl CandidateExtractor for EventPageExtractor {
    fn source(&self) -> SourceKind {
        SourceKind::EventPage
    }

    async fn extract_candidates(&self, ctx: &ExtractContext) -> Result<WeekCandidates, ExtractorError> {
        let page = self.pages.fetch_page(self.source(), &self.url).await?;
        let weeks = parse_event_page(&page.body)?;
        info!(run_id = %ctx.run_id, weeks = weeks.len(), "event page parsed");
        Ok(weeks)
    }
}

pub struct ForumExtractor {
    url: String,
    pages: Arc<dyn PageFetcher>,
}

impl ForumExtractor {
    pub fn new(url: impl Into<String>, pages: Arc<dyn PageFetcher>) -> Self {
        Self { url: url.into(), pages }
    }
}

#[async_trait]
impl CandidateExtractor for ForumExtractor {
    fn source(&self) -> SourceKind {
        SourceKind::Forum
    }

    async fn extract_candidates(&self, ctx: &ExtractContext) -> Result<WeekCandidates, ExtractorError> {
        let page = self.pages.fetch_page(self.source(), &self.url).await?;
        let weeks = parse_forum_page(&page.body)?;
        info!(run_id = %ctx.run_id, weeks = weeks.len(), "forum topic parsed");
        Ok(weeks)
    }
}

/// Reads the event's own achievement set; display orders `3(w-1)+1..=3w`
/// belong to week `w`. A week with any entry still titled `Placeholder` has
/// not been revealed and is left out.
pub struct EventSetExtractor {
    game_id: u64,
    api: Arc<dyn RaApi>,
}

impl EventSetExtractor {
    pub fn new(game_id: u64, api: Arc<dyn RaApi>) -> Self {
        Self { game_id, api }
    }
}

#[async_trait]
impl CandidateExtractor for EventSetExtractor {
    fn source(&self) -> SourceKind {
        SourceKind::EventSet
    }

    async fn extract_candidates(&self, ctx: &ExtractContext) -> Result<WeekCandidates, ExtractorError> {
        let game = self
            .api
            .game_extended(self.game_id)
            .await?
            .ok_or_else(|| ExtractorError::Message(format!("event game {} not found", self.game_id)))?;
        let weeks = group_event_set(&game);
        info!(run_id = %ctx.run_id, weeks = weeks.len(), "event set read");
        Ok(weeks)
    }
}

pub fn group_event_set(game: &GameExtended) -> WeekCandidates {
    let per_week = ACHIEVEMENTS_PER_WEEK as u64;
    let mut weeks = WeekCandidates::new();
    for entry in game.achievements.iter().filter(|a| a.display_order > 0 && a.id > 0) {
        let Ok(week) = u32::try_from((entry.display_order - 1) / per_week + 1) else {
            continue;
        };
        weeks
            .entry(week)
            .or_insert_with(Vec::new)
            .push(Candidate::new(entry.id, entry.title.trim(), SourceKind::EventSet));
    }
    weeks.retain(|week, list| {
        let revealed = !list.iter().any(|c| c.display_text == "Placeholder");
        if !revealed {
            debug!(week, "event set week still has placeholders");
        }
        revealed
    });
    weeks
}

/// Builds the extractor for a source. `url` is ignored by the event set.
pub fn extractor_for_source(
    source: SourceKind,
    url: Option<&str>,
    pages: Arc<dyn PageFetcher>,
    api: Arc<dyn RaApi>,
) -> Box<dyn CandidateExtractor> {
    match source {
        SourceKind::EventPage => Box::new(EventPageExtractor::new(
            url.unwrap_or(DEFAULT_EVENT_PAGE_URL),
            pages,
        )),
        SourceKind::Forum => Box::new(ForumExtractor::new(url.unwrap_or(DEFAULT_FORUM_URL), pages)),
        SourceKind::EventSet => Box::new(EventSetExtractor::new(EVENT_SET_GAME_ID, api)),
    }
}
