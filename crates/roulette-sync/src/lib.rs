//! Sync pipeline orchestration: pending weeks, source reconciliation, enrichment and persistence.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use roulette_adapters::{
    extractor_for_source, AchievementResolver, CandidateExtractor, ExtractContext, FixturePageFetcher,
    HttpPageFetcher, HttpRaApi, PageFetcher, RaApi, RaEnrichmentClient,
};
use roulette_core::{Achievement, Event, EventProfile, Week, WeekCandidates, WeekSchedule};
use roulette_storage::{
    BackoffPolicy, DocumentStore, HttpClientConfig, HttpFetcher, LoadOrigin, RequestPacer, SavedDocument,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod reconcile;

pub use config::{
    document_path_from_env, ConfigError, SourceConfig, SourceRegistry, SyncConfig, DEFAULT_DOCUMENT_PATH,
    DEFAULT_SOURCES_PATH, DEFAULT_SYNC_CRON, DEFAULT_USER_AGENT,
};
pub use reconcile::{discard_claimed, reconcile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every week up to the current one was already complete.
    UpToDate,
    /// At least one pending week was written.
    Refreshed,
    /// Pending weeks exist but no source produced anything for them; the
    /// document was not stale, so this is not an error.
    Unchanged,
    /// The document was stale before the run and still is.
    StaleUnrefreshed,
}

impl SyncOutcome {
    fn decide(pending: usize, written: usize, was_stale: bool, still_stale: bool) -> Self {
        if was_stale && still_stale {
            SyncOutcome::StaleUnrefreshed
        } else if pending == 0 {
            SyncOutcome::UpToDate
        } else if written > 0 {
            SyncOutcome::Refreshed
        } else {
            SyncOutcome::Unchanged
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            SyncOutcome::StaleUnrefreshed => 1,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::UpToDate => "up_to_date",
            SyncOutcome::Refreshed => "refreshed",
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::StaleUnrefreshed => "stale_unrefreshed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub current_week: u32,
    /// Whether the document was read, absent or replaced by the skeleton.
    pub load_origin: LoadOrigin,
    pub pending_weeks: Vec<u32>,
    pub sources_attempted: usize,
    pub sources_succeeded: usize,
    pub written_weeks: Vec<u32>,
    pub completed_weeks: Vec<u32>,
    pub placeholder_slots: usize,
    pub was_stale: bool,
    pub still_stale: bool,
    pub saved: Option<SavedDocument>,
    pub outcome: SyncOutcome,
}

impl SyncRunSummary {
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }

    pub fn one_line(&self) -> String {
        let saved = match &self.saved {
            Some(doc) if doc.unchanged => "unchanged".to_string(),
            Some(doc) => format!("saved sha256={}", &doc.content_hash[..12.min(doc.content_hash.len())]),
            None => "not written".to_string(),
        };
        let loaded = match &self.load_origin {
            LoadOrigin::Existing => String::new(),
            LoadOrigin::Missing => ", started from empty document".to_string(),
            LoadOrigin::Corrupt(reason) => format!(", CORRUPT document replaced ({reason})"),
        };
        format!(
            "run {} week {}: {} (pending {:?}, written {:?}, complete {:?}, placeholders {}, sources {}/{}, document {}{})",
            self.run_id,
            self.current_week,
            self.outcome.as_str(),
            self.pending_weeks,
            self.written_weeks,
            self.completed_weeks,
            self.placeholder_slots,
            self.sources_succeeded,
            self.sources_attempted,
            saved,
            loaded
        )
    }
}

pub struct SyncPipeline {
    store: DocumentStore,
    schedule: WeekSchedule,
    extractors: Vec<Box<dyn CandidateExtractor>>,
    resolver: Box<dyn AchievementResolver>,
}

impl SyncPipeline {
    pub fn new(
        store: DocumentStore,
        extractors: Vec<Box<dyn CandidateExtractor>>,
        resolver: Box<dyn AchievementResolver>,
    ) -> Self {
        let schedule = store.profile().schedule();
        Self {
            store,
            schedule,
            extractors,
            resolver,
        }
    }

    /// Wires the production collaborators. Every outbound request shares one
    /// pacer.
    pub fn from_config(config: &SyncConfig, registry: &SourceRegistry) -> Result<Self> {
        let pacer = Arc::new(RequestPacer::new(config.min_request_interval));
        let http = Arc::new(HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: BackoffPolicy::default(),
            },
            pacer,
        )?);
        let api: Arc<dyn RaApi> = Arc::new(HttpRaApi::new(
            http.clone(),
            config.api_base.clone(),
            config.credentials.clone(),
        ));
        let pages: Arc<dyn PageFetcher> = match &config.page_fixtures {
            Some(dir) => {
                info!(dir = %dir.display(), "serving pages from fixtures");
                Arc::new(FixturePageFetcher::new(dir.clone()))
            }
            None => Arc::new(HttpPageFetcher::new(http)),
        };

        let extractors = registry
            .enabled()
            .map(|s| extractor_for_source(s.source, s.url.as_deref(), pages.clone(), api.clone()))
            .collect::<Vec<_>>();
        if extractors.is_empty() {
            warn!("no enabled sources in registry");
        }

        let store = DocumentStore::new(config.document_path.clone(), EventProfile::roulette_2026());
        Ok(Self::new(store, extractors, Box::new(RaEnrichmentClient::new(api))))
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn schedule(&self) -> &WeekSchedule {
        &self.schedule
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, now).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let _lock = self
            .store
            .lock()
            .with_context(|| format!("locking {}", self.store.path().display()))?;

        let current_week = self.schedule.current_week_number(now);
        let loaded = self.store.load().await;
        let mut event = loaded.event;
        let was_stale = event.is_stale_at(now, &self.schedule);
        let pending = pending_weeks(&event, current_week);
        info!(current_week, pending = ?pending, was_stale, origin = ?loaded.origin, "loaded document");

        let mut summary = SyncRunSummary {
            run_id,
            started_at: now,
            current_week,
            load_origin: loaded.origin,
            pending_weeks: pending.iter().copied().collect(),
            sources_attempted: 0,
            sources_succeeded: 0,
            written_weeks: Vec::new(),
            completed_weeks: Vec::new(),
            placeholder_slots: 0,
            was_stale,
            still_stale: was_stale,
            saved: None,
            outcome: SyncOutcome::UpToDate,
        };

        if pending.is_empty() {
            summary.outcome = SyncOutcome::decide(0, 0, was_stale, was_stale);
            info!("all weeks up to date");
            return Ok(summary);
        }

        let ctx = ExtractContext::new(run_id, now);
        let mut per_source = Vec::with_capacity(self.extractors.len());
        for extractor in &self.extractors {
            summary.sources_attempted += 1;
            match extractor.extract_candidates(&ctx).await {
                Ok(weeks) => {
                    summary.sources_succeeded += 1;
                    per_source.push(weeks);
                }
                Err(err) => {
                    warn!(source = %extractor.source(), error = %err, "source failed; treating as empty");
                    per_source.push(WeekCandidates::new());
                }
            }
        }

        let claimed = event.claimed_achievement_ids();
        for weeks in &mut per_source {
            let dropped = discard_claimed(weeks, &claimed);
            if dropped > 0 {
                info!(dropped, "discarded candidates already owned by complete weeks");
            }
        }
        let merged = reconcile(&per_source, &pending);

        let mut resolved: HashMap<u64, Option<Achievement>> = HashMap::new();
        for (week_number, candidates) in &merged {
            let mut week: Week = self.schedule.week_of(*week_number);
            for candidate in candidates {
                let slot = match resolved.get(&candidate.achievement_id) {
                    Some(known) => known.clone(),
                    None => {
                        let outcome = match self.resolver.resolve_achievement(candidate.achievement_id).await {
                            Ok(achievement) => Some(achievement),
                            Err(err) => {
                                warn!(week = week_number, error = %err, "enrichment failed; using placeholder");
                                None
                            }
                        };
                        resolved.insert(candidate.achievement_id, outcome.clone());
                        outcome
                    }
                };
                let achievement = slot.unwrap_or_else(|| {
                    summary.placeholder_slots += 1;
                    Achievement::placeholder(candidate.achievement_id, &candidate.display_text)
                });
                week.achievements.push(achievement);
            }

            if week.is_complete() {
                summary.completed_weeks.push(*week_number);
            }
            info!(
                week = week_number,
                slots = week.achievements.len(),
                complete = week.is_complete(),
                "week written"
            );
            event.upsert_week(week);
            summary.written_weeks.push(*week_number);
        }

        event.normalize_weeks();
        if !summary.written_weeks.is_empty() {
            let saved = self
                .store
                .save(&event)
                .await
                .with_context(|| format!("saving {}", self.store.path().display()))?;
            info!(
                path = %saved.path.display(),
                sha256 = %saved.content_hash,
                unchanged = saved.unchanged,
                "document persisted"
            );
            summary.saved = Some(saved);
        }

        summary.still_stale = event.is_stale_at(now, &self.schedule);
        summary.outcome = SyncOutcome::decide(
            pending.len(),
            summary.written_weeks.len(),
            was_stale,
            summary.still_stale,
        );
        if summary.outcome == SyncOutcome::StaleUnrefreshed {
            warn!(
                last_week_end = ?event.last_week_end(),
                "document is stale and no source refreshed it"
            );
        }
        Ok(summary)
    }
}

fn pending_weeks(event: &Event, current_week: u32) -> BTreeSet<u32> {
    (1..=current_week)
        .filter(|n| !event.week(*n).is_some_and(Week::is_complete))
        .collect()
}

/// Markdown overview of weeks `1..=current` for offline inspection.
pub fn status_markdown(event: &Event, schedule: &WeekSchedule, now: DateTime<Utc>) -> String {
    let current_week = schedule.current_week_number(now);
    let stale = event.is_stale_at(now, schedule);
    let mut lines = vec![
        format!("# {} Status", event.event_name),
        String::new(),
        format!("- current week: {current_week}"),
        format!("- stored weeks: {}", event.weeks.len()),
        format!("- stale: {}", if stale { "yes" } else { "no" }),
        String::new(),
        "| Week | Starts | Ends | Slots | Complete |".to_string(),
        "|---:|---|---|---:|---|".to_string(),
    ];

    for n in 1..=current_week {
        let (start, end) = schedule.week_date_range(n);
        let (slots, complete) = match event.week(n) {
            Some(week) => (week.achievements.len(), if week.is_complete() { "yes" } else { "no" }),
            None => (0, "missing"),
        };
        lines.push(format!(
            "| {n} | {} | {} | {slots} | {complete} |",
            start.to_rfc3339_opts(SecondsFormat::Millis, true),
            end.to_rfc3339_opts(SecondsFormat::Millis, true),
        ));
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Cron-driven runs. Ticks share one gate, so a tick that fires while a run
/// is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let gate = gate.clone();
        Box::pin(async move {
            let Ok(_running) = gate.try_lock() else {
                warn!("previous sync still running; skipping tick");
                return;
            };
            match pipeline.run_once(Utc::now()).await {
                Ok(summary) if summary.exit_code() == 0 => info!("{}", summary.one_line()),
                Ok(summary) => warn!("{}", summary.one_line()),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
