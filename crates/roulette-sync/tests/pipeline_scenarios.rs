use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use roulette_adapters::{AchievementResolver, CandidateExtractor, EnrichmentError, ExtractContext, ExtractorError};
use roulette_core::{Achievement, Candidate, Event, EventProfile, SourceKind, WeekCandidates};
use roulette_storage::{DocumentStore, FetchError, LoadOrigin};
use roulette_sync::{SyncOutcome, SyncPipeline};
use tempfile::{tempdir, TempDir};

struct StubExtractor {
    source: SourceKind,
    weeks: Option<WeekCandidates>,
}

impl StubExtractor {
    fn ok(source: SourceKind, entries: &[(u32, &[u64])]) -> Box<dyn CandidateExtractor> {
        let weeks: WeekCandidates = entries
            .iter()
            .map(|(week, ids)| {
                let list: Vec<Candidate> = ids
                    .iter()
                    .map(|id| Candidate::new(*id, format!("Scraped {id}"), source))
                    .collect();
                (*week, list)
            })
            .collect();
        Box::new(Self {
            source,
            weeks: Some(weeks),
        })
    }

    fn failing(source: SourceKind) -> Box<dyn CandidateExtractor> {
        Box::new(Self { source, weeks: None })
    }
}

#[async_trait]
impl CandidateExtractor for StubExtractor {
    fn source(&self) -> SourceKind {
        self.source
    }

    async fn extract_candidates(&self, _ctx: &ExtractContext) -> Result<WeekCandidates, ExtractorError> {
        self.weeks
            .clone()
            .ok_or_else(|| ExtractorError::Blocked {
                url: format!("https://retroachievements.org/{}", self.source),
            })
    }
}

/// Resolves every id except the ones listed as missing or flaky, and records
/// each lookup.
#[derive(Clone, Default)]
struct StubResolver {
    missing: HashSet<u64>,
    flaky: HashSet<u64>,
    calls: Arc<Mutex<Vec<u64>>>,
}

impl StubResolver {
    fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AchievementResolver for StubResolver {
    async fn resolve_achievement(&self, id: u64) -> Result<Achievement, EnrichmentError> {
        self.calls.lock().unwrap().push(id);
        if self.missing.contains(&id) {
            return Err(EnrichmentError::NotFound {
                id,
                reason: "absent from game".to_string(),
            });
        }
        if self.flaky.contains(&id) {
            return Err(EnrichmentError::Transient {
                id,
                source: FetchError::HttpStatus {
                    status: 503,
                    url: "https://retroachievements.org/API/API_GetGameExtended.php".to_string(),
                },
            });
        }
        Ok(resolved(id))
    }
}

fn resolved(id: u64) -> Achievement {
    Achievement {
        achievement_id: id,
        achievement_title: format!("Achievement {id}"),
        achievement_description: format!("Do the thing #{id}"),
        achievement_badge_name: format!("{:05}", id % 100_000),
        game_id: 1000 + id,
        game_title: format!("Game {id}"),
        game_image_icon: format!("/Images/{id:06}.png"),
        console_id: 7,
        console_name: "NES/Famicom".to_string(),
    }
}

struct Fixture {
    _dir: TempDir,
    store: DocumentStore,
    profile: EventProfile,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let profile = EventProfile::roulette_2026();
        let store = DocumentStore::new(dir.path().join("roulette2026.json"), profile.clone());
        Self {
            _dir: dir,
            store,
            profile,
        }
    }

    /// Noon on the first day of `week`.
    fn in_week(&self, week: u32) -> DateTime<Utc> {
        self.profile.start_date + Duration::days(7 * i64::from(week - 1)) + Duration::hours(12)
    }

    fn pipeline(&self, extractors: Vec<Box<dyn CandidateExtractor>>, resolver: &StubResolver) -> SyncPipeline {
        SyncPipeline::new(self.store.clone(), extractors, Box::new(resolver.clone()))
    }

    async fn seed(&self, weeks: &[(u32, &[u64])]) {
        let schedule = self.profile.schedule();
        let mut event = self.profile.skeleton();
        for (n, ids) in weeks {
            let mut week = schedule.week_of(*n);
            week.achievements = ids.iter().map(|id| resolved(*id)).collect();
            event.upsert_week(week);
        }
        self.store.save(&event).await.expect("seed document");
    }

    fn bytes(&self) -> Vec<u8> {
        std::fs::read(self.store.path()).expect("document on disk")
    }

    fn event(&self) -> Event {
        read_event(self.store.path())
    }
}

fn read_event(path: &Path) -> Event {
    serde_json::from_slice(&std::fs::read(path).expect("read document")).expect("parse document")
}

#[tokio::test]
async fn fresh_document_gets_all_due_weeks() {
    let fx = Fixture::new();
    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(
        vec![
            StubExtractor::ok(SourceKind::EventPage, &[(1, &[101, 102, 103]), (2, &[201, 202, 203])]),
            StubExtractor::ok(SourceKind::Forum, &[(1, &[101, 102, 103]), (2, &[201, 202, 203])]),
        ],
        &resolver,
    );

    let summary = pipeline.run_once(fx.in_week(2)).await.expect("run");

    assert_eq!(summary.current_week, 2);
    assert_eq!(summary.load_origin, LoadOrigin::Missing);
    assert_eq!(summary.pending_weeks, vec![1, 2]);
    assert_eq!(summary.written_weeks, vec![1, 2]);
    assert_eq!(summary.completed_weeks, vec![1, 2]);
    assert_eq!(summary.placeholder_slots, 0);
    assert_eq!(summary.sources_succeeded, 2);
    assert!(summary.was_stale && !summary.still_stale);
    assert_eq!(summary.outcome, SyncOutcome::Refreshed);
    assert_eq!(summary.exit_code(), 0);

    let event = fx.event();
    let numbers: Vec<u32> = event.weeks.iter().map(|w| w.week_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert!(event.weeks.iter().all(|w| w.is_complete()));
    assert_eq!(event.weeks[1].start_date, fx.profile.schedule().week_date_range(2).0);
}

#[tokio::test]
async fn corrupt_document_is_reported_in_the_summary() {
    let fx = Fixture::new();
    std::fs::write(fx.store.path(), b"{ \"eventName\": ").expect("write garbage");
    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(
        vec![StubExtractor::ok(SourceKind::EventPage, &[(1, &[101, 102, 103])])],
        &resolver,
    );

    let summary = pipeline.run_once(fx.in_week(1)).await.expect("run");

    assert!(matches!(summary.load_origin, LoadOrigin::Corrupt(_)));
    assert!(summary.one_line().contains("CORRUPT document replaced"));
    let json = serde_json::to_value(&summary).expect("summary json");
    assert_eq!(json["load_origin"]["kind"], "corrupt");
    assert_eq!(json["outcome"], "refreshed");
    assert_eq!(fx.event().weeks.len(), 1);

    let again = fx.pipeline(Vec::new(), &resolver).run_once(fx.in_week(1)).await.expect("rerun");
    assert_eq!(again.load_origin, LoadOrigin::Existing);
    assert!(!again.one_line().contains("CORRUPT"));
}

#[tokio::test]
async fn second_identical_run_is_a_no_op() {
    let fx = Fixture::new();
    let resolver = StubResolver::default();
    let extractors = || {
        vec![StubExtractor::ok(
            SourceKind::EventPage,
            &[(1, &[101, 102, 103]), (2, &[201, 202, 203])],
        )]
    };
    let now = fx.in_week(2);

    fx.pipeline(extractors(), &resolver).run_once(now).await.expect("first run");
    let after_first = fx.bytes();
    let calls_after_first = resolver.calls().len();

    let second = fx.pipeline(extractors(), &resolver).run_once(now).await.expect("second run");
    assert_eq!(second.outcome, SyncOutcome::UpToDate);
    assert!(second.pending_weeks.is_empty());
    assert!(second.saved.is_none());
    assert_eq!(second.sources_attempted, 0);
    assert_eq!(fx.bytes(), after_first);
    assert_eq!(resolver.calls().len(), calls_after_first);
}

#[tokio::test]
async fn complete_week_is_never_rewritten_or_requeried() {
    let fx = Fixture::new();
    fx.seed(&[(1, &[11, 12, 13])]).await;
    let week_one_before = fx.event().weeks[0].clone();

    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(
        vec![StubExtractor::ok(
            SourceKind::EventPage,
            &[(1, &[999, 998, 997]), (2, &[201, 202, 203])],
        )],
        &resolver,
    );
    let summary = pipeline.run_once(fx.in_week(2)).await.expect("run");

    assert_eq!(summary.pending_weeks, vec![2]);
    assert_eq!(summary.written_weeks, vec![2]);
    assert_eq!(fx.event().weeks[0], week_one_before);
    let calls = resolver.calls();
    assert!(calls.iter().all(|id| ![11, 12, 13, 997, 998, 999].contains(id)));
}

#[tokio::test]
async fn not_found_slot_degrades_to_placeholder_and_stays_pending() {
    let fx = Fixture::new();
    fx.seed(&[(1, &[11, 12, 13])]).await;
    let resolver = StubResolver {
        missing: [202].into_iter().collect(),
        ..StubResolver::default()
    };
    let extractors = || vec![StubExtractor::ok(SourceKind::Forum, &[(2, &[201, 202, 203])])];
    let now = fx.in_week(2);

    let first = fx.pipeline(extractors(), &resolver).run_once(now).await.expect("first run");
    assert_eq!(first.written_weeks, vec![2]);
    assert!(first.completed_weeks.is_empty());
    assert_eq!(first.placeholder_slots, 1);

    let event = fx.event();
    let week = event.week(2).expect("week 2 written");
    assert_eq!(week.achievements.len(), 3);
    assert!(!week.is_complete());
    let slot = &week.achievements[1];
    assert_eq!(slot.achievement_id, 202);
    assert_eq!(slot.achievement_title, "Scraped 202");
    assert_eq!(slot.achievement_badge_name, "00000");
    assert_eq!(slot.game_id, 0);
    assert_eq!(slot.game_title, "Unknown");
    assert_eq!(slot.console_name, "Unknown");

    let second = fx.pipeline(extractors(), &resolver).run_once(now).await.expect("second run");
    assert_eq!(second.pending_weeks, vec![2]);
    assert_eq!(resolver.calls().iter().filter(|id| **id == 202).count(), 2);
}

#[tokio::test]
async fn transient_failure_is_a_placeholder_too() {
    let fx = Fixture::new();
    let resolver = StubResolver {
        flaky: [103].into_iter().collect(),
        ..StubResolver::default()
    };
    let pipeline = fx.pipeline(
        vec![StubExtractor::ok(SourceKind::EventPage, &[(1, &[101, 102, 103])])],
        &resolver,
    );
    let summary = pipeline.run_once(fx.in_week(1)).await.expect("run");

    assert_eq!(summary.placeholder_slots, 1);
    assert!(summary.completed_weeks.is_empty());
    let event = fx.event();
    assert_eq!(event.weeks[0].achievements[2].achievement_id, 103);
    assert_eq!(event.weeks[0].achievements[2].game_id, 0);
}

#[tokio::test]
async fn all_sources_failing_on_stale_document_exits_non_zero() {
    let fx = Fixture::new();
    fx.seed(&[(1, &[11, 12, 13])]).await;
    let before = fx.bytes();

    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(
        vec![
            StubExtractor::failing(SourceKind::EventPage),
            StubExtractor::failing(SourceKind::Forum),
        ],
        &resolver,
    );
    let summary = pipeline.run_once(fx.in_week(3)).await.expect("run");

    assert_eq!(summary.pending_weeks, vec![2, 3]);
    assert_eq!(summary.sources_attempted, 2);
    assert_eq!(summary.sources_succeeded, 0);
    assert!(summary.was_stale && summary.still_stale);
    assert_eq!(summary.outcome, SyncOutcome::StaleUnrefreshed);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.saved.is_none());
    assert_eq!(fx.bytes(), before);
    assert!(resolver.calls().is_empty());
}

#[tokio::test]
async fn failing_sources_on_fresh_document_are_not_an_error() {
    let fx = Fixture::new();
    fx.seed(&[(1, &[11, 12, 13])]).await;
    let before = fx.bytes();

    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(vec![StubExtractor::failing(SourceKind::EventPage)], &resolver);
    // Day two of week one: the stored week has not ended yet.
    let summary = pipeline
        .run_once(fx.profile.start_date + Duration::days(1))
        .await
        .expect("run");

    assert_eq!(summary.outcome, SyncOutcome::UpToDate);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(fx.bytes(), before);

    let partial = Fixture::new();
    partial.seed(&[(1, &[11, 12, 13]), (2, &[21])]).await;
    let before = partial.bytes();
    let pipeline = partial.pipeline(vec![StubExtractor::failing(SourceKind::Forum)], &resolver);
    let summary = pipeline.run_once(partial.in_week(2)).await.expect("run");
    assert!(!summary.was_stale);
    assert_eq!(summary.outcome, SyncOutcome::Unchanged);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(partial.bytes(), before);
}

#[tokio::test]
async fn ids_owned_by_complete_weeks_are_not_reused() {
    let fx = Fixture::new();
    fx.seed(&[(1, &[11, 12, 13])]).await;
    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(
        vec![StubExtractor::ok(SourceKind::Forum, &[(2, &[11, 201, 202, 203])])],
        &resolver,
    );
    pipeline.run_once(fx.in_week(2)).await.expect("run");

    let ids: Vec<u64> = fx.event().week(2).expect("week 2").achievements.iter().map(|a| a.achievement_id).collect();
    assert_eq!(ids, vec![201, 202, 203]);
}

#[tokio::test]
async fn resolutions_are_memoised_within_a_run() {
    let fx = Fixture::new();
    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(
        vec![StubExtractor::ok(
            SourceKind::EventPage,
            &[(1, &[101, 102, 300]), (2, &[300, 202, 203])],
        )],
        &resolver,
    );
    pipeline.run_once(fx.in_week(2)).await.expect("run");

    let calls: HashMap<u64, usize> = resolver.calls().into_iter().fold(HashMap::new(), |mut acc, id| {
        *acc.entry(id).or_default() += 1;
        acc
    });
    assert_eq!(calls.get(&300), Some(&1));
    assert_eq!(calls.len(), 5);
}

#[tokio::test]
async fn concurrent_run_is_refused_while_locked() {
    let fx = Fixture::new();
    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(vec![StubExtractor::ok(SourceKind::EventPage, &[(1, &[101])])], &resolver);

    let held = fx.store.lock().expect("hold lock");
    let err = pipeline.run_once(fx.in_week(1)).await.expect_err("locked");
    assert!(format!("{err:#}").contains("locked by another run"));
    assert!(!fx.store.path().exists());

    drop(held);
    pipeline.run_once(fx.in_week(1)).await.expect("run after release");
    assert!(fx.store.path().exists());
}

#[tokio::test]
async fn nothing_is_due_before_the_event_starts() {
    let fx = Fixture::new();
    let resolver = StubResolver::default();
    let pipeline = fx.pipeline(vec![StubExtractor::failing(SourceKind::EventPage)], &resolver);
    let summary = pipeline
        .run_once(fx.profile.start_date - Duration::hours(1))
        .await
        .expect("run");

    assert_eq!(summary.current_week, 0);
    assert_eq!(summary.outcome, SyncOutcome::UpToDate);
    assert!(!summary.was_stale);
    assert!(!fx.store.path().exists());
}
