//! Core domain model, week schedule and completeness rules for the roulette sync.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Number of achievement slots a complete week holds.
pub const ACHIEVEMENTS_PER_WEEK: usize = 3;

/// Titles that mark a slot as not yet resolved.
pub const PLACEHOLDER_TITLES: [&str; 3] = ["TBD", "Placeholder", "Unknown"];

pub const DEFAULT_BADGE_NAME: &str = "00000";

const ROULETTE_2026_START_SECS: i64 = 1_770_422_400;
const ROULETTE_2026_END_SECS: i64 = 1_801_958_399;

/// Where a candidate was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    EventPage,
    Forum,
    EventSet,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::EventPage => "event-page",
            SourceKind::Forum => "forum",
            SourceKind::EventSet => "event-set",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unverified (id, text) pair scraped from a source. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub achievement_id: u64,
    pub display_text: String,
    pub source: SourceKind,
}

impl Candidate {
    pub fn new(achievement_id: u64, display_text: impl Into<String>, source: SourceKind) -> Self {
        Self {
            achievement_id,
            display_text: display_text.into(),
            source,
        }
    }
}

/// Candidates grouped by the week label a source assigned them.
pub type WeekCandidates = BTreeMap<u32, Vec<Candidate>>;

/// One achievement slot as published to the app.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Achievement {
    pub achievement_id: u64,
    pub achievement_title: String,
    pub achievement_description: String,
    pub achievement_badge_name: String,
    pub game_id: u64,
    pub game_title: String,
    pub game_image_icon: String,
    #[serde(rename = "consoleID", alias = "consoleId")]
    pub console_id: u64,
    pub console_name: String,
}

impl Achievement {
    /// Slot used when a candidate could not be enriched. It keeps the
    /// scraped id and text so the app has something to show, but it can
    /// never satisfy [`is_week_complete`].
    pub fn placeholder(achievement_id: u64, display_text: &str) -> Self {
        let title = display_text.trim();
        Self {
            achievement_id,
            achievement_title: if title.is_empty() {
                "Unknown".to_string()
            } else {
                title.to_string()
            },
            achievement_description: String::new(),
            achievement_badge_name: DEFAULT_BADGE_NAME.to_string(),
            game_id: 0,
            game_title: "Unknown".to_string(),
            game_image_icon: String::new(),
            console_id: 0,
            console_name: "Unknown".to_string(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.achievement_id > 0 && self.game_id > 0 && !is_placeholder_title(&self.achievement_title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Week {
    #[serde(rename = "week", alias = "weekNumber")]
    pub week_number: u32,
    #[serde(with = "iso_millis")]
    pub start_date: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub achievements: Vec<Achievement>,
}

impl Week {
    pub fn is_complete(&self) -> bool {
        is_week_complete(self)
    }
}

/// Top-level persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_name: String,
    pub event_id: u32,
    pub badge_threshold: u32,
    pub max_points: u32,
    #[serde(with = "iso_millis")]
    pub start_date: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub weeks: Vec<Week>,
}

impl Event {
    pub fn week(&self, week_number: u32) -> Option<&Week> {
        self.weeks.iter().find(|w| w.week_number == week_number)
    }

    /// Sorts weeks ascending and drops duplicate week numbers, keeping the
    /// first occurrence.
    pub fn normalize_weeks(&mut self) {
        self.weeks.sort_by_key(|w| w.week_number);
        self.weeks.dedup_by_key(|w| w.week_number);
    }

    /// Replaces the week with the same number, or inserts it in order.
    pub fn upsert_week(&mut self, week: Week) {
        match self
            .weeks
            .binary_search_by_key(&week.week_number, |w| w.week_number)
        {
            Ok(index) => self.weeks[index] = week,
            Err(index) => self.weeks.insert(index, week),
        }
    }

    pub fn last_week_end(&self) -> Option<DateTime<Utc>> {
        self.weeks.iter().map(|w| w.end_date).max()
    }

    /// A document is stale once its last week has ended. Without any week it
    /// is stale as soon as the event has started.
    pub fn is_stale_at(&self, now: DateTime<Utc>, schedule: &WeekSchedule) -> bool {
        match self.last_week_end() {
            Some(end) => end < now,
            None => now >= schedule.event_start(),
        }
    }

    /// Achievement ids already owned by complete weeks.
    pub fn claimed_achievement_ids(&self) -> BTreeSet<u64> {
        self.weeks
            .iter()
            .filter(|w| w.is_complete())
            .flat_map(|w| w.achievements.iter().map(|a| a.achievement_id))
            .collect()
    }
}

/// Static facts about the tracked event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventProfile {
    pub event_name: String,
    pub event_id: u32,
    pub badge_threshold: u32,
    pub max_points: u32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub week_duration: Duration,
}

impl EventProfile {
    pub fn roulette_2026() -> Self {
        Self {
            event_name: "RA Roulette 2026".to_string(),
            event_id: 200,
            badge_threshold: 52,
            max_points: 156,
            start_date: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(ROULETTE_2026_START_SECS),
            end_date: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(ROULETTE_2026_END_SECS),
            week_duration: Duration::days(7),
        }
    }

    /// Document used when nothing usable is on disk.
    pub fn skeleton(&self) -> Event {
        Event {
            event_name: self.event_name.clone(),
            event_id: self.event_id,
            badge_threshold: self.badge_threshold,
            max_points: self.max_points,
            start_date: self.start_date,
            end_date: self.end_date,
            weeks: Vec::new(),
        }
    }

    pub fn schedule(&self) -> WeekSchedule {
        WeekSchedule::new(self.start_date, self.week_duration)
    }
}

/// Maps instants to 1-based week numbers and back. All arithmetic is in
/// whole milliseconds so two computations can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekSchedule {
    event_start: DateTime<Utc>,
    week_millis: i64,
}

impl WeekSchedule {
    pub fn new(event_start: DateTime<Utc>, week_duration: Duration) -> Self {
        Self {
            event_start,
            week_millis: week_duration.num_milliseconds().max(1),
        }
    }

    pub fn event_start(&self) -> DateTime<Utc> {
        self.event_start
    }

    pub fn week_duration(&self) -> Duration {
        Duration::milliseconds(self.week_millis)
    }

    /// `0` before the event starts, otherwise the week `now` falls in.
    pub fn current_week_number(&self, now: DateTime<Utc>) -> u32 {
        let elapsed = (now - self.event_start).num_milliseconds();
        if elapsed < 0 {
            return 0;
        }
        u32::try_from(elapsed / self.week_millis + 1).unwrap_or(u32::MAX)
    }

    /// Inclusive `[start, end]` bounds of a week; `end` is one millisecond
    /// before the next week's start. Week `0` is treated as week `1`.
    pub fn week_date_range(&self, week_number: u32) -> (DateTime<Utc>, DateTime<Utc>) {
        let index = i64::from(week_number.max(1) - 1);
        let start = self
            .event_start
            .checked_add_signed(Duration::milliseconds(index.saturating_mul(self.week_millis)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let end = start
            .checked_add_signed(Duration::milliseconds(self.week_millis - 1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (start, end)
    }

    /// Empty week with dates taken from the schedule.
    pub fn week_of(&self, week_number: u32) -> Week {
        let (start_date, end_date) = self.week_date_range(week_number);
        Week {
            week_number,
            start_date,
            end_date,
            achievements: Vec::new(),
        }
    }
}

pub fn is_placeholder_title(title: &str) -> bool {
    let title = title.trim();
    title.is_empty() || PLACEHOLDER_TITLES.contains(&title)
}

/// A week is complete when it holds exactly [`ACHIEVEMENTS_PER_WEEK`]
/// resolved achievements.
pub fn is_week_complete(week: &Week) -> bool {
    week.achievements.len() == ACHIEVEMENTS_PER_WEEK
        && week.achievements.iter().all(Achievement::is_resolved)
}

/// Timestamps as `2026-02-07T00:00:00.000Z`; any RFC 3339 form is read.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
