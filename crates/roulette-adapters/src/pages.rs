//! HTML parsing for the event page and the event's forum topic.

use regex::Regex;
use roulette_core::{Candidate, SourceKind, WeekCandidates};
use scraper::{ElementRef, Html, Node, Selector};

use crate::ExtractorError;

const EVENT_SECTION_SELECTOR: &str = r#"[class*="week"], [data-week], table tr, .card"#;
const FORUM_POST_SELECTOR: &str = r#".post, .comment, article, [class*="post"]"#;
const WEEK_PATTERN: &str = r"(?i)\bweek\s*#?\s*(\d{1,3})\b";
const ACHIEVEMENT_HREF_PATTERN: &str = r"/achievement/(\d+)";
const MAX_DISPLAY_TEXT_CHARS: usize = 100;

struct Patterns {
    week: Regex,
    achievement_href: Regex,
    link: Selector,
}

impl Patterns {
    fn compile() -> Result<Self, ExtractorError> {
        Ok(Self {
            week: regex(WEEK_PATTERN)?,
            achievement_href: regex(ACHIEVEMENT_HREF_PATTERN)?,
            link: selector("a[href]")?,
        })
    }

    fn week_numbers(&self, text: &str) -> Vec<u32> {
        self.week
            .captures_iter(text)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
            .filter(|n| *n > 0)
            .collect()
    }

    fn achievement_id(&self, link: &ElementRef<'_>) -> Option<u64> {
        let href = link.value().attr("href")?;
        let caps = self.achievement_href.captures(href)?;
        caps.get(1)?.as_str().parse().ok().filter(|id: &u64| *id > 0)
    }
}

/// Ordered candidate list with per-list id dedupe: the first position of an
/// id is kept, and a non-empty text replaces an empty one.
struct CandidateList {
    source: SourceKind,
    items: Vec<Candidate>,
}

impl CandidateList {
    fn new(source: SourceKind) -> Self {
        Self {
            source,
            items: Vec::new(),
        }
    }

    fn push(&mut self, achievement_id: u64, text: String) {
        match self.items.iter_mut().find(|c| c.achievement_id == achievement_id) {
            Some(existing) => {
                if existing.display_text.is_empty() && !text.is_empty() {
                    existing.display_text = text;
                }
            }
            None => self.items.push(Candidate::new(achievement_id, text, self.source)),
        }
    }
}

/// Keeps the longest list per week; on equal length the earlier one stays.
fn keep_longest(weeks: &mut WeekCandidates, week: u32, list: CandidateList) {
    if list.items.is_empty() {
        return;
    }
    let replace = weeks
        .get(&week)
        .map_or(true, |current| list.items.len() > current.len());
    if replace {
        weeks.insert(week, list.items);
    }
}

/// Each section that names exactly one week contributes its achievement
/// links to that week. Sections naming several weeks are containers and are
/// skipped; their inner sections are matched on their own.
pub fn parse_event_page(html: &str) -> Result<WeekCandidates, ExtractorError> {
    let patterns = Patterns::compile()?;
    let sections = selector(EVENT_SECTION_SELECTOR)?;
    let document = Html::parse_document(html);
    let mut weeks = WeekCandidates::new();

    for section in document.select(&sections) {
        let text = section.text().collect::<Vec<_>>().join(" ");
        let mut mentioned = patterns.week_numbers(&text);
        mentioned.sort_unstable();
        mentioned.dedup();
        let &[week] = mentioned.as_slice() else {
            continue;
        };

        let mut list = CandidateList::new(SourceKind::EventPage);
        for link in section.select(&patterns.link) {
            if let Some(id) = patterns.achievement_id(&link) {
                list.push(id, display_text(&link));
            }
        }
        keep_longest(&mut weeks, week, list);
    }

    Ok(weeks)
}

/// Walks each post in document order. A text mentioning a week opens that
/// week; achievement links after it belong to it until the next mention.
pub fn parse_forum_page(html: &str) -> Result<WeekCandidates, ExtractorError> {
    let patterns = Patterns::compile()?;
    let posts = selector(FORUM_POST_SELECTOR)?;
    let document = Html::parse_document(html);
    let mut weeks = WeekCandidates::new();

    for post in document.select(&posts) {
        let mut current: Option<(u32, CandidateList)> = None;

        for node in post.descendants() {
            match node.value() {
                Node::Text(text) => {
                    if inside_link(node.parent().and_then(ElementRef::wrap)) {
                        continue;
                    }
                    if let Some(&week) = patterns.week_numbers(text).last() {
                        if let Some((done, list)) = current.take() {
                            keep_longest(&mut weeks, done, list);
                        }
                        current = Some((week, CandidateList::new(SourceKind::Forum)));
                    }
                }
                Node::Element(element) if element.name() == "a" => {
                    let (Some((_, list)), Some(link)) = (current.as_mut(), ElementRef::wrap(node)) else {
                        continue;
                    };
                    if let Some(id) = patterns.achievement_id(&link) {
                        list.push(id, display_text(&link));
                    }
                }
                _ => {}
            }
        }

        if let Some((week, list)) = current {
            keep_longest(&mut weeks, week, list);
        }
    }

    Ok(weeks)
}

fn inside_link(parent: Option<ElementRef<'_>>) -> bool {
    let mut cursor = parent;
    while let Some(element) = cursor {
        if element.value().name() == "a" {
            return true;
        }
        cursor = element.parent().and_then(ElementRef::wrap);
    }
    false
}

fn display_text(link: &ElementRef<'_>) -> String {
    let joined = link.text().collect::<Vec<_>>().join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_DISPLAY_TEXT_CHARS).collect()
}

fn selector(raw: &str) -> Result<Selector, ExtractorError> {
    Selector::parse(raw).map_err(|e| ExtractorError::Message(format!("selector {raw:?}: {e}")))
}

fn regex(raw: &str) -> Result<Regex, ExtractorError> {
    Regex::new(raw).map_err(|e| ExtractorError::Message(format!("pattern {raw:?}: {e}")))
}
