use std::collections::BTreeSet;

use roulette_core::{WeekCandidates, ACHIEVEMENTS_PER_WEEK};

/// Merges per-source results for the pending weeks. Per week the longest
/// list wins and ties keep the earlier source; the winner is cut to the
/// first [`ACHIEVEMENTS_PER_WEEK`] entries.
pub fn reconcile(per_source: &[WeekCandidates], pending: &BTreeSet<u32>) -> WeekCandidates {
    let mut merged = WeekCandidates::new();

    for source in per_source {
        for (week, candidates) in source {
            if !pending.contains(week) || candidates.is_empty() {
                continue;
            }
            let longer = merged
                .get(week)
                .map_or(true, |current| candidates.len() > current.len());
            if longer {
                merged.insert(*week, candidates.clone());
            }
        }
    }

    for candidates in merged.values_mut() {
        candidates.truncate(ACHIEVEMENTS_PER_WEEK);
    }
    merged
}

/// Drops candidates whose id is already owned by a complete week. Weeks left
/// empty are removed. Returns how many candidates were dropped.
pub fn discard_claimed(weeks: &mut WeekCandidates, claimed: &BTreeSet<u64>) -> usize {
    if claimed.is_empty() {
        return 0;
    }
    let mut dropped = 0;
    for candidates in weeks.values_mut() {
        let before = candidates.len();
        candidates.retain(|c| !claimed.contains(&c.achievement_id));
        dropped += before - candidates.len();
    }
    weeks.retain(|_, candidates| !candidates.is_empty());
    dropped
}

#[cfg(test)]
mod tests {
    use roulette_core::{Candidate, SourceKind};

    use super::*;

    fn week(source: SourceKind, entries: &[(u32, &[u64])]) -> WeekCandidates {
        entries
            .iter()
            .map(|(n, ids)| {
                let list: Vec<Candidate> = ids
                    .iter()
                    .map(|id| Candidate::new(*id, format!("a{id}"), source))
                    .collect();
                (*n, list)
            })
            .collect()
    }

    fn ids(merged: &WeekCandidates, n: u32) -> Vec<u64> {
        merged[&n].iter().map(|c| c.achievement_id).collect()
    }

    fn pending(weeks: &[u32]) -> BTreeSet<u32> {
        weeks.iter().copied().collect()
    }

    #[test]
    fn longer_list_wins() {
        let page = week(SourceKind::EventPage, &[(1, &[1, 2])]);
        let forum = week(SourceKind::Forum, &[(1, &[3, 4, 5])]);
        let merged = reconcile(&[page, forum], &pending(&[1]));
        assert_eq!(ids(&merged, 1), vec![3, 4, 5]);
        assert_eq!(merged[&1][0].source, SourceKind::Forum);
    }

    #[test]
    fn equal_lengths_keep_first_source() {
        let page = week(SourceKind::EventPage, &[(2, &[1, 2, 3])]);
        let forum = week(SourceKind::Forum, &[(2, &[7, 8, 9])]);
        let merged = reconcile(&[page, forum], &pending(&[2]));
        assert_eq!(ids(&merged, 2), vec![1, 2, 3]);
    }

    #[test]
    fn only_pending_weeks_are_kept_and_lists_are_truncated() {
        let page = week(SourceKind::EventPage, &[(1, &[1, 2, 3]), (2, &[4, 5, 6, 7, 8]), (9, &[10])]);
        let merged = reconcile(&[page], &pending(&[2, 3]));
        assert_eq!(merged.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(ids(&merged, 2), vec![4, 5, 6]);
    }

    #[test]
    fn no_sources_means_no_weeks() {
        assert!(reconcile(&[], &pending(&[1, 2])).is_empty());
        let empty = vec![WeekCandidates::new(), WeekCandidates::new()];
        assert!(reconcile(&empty, &pending(&[1])).is_empty());
    }

    #[test]
    fn claimed_ids_are_discarded() {
        let mut weeks = week(SourceKind::Forum, &[(2, &[11, 21, 22]), (3, &[12])]);
        let claimed: BTreeSet<u64> = [11, 12, 13].into_iter().collect();
        assert_eq!(discard_claimed(&mut weeks, &claimed), 2);
        assert_eq!(ids(&weeks, 2), vec![21, 22]);
        assert!(!weeks.contains_key(&3));
    }
}
