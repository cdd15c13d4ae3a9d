//! Single-pass assignment resolver.
//!
//! The candidate feed must arrive ordered by `(page_id ASC, fallback ASC,
//! priority DESC)`: a page's candidates are contiguous, with non-fallback
//! candidates ahead of fallback ones and stronger matches first. The
//! resolver performs no sorting and no I/O of its own; it walks the stream
//! once and decides admission per candidate, so a page is final as soon as
//! the stream moves past it.

/// Normal per-page assignment cap.
pub const MAX_LINKS_PER_PAGE: usize = 2;
/// Cap once a fallback link has been admitted for the page.
pub const MAX_LINKS_PER_PAGE_FALLBACK: usize = 1;

/// One (page, rule) match produced by the feed query. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub page_id: i64,
    pub rule_id: i64,
    pub link_id: i64,
    pub fallback: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Assignment {
    pub page_id: i64,
    pub link_id: i64,
}

/// Walk an ordered candidate stream and admit links page by page.
///
/// Admission tests, in order; the first failing test skips the candidate:
/// 1. the page's slots are full (two links, or one once a fallback is in);
/// 2. a fallback candidate meets a page that already holds any link;
/// 3. the link is already admitted for this page;
/// 4. the page is excluded by policy.
pub fn resolve<I, F>(candidates: I, mut is_page_excluded: F) -> Vec<Assignment>
where
    I: IntoIterator<Item = Candidate>,
    F: FnMut(i64) -> bool,
{
    let mut assignments = Vec::new();
    let mut current_page: Option<i64> = None;
    let mut links_assigned: Vec<i64> = Vec::new();
    let mut fallback_assigned = false;

    for candidate in candidates {
        if current_page != Some(candidate.page_id) {
            current_page = Some(candidate.page_id);
            links_assigned.clear();
            fallback_assigned = false;
        }
        let cap = if fallback_assigned {
            MAX_LINKS_PER_PAGE_FALLBACK
        } else {
            MAX_LINKS_PER_PAGE
        };
        if links_assigned.len() >= cap {
            continue;
        }
        // A fallback only stands in when nothing else matched the page.
        if candidate.fallback && !links_assigned.is_empty() {
            continue;
        }
        if links_assigned.contains(&candidate.link_id) {
            continue;
        }
        if is_page_excluded(candidate.page_id) {
            continue;
        }
        assignments.push(Assignment {
            page_id: candidate.page_id,
            link_id: candidate.link_id,
        });
        links_assigned.push(candidate.link_id);
        fallback_assigned = candidate.fallback;
    }

    assignments
}

/// Convenience for callers without an exclusion policy.
pub fn resolve_unfiltered<I>(candidates: I) -> Vec<Assignment>
where
    I: IntoIterator<Item = Candidate>,
{
    resolve(candidates, |_| false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::collections::HashSet;

    use super::{Assignment, Candidate, resolve, resolve_unfiltered};

    fn candidate(
        page_id: i64,
        rule_id: i64,
        link_id: i64,
        fallback: bool,
        priority: i64,
    ) -> Candidate {
        Candidate {
            page_id,
            rule_id,
            link_id,
            fallback,
            priority,
        }
    }

    fn assignment(page_id: i64, link_id: i64) -> Assignment {
        Assignment { page_id, link_id }
    }

    #[test]
    fn empty_feed_yields_no_assignments() {
        assert!(resolve_unfiltered([]).is_empty());
    }

    #[test]
    fn page_rule_beats_category_fallback() {
        // Page P: page rule for L1 at 999, category fallback for L2 at 2.
        let feed = [
            candidate(10, 1, 1, false, 999),
            candidate(10, 2, 2, true, 2),
        ];
        assert_eq!(resolve_unfiltered(feed), vec![assignment(10, 1)]);
    }

    #[test]
    fn two_nonfallback_candidates_both_admitted() {
        let feed = [
            candidate(20, 1, 3, false, 5),
            candidate(20, 2, 4, false, 3),
        ];
        assert_eq!(
            resolve_unfiltered(feed),
            vec![assignment(20, 3), assignment(20, 4)]
        );
    }

    #[test]
    fn third_nonfallback_candidate_hits_the_cap() {
        let feed = [
            candidate(20, 1, 3, false, 7),
            candidate(20, 2, 4, false, 5),
            candidate(20, 3, 5, false, 3),
        ];
        assert_eq!(
            resolve_unfiltered(feed),
            vec![assignment(20, 3), assignment(20, 4)]
        );
    }

    #[test]
    fn duplicate_link_counts_once() {
        // Three rules all matching page S for the same link.
        let feed = [
            candidate(30, 1, 5, false, 7),
            candidate(30, 2, 5, false, 5),
            candidate(30, 3, 5, false, 2),
        ];
        assert_eq!(resolve_unfiltered(feed), vec![assignment(30, 5)]);
    }

    #[test]
    fn duplicate_link_does_not_consume_a_slot() {
        let feed = [
            candidate(30, 1, 5, false, 7),
            candidate(30, 2, 5, false, 5),
            candidate(30, 3, 6, false, 2),
        ];
        assert_eq!(
            resolve_unfiltered(feed),
            vec![assignment(30, 5), assignment(30, 6)]
        );
    }

    #[test]
    fn fallback_alone_is_admitted_exactly_once() {
        let feed = [
            candidate(40, 1, 7, true, 3),
            candidate(40, 2, 8, true, 2),
        ];
        assert_eq!(resolve_unfiltered(feed), vec![assignment(40, 7)]);
    }

    #[test]
    fn fallback_admission_caps_the_page_at_one() {
        // Malformed order placing a non-fallback after a fallback must not
        // produce a second slot.
        let feed = [
            candidate(40, 1, 7, true, 3),
            candidate(40, 2, 8, false, 9),
        ];
        assert_eq!(resolve_unfiltered(feed), vec![assignment(40, 7)]);
    }

    #[test]
    fn pages_accumulate_independently() {
        let feed = [
            candidate(10, 1, 1, false, 999),
            candidate(10, 2, 2, true, 2),
            candidate(11, 2, 2, true, 2),
            candidate(12, 3, 1, false, 5),
            candidate(12, 4, 2, false, 3),
        ];
        assert_eq!(
            resolve_unfiltered(feed),
            vec![
                assignment(10, 1),
                assignment(11, 2),
                assignment(12, 1),
                assignment(12, 2),
            ]
        );
    }

    #[test]
    fn excluded_pages_get_nothing() {
        let excluded: HashSet<i64> = HashSet::from([50]);
        let feed = [
            candidate(50, 1, 1, false, 999),
            candidate(51, 1, 1, false, 999),
        ];
        let result = resolve(feed, |page_id| excluded.contains(&page_id));
        assert_eq!(result, vec![assignment(51, 1)]);
    }

    #[test]
    fn exclusion_applies_to_fallbacks_too() {
        let excluded: HashSet<i64> = HashSet::from([50]);
        let feed = [candidate(50, 1, 9, true, 2)];
        assert!(resolve(feed, |page_id| excluded.contains(&page_id)).is_empty());
    }

    #[test]
    fn resolution_is_deterministic_for_identical_feeds() {
        let feed = vec![
            candidate(10, 1, 1, false, 999),
            candidate(10, 2, 2, false, 7),
            candidate(10, 3, 3, false, 5),
            candidate(11, 4, 1, true, 2),
        ];
        let first = resolve_unfiltered(feed.clone());
        let second = resolve_unfiltered(feed);
        assert_eq!(first, second);
    }

    #[test]
    fn invariants_hold_over_a_mixed_feed() {
        let feed = vec![
            candidate(1, 1, 10, false, 999),
            candidate(1, 2, 11, false, 7),
            candidate(1, 3, 12, false, 5),
            candidate(2, 4, 10, true, 3),
            candidate(2, 5, 11, true, 2),
            candidate(3, 6, 12, false, 9),
            candidate(3, 7, 12, false, 7),
            candidate(3, 8, 13, false, 2),
        ];
        let result = resolve_unfiltered(feed);

        let mut per_page: HashMap<i64, Vec<i64>> = HashMap::new();
        for entry in &result {
            per_page.entry(entry.page_id).or_default().push(entry.link_id);
        }
        for links in per_page.values() {
            assert!(links.len() <= 2);
            let distinct: HashSet<&i64> = links.iter().collect();
            assert_eq!(distinct.len(), links.len());
        }
        // Page 2 was fallback-derived and must hold exactly one link.
        assert_eq!(per_page.get(&2).map(Vec::len), Some(1));
    }
}
