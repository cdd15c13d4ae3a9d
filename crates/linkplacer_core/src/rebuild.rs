use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::audit::{self, AuditAction};
use crate::config::ToolConfig;
use crate::resolver::{self, Assignment, Candidate};
use crate::runtime::ResolvedPaths;
use crate::store;

pub(crate) const FINGERPRINT_META_KEY: &str = "assignments_fingerprint";
pub(crate) const LAST_REBUILD_META_KEY: &str = "last_rebuild_unix";
pub(crate) const FALLBACK_ASSIGNMENTS_META_KEY: &str = "last_rebuild_fallback_assignments";

/// Candidate feed over the rule table joined against the mirrored wiki
/// state. The page arm emits one candidate per exact-page rule whose page
/// is still mirrored; the category arm emits one candidate per (rule, page)
/// pair where the page carries the rule's content area and every listed
/// category. Content areas compare with spaces folded to underscores, the
/// same normalization applied when rules are stored.
///
/// The ORDER BY is the resolver's ordering contract: pages contiguous,
/// non-fallback before fallback, stronger matches first, rule id as the
/// final tiebreaker so the feed is deterministic.
const CANDIDATE_FEED_SQL: &str = "
    SELECT rules.page_id AS page_id,
           rules.rule_id AS rule_id,
           rules.link_id AS link_id,
           rules.fallback AS fallback,
           rules.priority AS priority
      FROM rules
      INNER JOIN pages ON pages.page_id = rules.page_id
     WHERE rules.page_id IS NOT NULL
       AND (?1 IS NULL OR rules.link_id = ?1)
    UNION ALL
    SELECT pages.page_id AS page_id,
           rules.rule_id AS rule_id,
           rules.link_id AS link_id,
           rules.fallback AS fallback,
           rules.priority AS priority
      FROM rules
      INNER JOIN pages
              ON (rules.content_area IS NULL
                  OR REPLACE(pages.content_area, ' ', '_') = rules.content_area)
             AND (rules.category_1 IS NULL OR EXISTS (
                    SELECT 1 FROM page_categories pc1
                     WHERE pc1.page_id = pages.page_id
                       AND pc1.category = rules.category_1))
             AND (rules.category_2 IS NULL OR EXISTS (
                    SELECT 1 FROM page_categories pc2
                     WHERE pc2.page_id = pages.page_id
                       AND pc2.category = rules.category_2))
             AND (rules.category_3 IS NULL OR EXISTS (
                    SELECT 1 FROM page_categories pc3
                     WHERE pc3.page_id = pages.page_id
                       AND pc3.category = rules.category_3))
             AND (rules.category_4 IS NULL OR EXISTS (
                    SELECT 1 FROM page_categories pc4
                     WHERE pc4.page_id = pages.page_id
                       AND pc4.category = rules.category_4))
     WHERE rules.page_id IS NULL
       AND (?1 IS NULL OR rules.link_id = ?1)
     ORDER BY page_id ASC, fallback ASC, priority DESC, rule_id ASC";

pub(crate) fn candidate_feed(
    connection: &Connection,
    link_filter: Option<i64>,
) -> Result<Vec<Candidate>> {
    let mut statement = connection
        .prepare(CANDIDATE_FEED_SQL)
        .context("failed to prepare candidate feed query")?;
    let rows = statement
        .query_map(params![link_filter], |row| {
            let fallback: i64 = row.get(3)?;
            Ok(Candidate {
                page_id: row.get(0)?,
                rule_id: row.get(1)?,
                link_id: row.get(2)?,
                fallback: fallback != 0,
                priority: row.get(4)?,
            })
        })
        .context("failed to run candidate feed query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode candidate row")?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub dry_run: bool,
    pub candidates_considered: usize,
    pub assignments_written: usize,
    pub pages_assigned: usize,
    pub assignments_added: usize,
    pub assignments_removed: usize,
    pub fallback_assignments: usize,
    pub affected_page_ids: Vec<i64>,
}

/// Recompute the assignment table from current rules and mirror state.
///
/// The whole rebuild runs inside one immediate transaction: the feed read,
/// the delete-all-then-insert replace, the staleness fingerprint and the
/// audit entry all commit together or not at all, and a concurrent rebuild
/// blocks on the busy handler until this one finishes. With `dry_run` set
/// nothing is written; the report describes what a real run would change.
///
/// Affected pages are every page holding an assignment before or after the
/// replace. Callers forward them to the wiki purge so cached renders drop
/// stale link boxes.
pub fn rebuild(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    options: &RebuildOptions,
) -> Result<RebuildReport> {
    let mut connection = store::open_connection(&paths.db_path)?;
    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start rebuild transaction")?;

    let excluded = store::excluded_page_ids(&transaction, config.excluded_article_types())?;
    let candidates = candidate_feed(&transaction, None)?;
    let candidates_considered = candidates.len();
    // A surviving assignment came from a fallback candidate exactly when no
    // regular rule of that link matched the page at all.
    let non_fallback_pairs: HashSet<(i64, i64)> = candidates
        .iter()
        .filter(|candidate| !candidate.fallback)
        .map(|candidate| (candidate.page_id, candidate.link_id))
        .collect();
    let resolved = resolver::resolve(candidates, |page_id| excluded.contains(&page_id));

    let before = current_assignments(&transaction)?;
    let after: BTreeSet<Assignment> = resolved.into_iter().collect();

    let mut affected: BTreeSet<i64> = BTreeSet::new();
    for assignment in before.iter().chain(after.iter()) {
        affected.insert(assignment.page_id);
    }

    let report = RebuildReport {
        dry_run: options.dry_run,
        candidates_considered,
        assignments_written: after.len(),
        pages_assigned: after
            .iter()
            .map(|assignment| assignment.page_id)
            .collect::<BTreeSet<i64>>()
            .len(),
        assignments_added: after.difference(&before).count(),
        assignments_removed: before.difference(&after).count(),
        fallback_assignments: after
            .iter()
            .filter(|assignment| {
                !non_fallback_pairs.contains(&(assignment.page_id, assignment.link_id))
            })
            .count(),
        affected_page_ids: affected.into_iter().collect(),
    };

    if options.dry_run {
        return Ok(report);
    }

    transaction
        .execute("DELETE FROM assignments", [])
        .context("failed to clear assignments table")?;
    let mut insert_statement = transaction
        .prepare("INSERT INTO assignments (page_id, link_id) VALUES (?1, ?2)")
        .context("failed to prepare assignments insert")?;
    for assignment in &after {
        insert_statement
            .execute(params![assignment.page_id, assignment.link_id])
            .with_context(|| {
                format!(
                    "failed to insert assignment ({}, {})",
                    assignment.page_id, assignment.link_id
                )
            })?;
    }
    drop(insert_statement);

    let fingerprint = state_fingerprint(&transaction, config)?;
    store::meta_set(&transaction, FINGERPRINT_META_KEY, &fingerprint)?;
    let now = i64::try_from(store::unix_timestamp()?)
        .context("timestamp does not fit into i64")?;
    store::meta_set(&transaction, LAST_REBUILD_META_KEY, &now.to_string())?;
    store::meta_set(
        &transaction,
        FALLBACK_ASSIGNMENTS_META_KEY,
        &report.fallback_assignments.to_string(),
    )?;

    audit::record(
        &transaction,
        AuditAction::Rebuild,
        None,
        &json!({
            "candidates": report.candidates_considered,
            "assignments": report.assignments_written,
            "added": report.assignments_added,
            "removed": report.assignments_removed,
        }),
    )?;

    transaction
        .commit()
        .context("failed to commit rebuild transaction")?;

    Ok(report)
}

fn current_assignments(connection: &Connection) -> Result<BTreeSet<Assignment>> {
    let mut statement = connection
        .prepare("SELECT page_id, link_id FROM assignments")
        .context("failed to prepare assignments read")?;
    let rows = statement
        .query_map([], |row| {
            Ok(Assignment {
                page_id: row.get(0)?,
                link_id: row.get(1)?,
            })
        })
        .context("failed to run assignments read")?;

    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(row.context("failed to decode assignment row")?);
    }
    Ok(out)
}

/// Hash of everything the resolver's output depends on: the rule table, the
/// mirrored pages and category memberships, and the exclusion policy. Link
/// rows stay out of the hash; editing a URL or text changes rendering, not
/// placement.
pub(crate) fn state_fingerprint(connection: &Connection, config: &ToolConfig) -> Result<String> {
    let mut hasher = Sha256::new();

    for article_type in config.excluded_article_types() {
        hasher.update(b"exclude|");
        hasher.update(article_type.as_bytes());
        hasher.update(b"\n");
    }

    let mut rule_statement = connection
        .prepare(
            "SELECT rule_id, link_id, fallback, page_id, content_area,
                    category_1, category_2, category_3, category_4, priority
             FROM rules ORDER BY rule_id ASC",
        )
        .context("failed to prepare rule fingerprint query")?;
    let rule_rows = rule_statement
        .query_map([], |row| {
            let rule_id: i64 = row.get(0)?;
            let link_id: i64 = row.get(1)?;
            let fallback: i64 = row.get(2)?;
            let page_id: Option<i64> = row.get(3)?;
            let content_area: Option<String> = row.get(4)?;
            let category_1: Option<String> = row.get(5)?;
            let category_2: Option<String> = row.get(6)?;
            let category_3: Option<String> = row.get(7)?;
            let category_4: Option<String> = row.get(8)?;
            let priority: i64 = row.get(9)?;
            Ok(format!(
                "rule|{rule_id}|{link_id}|{fallback}|{}|{}|{}|{}|{}|{}|{priority}\n",
                page_id.map(|id| id.to_string()).unwrap_or_default(),
                content_area.unwrap_or_default(),
                category_1.unwrap_or_default(),
                category_2.unwrap_or_default(),
                category_3.unwrap_or_default(),
                category_4.unwrap_or_default(),
            ))
        })
        .context("failed to run rule fingerprint query")?;
    for row in rule_rows {
        hasher.update(row.context("failed to decode rule fingerprint row")?);
    }

    let mut page_statement = connection
        .prepare(
            "SELECT page_id, title, content_area, article_type
             FROM pages ORDER BY page_id ASC",
        )
        .context("failed to prepare page fingerprint query")?;
    let page_rows = page_statement
        .query_map([], |row| {
            let page_id: i64 = row.get(0)?;
            let title: String = row.get(1)?;
            let content_area: Option<String> = row.get(2)?;
            let article_type: Option<String> = row.get(3)?;
            Ok(format!(
                "page|{page_id}|{title}|{}|{}\n",
                content_area.unwrap_or_default(),
                article_type.unwrap_or_default(),
            ))
        })
        .context("failed to run page fingerprint query")?;
    for row in page_rows {
        hasher.update(row.context("failed to decode page fingerprint row")?);
    }

    let mut category_statement = connection
        .prepare(
            "SELECT page_id, category FROM page_categories
             ORDER BY page_id ASC, category ASC",
        )
        .context("failed to prepare category fingerprint query")?;
    let category_rows = category_statement
        .query_map([], |row| {
            let page_id: i64 = row.get(0)?;
            let category: String = row.get(1)?;
            Ok(format!("category|{page_id}|{category}\n"))
        })
        .context("failed to run category fingerprint query")?;
    for row in category_rows {
        hasher.update(row.context("failed to decode category fingerprint row")?);
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct StalenessReport {
    pub stale: bool,
    pub last_rebuild_unix: Option<i64>,
    pub last_rebuild_fallback_assignments: Option<usize>,
}

/// Compare the fingerprint stored by the last rebuild against the current
/// state. A missing fingerprint (no rebuild yet) reads as stale.
pub fn staleness(paths: &ResolvedPaths, config: &ToolConfig) -> Result<StalenessReport> {
    let connection = store::open_connection(&paths.db_path)?;
    let stored = store::meta_get(&connection, FINGERPRINT_META_KEY)?;
    let current = state_fingerprint(&connection, config)?;
    let last_rebuild_unix = store::meta_get(&connection, LAST_REBUILD_META_KEY)?
        .and_then(|value| value.parse::<i64>().ok());
    let last_rebuild_fallback_assignments =
        store::meta_get(&connection, FALLBACK_ASSIGNMENTS_META_KEY)?
            .and_then(|value| value.parse::<usize>().ok());
    Ok(StalenessReport {
        stale: stored.as_deref() != Some(current.as_str()),
        last_rebuild_unix,
        last_rebuild_fallback_assignments,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UnassignedMatch {
    pub page_id: i64,
    pub page_title: String,
    pub rule_id: i64,
    pub priority: i64,
    pub fallback: bool,
    pub excluded: bool,
}

/// Pages that match some rule of this link but hold no assignment for it.
/// One entry per page, carrying the page's strongest candidate; excluded
/// pages are listed and flagged so the gap is explainable.
pub fn unassigned_matches_for_link(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    link_id: i64,
) -> Result<Vec<UnassignedMatch>> {
    let connection = store::open_connection(&paths.db_path)?;
    store::get_link_for_connection(&connection, link_id)?
        .with_context(|| format!("link {link_id} not found"))?;

    let excluded = store::excluded_page_ids(&connection, config.excluded_article_types())?;

    let mut assigned_statement = connection
        .prepare("SELECT page_id FROM assignments WHERE link_id = ?1")
        .context("failed to prepare assigned pages query")?;
    let assigned_rows = assigned_statement
        .query_map(params![link_id], |row| row.get::<_, i64>(0))
        .context("failed to run assigned pages query")?;
    let mut assigned = HashSet::new();
    for row in assigned_rows {
        assigned.insert(row.context("failed to decode assigned page row")?);
    }

    let candidates = candidate_feed(&connection, Some(link_id))?;
    let mut title_statement = connection
        .prepare("SELECT title FROM pages WHERE page_id = ?1")
        .context("failed to prepare page title query")?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        if assigned.contains(&candidate.page_id) {
            continue;
        }
        if !seen.insert(candidate.page_id) {
            continue;
        }
        let page_title: String = title_statement
            .query_row(params![candidate.page_id], |row| row.get(0))
            .with_context(|| format!("page {} missing from mirror", candidate.page_id))?;
        out.push(UnassignedMatch {
            page_id: candidate.page_id,
            page_title,
            rule_id: candidate.rule_id,
            priority: candidate.priority,
            fallback: candidate.fallback,
            excluded: excluded.contains(&candidate.page_id),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::config::ToolConfig;
    use crate::migrate::run_migrations;
    use crate::store::test_support::{seed_category, seed_page, test_paths};
    use crate::store::{self, create_category_rule, create_link, create_page_rule, delete_rule};

    use super::{RebuildOptions, candidate_feed, rebuild, staleness, unassigned_matches_for_link};

    fn excluding(types: &[&str]) -> ToolConfig {
        let mut config = ToolConfig::default();
        config.placement.excluded_article_types =
            types.iter().map(|value| value.to_string()).collect();
        config
    }

    fn assignment_rows(paths: &crate::runtime::ResolvedPaths) -> Vec<(i64, i64)> {
        let connection = store::open_connection(&paths.db_path).expect("open");
        let mut statement = connection
            .prepare("SELECT page_id, link_id FROM assignments ORDER BY page_id, link_id")
            .expect("prepare");
        let rows = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("query");
        rows.map(|row| row.expect("row")).collect()
    }

    #[test]
    fn feed_orders_candidates_per_contract() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 10, "Anxiety", Some("Mental Health"), None);
            seed_category(&connection, 10, "Aid");
        }

        let link_page = create_link(&paths, "https://example.org/a", "a").expect("link");
        let link_area = create_link(&paths, "https://example.org/b", "b").expect("link");
        let link_fallback = create_link(&paths, "https://example.org/c", "c").expect("link");

        create_page_rule(&paths, &config, link_page.link_id, "Anxiety", false).expect("page rule");
        create_category_rule(
            &paths,
            &config,
            link_area.link_id,
            Some("Mental Health"),
            &[],
            false,
        )
        .expect("area rule");
        create_category_rule(
            &paths,
            &config,
            link_fallback.link_id,
            None,
            &["Aid".to_string()],
            true,
        )
        .expect("fallback rule");

        let connection = store::open_connection(&paths.db_path).expect("open");
        let feed = candidate_feed(&connection, None).expect("feed");
        let summary: Vec<(i64, bool, i64)> = feed
            .iter()
            .map(|candidate| (candidate.link_id, candidate.fallback, candidate.priority))
            .collect();
        assert_eq!(
            summary,
            vec![
                (link_page.link_id, false, 999),
                (link_area.link_id, false, 3),
                (link_fallback.link_id, true, 2),
            ]
        );
    }

    #[test]
    fn feed_requires_every_listed_category() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "Both", None, None);
            seed_page(&connection, 2, "OnlyFirst", None, None);
            seed_category(&connection, 1, "Housing");
            seed_category(&connection, 1, "Benefits");
            seed_category(&connection, 2, "Housing");
        }

        let link = create_link(&paths, "https://example.org", "t").expect("link");
        create_category_rule(
            &paths,
            &config,
            link.link_id,
            None,
            &["Housing".to_string(), "Benefits".to_string()],
            false,
        )
        .expect("rule");

        let connection = store::open_connection(&paths.db_path).expect("open");
        let feed = candidate_feed(&connection, None).expect("feed");
        let pages: Vec<i64> = feed.iter().map(|candidate| candidate.page_id).collect();
        assert_eq!(pages, vec![1]);
    }

    #[test]
    fn feed_normalizes_content_area_spaces() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 5, "Care", Some("Mental Health"), None);
            seed_page(&connection, 6, "Other", Some("Benefits"), None);
        }

        let link = create_link(&paths, "https://example.org", "t").expect("link");
        create_category_rule(&paths, &config, link.link_id, Some("Mental Health"), &[], false)
            .expect("rule");

        let connection = store::open_connection(&paths.db_path).expect("open");
        let feed = candidate_feed(&connection, None).expect("feed");
        let pages: Vec<i64> = feed.iter().map(|candidate| candidate.page_id).collect();
        assert_eq!(pages, vec![5]);
    }

    #[test]
    fn feed_drops_page_rules_for_unmirrored_pages() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 9, "Gone Soon", None, None);
        }

        let link = create_link(&paths, "https://example.org", "t").expect("link");
        create_page_rule(&paths, &config, link.link_id, "Gone Soon", false).expect("rule");

        let connection = store::open_connection(&paths.db_path).expect("open");
        connection
            .execute("DELETE FROM pages WHERE page_id = 9", [])
            .expect("unmirror page");
        let feed = candidate_feed(&connection, None).expect("feed");
        assert!(feed.is_empty());
    }

    #[test]
    fn rebuild_materializes_assignments_and_is_idempotent() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "One", None, None);
            seed_page(&connection, 2, "Two", None, None);
            seed_category(&connection, 1, "Aid");
            seed_category(&connection, 2, "Aid");
        }

        let first = create_link(&paths, "https://example.org/1", "1").expect("link");
        let second = create_link(&paths, "https://example.org/2", "2").expect("link");
        create_category_rule(&paths, &config, first.link_id, None, &["Aid".to_string()], false)
            .expect("rule");
        create_category_rule(&paths, &config, second.link_id, None, &["Aid".to_string()], false)
            .expect("rule");

        let report = rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert_eq!(report.assignments_written, 4);
        assert_eq!(report.pages_assigned, 2);
        assert_eq!(report.assignments_added, 4);
        assert_eq!(report.assignments_removed, 0);
        assert_eq!(report.affected_page_ids, vec![1, 2]);
        assert_eq!(
            assignment_rows(&paths),
            vec![
                (1, first.link_id),
                (1, second.link_id),
                (2, first.link_id),
                (2, second.link_id),
            ]
        );

        let again = rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert_eq!(again.assignments_added, 0);
        assert_eq!(again.assignments_removed, 0);
        assert_eq!(again.assignments_written, 4);
    }

    #[test]
    fn rebuild_skips_excluded_pages() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = excluding(&["landing_page"]);
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "Normal", None, None);
            seed_page(&connection, 2, "Landing", None, Some("landing_page"));
            seed_category(&connection, 1, "Aid");
            seed_category(&connection, 2, "Aid");
        }

        let link = create_link(&paths, "https://example.org", "t").expect("link");
        create_category_rule(&paths, &config, link.link_id, None, &["Aid".to_string()], false)
            .expect("rule");

        let report = rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert_eq!(report.candidates_considered, 2);
        assert_eq!(report.assignments_written, 1);
        assert_eq!(assignment_rows(&paths), vec![(1, link.link_id)]);

        let matches =
            unassigned_matches_for_link(&paths, &config, link.link_id).expect("matches");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].page_id, 2);
        assert_eq!(matches[0].page_title, "Landing");
        assert!(matches[0].excluded);
    }

    #[test]
    fn fallback_assignments_counted_in_report() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "Covered", None, None);
            seed_page(&connection, 2, "Bare", None, None);
            seed_category(&connection, 1, "Aid");
            seed_category(&connection, 1, "Backup");
            seed_category(&connection, 2, "Backup");
        }

        let regular = create_link(&paths, "https://example.org/aid", "aid").expect("link");
        let backup = create_link(&paths, "https://example.org/backup", "backup").expect("link");
        create_category_rule(&paths, &config, regular.link_id, None, &["Aid".to_string()], false)
            .expect("rule");
        create_category_rule(&paths, &config, backup.link_id, None, &["Aid".to_string()], false)
            .expect("rule");
        create_category_rule(
            &paths,
            &config,
            backup.link_id,
            None,
            &["Backup".to_string()],
            true,
        )
        .expect("fallback rule");

        // Page 1 carries both of backup's matchers; only the empty page 2
        // takes its fallback, so exactly one assignment is fallback-derived.
        let report = rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert_eq!(report.assignments_written, 3);
        assert_eq!(report.fallback_assignments, 1);
        assert_eq!(
            assignment_rows(&paths),
            vec![
                (1, regular.link_id),
                (1, backup.link_id),
                (2, backup.link_id),
            ]
        );

        let status = staleness(&paths, &config).expect("staleness");
        assert_eq!(status.last_rebuild_fallback_assignments, Some(1));
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "One", None, None);
            seed_category(&connection, 1, "Aid");
        }
        let link = create_link(&paths, "https://example.org", "t").expect("link");
        create_category_rule(&paths, &config, link.link_id, None, &["Aid".to_string()], false)
            .expect("rule");

        let dry = rebuild(&paths, &config, &RebuildOptions { dry_run: true }).expect("dry run");
        assert!(dry.dry_run);
        assert_eq!(dry.assignments_written, 1);
        assert_eq!(dry.assignments_added, 1);
        assert!(assignment_rows(&paths).is_empty());

        let status = staleness(&paths, &config).expect("staleness");
        assert!(status.stale);
        assert_eq!(status.last_rebuild_unix, None);
    }

    #[test]
    fn rebuild_prunes_assignments_for_deleted_rules() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "One", None, None);
            seed_category(&connection, 1, "Aid");
        }
        let link = create_link(&paths, "https://example.org", "t").expect("link");
        let rule = create_category_rule(
            &paths,
            &config,
            link.link_id,
            None,
            &["Aid".to_string()],
            false,
        )
        .expect("rule");
        rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert_eq!(assignment_rows(&paths).len(), 1);

        delete_rule(&paths, rule.rule_id).expect("delete rule");
        let report = rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert_eq!(report.assignments_removed, 1);
        assert_eq!(report.assignments_written, 0);
        assert_eq!(report.affected_page_ids, vec![1]);
        assert!(assignment_rows(&paths).is_empty());
    }

    #[test]
    fn staleness_tracks_rule_and_mirror_changes() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "One", None, None);
            seed_category(&connection, 1, "Aid");
        }
        let link = create_link(&paths, "https://example.org", "t").expect("link");

        assert!(staleness(&paths, &config).expect("staleness").stale);

        rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        let status = staleness(&paths, &config).expect("staleness");
        assert!(!status.stale);
        assert!(status.last_rebuild_unix.is_some());

        create_category_rule(&paths, &config, link.link_id, None, &["Aid".to_string()], false)
            .expect("rule");
        assert!(staleness(&paths, &config).expect("staleness").stale);

        rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert!(!staleness(&paths, &config).expect("staleness").stale);

        let connection = store::open_connection(&paths.db_path).expect("open");
        seed_page(&connection, 2, "Two", None, None);
        drop(connection);
        assert!(staleness(&paths, &config).expect("staleness").stale);
    }

    #[test]
    fn unassigned_matches_reports_pages_capped_out() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let config = ToolConfig::default();
        {
            let connection = store::open_connection(&paths.db_path).expect("open");
            seed_page(&connection, 1, "Busy", Some("Care"), None);
            seed_category(&connection, 1, "Aid");
            seed_category(&connection, 1, "Housing");
        }

        let strong = create_link(&paths, "https://example.org/strong", "s").expect("link");
        let middle = create_link(&paths, "https://example.org/middle", "m").expect("link");
        let weak = create_link(&paths, "https://example.org/weak", "w").expect("link");
        create_category_rule(
            &paths,
            &config,
            strong.link_id,
            Some("Care"),
            &["Aid".to_string(), "Housing".to_string()],
            false,
        )
        .expect("rule");
        create_category_rule(
            &paths,
            &config,
            middle.link_id,
            Some("Care"),
            &["Aid".to_string()],
            false,
        )
        .expect("rule");
        create_category_rule(&paths, &config, weak.link_id, None, &["Aid".to_string()], false)
            .expect("rule");

        rebuild(&paths, &config, &RebuildOptions::default()).expect("rebuild");
        assert_eq!(
            assignment_rows(&paths),
            vec![(1, strong.link_id), (1, middle.link_id)]
        );

        let capped = unassigned_matches_for_link(&paths, &config, weak.link_id).expect("matches");
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].page_id, 1);
        assert!(!capped[0].excluded);

        let placed =
            unassigned_matches_for_link(&paths, &config, strong.link_id).expect("matches");
        assert!(placed.is_empty());
    }
}
