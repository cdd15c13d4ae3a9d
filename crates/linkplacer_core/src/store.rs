use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::json;

use crate::audit::{self, AuditAction};
use crate::config::ToolConfig;
use crate::rules::{Link, Rule, RuleMatch, normalize_category_name};
use crate::runtime::ResolvedPaths;

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

pub(crate) fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

fn now_i64() -> Result<i64> {
    i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")
}

/// Accept only absolute http(s) URLs for stored links.
fn validate_link_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let parsed = reqwest::Url::parse(trimmed)
        .with_context(|| format!("link URL does not parse: {trimmed}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        bail!("link URL must be http or https, got {}", parsed.scheme());
    }
    Ok(trimmed.to_string())
}

fn validate_link_text(text: &str) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("link text cannot be empty");
    }
    Ok(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Links

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub link_id: i64,
    pub url: String,
    pub text: String,
    pub page_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkDeleteReport {
    pub link_id: i64,
    pub url: String,
    pub rules_deleted: usize,
    pub assignments_released: usize,
    pub released_page_ids: Vec<i64>,
}

pub fn create_link(paths: &ResolvedPaths, url: &str, text: &str) -> Result<Link> {
    let url = validate_link_url(url)?;
    let text = validate_link_text(text)?;
    let mut connection = open_connection(&paths.db_path)?;
    let now = now_i64()?;

    let transaction = connection
        .transaction()
        .context("failed to start link create transaction")?;
    transaction
        .execute(
            "INSERT INTO links (url, text, created_at_unix, updated_at_unix)
             VALUES (?1, ?2, ?3, ?3)",
            params![url, text, now],
        )
        .context("failed to insert link")?;
    let link_id = transaction.last_insert_rowid();
    audit::record(
        &transaction,
        AuditAction::LinkCreate,
        Some(link_id),
        &json!({ "url": url, "text": text }),
    )?;
    transaction
        .commit()
        .context("failed to commit link create transaction")?;

    Ok(Link { link_id, url, text })
}

pub fn update_link(paths: &ResolvedPaths, link_id: i64, url: &str, text: &str) -> Result<Link> {
    let url = validate_link_url(url)?;
    let text = validate_link_text(text)?;
    let mut connection = open_connection(&paths.db_path)?;
    let now = now_i64()?;

    let transaction = connection
        .transaction()
        .context("failed to start link update transaction")?;
    let changed = transaction
        .execute(
            "UPDATE links SET url = ?1, text = ?2, updated_at_unix = ?3 WHERE link_id = ?4",
            params![url, text, now, link_id],
        )
        .context("failed to update link")?;
    if changed == 0 {
        bail!("link {link_id} not found");
    }
    audit::record(
        &transaction,
        AuditAction::LinkEdit,
        Some(link_id),
        &json!({ "url": url, "text": text }),
    )?;
    transaction
        .commit()
        .context("failed to commit link update transaction")?;

    Ok(Link { link_id, url, text })
}

pub fn get_link(paths: &ResolvedPaths, link_id: i64) -> Result<Option<Link>> {
    let connection = open_connection(&paths.db_path)?;
    get_link_for_connection(&connection, link_id)
}

pub(crate) fn get_link_for_connection(
    connection: &Connection,
    link_id: i64,
) -> Result<Option<Link>> {
    connection
        .query_row(
            "SELECT link_id, url, text FROM links WHERE link_id = ?1",
            params![link_id],
            |row| {
                Ok(Link {
                    link_id: row.get(0)?,
                    url: row.get(1)?,
                    text: row.get(2)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to load link {link_id}"))
}

/// Lowest-id link carrying exactly this URL. URLs are not unique, so this
/// is a lookup aid, not a constraint.
pub fn find_link_by_url(paths: &ResolvedPaths, url: &str) -> Result<Option<Link>> {
    let connection = open_connection(&paths.db_path)?;
    connection
        .query_row(
            "SELECT link_id, url, text FROM links WHERE url = ?1 ORDER BY link_id ASC LIMIT 1",
            params![url],
            |row| {
                Ok(Link {
                    link_id: row.get(0)?,
                    url: row.get(1)?,
                    text: row.get(2)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to look up link by url {url}"))
}

/// Every link with its assigned-page count, busiest links first.
pub fn list_links(paths: &ResolvedPaths) -> Result<Vec<LinkSummary>> {
    let connection = open_connection(&paths.db_path)?;
    let mut statement = connection
        .prepare(
            "SELECT links.link_id, links.url, links.text, COUNT(assignments.link_id) AS page_count
             FROM links
             LEFT JOIN assignments ON assignments.link_id = links.link_id
             GROUP BY links.link_id
             ORDER BY page_count DESC, links.url ASC",
        )
        .context("failed to prepare link list query")?;
    let rows = statement
        .query_map([], |row| {
            let link_id: i64 = row.get(0)?;
            let url: String = row.get(1)?;
            let text: String = row.get(2)?;
            let page_count: i64 = row.get(3)?;
            Ok((link_id, url, text, page_count))
        })
        .context("failed to run link list query")?;

    let mut out = Vec::new();
    for row in rows {
        let (link_id, url, text, page_count) = row.context("failed to decode link list row")?;
        out.push(LinkSummary {
            link_id,
            url,
            text,
            page_count: usize::try_from(page_count).context("page count does not fit usize")?,
        });
    }
    Ok(out)
}

/// Delete a link with its rules and assignments in one transaction, rules
/// first. Released page ids come back so the caller can purge those pages.
pub fn delete_link(paths: &ResolvedPaths, link_id: i64) -> Result<LinkDeleteReport> {
    let mut connection = open_connection(&paths.db_path)?;
    let link = get_link_for_connection(&connection, link_id)?
        .with_context(|| format!("link {link_id} not found"))?;
    let rules = rules_for_link_for_connection(&connection, link_id)?;

    let transaction = connection
        .transaction()
        .context("failed to start link delete transaction")?;
    for rule in &rules {
        let action = if rule.matcher.is_page() {
            AuditAction::PageRuleDelete
        } else {
            AuditAction::CategoryRuleDelete
        };
        audit::record(
            &transaction,
            action,
            Some(link_id),
            &json!({ "rule_id": rule.rule_id, "priority": rule.priority }),
        )?;
    }
    let rules_deleted = transaction
        .execute("DELETE FROM rules WHERE link_id = ?1", params![link_id])
        .context("failed to delete link rules")?;

    let mut released_page_ids = Vec::new();
    {
        let mut statement = transaction
            .prepare("SELECT page_id FROM assignments WHERE link_id = ?1 ORDER BY page_id ASC")
            .context("failed to prepare released assignments query")?;
        let rows = statement
            .query_map(params![link_id], |row| row.get::<_, i64>(0))
            .context("failed to run released assignments query")?;
        for row in rows {
            released_page_ids.push(row.context("failed to decode released page id")?);
        }
    }
    let assignments_released = transaction
        .execute(
            "DELETE FROM assignments WHERE link_id = ?1",
            params![link_id],
        )
        .context("failed to delete link assignments")?;

    audit::record(
        &transaction,
        AuditAction::LinkDelete,
        Some(link_id),
        &json!({ "url": link.url, "assignments_released": assignments_released }),
    )?;
    transaction
        .execute("DELETE FROM links WHERE link_id = ?1", params![link_id])
        .context("failed to delete link")?;
    transaction
        .commit()
        .context("failed to commit link delete transaction")?;

    Ok(LinkDeleteReport {
        link_id,
        url: link.url,
        rules_deleted,
        assignments_released,
        released_page_ids,
    })
}

// ---------------------------------------------------------------------------
// Rules

#[derive(Debug, Clone, Serialize)]
pub struct RuleReport {
    pub rule_id: i64,
    pub link_id: i64,
    pub fallback: bool,
    pub priority: i64,
    pub kind: String,
    pub page_id: Option<i64>,
    pub content_area: Option<String>,
    pub categories: Vec<String>,
    pub link_url: Option<String>,
    pub link_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageRuleEntry {
    pub rule_id: i64,
    pub page_id: i64,
    pub page_title: Option<String>,
    pub fallback: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryRuleEntry {
    pub rule_id: i64,
    pub fallback: bool,
    pub priority: i64,
    pub content_area: Option<String>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkRulesReport {
    pub link_id: i64,
    pub page_rules: Vec<PageRuleEntry>,
    pub category_rules: Vec<CategoryRuleEntry>,
}

fn rule_from_parts(
    rule_id: i64,
    link_id: i64,
    fallback: i64,
    page_id: Option<i64>,
    content_area: Option<String>,
    categories: [Option<String>; 4],
    priority: i64,
) -> Rule {
    let matcher = match page_id {
        Some(page_id) => RuleMatch::Page { page_id },
        None => RuleMatch::Categories {
            content_area,
            categories: categories.into_iter().flatten().collect(),
        },
    };
    Rule {
        rule_id,
        link_id,
        fallback: fallback != 0,
        priority,
        matcher,
    }
}

fn insert_rule(
    connection: &Connection,
    link_id: i64,
    fallback: bool,
    matcher: &RuleMatch,
) -> Result<i64> {
    let priority = matcher.priority();
    let (page_id, content_area, categories) = match matcher {
        RuleMatch::Page { page_id } => (Some(*page_id), None, Vec::new()),
        RuleMatch::Categories {
            content_area,
            categories,
        } => (None, content_area.clone(), categories.clone()),
    };
    let category = |index: usize| categories.get(index).cloned();
    connection
        .execute(
            "INSERT INTO rules (
                link_id,
                fallback,
                page_id,
                content_area,
                category_1,
                category_2,
                category_3,
                category_4,
                priority,
                created_at_unix
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                link_id,
                if fallback { 1i64 } else { 0i64 },
                page_id,
                content_area,
                category(0),
                category(1),
                category(2),
                category(3),
                priority,
                now_i64()?,
            ],
        )
        .context("failed to insert rule")?;
    Ok(connection.last_insert_rowid())
}

/// Create an exact-page rule. The page reference (id or title) must exist
/// in the synced mirror and must not carry an excluded article type.
pub fn create_page_rule(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    link_id: i64,
    page_ref: &str,
    fallback: bool,
) -> Result<Rule> {
    let mut connection = open_connection(&paths.db_path)?;
    ensure_link_exists(&connection, link_id)?;

    let trimmed = page_ref.trim();
    let page = if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        let page_id = trimmed
            .parse::<i64>()
            .with_context(|| format!("page id does not parse: {trimmed}"))?;
        find_page_by_id(&connection, page_id)?
    } else {
        find_page_by_title(&connection, trimmed)?
    }
    .with_context(|| {
        format!(
            "page not found in the local mirror: {trimmed}\nRun `linkplacer sync` if the wiki has it."
        )
    })?;
    if let Some(article_type) = &page.article_type
        && config
            .excluded_article_types()
            .iter()
            .any(|excluded| excluded == article_type)
    {
        bail!(
            "page {} has excluded article type {article_type}; no links are placed on it",
            page.title
        );
    }

    let matcher = RuleMatch::classify(Some(page.page_id), None, &[])?;
    let transaction = connection
        .transaction()
        .context("failed to start rule create transaction")?;
    let rule_id = insert_rule(&transaction, link_id, fallback, &matcher)?;
    audit::record(
        &transaction,
        AuditAction::PageRuleAdd,
        Some(link_id),
        &json!({ "rule_id": rule_id, "page_id": page.page_id, "page_title": page.title }),
    )?;
    transaction
        .commit()
        .context("failed to commit rule create transaction")?;

    Ok(Rule {
        rule_id,
        link_id,
        fallback,
        priority: matcher.priority(),
        matcher,
    })
}

/// Create a category/content-area rule. Referenced names must resolve
/// against the synced mirror (or the configured content-area list).
pub fn create_category_rule(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    link_id: i64,
    content_area: Option<&str>,
    categories: &[String],
    fallback: bool,
) -> Result<Rule> {
    let mut connection = open_connection(&paths.db_path)?;
    ensure_link_exists(&connection, link_id)?;

    let matcher = RuleMatch::classify(None, content_area, categories)?;
    let RuleMatch::Categories {
        content_area: normalized_area,
        categories: normalized_categories,
    } = &matcher
    else {
        bail!("category rule classification produced a page rule");
    };

    if let Some(area) = normalized_area
        && !is_valid_content_area(&connection, config, area)?
    {
        bail!("not a valid content area: {area}");
    }
    for category in normalized_categories {
        if !category_exists(&connection, category)? {
            bail!(
                "category not found in the local mirror: {category}\nRun `linkplacer sync` if the wiki has it."
            );
        }
    }

    let transaction = connection
        .transaction()
        .context("failed to start rule create transaction")?;
    let rule_id = insert_rule(&transaction, link_id, fallback, &matcher)?;
    audit::record(
        &transaction,
        AuditAction::CategoryRuleAdd,
        Some(link_id),
        &json!({
            "rule_id": rule_id,
            "content_area": normalized_area,
            "categories": normalized_categories,
            "fallback": fallback,
        }),
    )?;
    transaction
        .commit()
        .context("failed to commit rule create transaction")?;

    Ok(Rule {
        rule_id,
        link_id,
        fallback,
        priority: matcher.priority(),
        matcher,
    })
}

pub fn get_rule(paths: &ResolvedPaths, rule_id: i64) -> Result<Option<Rule>> {
    let connection = open_connection(&paths.db_path)?;
    get_rule_for_connection(&connection, rule_id)
}

fn get_rule_for_connection(connection: &Connection, rule_id: i64) -> Result<Option<Rule>> {
    connection
        .query_row(
            "SELECT rule_id, link_id, fallback, page_id, content_area,
                    category_1, category_2, category_3, category_4, priority
             FROM rules WHERE rule_id = ?1",
            params![rule_id],
            |row| {
                Ok(rule_from_parts(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    [row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?],
                    row.get(9)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("failed to load rule {rule_id}"))
}

/// Delete one rule and return it for reporting.
pub fn delete_rule(paths: &ResolvedPaths, rule_id: i64) -> Result<Rule> {
    let mut connection = open_connection(&paths.db_path)?;
    let rule = get_rule_for_connection(&connection, rule_id)?
        .with_context(|| format!("rule {rule_id} not found"))?;

    let transaction = connection
        .transaction()
        .context("failed to start rule delete transaction")?;
    transaction
        .execute(
            "DELETE FROM rules WHERE rule_id = ?1 AND link_id = ?2",
            params![rule.rule_id, rule.link_id],
        )
        .context("failed to delete rule")?;
    let action = if rule.matcher.is_page() {
        AuditAction::PageRuleDelete
    } else {
        AuditAction::CategoryRuleDelete
    };
    audit::record(
        &transaction,
        action,
        Some(rule.link_id),
        &json!({ "rule_id": rule.rule_id, "priority": rule.priority }),
    )?;
    transaction
        .commit()
        .context("failed to commit rule delete transaction")?;

    Ok(rule)
}

fn rules_for_link_for_connection(connection: &Connection, link_id: i64) -> Result<Vec<Rule>> {
    let mut statement = connection
        .prepare(
            "SELECT rule_id, link_id, fallback, page_id, content_area,
                    category_1, category_2, category_3, category_4, priority
             FROM rules WHERE link_id = ?1 ORDER BY rule_id ASC",
        )
        .context("failed to prepare link rules query")?;
    let rows = statement
        .query_map(params![link_id], |row| {
            Ok(rule_from_parts(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                [row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?],
                row.get(9)?,
            ))
        })
        .context("failed to run link rules query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode link rule row")?);
    }
    Ok(out)
}

/// All rules with denormalized link URL/text: page rules first ordered by
/// page id, then category rules strongest first.
pub fn list_rules(paths: &ResolvedPaths) -> Result<Vec<RuleReport>> {
    let connection = open_connection(&paths.db_path)?;
    let mut statement = connection
        .prepare(
            "SELECT rules.rule_id, rules.link_id, rules.fallback, rules.page_id,
                    rules.content_area, rules.category_1, rules.category_2,
                    rules.category_3, rules.category_4, rules.priority,
                    links.url, links.text
             FROM rules
             LEFT JOIN links ON links.link_id = rules.link_id
             ORDER BY rules.page_id IS NULL, rules.page_id ASC,
                      rules.priority DESC, rules.rule_id ASC",
        )
        .context("failed to prepare rule list query")?;
    let rows = statement
        .query_map([], |row| {
            let rule = rule_from_parts(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                [row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?],
                row.get(9)?,
            );
            let link_url: Option<String> = row.get(10)?;
            let link_text: Option<String> = row.get(11)?;
            Ok((rule, link_url, link_text))
        })
        .context("failed to run rule list query")?;

    let mut out = Vec::new();
    for row in rows {
        let (rule, link_url, link_text) = row.context("failed to decode rule list row")?;
        let (page_id, content_area, categories) = match &rule.matcher {
            RuleMatch::Page { page_id } => (Some(*page_id), None, Vec::new()),
            RuleMatch::Categories {
                content_area,
                categories,
            } => (None, content_area.clone(), categories.clone()),
        };
        out.push(RuleReport {
            rule_id: rule.rule_id,
            link_id: rule.link_id,
            fallback: rule.fallback,
            priority: rule.priority,
            kind: rule.matcher.kind().to_string(),
            page_id,
            content_area,
            categories,
            link_url,
            link_text,
        });
    }
    Ok(out)
}

/// One link's rules split by kind: page rules ordered by page title, category
/// rules strongest first.
pub fn rules_for_link(paths: &ResolvedPaths, link_id: i64) -> Result<LinkRulesReport> {
    let connection = open_connection(&paths.db_path)?;
    ensure_link_exists(&connection, link_id)?;

    let mut page_statement = connection
        .prepare(
            "SELECT rules.rule_id, rules.page_id, pages.title, rules.fallback, rules.priority
             FROM rules
             LEFT JOIN pages ON pages.page_id = rules.page_id
             WHERE rules.link_id = ?1 AND rules.page_id IS NOT NULL
             ORDER BY pages.title ASC",
        )
        .context("failed to prepare page rules query")?;
    let page_rows = page_statement
        .query_map(params![link_id], |row| {
            let fallback: i64 = row.get(3)?;
            Ok(PageRuleEntry {
                rule_id: row.get(0)?,
                page_id: row.get(1)?,
                page_title: row.get(2)?,
                fallback: fallback != 0,
                priority: row.get(4)?,
            })
        })
        .context("failed to run page rules query")?;
    let mut page_rules = Vec::new();
    for row in page_rows {
        page_rules.push(row.context("failed to decode page rule row")?);
    }

    let mut category_statement = connection
        .prepare(
            "SELECT rule_id, fallback, priority, content_area,
                    category_1, category_2, category_3, category_4
             FROM rules
             WHERE link_id = ?1
               AND (content_area IS NOT NULL OR category_1 IS NOT NULL)
             ORDER BY priority DESC, fallback ASC, content_area ASC,
                      category_1 ASC, category_2 ASC, category_3 ASC, category_4 ASC",
        )
        .context("failed to prepare category rules query")?;
    let category_rows = category_statement
        .query_map(params![link_id], |row| {
            let fallback: i64 = row.get(1)?;
            let categories: [Option<String>; 4] =
                [row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?];
            Ok(CategoryRuleEntry {
                rule_id: row.get(0)?,
                fallback: fallback != 0,
                priority: row.get(2)?,
                content_area: row.get(3)?,
                categories: categories.into_iter().flatten().collect(),
            })
        })
        .context("failed to run category rules query")?;
    let mut category_rules = Vec::new();
    for row in category_rows {
        category_rules.push(row.context("failed to decode category rule row")?);
    }

    Ok(LinkRulesReport {
        link_id,
        page_rules,
        category_rules,
    })
}

fn ensure_link_exists(connection: &Connection, link_id: i64) -> Result<()> {
    if get_link_for_connection(connection, link_id)?.is_none() {
        bail!("link {link_id} not found");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Assignments and mirror reads

#[derive(Debug, Clone, Serialize)]
pub struct PageAssignment {
    pub page_id: i64,
    pub page_title: String,
    pub link_id: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct PageRow {
    pub page_id: i64,
    pub title: String,
    pub article_type: Option<String>,
}

/// Current assignments joined with mirrored page titles, ordered by title.
/// Optionally restricted to one link.
pub fn page_assignments(
    paths: &ResolvedPaths,
    link_filter: Option<i64>,
) -> Result<Vec<PageAssignment>> {
    let connection = open_connection(&paths.db_path)?;
    let mut statement = connection
        .prepare(
            "SELECT assignments.page_id, pages.title, assignments.link_id
             FROM assignments
             INNER JOIN pages ON pages.page_id = assignments.page_id
             WHERE ?1 IS NULL OR assignments.link_id = ?1
             ORDER BY pages.title ASC",
        )
        .context("failed to prepare assignments query")?;
    let rows = statement
        .query_map(params![link_filter], |row| {
            Ok(PageAssignment {
                page_id: row.get(0)?,
                page_title: row.get(1)?,
                link_id: row.get(2)?,
            })
        })
        .context("failed to run assignments query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode assignment row")?);
    }
    Ok(out)
}

/// Links currently assigned to one page.
pub fn links_for_page(paths: &ResolvedPaths, page_ref: &str) -> Result<Vec<Link>> {
    let connection = open_connection(&paths.db_path)?;
    let page_id = resolve_page_ref(&connection, page_ref)?;
    links_for_page_id(&connection, page_id)
}

pub(crate) fn links_for_page_id(connection: &Connection, page_id: i64) -> Result<Vec<Link>> {
    let mut statement = connection
        .prepare(
            "SELECT links.link_id, links.url, links.text
             FROM assignments
             INNER JOIN links ON links.link_id = assignments.link_id
             WHERE assignments.page_id = ?1
             ORDER BY links.link_id ASC",
        )
        .context("failed to prepare page links query")?;
    let rows = statement
        .query_map(params![page_id], |row| {
            Ok(Link {
                link_id: row.get(0)?,
                url: row.get(1)?,
                text: row.get(2)?,
            })
        })
        .context("failed to run page links query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode page link row")?);
    }
    Ok(out)
}

/// Resolve a CLI page reference: a bare number is a page id, anything else a
/// mirrored title.
pub(crate) fn resolve_page_ref(connection: &Connection, page_ref: &str) -> Result<i64> {
    let trimmed = page_ref.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed
            .parse::<i64>()
            .with_context(|| format!("page id does not parse: {trimmed}"));
    }
    let page = find_page_by_title(connection, trimmed)?
        .with_context(|| format!("page not found in the local mirror: {trimmed}"))?;
    Ok(page.page_id)
}

pub(crate) fn find_page_by_id(connection: &Connection, page_id: i64) -> Result<Option<PageRow>> {
    connection
        .query_row(
            "SELECT page_id, title, article_type FROM pages WHERE page_id = ?1",
            params![page_id],
            |row| {
                Ok(PageRow {
                    page_id: row.get(0)?,
                    title: row.get(1)?,
                    article_type: row.get(2)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to look up page {page_id}"))
}

pub(crate) fn find_page_by_title(connection: &Connection, title: &str) -> Result<Option<PageRow>> {
    let normalized = title.trim().replace('_', " ");
    connection
        .query_row(
            "SELECT page_id, title, article_type FROM pages WHERE title = ?1",
            params![normalized],
            |row| {
                Ok(PageRow {
                    page_id: row.get(0)?,
                    title: row.get(1)?,
                    article_type: row.get(2)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to look up page {normalized}"))
}

/// Content areas in active use on the mirror, sorted.
pub(crate) fn known_content_areas(connection: &Connection) -> Result<Vec<String>> {
    let mut statement = connection
        .prepare(
            "SELECT DISTINCT content_area FROM pages
             WHERE content_area IS NOT NULL AND content_area <> ''
             ORDER BY content_area ASC",
        )
        .context("failed to prepare content area list query")?;
    let rows = statement
        .query_map([], |row| row.get::<_, String>(0))
        .context("failed to run content area list query")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode content area row")?);
    }
    Ok(out)
}

pub(crate) fn category_exists(connection: &Connection, category: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM page_categories WHERE category = ?1)",
            params![category],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check category {category}"))?;
    Ok(exists == 1)
}

/// A content area passes when the configured list names it; with no list
/// configured, any area or category in active use on the mirror passes.
pub(crate) fn is_valid_content_area(
    connection: &Connection,
    config: &ToolConfig,
    content_area: &str,
) -> Result<bool> {
    let configured = config.valid_content_areas();
    if !configured.is_empty() {
        return Ok(configured
            .iter()
            .filter_map(|area| normalize_category_name(area))
            .any(|area| area == content_area));
    }
    let in_use = known_content_areas(connection)?
        .iter()
        .filter_map(|area| normalize_category_name(area))
        .any(|area| area == content_area);
    if in_use {
        return Ok(true);
    }
    category_exists(connection, content_area)
}

/// Page ids whose mirrored article type is excluded by config.
pub(crate) fn excluded_page_ids(
    connection: &Connection,
    excluded_article_types: &[String],
) -> Result<HashSet<i64>> {
    let mut out = HashSet::new();
    if excluded_article_types.is_empty() {
        return Ok(out);
    }
    let mut statement = connection
        .prepare("SELECT page_id, article_type FROM pages WHERE article_type IS NOT NULL")
        .context("failed to prepare excluded pages query")?;
    let rows = statement
        .query_map([], |row| {
            let page_id: i64 = row.get(0)?;
            let article_type: String = row.get(1)?;
            Ok((page_id, article_type))
        })
        .context("failed to run excluded pages query")?;
    for row in rows {
        let (page_id, article_type) = row.context("failed to decode excluded page row")?;
        if excluded_article_types.contains(&article_type) {
            out.insert(page_id);
        }
    }
    Ok(out)
}

pub(crate) fn meta_get(connection: &Connection, key: &str) -> Result<Option<String>> {
    connection
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read meta key {key}"))
}

pub(crate) fn meta_set(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to write meta key {key}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stats

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub links: usize,
    pub page_rules: usize,
    pub category_rules: usize,
    pub fallback_rules: usize,
    pub assignments: usize,
    pub assigned_pages: usize,
    pub pages_at_cap: usize,
    pub mirrored_pages: usize,
    pub mirrored_category_memberships: usize,
    pub content_areas_in_use: usize,
}

pub fn stats(paths: &ResolvedPaths) -> Result<StoreStats> {
    let connection = open_connection(&paths.db_path)?;
    Ok(StoreStats {
        links: count_query(&connection, "SELECT COUNT(*) FROM links")?,
        page_rules: count_query(
            &connection,
            "SELECT COUNT(*) FROM rules WHERE page_id IS NOT NULL",
        )?,
        category_rules: count_query(
            &connection,
            "SELECT COUNT(*) FROM rules WHERE page_id IS NULL",
        )?,
        fallback_rules: count_query(&connection, "SELECT COUNT(*) FROM rules WHERE fallback = 1")?,
        assignments: count_query(&connection, "SELECT COUNT(*) FROM assignments")?,
        assigned_pages: count_query(
            &connection,
            "SELECT COUNT(DISTINCT page_id) FROM assignments",
        )?,
        pages_at_cap: count_query(
            &connection,
            "SELECT COUNT(*) FROM (
                 SELECT page_id FROM assignments GROUP BY page_id HAVING COUNT(*) >= 2
             )",
        )?,
        mirrored_pages: count_query(&connection, "SELECT COUNT(*) FROM pages")?,
        mirrored_category_memberships: count_query(
            &connection,
            "SELECT COUNT(*) FROM page_categories",
        )?,
        content_areas_in_use: count_query(
            &connection,
            "SELECT COUNT(DISTINCT content_area) FROM pages WHERE content_area IS NOT NULL",
        )?,
    })
}

pub(crate) fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

pub(crate) fn ensure_db_parent(paths: &ResolvedPaths) -> Result<()> {
    let parent = paths
        .db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", paths.db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;

    use rusqlite::{Connection, params};
    use tempfile::{TempDir, tempdir};

    use crate::runtime::{ResolvedPaths, ValueSource};

    pub(crate) fn test_paths() -> (TempDir, ResolvedPaths) {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        fs::create_dir_all(project_root.join(".linkplacer/data")).expect("create data dir");
        let paths = ResolvedPaths {
            db_path: project_root.join(".linkplacer/data/linkplacer.db"),
            state_dir: project_root.join(".linkplacer"),
            data_dir: project_root.join(".linkplacer/data"),
            snapshots_dir: project_root.join(".linkplacer/snapshots"),
            config_path: project_root.join(".linkplacer/config.toml"),
            project_root,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        };
        (temp, paths)
    }

    pub(crate) fn seed_page(
        connection: &Connection,
        page_id: i64,
        title: &str,
        content_area: Option<&str>,
        article_type: Option<&str>,
    ) {
        connection
            .execute(
                "INSERT INTO pages (page_id, title, content_area, article_type)
                 VALUES (?1, ?2, ?3, ?4)",
                params![page_id, title, content_area, article_type],
            )
            .expect("seed page");
    }

    pub(crate) fn seed_category(connection: &Connection, page_id: i64, category: &str) {
        connection
            .execute(
                "INSERT OR IGNORE INTO page_categories (page_id, category) VALUES (?1, ?2)",
                params![page_id, category],
            )
            .expect("seed category");
    }
}
