use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::Value;

use crate::runtime::ResolvedPaths;
use crate::store;

pub const DEFAULT_LOG_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuditAction {
    LinkCreate,
    LinkEdit,
    LinkDelete,
    PageRuleAdd,
    CategoryRuleAdd,
    PageRuleDelete,
    CategoryRuleDelete,
    Sync,
    Rebuild,
}

impl AuditAction {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::LinkCreate => "link-create",
            Self::LinkEdit => "link-edit",
            Self::LinkDelete => "link-delete",
            Self::PageRuleAdd => "page-rule-add",
            Self::CategoryRuleAdd => "category-rule-add",
            Self::PageRuleDelete => "page-rule-delete",
            Self::CategoryRuleDelete => "category-rule-delete",
            Self::Sync => "sync",
            Self::Rebuild => "rebuild",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub entry_id: i64,
    pub action: String,
    pub link_id: Option<i64>,
    pub details: Value,
    pub logged_at_unix: i64,
}

/// Append one audit entry. Callers inside a transaction pass the transaction
/// connection so the entry commits or rolls back with the mutation it
/// describes.
pub(crate) fn record(
    connection: &Connection,
    action: AuditAction,
    link_id: Option<i64>,
    details: &Value,
) -> Result<()> {
    let logged_at = store::unix_timestamp()?;
    connection
        .execute(
            "INSERT INTO audit_log (action, link_id, details, logged_at_unix)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                action.as_str(),
                link_id,
                details.to_string(),
                i64::try_from(logged_at).context("timestamp does not fit into i64")?,
            ],
        )
        .with_context(|| format!("failed to record audit entry {}", action.as_str()))?;
    Ok(())
}

/// Newest-first audit entries, optionally restricted to one link.
pub fn recent_entries(
    paths: &ResolvedPaths,
    link_filter: Option<i64>,
    limit: usize,
) -> Result<Vec<AuditEntry>> {
    let connection = store::open_connection(&paths.db_path)?;
    let limit_i64 = i64::try_from(limit).context("log limit does not fit into i64")?;
    let mut statement = connection
        .prepare(
            "SELECT entry_id, action, link_id, details, logged_at_unix
             FROM audit_log
             WHERE ?1 IS NULL OR link_id = ?1
             ORDER BY entry_id DESC
             LIMIT ?2",
        )
        .context("failed to prepare audit log query")?;
    let rows = statement
        .query_map(params![link_filter, limit_i64], |row| {
            let entry_id: i64 = row.get(0)?;
            let action: String = row.get(1)?;
            let link_id: Option<i64> = row.get(2)?;
            let details: String = row.get(3)?;
            let logged_at_unix: i64 = row.get(4)?;
            Ok((entry_id, action, link_id, details, logged_at_unix))
        })
        .context("failed to run audit log query")?;

    let mut out = Vec::new();
    for row in rows {
        let (entry_id, action, link_id, details, logged_at_unix) =
            row.context("failed to decode audit log row")?;
        let details: Value = serde_json::from_str(&details)
            .with_context(|| format!("corrupt details JSON in audit entry {entry_id}"))?;
        out.push(AuditEntry {
            entry_id,
            action,
            link_id,
            details,
            logged_at_unix,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::migrate::run_migrations;
    use crate::store::test_support::test_paths;

    use super::*;

    #[test]
    fn entries_come_back_newest_first() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let connection = store::open_connection(&paths.db_path).expect("open");

        record(&connection, AuditAction::LinkCreate, Some(1), &json!({ "url": "https://a" }))
            .expect("record");
        record(&connection, AuditAction::PageRuleAdd, Some(1), &json!({ "page_id": 9 }))
            .expect("record");
        record(&connection, AuditAction::Rebuild, None, &json!({}))
            .expect("record");

        let entries = recent_entries(&paths, None, DEFAULT_LOG_LIMIT).expect("query");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].action, "rebuild");
        assert_eq!(entries[2].action, "link-create");
        assert_eq!(entries[2].details["url"], "https://a");
    }

    #[test]
    fn link_filter_restricts_entries() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let connection = store::open_connection(&paths.db_path).expect("open");

        record(&connection, AuditAction::LinkCreate, Some(1), &json!({})).expect("record");
        record(&connection, AuditAction::LinkCreate, Some(2), &json!({})).expect("record");
        record(&connection, AuditAction::Rebuild, None, &json!({})).expect("record");

        let entries = recent_entries(&paths, Some(2), DEFAULT_LOG_LIMIT).expect("query");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].link_id, Some(2));
    }

    #[test]
    fn limit_caps_returned_entries() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let connection = store::open_connection(&paths.db_path).expect("open");

        for index in 0..5 {
            record(
                &connection,
                AuditAction::LinkEdit,
                Some(index),
                &json!({ "step": index }),
            )
            .expect("record");
        }

        let entries = recent_entries(&paths, None, 2).expect("query");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].details["step"], 4);
    }
}
