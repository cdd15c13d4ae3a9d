use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::runtime::ResolvedPaths;
use crate::store::{ensure_db_parent, open_connection, unix_timestamp};

/// Ordered schema history. Entries are append-only; a shipped version's SQL
/// never changes.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

/// Bring the database at `paths.db_path` up to the latest schema version,
/// creating the file and its parent directories on first run. Every pending
/// migration commits in its own transaction together with its ledger row, so
/// an interrupted run leaves the database at the last fully applied version.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(paths)?;
    let mut connection = open_connection(&paths.db_path)?;
    ensure_ledger(&connection)?;

    let from_version = ledger_version(&connection)?;
    let mut applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| m.version > from_version) {
        apply_one(&mut connection, migration)?;
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    Ok(MigrateReport {
        current_version: ledger_version(&connection)?,
        applied,
    })
}

/// Migrations not yet recorded in the ledger. A missing database counts
/// every known migration as pending.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    let on_disk = disk_version(paths)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > on_disk).count())
}

/// Highest applied migration version, 0 when the database file does not
/// exist yet.
pub fn schema_version(paths: &ResolvedPaths) -> Result<u32> {
    disk_version(paths)
}

// Never creates the database file; status paths must stay read-only.
fn disk_version(paths: &ResolvedPaths) -> Result<u32> {
    if !paths.db_path.exists() {
        return Ok(0);
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_ledger(&connection)?;
    ledger_version(&connection)
}

fn ensure_ledger(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 version INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at_unix INTEGER NOT NULL
             )",
        )
        .context("failed to create schema_migrations ledger")
}

fn ledger_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read schema_migrations ledger")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

fn apply_one(connection: &mut Connection, migration: &Migration) -> Result<()> {
    let tag = format!("v{:03}_{}", migration.version, migration.name);
    let applied_at =
        i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;
    let transaction = connection
        .transaction()
        .with_context(|| format!("failed to start transaction for {tag}"))?;
    transaction
        .execute_batch(migration.sql)
        .with_context(|| format!("migration {tag} failed"))?;
    transaction
        .execute(
            "INSERT INTO schema_migrations (version, name, applied_at_unix)
             VALUES (?1, ?2, ?3)",
            params![i64::from(migration.version), migration.name, applied_at],
        )
        .with_context(|| format!("failed to record {tag} in the ledger"))?;
    transaction
        .commit()
        .with_context(|| format!("failed to commit migration {tag}"))
}

#[cfg(test)]
mod tests {
    use crate::store::test_support::test_paths;

    use super::*;

    #[test]
    fn fresh_database_migrates_to_latest() {
        let (_temp, paths) = test_paths();
        assert_eq!(schema_version(&paths).expect("version"), 0);
        assert_eq!(
            pending_migration_count(&paths).expect("pending"),
            MIGRATIONS.len()
        );

        let report = run_migrations(&paths).expect("migrate");
        let names: Vec<&str> = report.applied.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["baseline", "indexes"]);
        assert_eq!(report.current_version, 2);
        assert_eq!(schema_version(&paths).expect("version"), 2);
    }

    #[test]
    fn second_run_applies_nothing() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("first run");

        let second = run_migrations(&paths).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, 2);
        assert_eq!(pending_migration_count(&paths).expect("pending"), 0);
    }
}
