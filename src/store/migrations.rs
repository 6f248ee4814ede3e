//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "audit_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
                message_id TEXT PRIMARY KEY,
                account TEXT NOT NULL,
                folder TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                classification TEXT,
                category TEXT,
                priority TEXT,
                classification_status TEXT NOT NULL,
                actions_applied TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_processed_at ON audit_entries(processed_at);
            CREATE INDEX IF NOT EXISTS idx_audit_account_status ON audit_entries(account, status);

            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_events_message ON audit_events(message_id);

            CREATE TABLE IF NOT EXISTS watermarks (
                account TEXT NOT NULL,
                folder TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account, folder)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "action_items",
        sql: r#"
            CREATE TABLE IF NOT EXISTS action_items (
                id TEXT PRIMARY KEY,
                source_message_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                due_hint TEXT,
                priority TEXT NOT NULL DEFAULT 'normal',
                confidence REAL NOT NULL DEFAULT 1.0,
                relevance TEXT NOT NULL DEFAULT 'direct',
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_action_items_message ON action_items(source_message_id);
            CREATE INDEX IF NOT EXISTS idx_action_items_status ON action_items(status);
        "#,
    },
    Migration {
        version: 3,
        name: "digests_and_drafts",
        sql: r#"
            CREATE TABLE IF NOT EXISTS digests (
                id TEXT PRIMARY KEY,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                included_message_ids TEXT NOT NULL DEFAULT '[]',
                summary_text TEXT NOT NULL,
                content TEXT NOT NULL,
                format TEXT NOT NULL,
                delivery_results TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_digests_created ON digests(created_at);

            CREATE TABLE IF NOT EXISTS drafts (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                account TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_drafts_status ON drafts(status);
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
