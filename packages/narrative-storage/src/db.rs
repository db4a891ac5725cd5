//! Connection setup and schema management.
//!
//! Startup brings the schema into a known state: base tables are created if
//! absent, then a fixed list of additive column patches is applied to bring
//! older databases up to date. Patches only ever add columns; there is no
//! rename or drop path, per the persistence layer's non-destructive-evolution
//! contract.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::{Result, StorageError};

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

/// Connects to (creating if necessary) the SQLite database at `database_url`
/// and brings the schema up to date. `max_connections` should be sized to the
/// largest `max_workers` the pipeline runner will use plus headroom for the
/// orchestrator's own single-chapter operations — unlike a desktop app, this
/// engine runs many chapters concurrently, each owning its own session.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Database> {
    let options = SqliteConnectOptions::new()
        .filename(database_url)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(15))
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    ensure_schema(&pool).await?;

    Ok(Database { pool })
}

async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    create_base_tables(pool).await?;
    apply_column_patches(pool).await?;
    Ok(())
}

async fn create_base_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON;").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL UNIQUE,
            author TEXT,
            genre TEXT,
            plot_tags TEXT NOT NULL DEFAULT '[]',
            description TEXT,
            planning_text TEXT,
            world_building_raw TEXT,
            outline_raw TEXT,
            stage TEXT NOT NULL DEFAULT 'created',
            current_step INTEGER NOT NULL DEFAULT 0,
            spoiler_global_config TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS volumes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            "order" INTEGER NOT NULL,
            description TEXT,
            config TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chapters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            volume_id INTEGER NOT NULL REFERENCES volumes(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            "order" INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            summary TEXT,
            detail_outline TEXT,
            word_count INTEGER NOT NULL DEFAULT 0,
            key_events TEXT NOT NULL DEFAULT '[]',
            characters_involved TEXT NOT NULL DEFAULT '[]',
            quality_report TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS characters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            archetype TEXT,
            background TEXT,
            personality_traits TEXT NOT NULL DEFAULT '{}',
            relationships TEXT NOT NULL DEFAULT '{}',
            memories TEXT NOT NULL DEFAULT '[]',
            lorebook_keywords TEXT NOT NULL DEFAULT '[]',
            current_mood TEXT,
            current_status TEXT,
            goals TEXT NOT NULL DEFAULT '[]',
            catchphrases TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(project_id, name)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS world_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            properties TEXT NOT NULL DEFAULT '{}',
            lorebook_keywords TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(project_id, name)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plot_arcs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'planted',
            planted_chapter INTEGER,
            resolved_chapter INTEGER,
            related_characters TEXT NOT NULL DEFAULT '[]',
            related_keywords TEXT NOT NULL DEFAULT '[]',
            importance TEXT NOT NULL DEFAULT 'medium',
            embedding TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS style_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            source_text TEXT NOT NULL DEFAULT '',
            features TEXT NOT NULL DEFAULT '{}',
            style_guide TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    info!("base schema ensured");
    Ok(())
}

/// A column this schema has ever gained after its initial release. Applying
/// these is idempotent and safe to run on every startup.
struct ColumnPatch {
    table: &'static str,
    column: &'static str,
    def: &'static str,
}

const COLUMN_PATCHES: &[ColumnPatch] = &[
    ColumnPatch {
        table: "projects",
        column: "spoiler_global_config",
        def: "TEXT",
    },
    ColumnPatch {
        table: "chapters",
        column: "quality_report",
        def: "TEXT",
    },
    ColumnPatch {
        table: "plot_arcs",
        column: "embedding",
        def: "TEXT",
    },
];

async fn apply_column_patches(pool: &SqlitePool) -> Result<()> {
    for patch in COLUMN_PATCHES {
        ensure_column(pool, patch.table, patch.column, patch.def)
            .await
            .map_err(|e| {
                warn!(table = patch.table, column = patch.column, error = %e, "startup column patch failed");
                e
            })?;
    }
    Ok(())
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let row = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
        .bind(table)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let query = format!("SELECT name FROM pragma_table_info('{table}') WHERE name = ?");
    let row = sqlx::query(&query)
        .bind(column)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, col_def: &str) -> Result<()> {
    if !table_exists(pool, table).await? {
        return Err(StorageError::constraint(format!(
            "cannot patch column {column} onto missing table {table}"
        )));
    }
    if column_exists(pool, table, column).await? {
        return Ok(());
    }
    let stmt = format!("ALTER TABLE {table} ADD COLUMN {column} {col_def}");
    sqlx::query(&stmt).execute(pool).await?;
    info!(table, column, "added column");
    Ok(())
}

/// Helper for reading a single scalar count, used by a few named queries.
pub(crate) async fn scalar_i64(pool: &SqlitePool, query: &str) -> Result<i64> {
    let row = sqlx::query(query).fetch_one(pool).await?;
    Ok(row.try_get::<i64, _>(0)?)
}
