use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Safe to run on an existing database.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Connector kinds discovered at startup
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connector_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            config_fields TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Configured connector instances
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connector_instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type_id INTEGER NOT NULL,
            config TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_synced_at INTEGER,
            FOREIGN KEY (type_id) REFERENCES connector_types(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexing queue sink
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            data_source_id INTEGER NOT NULL,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            author TEXT,
            author_image_url TEXT,
            timestamp INTEGER NOT NULL,
            location TEXT NOT NULL,
            url TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            dedup_hash TEXT NOT NULL,
            indexed_at INTEGER NOT NULL,
            UNIQUE(data_source_id, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_instances_type_id ON connector_instances(type_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_timestamp ON documents(timestamp DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
