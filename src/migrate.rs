use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index the pipeline uses. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Keyed store: one row per image, last write wins
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            image_id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            object_key TEXT NOT NULL,
            fields_json TEXT NOT NULL DEFAULT '{}',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            extracted_at TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Search index documents, keyed by image id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            image_id TEXT PRIMARY KEY,
            fields_json TEXT NOT NULL DEFAULT '{}',
            ocr_text TEXT NOT NULL,
            source_updated_at TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Consumer group offsets
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            consumer_group TEXT NOT NULL,
            stream TEXT NOT NULL,
            part INTEGER NOT NULL,
            next_offset INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (consumer_group, stream, part)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_heads (
            stream TEXT NOT NULL,
            part INTEGER NOT NULL,
            next_offset INTEGER NOT NULL,
            PRIMARY KEY (stream, part)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_records (
            stream TEXT NOT NULL,
            part INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            record_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            appended_at INTEGER NOT NULL,
            PRIMARY KEY (stream, part, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            consumer_group TEXT NOT NULL,
            stream TEXT NOT NULL,
            part INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            image_id TEXT,
            reason TEXT NOT NULL,
            payload TEXT NOT NULL,
            failed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                image_id UNINDEXED,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stream_records_appended_at ON stream_records(stream, appended_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters(failed_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("data/bizcard.sqlite"))
            .await
            .unwrap();
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'documents_fts_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            tables,
            vec![
                "checkpoints",
                "dead_letters",
                "documents",
                "documents_fts",
                "records",
                "stream_heads",
                "stream_records"
            ]
        );
    }
}
