use sqlx::SqlitePool;

/// Create the kbsync schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_indexes (
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            path TEXT NOT NULL,
            similarity TEXT NOT NULL,
            candidate_count INTEGER NOT NULL,
            PRIMARY KEY (collection, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata_indexes (
            collection TEXT NOT NULL,
            field TEXT NOT NULL,
            PRIMARY KEY (collection, field)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunk ids are unique per collection, not globally.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
