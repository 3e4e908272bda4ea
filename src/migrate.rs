use anyhow::Result;
use sqlx::SqlitePool;

/// Create the registry tables that describe every scope table and index.
///
/// Scope tables themselves are created on demand by
/// [`SqliteVectorStore::create_empty_table`](crate::sqlite_store::SqliteVectorStore).
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per scope: its physical table and vector width.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_tables (
            scope TEXT PRIMARY KEY,
            table_name TEXT NOT NULL UNIQUE,
            dimensions INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_indexes (
            scope TEXT NOT NULL,
            column_name TEXT NOT NULL,
            metric TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (scope, column_name),
            FOREIGN KEY (scope) REFERENCES rag_tables(scope)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
