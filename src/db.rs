//! Schema migration runner shared by `main` and the test suites.

use anyhow::Result;
use sqlx::SqlitePool;

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Run the embedded SQLite migration statement-by-statement.
///
/// Statements are idempotent (`IF NOT EXISTS` / `INSERT OR IGNORE`), so the
/// runner is safe to call on every start.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    /// Fresh in-memory database with the schema applied.
    ///
    /// A single connection keeps every handle on the same memory store.
    pub async fn memory_pool() -> Arc<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite");
        run_migrations(&pool).await.expect("apply migrations");
        Arc::new(pool)
    }
}
