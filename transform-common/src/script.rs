//! User transformation scripts.
//!
//! The core only ever reads `code_text`, and only once per job: the
//! processor snapshots the source at dispatch so concurrent edits
//! cannot change a running job.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::queue::{QueueError, QueueResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Script {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub code_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Script {
    pub async fn fetch(pool: &PgPool, id: i64) -> QueueResult<Option<Script>> {
        sqlx::query_as("SELECT * FROM scripts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "SELECT".to_owned(),
                error,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "../migrations")]
    async fn test_fetch_returns_none_for_missing_script(pool: PgPool) {
        assert!(Script::fetch(&pool, 999).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_fetch_reads_code_text(pool: PgPool) {
        let (user_id,): (i64,) = sqlx::query_as(
            "INSERT INTO users (username, password_hash) VALUES ('tester', 'x') RETURNING id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        let (script_id,): (i64,) = sqlx::query_as(
            r#"
INSERT INTO scripts (user_id, name, code_text)
VALUES ($1, 'identity', 'return df')
RETURNING id
            "#,
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();

        let script = Script::fetch(&pool, script_id).await.unwrap().unwrap();
        assert_eq!(script.code_text, "return df");
        assert_eq!(script.name, "identity");
    }
}
