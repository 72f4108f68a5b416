//! PostgreSQL relation store.

use super::traits::RelationStore;
use crate::connection::DbConfig;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use tally_core::{Domain, PairKey, StorageError, TallyResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id              BIGINT PRIMARY KEY,
    following_count BIGINT NOT NULL DEFAULT 0,
    follower_count  BIGINT NOT NULL DEFAULT 0,
    favorite_count  BIGINT NOT NULL DEFAULT 0,
    total_favorited BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS videos (
    id             BIGINT PRIMARY KEY,
    author_id      BIGINT NOT NULL,
    favorite_count BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_favorite_videos (
    user_id    BIGINT NOT NULL,
    video_id   BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (user_id, video_id)
);
CREATE INDEX IF NOT EXISTS idx_user_favorite_videos_video ON user_favorite_videos (video_id);

CREATE TABLE IF NOT EXISTS relations (
    user_id    BIGINT NOT NULL,
    to_user_id BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (user_id, to_user_id)
);
CREATE INDEX IF NOT EXISTS idx_relations_to_user ON relations (to_user_id);
"#;

/// Table and column names of a domain's relation rows.
struct RowTable {
    table: &'static str,
    actor: &'static str,
    target: &'static str,
}

fn row_table(domain: Domain) -> RowTable {
    match domain {
        Domain::Favorite => RowTable {
            table: "user_favorite_videos",
            actor: "user_id",
            target: "video_id",
        },
        Domain::Relation => RowTable {
            table: "relations",
            actor: "user_id",
            target: "to_user_id",
        },
    }
}

/// Counter updates that accompany a row mutation, as `(sql, binds_target)`.
/// `{op}` is replaced by `+` or `-`.
fn counter_statements(domain: Domain) -> &'static [(&'static str, bool)] {
    match domain {
        Domain::Favorite => &[
            ("UPDATE videos SET favorite_count = favorite_count {op} 1 WHERE id = $1", true),
            ("UPDATE users SET favorite_count = favorite_count {op} 1 WHERE id = $1", false),
            (
                "UPDATE users SET total_favorited = total_favorited {op} 1 \
                 WHERE id = (SELECT author_id FROM videos WHERE id = $1)",
                true,
            ),
        ],
        Domain::Relation => &[
            ("UPDATE users SET following_count = following_count {op} 1 WHERE id = $1", false),
            ("UPDATE users SET follower_count = follower_count {op} 1 WHERE id = $1", true),
        ],
    }
}

/// Relation store over a deadpool-postgres pool.
#[derive(Clone)]
pub struct PgRelationStore {
    pool: Pool,
}

impl PgRelationStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> TallyResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> TallyResult<Object> {
        self.pool.get().await.map_err(|e| {
            StorageError::ConnectionFailed {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Create the tables this store needs if they are missing.
    pub async fn ensure_schema(&self) -> TallyResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(SCHEMA).await.map_err(query_failed)?;
        Ok(())
    }

    async fn mutate(&self, domain: Domain, pair: PairKey, created_at: Option<i64>) -> TallyResult<()> {
        let failed = |reason: String| StorageError::TransactionFailed {
            domain,
            actor_id: pair.actor_id,
            target_id: pair.target_id,
            reason,
        };
        let rows = row_table(domain);
        let (row_sql, op) = match created_at {
            Some(_) => (
                format!(
                    "INSERT INTO {} ({}, {}, created_at) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                    rows.table, rows.actor, rows.target
                ),
                "+",
            ),
            None => (
                format!(
                    "DELETE FROM {} WHERE {} = $1 AND {} = $2",
                    rows.table, rows.actor, rows.target
                ),
                "-",
            ),
        };

        let mut conn = self.get_conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| failed(format!("begin: {}", e)))?;

        let affected = match created_at {
            Some(at) => {
                tx.execute(row_sql.as_str(), &[&pair.actor_id, &pair.target_id, &at])
                    .await
            }
            None => {
                tx.execute(row_sql.as_str(), &[&pair.actor_id, &pair.target_id])
                    .await
            }
        }
        .map_err(|e| failed(e.to_string()))?;
        if affected != 1 {
            // dropping the transaction rolls it back
            return Err(failed(format!("relation row: {} rows affected", affected)).into());
        }

        for (template, binds_target) in counter_statements(domain) {
            let sql = template.replace("{op}", op);
            let id = if *binds_target {
                pair.target_id
            } else {
                pair.actor_id
            };
            let affected = tx
                .execute(sql.as_str(), &[&id])
                .await
                .map_err(|e| failed(e.to_string()))?;
            if affected != 1 {
                return Err(failed(format!("{}: {} rows affected", sql, affected)).into());
            }
        }

        tx.commit()
            .await
            .map_err(|e| failed(format!("commit: {}", e)))?;
        Ok(())
    }
}

fn query_failed(e: tokio_postgres::Error) -> StorageError {
    StorageError::QueryFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl RelationStore for PgRelationStore {
    async fn entities_exist(&self, domain: Domain, pair: PairKey) -> TallyResult<bool> {
        let sql = match domain {
            Domain::Favorite => {
                "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1) \
                 AND EXISTS (SELECT 1 FROM videos v JOIN users a ON a.id = v.author_id \
                             WHERE v.id = $2)"
            }
            Domain::Relation => {
                "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1) \
                 AND EXISTS (SELECT 1 FROM users WHERE id = $2)"
            }
        };
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(sql, &[&pair.actor_id, &pair.target_id])
            .await
            .map_err(query_failed)?;
        Ok(row.get(0))
    }

    async fn relation_exists(&self, domain: Domain, pair: PairKey) -> TallyResult<bool> {
        let rows = row_table(domain);
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = $1 AND {} = $2)",
            rows.table, rows.actor, rows.target
        );
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(sql.as_str(), &[&pair.actor_id, &pair.target_id])
            .await
            .map_err(query_failed)?;
        Ok(row.get(0))
    }

    async fn apply_relation(&self, domain: Domain, pair: PairKey, created_at: i64) -> TallyResult<()> {
        self.mutate(domain, pair, Some(created_at)).await
    }

    async fn revoke_relation(&self, domain: Domain, pair: PairKey) -> TallyResult<()> {
        self.mutate(domain, pair, None).await
    }

    async fn list_targets(&self, domain: Domain, actor_id: i64) -> TallyResult<Vec<i64>> {
        let rows = row_table(domain);
        let sql = format!(
            "SELECT {target} FROM {table} WHERE {actor} = $1 ORDER BY created_at DESC, {target}",
            target = rows.target,
            table = rows.table,
            actor = rows.actor
        );
        let conn = self.get_conn().await?;
        let result = conn
            .query(sql.as_str(), &[&actor_id])
            .await
            .map_err(query_failed)?;
        Ok(result.iter().map(|r| r.get(0)).collect())
    }

    async fn list_actors(&self, domain: Domain, target_id: i64) -> TallyResult<Vec<i64>> {
        let rows = row_table(domain);
        let sql = format!(
            "SELECT {actor} FROM {table} WHERE {target} = $1 ORDER BY created_at DESC, {actor}",
            target = rows.target,
            table = rows.table,
            actor = rows.actor
        );
        let conn = self.get_conn().await?;
        let result = conn
            .query(sql.as_str(), &[&target_id])
            .await
            .map_err(query_failed)?;
        Ok(result.iter().map(|r| r.get(0)).collect())
    }

    async fn list_friends(&self, user_id: i64) -> TallyResult<Vec<i64>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT r.to_user_id FROM relations r \
                 WHERE r.user_id = $1 \
                 AND EXISTS (SELECT 1 FROM relations b WHERE b.user_id = r.to_user_id AND b.to_user_id = $1) \
                 ORDER BY r.created_at DESC, r.to_user_id",
                &[&user_id],
            )
            .await
            .map_err(query_failed)?;
        Ok(result.iter().map(|r| r.get(0)).collect())
    }

    async fn ping(&self) -> TallyResult<()> {
        let conn = self.get_conn().await?;
        conn.simple_query("SELECT 1").await.map_err(query_failed)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

// =============================================================================
// TESTS
// =============================================================================
