use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::StateError;
use super::StateStore;

/// Keys per DELETE statement, well under SQLite's bound-parameter limit.
const CHUNK_SIZE: usize = 500;

#[async_trait]
impl StateStore for Database {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StateError> {
        sqlx::query("INSERT OR IGNORE INTO buckets (name) VALUES (?)")
            .bind(bucket)
            .execute(&self.pool)
            .await
            .map_err(StateError::from_sqlx)?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM entries WHERE bucket = ? AND key = ?")
                .bind(bucket)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(StateError::from_sqlx)?;
        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError> {
        // Only insert when the bucket exists, so a missing bucket is reported
        // instead of surfacing as a foreign key failure
        let result = sqlx::query(
            r#"
            INSERT INTO entries (bucket, key, value)
            SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM buckets WHERE name = ?1)
            ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value
        "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StateError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StateError::MissingBucket(bucket.to_owned()));
        }
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StateError> {
        let result = sqlx::query("DELETE FROM entries WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StateError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>, StateError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM entries WHERE bucket = ? ORDER BY key")
                .bind(bucket)
                .fetch_all(&self.pool)
                .await
                .map_err(StateError::from_sqlx)?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn buckets(&self) -> Result<Vec<String>, StateError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM buckets ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(StateError::from_sqlx)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool, StateError> {
        let mut tx = self.pool.begin().await.map_err(StateError::from_sqlx)?;

        sqlx::query("DELETE FROM entries WHERE bucket = ?")
            .bind(bucket)
            .execute(&mut *tx)
            .await
            .map_err(StateError::from_sqlx)?;
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(bucket)
            .execute(&mut *tx)
            .await
            .map_err(StateError::from_sqlx)?;

        tx.commit().await.map_err(StateError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    /// Single-transaction override: read the key set, then delete the stale
    /// keys in chunks.
    async fn prune_feed(&self, bucket: &str, current: &[String]) -> Result<usize, StateError> {
        let current: HashSet<&str> = current.iter().map(String::as_str).collect();
        let mut tx = self.pool.begin().await.map_err(StateError::from_sqlx)?;

        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM entries WHERE bucket = ?")
            .bind(bucket)
            .fetch_all(&mut *tx)
            .await
            .map_err(StateError::from_sqlx)?;
        let stale: Vec<String> = rows
            .into_iter()
            .map(|(key,)| key)
            .filter(|key| !current.contains(key.as_str()))
            .collect();

        let mut removed = 0;
        for chunk in stale.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM entries WHERE bucket = ");
            builder.push_bind(bucket);
            builder.push(" AND key IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key);
            }
            separated.push_unseparated(")");

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(StateError::from_sqlx)?;
            removed += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(StateError::from_sqlx)?;

        if removed > 0 {
            tracing::debug!(feed = %bucket, removed = removed, "Pruned stale items");
        }
        Ok(removed)
    }

    /// Single-transaction override of the bucket reaper.
    async fn prune_buckets(&self, current: &[String]) -> Result<usize, StateError> {
        let current: HashSet<&str> = current.iter().map(String::as_str).collect();
        let mut tx = self.pool.begin().await.map_err(StateError::from_sqlx)?;

        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM buckets")
            .fetch_all(&mut *tx)
            .await
            .map_err(StateError::from_sqlx)?;
        let stale: Vec<String> = rows
            .into_iter()
            .map(|(name,)| name)
            .filter(|name| !current.contains(name.as_str()))
            .collect();

        for chunk in stale.chunks(CHUNK_SIZE) {
            // Keys first, then the bucket rows themselves
            for (table, column) in [("entries", "bucket"), ("buckets", "name")] {
                let mut builder: QueryBuilder<sqlx::Sqlite> =
                    QueryBuilder::new(format!("DELETE FROM {table} WHERE {column} IN ("));
                let mut separated = builder.separated(", ");
                for name in chunk {
                    separated.push_bind(name);
                }
                separated.push_unseparated(")");

                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(StateError::from_sqlx)?;
            }
        }

        tx.commit().await.map_err(StateError::from_sqlx)?;

        for name in &stale {
            tracing::info!(feed = %name, "Removed state for unsubscribed feed");
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prune_many_keys_across_chunks() {
        let db = Database::open(":memory:").await.unwrap();
        db.ensure_bucket("feed").await.unwrap();

        let all: Vec<String> = (0..1200).map(|i| format!("https://example.com/{i}")).collect();
        for key in &all {
            db.mark_seen("feed", key).await.unwrap();
        }

        let keep: Vec<String> = all.iter().take(10).cloned().collect();
        let removed = db.prune_feed("feed", &keep).await.unwrap();
        assert_eq!(removed, 1190);

        let mut left = db.keys("feed").await.unwrap();
        left.sort();
        let mut expected = keep.clone();
        expected.sort();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn test_put_overwrites_value() {
        let db = Database::open(":memory:").await.unwrap();
        db.ensure_bucket("feed").await.unwrap();
        db.put("feed", "k", b"one").await.unwrap();
        db.put("feed", "k", b"two").await.unwrap();
        assert_eq!(db.get("feed", "k").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(db.keys("feed").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        db.ensure_bucket("https://example.com/feed").await.unwrap();
        db.mark_seen("https://example.com/feed", "https://example.com/1")
            .await
            .unwrap();
        db.close().await;

        let db = Database::open(path).await.unwrap();
        assert!(db
            .seen("https://example.com/feed", "https://example.com/1")
            .await
            .unwrap());
        db.close().await;
    }
}
