//! SQLite Checkpoint Store Implementation
//!
//! Implements [`CheckpointStore`] on SQLite through SQLx.
//!
//! ## Optimistic Claims
//!
//! Each requested claim is a single statement whose affected-row count
//! decides the outcome:
//! - no eTag on the request: `INSERT ... ON CONFLICT DO NOTHING` (first claim)
//! - eTag on the request: `UPDATE ... WHERE etag = ?` (renewal or steal)
//!
//! Exactly one affected row means the claim won. SQLite serializes writers,
//! so two instances presenting the same eTag cannot both succeed.
//!
//! ## Usage
//!
//! ```ignore
//! // File-backed (created if missing)
//! let store = SqliteCheckpointStore::new("checkpoints.db").await?;
//!
//! // In-memory, for tests
//! let store = SqliteCheckpointStore::new_in_memory().await?;
//! ```
//!
//! ## Migrations
//! - Run automatically on startup via sqlx::migrate!

use crate::{
    error::Result,
    new_e_tag, now_ms,
    types::*,
    CheckpointStore,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

type OwnershipRow = (String, String, String, String, String, i64, String);
type CheckpointRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<i64>,
);

/// SQLite-based checkpoint store
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (or create) a file-backed store
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        // Every connection to `sqlite::memory:` is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    async fn try_claim(&self, request: &PartitionOwnership) -> Result<Option<PartitionOwnership>> {
        let e_tag = new_e_tag();
        let now = now_ms();

        let result = match &request.e_tag {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO partition_ownership (
                        fully_qualified_namespace, event_hub_name, consumer_group,
                        partition_id, owner_id, last_modified_time, etag
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(&request.fully_qualified_namespace)
                .bind(&request.event_hub_name)
                .bind(&request.consumer_group)
                .bind(&request.partition_id)
                .bind(&request.owner_id)
                .bind(now)
                .bind(&e_tag)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE partition_ownership
                    SET owner_id = ?, last_modified_time = ?, etag = ?
                    WHERE fully_qualified_namespace = ?
                      AND event_hub_name = ?
                      AND consumer_group = ?
                      AND partition_id = ?
                      AND etag = ?
                    "#,
                )
                .bind(&request.owner_id)
                .bind(now)
                .bind(&e_tag)
                .bind(&request.fully_qualified_namespace)
                .bind(&request.event_hub_name)
                .bind(&request.consumer_group)
                .bind(&request.partition_id)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() != 1 {
            debug!(
                partition_id = %request.partition_id,
                owner_id = %request.owner_id,
                "Ownership claim rejected: eTag mismatch"
            );
            return Ok(None);
        }

        let mut claimed = request.clone();
        claimed.e_tag = Some(e_tag);
        claimed.last_modified_time = Some(now);
        Ok(Some(claimed))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>> {
        let rows: Vec<OwnershipRow> = sqlx::query_as(
            r#"
            SELECT fully_qualified_namespace, event_hub_name, consumer_group,
                   partition_id, owner_id, last_modified_time, etag
            FROM partition_ownership
            WHERE fully_qualified_namespace = ? COLLATE NOCASE
              AND event_hub_name = ? COLLATE NOCASE
              AND consumer_group = ? COLLATE NOCASE
            ORDER BY partition_id
            "#,
        )
        .bind(fully_qualified_namespace)
        .bind(event_hub_name)
        .bind(consumer_group)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(namespace, hub, group, partition_id, owner_id, last_modified_time, e_tag)| {
                    PartitionOwnership {
                        fully_qualified_namespace: namespace,
                        event_hub_name: hub,
                        consumer_group: group,
                        partition_id,
                        owner_id,
                        last_modified_time: Some(last_modified_time),
                        e_tag: Some(e_tag),
                    }
                },
            )
            .collect())
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>> {
        let mut claimed = Vec::with_capacity(requested.len());
        for request in &requested {
            if let Some(ownership) = self.try_claim(request).await? {
                claimed.push(ownership);
            }
        }
        Ok(claimed)
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT fully_qualified_namespace, event_hub_name, consumer_group,
                   partition_id, owner_id, checkpoint_offset, sequence_number
            FROM checkpoints
            WHERE fully_qualified_namespace = ? COLLATE NOCASE
              AND event_hub_name = ? COLLATE NOCASE
              AND consumer_group = ? COLLATE NOCASE
            ORDER BY partition_id
            "#,
        )
        .bind(fully_qualified_namespace)
        .bind(event_hub_name)
        .bind(consumer_group)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(namespace, hub, group, partition_id, owner_id, offset, sequence_number)| {
                    Checkpoint {
                        fully_qualified_namespace: namespace,
                        event_hub_name: hub,
                        consumer_group: group,
                        partition_id,
                        owner_id,
                        offset,
                        sequence_number,
                    }
                },
            )
            .collect())
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<String> {
        let e_tag = new_e_tag();
        let now = now_ms();

        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                fully_qualified_namespace, event_hub_name, consumer_group, partition_id,
                owner_id, checkpoint_offset, sequence_number, etag, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fully_qualified_namespace, event_hub_name, consumer_group, partition_id)
            DO UPDATE SET
                owner_id = excluded.owner_id,
                checkpoint_offset = excluded.checkpoint_offset,
                sequence_number = excluded.sequence_number,
                etag = excluded.etag,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.fully_qualified_namespace)
        .bind(&checkpoint.event_hub_name)
        .bind(&checkpoint.consumer_group)
        .bind(&checkpoint.partition_id)
        .bind(&checkpoint.owner_id)
        .bind(checkpoint.offset)
        .bind(checkpoint.sequence_number)
        .bind(&e_tag)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(e_tag)
    }
}
