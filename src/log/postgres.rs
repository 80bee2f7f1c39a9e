use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;

use super::store::{LogStore, StoredEntry};
use super::{Checkpoint, EntryType, LogEntry};
use crate::error::{Error, Result};
use crate::{hash_from_slice, Hash};

/// Log store backed by the `log_entries` / `log_checkpoints` tables.
#[derive(Clone)]
pub struct PostgresLogStore {
    pool: Pool,
}

impl PostgresLogStore {
    /// Wraps an existing connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn to_db_index(index: u64) -> Result<i64> {
    i64::try_from(index).map_err(|_| Error::invalid(format!("index {index} exceeds BIGINT")))
}

fn from_db_index(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::consistency_violation(format!("negative index {value} in log table")))
}

#[async_trait]
impl LogStore for PostgresLogStore {
    async fn append_entry(
        &self,
        origin: &str,
        index: u64,
        entry: &LogEntry,
        leaf_hash: &Hash,
    ) -> Result<()> {
        let client = self.pool.get().await?;
        let db_index = to_db_index(index)?;

        let next: i64 = client
            .query_one(
                "SELECT COALESCE(MAX(leaf_index) + 1, 0) FROM log_entries WHERE origin = $1",
                &[&origin],
            )
            .await?
            .get(0);
        if db_index > next {
            return Err(Error::consistency_violation(format!(
                "append at {index} would leave a gap after {next} entries of '{origin}'"
            )));
        }

        let inserted = client
            .execute(
                "INSERT INTO log_entries
                     (origin, leaf_index, entry_type, tenant_id, created_at, payload, leaf_hash)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (origin, leaf_index) DO NOTHING",
                &[
                    &origin,
                    &db_index,
                    &entry.entry_type.as_str(),
                    &entry.tenant_id,
                    &entry.timestamp,
                    &entry.payload,
                    &leaf_hash.as_slice(),
                ],
            )
            .await?;

        if inserted == 1 {
            return Ok(());
        }

        // The row already exists, either from an earlier attempt of this
        // same append or from a conflicting writer.
        let existing: Vec<u8> = client
            .query_one(
                "SELECT leaf_hash FROM log_entries WHERE origin = $1 AND leaf_index = $2",
                &[&origin, &db_index],
            )
            .await?
            .get(0);
        if existing.as_slice() == leaf_hash.as_slice() {
            Ok(())
        } else {
            Err(Error::consistency_violation(format!(
                "index {index} of '{origin}' already holds a different leaf"
            )))
        }
    }

    async fn load_entries(&self, origin: &str) -> Result<Vec<StoredEntry>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT leaf_index, entry_type, tenant_id, created_at, payload, leaf_hash
                 FROM log_entries
                 WHERE origin = $1
                 ORDER BY leaf_index",
                &[&origin],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let entry_type: String = row.get(1);
                let created_at: DateTime<Utc> = row.get(3);
                let leaf_hash: Vec<u8> = row.get(5);
                Ok(StoredEntry {
                    index: from_db_index(row.get(0))?,
                    entry: LogEntry {
                        entry_type: entry_type.parse::<EntryType>()?,
                        timestamp: created_at,
                        tenant_id: row.get(2),
                        payload: row.get(4),
                    },
                    leaf_hash: hash_from_slice(&leaf_hash)?,
                })
            })
            .collect()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO log_checkpoints
                     (origin, tree_size, root_hash, created_at, signature, public_key)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &checkpoint.origin,
                    &to_db_index(checkpoint.tree_size)?,
                    &checkpoint.root_hash.as_slice(),
                    &checkpoint.timestamp,
                    &checkpoint.signature,
                    &checkpoint.public_key,
                ],
            )
            .await?;
        Ok(())
    }

    async fn load_checkpoints(&self, origin: &str) -> Result<Vec<Checkpoint>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT tree_size, root_hash, created_at, signature, public_key
                 FROM log_checkpoints
                 WHERE origin = $1
                 ORDER BY id",
                &[&origin],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let root_hash: Vec<u8> = row.get(1);
                Ok(Checkpoint {
                    origin: origin.to_string(),
                    tree_size: from_db_index(row.get(0))?,
                    root_hash: hash_from_slice(&root_hash)?,
                    timestamp: row.get(2),
                    signature: row.get(3),
                    public_key: row.get(4),
                })
            })
            .collect()
    }
}
