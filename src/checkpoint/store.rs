//! SQLite checkpoint store

use super::{CheckpointOwner, CheckpointSnapshot, CheckpointTag};
use crate::config::DatabaseConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol::SwapId;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Listing row for restorable swaps
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub swap_id: SwapId,
    pub owner: CheckpointOwner,
    pub tag: CheckpointTag,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

/// Write-once persistence for swap milestones
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Open the store
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(CoordinatorError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                swap_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                tag TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (swap_id, owner, tag)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_checkpoints_swap
            ON checkpoints (swap_id, owner, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;
        Ok(())
    }

    /// Record a milestone. Write-once: an existing (swap, owner, tag) row is
    /// a fatal coordination fault, never overwritten.
    pub async fn record(
        &self,
        owner: CheckpointOwner,
        tag: CheckpointTag,
        snapshot: &CheckpointSnapshot,
    ) -> CoordinatorResult<()> {
        let payload = serde_json::to_string(snapshot)?;
        let swap_id = snapshot.swap_id.to_string();

        let mut tx = self.pool.begin().await?;

        let existing =
            sqlx::query("SELECT seq FROM checkpoints WHERE swap_id = ?1 AND owner = ?2 AND tag = ?3")
                .bind(&swap_id)
                .bind(owner.name())
                .bind(tag.name())
                .fetch_optional(&mut *tx)
                .await?;

        if existing.is_some() {
            warn!(swap = %swap_id, %tag, "Refusing to overwrite existing checkpoint");
            return Err(CoordinatorError::DuplicateCheckpoint {
                swap_id: snapshot.swap_id,
                tag: tag.name().to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (swap_id, owner, tag, snapshot, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&swap_id)
        .bind(owner.name())
        .bind(tag.name())
        .bind(&payload)
        .bind(snapshot.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(swap = %swap_id, %tag, "Checkpoint recorded");
        Ok(())
    }

    /// Latest Swap-owned snapshot for a swap, if any
    pub async fn latest(&self, swap_id: SwapId) -> CoordinatorResult<Option<CheckpointSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT snapshot FROM checkpoints
            WHERE swap_id = ?1 AND owner = ?2
            ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(swap_id.to_string())
        .bind(CheckpointOwner::Swap.name())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: String = row.get("snapshot");
                let snapshot = serde_json::from_str(&payload).map_err(|e| {
                    CoordinatorError::InconsistentSnapshot {
                        swap_id,
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// One entry per swap: its newest Swap-owned milestone
    pub async fn list(&self) -> CoordinatorResult<Vec<CheckpointEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT swap_id, owner, tag, seq, created_at FROM checkpoints
            WHERE owner = ?1 AND seq IN (
                SELECT MAX(seq) FROM checkpoints WHERE owner = ?1 GROUP BY swap_id
            )
            ORDER BY seq DESC
            "#,
        )
        .bind(CheckpointOwner::Swap.name())
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let swap_id: String = row.get("swap_id");
            let owner: String = row.get("owner");
            let tag: String = row.get("tag");
            let entry = CheckpointEntry {
                swap_id: SwapId::from_str(&swap_id)
                    .map_err(|e| CoordinatorError::Internal(e.to_string()))?,
                owner: CheckpointOwner::from_str(&owner).map_err(CoordinatorError::Internal)?,
                tag: CheckpointTag::from_str(&tag).map_err(CoordinatorError::Internal)?,
                seq: row.get("seq"),
                created_at: row.get("created_at"),
            };
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Delete every record of a finished swap, all owners included
    pub async fn remove(&self, swap_id: SwapId) -> CoordinatorResult<u64> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE swap_id = ?1")
            .bind(swap_id.to_string())
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(swap = %swap_id, removed, "Checkpoints removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Network, SwapParams, SwapRole, TradeRole};
    use crate::swap::state::{BobState, SwapState};

    fn test_config(dir: &tempfile::TempDir) -> DatabaseConfig {
        DatabaseConfig {
            url: format!(
                "sqlite://{}?mode=rwc",
                dir.path().join("checkpoints.db").display()
            ),
            max_connections: 2,
            min_connections: 1,
        }
    }

    fn snapshot(swap_id: SwapId, state: SwapState) -> CheckpointSnapshot {
        CheckpointSnapshot {
            swap_id,
            params: SwapParams {
                swap_id,
                role: SwapRole::Bob,
                trade_role: TradeRole::Taker,
                network: Network::Local,
                arbitrating_amount: 100_000,
                accordant_amount: 5_000_000,
                arbitrating_finality: 3,
                accordant_finality: 10,
                cancel_timelock: 16,
                punish_timelock: 32,
                sat_per_vbyte: 1,
                remote_commit: None,
            },
            state,
            artifacts: Default::default(),
            pending: vec![],
            watches: vec![],
            broadcasts: vec![],
            funded_legs: vec![],
            created_at: Utc::now(),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> CheckpointStore {
        let store = CheckpointStore::new(&test_config(dir)).await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    #[test]
    fn test_write_once_rejects_second_write() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(&dir).await;
            let swap_id = SwapId::random();
            let snap = snapshot(swap_id, SwapState::Bob(BobState::CorearbB));

            store
                .record(CheckpointOwner::Swap, CheckpointTag::BobPreLock, &snap)
                .await
                .unwrap();

            let err = store
                .record(CheckpointOwner::Swap, CheckpointTag::BobPreLock, &snap)
                .await
                .unwrap_err();
            assert!(matches!(err, CoordinatorError::DuplicateCheckpoint { .. }));
            assert!(err.is_fatal());

            // A different owner for the same tag is a separate key.
            store
                .record(CheckpointOwner::Wallet, CheckpointTag::BobPreLock, &snap)
                .await
                .unwrap();
        });
    }

    #[test]
    fn test_latest_returns_newest_milestone() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(&dir).await;
            let swap_id = SwapId::random();

            store
                .record(
                    CheckpointOwner::Swap,
                    CheckpointTag::BobPreLock,
                    &snapshot(swap_id, SwapState::Bob(BobState::CorearbB)),
                )
                .await
                .unwrap();
            store
                .record(
                    CheckpointOwner::Swap,
                    CheckpointTag::BobPreBuy,
                    &snapshot(
                        swap_id,
                        SwapState::Bob(BobState::BuySigB {
                            lock_final: false,
                            buy_sig_released: false,
                        }),
                    ),
                )
                .await
                .unwrap();

            let latest = store.latest(swap_id).await.unwrap().unwrap();
            assert_eq!(latest.state.name(), "BuySigB");

            assert!(store.latest(SwapId::random()).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_list_and_remove() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(&dir).await;
            let a = SwapId::random();
            let b = SwapId::random();

            store
                .record(
                    CheckpointOwner::Swap,
                    CheckpointTag::BobPreLock,
                    &snapshot(a, SwapState::Bob(BobState::CorearbB)),
                )
                .await
                .unwrap();
            store
                .record(
                    CheckpointOwner::Swap,
                    CheckpointTag::BobPreBuy,
                    &snapshot(
                        a,
                        SwapState::Bob(BobState::BuySigB {
                            lock_final: false,
                            buy_sig_released: false,
                        }),
                    ),
                )
                .await
                .unwrap();
            store
                .record(
                    CheckpointOwner::Swap,
                    CheckpointTag::BobPreLock,
                    &snapshot(b, SwapState::Bob(BobState::CorearbB)),
                )
                .await
                .unwrap();

            let entries = store.list().await.unwrap();
            assert_eq!(entries.len(), 2);
            let for_a = entries.iter().find(|e| e.swap_id == a).unwrap();
            assert_eq!(for_a.tag, CheckpointTag::BobPreBuy);

            assert_eq!(store.remove(a).await.unwrap(), 2);
            assert_eq!(store.list().await.unwrap().len(), 1);
            assert!(store.latest(a).await.unwrap().is_none());
        });
    }
}
