//! PostgreSQL-backed provisioning queue and confidential storage.
//!
//! Operations and archive records are stored as JSONB payloads next to the
//! columns used for lookups. A [`UnitOfWork`] is applied inside a single
//! transaction, secrets included, so rows and secrets change together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idm_core::{BatchId, OperationId, SystemEntityId, SystemId};
use idm_secrets::{
    ConfidentialStorage, GuardedString, SecretCipher, SecretError, SecretResult, SecretWrite,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{ProvisioningStore, StagedWrite, StoreError, StoreResult, UnitOfWork};
use crate::operation::{
    OperationState, ProvisioningArchive, ProvisioningAttribute, ProvisioningBatch,
    ProvisioningOperation,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
                message: db.message().to_string(),
            },
            _ => StoreError::Unavailable {
                message: err.to_string(),
            },
        }
    }
}

/// Apply pending migrations.
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    info!("Running provisioning migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable {
            message: format!("migration failed: {e}"),
        })?;
    info!("Provisioning migrations complete");
    Ok(())
}

// ============================================================================
// Confidential storage
// ============================================================================

/// Confidential storage in the `confidential_storage` table, sealed with AES-GCM.
#[derive(Debug, Clone)]
pub struct PgConfidentialStorage {
    pool: PgPool,
    cipher: SecretCipher,
}

fn unavailable(err: sqlx::Error) -> SecretError {
    SecretError::StorageUnavailable {
        detail: err.to_string(),
    }
}

impl PgConfidentialStorage {
    /// Create a storage over `pool`.
    #[must_use]
    pub fn new(pool: PgPool, cipher: SecretCipher) -> Self {
        Self { pool, cipher }
    }

    async fn apply_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        write: SecretWrite,
    ) -> SecretResult<()> {
        match write {
            SecretWrite::Put {
                owner_id,
                key,
                value,
            } => {
                let sealed = self.cipher.encrypt(owner_id, &value)?;
                sqlx::query(
                    r#"
                    INSERT INTO confidential_storage (owner_id, key, sealed)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (owner_id, key) DO UPDATE SET sealed = EXCLUDED.sealed
                    "#,
                )
                .bind(owner_id)
                .bind(&key)
                .bind(sealed)
                .execute(&mut **tx)
                .await
                .map_err(unavailable)?;
            }
            SecretWrite::Remove { owner_id, key } => {
                sqlx::query("DELETE FROM confidential_storage WHERE owner_id = $1 AND key = $2")
                    .bind(owner_id)
                    .bind(&key)
                    .execute(&mut **tx)
                    .await
                    .map_err(unavailable)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConfidentialStorage for PgConfidentialStorage {
    async fn save(&self, owner_id: Uuid, key: &str, value: &GuardedString) -> SecretResult<()> {
        self.apply(vec![SecretWrite::Put {
            owner_id,
            key: key.to_string(),
            value: value.clone(),
        }])
        .await
    }

    async fn get(&self, owner_id: Uuid, key: &str) -> SecretResult<Option<GuardedString>> {
        let sealed: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT sealed FROM confidential_storage WHERE owner_id = $1 AND key = $2",
        )
        .bind(owner_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        sealed
            .map(|(bytes,)| self.cipher.decrypt(owner_id, &bytes))
            .transpose()
    }

    async fn delete(&self, owner_id: Uuid, key: &str) -> SecretResult<bool> {
        let result =
            sqlx::query("DELETE FROM confidential_storage WHERE owner_id = $1 AND key = $2")
                .bind(owner_id)
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, owner_id: Uuid) -> SecretResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM confidential_storage WHERE owner_id = $1 ORDER BY key")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn apply(&self, writes: Vec<SecretWrite>) -> SecretResult<()> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        for write in writes {
            self.apply_in(&mut tx, write).await?;
        }
        tx.commit().await.map_err(unavailable)
    }
}

// ============================================================================
// Provisioning queue
// ============================================================================

/// Provisioning queue on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgProvisioningStore {
    pool: PgPool,
    secrets: Arc<PgConfidentialStorage>,
}

impl PgProvisioningStore {
    /// Create a store over `pool`, sealing secrets with `cipher`.
    #[must_use]
    pub fn new(pool: PgPool, cipher: SecretCipher) -> Self {
        let secrets = Arc::new(PgConfidentialStorage::new(pool.clone(), cipher));
        Self { pool, secrets }
    }

    async fn apply_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        write: StagedWrite,
    ) -> StoreResult<()> {
        match write {
            StagedWrite::SaveOperation(op) => upsert_operation(tx, &op).await?,
            StagedWrite::EnqueueOperation { mut operation, batch } => {
                sqlx::query(
                    r#"
                    INSERT INTO provisioning_batches
                        (id, system_id, system_entity_id, next_attempt, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (system_id, system_entity_id) DO NOTHING
                    "#,
                )
                .bind(batch.id.into_inner())
                .bind(batch.system_id.into_inner())
                .bind(batch.system_entity_id.into_inner())
                .bind(batch.next_attempt)
                .bind(batch.created_at)
                .execute(&mut **tx)
                .await?;
                let (batch_id,): (Uuid,) = sqlx::query_as(
                    "SELECT id FROM provisioning_batches WHERE system_id = $1 AND system_entity_id = $2",
                )
                .bind(batch.system_id.into_inner())
                .bind(batch.system_entity_id.into_inner())
                .fetch_one(&mut **tx)
                .await?;
                operation.batch_id = Some(BatchId::from_uuid(batch_id));
                upsert_operation(tx, &operation).await?;
            }
            StagedWrite::ClaimOperation {
                operation,
                expected_state,
                expected_attempt,
            } => {
                let not_claimable = StoreError::NotClaimable {
                    operation_id: operation.id,
                };
                if !expected_state.is_claimable() {
                    return Err(not_claimable);
                }
                let claimed = sqlx::query(
                    r#"
                    UPDATE provisioning_operations
                    SET state = $2, payload = $3
                    WHERE id = $1
                      AND state = $4
                      AND (payload->>'current_attempt')::BIGINT = $5
                    "#,
                )
                .bind(operation.id.into_inner())
                .bind(operation.state().as_str())
                .bind(Json(operation.as_ref()))
                .bind(expected_state.as_str())
                .bind(i64::from(expected_attempt))
                .execute(&mut **tx)
                .await?;
                if claimed.rows_affected() == 0 {
                    return Err(not_claimable);
                }
            }
            StagedWrite::DeleteOperation(id) => {
                sqlx::query("DELETE FROM provisioning_operations WHERE id = $1")
                    .bind(id.into_inner())
                    .execute(&mut **tx)
                    .await?;
            }
            StagedWrite::SaveBatch(batch) => {
                sqlx::query(
                    r#"
                    INSERT INTO provisioning_batches
                        (id, system_id, system_entity_id, next_attempt, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (id) DO UPDATE SET next_attempt = EXCLUDED.next_attempt
                    "#,
                )
                .bind(batch.id.into_inner())
                .bind(batch.system_id.into_inner())
                .bind(batch.system_entity_id.into_inner())
                .bind(batch.next_attempt)
                .bind(batch.created_at)
                .execute(&mut **tx)
                .await?;
            }
            StagedWrite::AppendArchive(archive) => {
                sqlx::query(
                    r#"
                    INSERT INTO provisioning_archives
                        (id, operation_id, system_id, system_entity_id, archived_at, payload)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(archive.id.into_inner())
                .bind(archive.operation_id.into_inner())
                .bind(archive.system_id.into_inner())
                .bind(archive.system_entity_id.map(SystemEntityId::into_inner))
                .bind(archive.archived_at)
                .bind(Json(archive.as_ref()))
                .execute(&mut **tx)
                .await?;
            }
            StagedWrite::ReplaceAttributes {
                operation_id,
                attributes,
            } => {
                sqlx::query("DELETE FROM provisioning_attributes WHERE operation_id = $1")
                    .bind(operation_id.into_inner())
                    .execute(&mut **tx)
                    .await?;
                for attribute in attributes {
                    sqlx::query(
                        r#"
                        INSERT INTO provisioning_attributes (operation_id, name, removed)
                        VALUES ($1, $2, $3)
                        "#,
                    )
                    .bind(attribute.operation_id.into_inner())
                    .bind(&attribute.name)
                    .bind(attribute.removed)
                    .execute(&mut **tx)
                    .await?;
                }
            }
            StagedWrite::DeleteAttributes(operation_id) => {
                sqlx::query("DELETE FROM provisioning_attributes WHERE operation_id = $1")
                    .bind(operation_id.into_inner())
                    .execute(&mut **tx)
                    .await?;
            }
            StagedWrite::Secret(write) => self.secrets.apply_in(tx, write).await?,
        }
        Ok(())
    }
}

async fn upsert_operation(
    tx: &mut Transaction<'_, Postgres>,
    op: &ProvisioningOperation,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO provisioning_operations
            (id, batch_id, system_id, system_entity_id, state, created_at, payload)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE SET
            batch_id = EXCLUDED.batch_id,
            state = EXCLUDED.state,
            payload = EXCLUDED.payload
        "#,
    )
    .bind(op.id.into_inner())
    .bind(op.batch_id.map(BatchId::into_inner))
    .bind(op.system_id.into_inner())
    .bind(op.system_entity_id.map(SystemEntityId::into_inner))
    .bind(op.state().as_str())
    .bind(op.created_at)
    .bind(Json(op))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

type BatchRow = (Uuid, Uuid, Uuid, Option<DateTime<Utc>>, DateTime<Utc>);

fn batch_from_row(row: BatchRow) -> ProvisioningBatch {
    let (id, system_id, system_entity_id, next_attempt, created_at) = row;
    ProvisioningBatch {
        id: BatchId::from_uuid(id),
        system_id: SystemId::from_uuid(system_id),
        system_entity_id: SystemEntityId::from_uuid(system_entity_id),
        next_attempt,
        created_at,
    }
}

const BATCH_COLUMNS: &str = "id, system_id, system_entity_id, next_attempt, created_at";

#[async_trait]
impl ProvisioningStore for PgProvisioningStore {
    async fn commit(&self, unit: UnitOfWork) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for write in unit.into_writes() {
            self.apply_in(&mut tx, write).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_operation(&self, id: OperationId) -> StoreResult<Option<ProvisioningOperation>> {
        let row: Option<(Json<ProvisioningOperation>,)> =
            sqlx::query_as("SELECT payload FROM provisioning_operations WHERE id = $1")
                .bind(id.into_inner())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(Json(op),)| op))
    }

    async fn list_batch_operations(
        &self,
        batch_id: BatchId,
    ) -> StoreResult<Vec<ProvisioningOperation>> {
        let rows: Vec<(Json<ProvisioningOperation>,)> = sqlx::query_as(
            "SELECT payload FROM provisioning_operations WHERE batch_id = $1 ORDER BY created_at, id",
        )
        .bind(batch_id.into_inner())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(Json(op),)| op).collect())
    }

    async fn list_operations_in_state(
        &self,
        state: OperationState,
    ) -> StoreResult<Vec<ProvisioningOperation>> {
        let rows: Vec<(Json<ProvisioningOperation>,)> = sqlx::query_as(
            "SELECT payload FROM provisioning_operations WHERE state = $1 ORDER BY created_at, id",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(Json(op),)| op).collect())
    }

    async fn get_batch(&self, id: BatchId) -> StoreResult<Option<ProvisioningBatch>> {
        let row: Option<BatchRow> = sqlx::query_as(&format!(
            "SELECT {BATCH_COLUMNS} FROM provisioning_batches WHERE id = $1"
        ))
        .bind(id.into_inner())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(batch_from_row))
    }

    async fn find_batch(
        &self,
        system_id: SystemId,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Option<ProvisioningBatch>> {
        let row: Option<BatchRow> = sqlx::query_as(&format!(
            "SELECT {BATCH_COLUMNS} FROM provisioning_batches \
             WHERE system_id = $1 AND system_entity_id = $2"
        ))
        .bind(system_id.into_inner())
        .bind(system_entity_id.into_inner())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(batch_from_row))
    }

    async fn list_due_batches(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ProvisioningBatch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            "SELECT {BATCH_COLUMNS} FROM provisioning_batches \
             WHERE next_attempt IS NOT NULL AND next_attempt <= $1 \
             ORDER BY next_attempt, created_at LIMIT $2"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(batch_from_row).collect())
    }

    async fn list_archives(
        &self,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Vec<ProvisioningArchive>> {
        let rows: Vec<(Json<ProvisioningArchive>,)> = sqlx::query_as(
            "SELECT payload FROM provisioning_archives WHERE system_entity_id = $1 ORDER BY archived_at",
        )
        .bind(system_entity_id.into_inner())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(Json(archive),)| archive).collect())
    }

    async fn list_attributes(
        &self,
        operation_id: OperationId,
    ) -> StoreResult<Vec<ProvisioningAttribute>> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT name, removed FROM provisioning_attributes WHERE operation_id = $1 ORDER BY name",
        )
        .bind(operation_id.into_inner())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, removed)| ProvisioningAttribute {
                operation_id,
                name,
                removed,
            })
            .collect())
    }

    async fn purge_operation(&self, id: OperationId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM provisioning_operations WHERE id = $1")
            .bind(id.into_inner())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn confidential_storage(&self) -> Arc<dyn ConfidentialStorage> {
        self.secrets.clone()
    }
}
