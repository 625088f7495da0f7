//! Cluster-wide token service backed by the lock store database
//!
//! Each locked key has one row in `lock_slots`; each granted token has one
//! row in `lock_tokens`. Every operation runs in a single transaction that
//! starts with a write, so concurrent callers on any node serialize on the
//! database write lock. Transient database failures are retried with a fresh
//! connection up to the configured retry count; conflicts are not retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::LockContext;
use super::service::TokenService;
use super::token::{ObjectRef, Token, TokenKind};
use super::types::{LockError, LockHolder, LockInfo, LockResult, TokenServiceConfig};
use crate::storage::Database;

/// Token service sharing its locks with every node on the same database
#[derive(Debug, Clone)]
pub struct PersistentTokenService {
    pool: SqlitePool,
    config: TokenServiceConfig,
    context: LockContext,
    retry_count: u32,
}

/// Outcome of a single failed attempt
#[derive(Debug)]
enum AttemptError {
    /// Final answer, retrying would not change it
    Rejected(LockError),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for AttemptError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SlotRow {
    id: String,
    exclusive: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct HolderRow {
    owner_branch: Option<i64>,
    owner_id: Option<String>,
    owner_type: Option<String>,
    expires_at: i64,
    cluster_node: Option<i64>,
}

/// One token joined with its slot, as listed by `all_locks`
#[derive(Debug, sqlx::FromRow)]
struct LockRow {
    token_id: String,
    expires_at: i64,
    owner_branch: Option<i64>,
    owner_id: Option<String>,
    owner_type: Option<String>,
    batch_id: String,
    seq: i64,
    acquired_at: i64,
    operation: Option<String>,
    cluster_node: Option<i64>,
    target_branch: Option<i64>,
    target_id: Option<String>,
    target_type: Option<String>,
    aspect_name: String,
    exclusive: bool,
}

impl HolderRow {
    fn into_holder(self) -> LockHolder {
        LockHolder {
            owner: object_ref(self.owner_branch, self.owner_id, self.owner_type),
            expires_at: from_millis(self.expires_at),
            cluster_node: self.cluster_node,
        }
    }
}

impl LockRow {
    fn owner(&self) -> Option<ObjectRef> {
        object_ref(
            self.owner_branch,
            self.owner_id.clone(),
            self.owner_type.clone(),
        )
    }

    fn token(&self) -> Option<Token> {
        let id = match Uuid::parse_str(&self.token_id) {
            Ok(id) => id,
            Err(err) => {
                warn!(token_id = %self.token_id, error = %err, "Skipping token row with invalid id");
                return None;
            }
        };

        let kind = if self.exclusive {
            TokenKind::Exclusive
        } else {
            TokenKind::Shared
        };
        let target = object_ref(
            self.target_branch,
            self.target_id.clone(),
            self.target_type.clone(),
        );

        Some(Token::from_stored(kind, target, self.aspect_name.clone(), id))
    }
}

fn object_ref(
    branch: Option<i64>,
    id: Option<String>,
    type_name: Option<String>,
) -> Option<ObjectRef> {
    match (branch, id, type_name) {
        (Some(branch), Some(id), Some(type_name)) => Some(ObjectRef {
            branch,
            id,
            type_name,
        }),
        _ => None,
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Lock the slot row of `lock_key` for the rest of the transaction and read it
///
/// The no-op update takes the database write lock even when the row does not
/// exist yet, so a competing transaction cannot insert the same key meanwhile.
async fn select_slot_for_update(
    conn: &mut SqliteConnection,
    lock_key: &str,
) -> Result<Option<SlotRow>, sqlx::Error> {
    sqlx::query("UPDATE lock_slots SET exclusive = exclusive WHERE lock_key = ?")
        .bind(lock_key)
        .execute(&mut *conn)
        .await?;

    sqlx::query_as::<_, SlotRow>("SELECT id, exclusive FROM lock_slots WHERE lock_key = ?")
        .bind(lock_key)
        .fetch_optional(&mut *conn)
        .await
}

impl PersistentTokenService {
    /// Create a token service on `db`, retrying as often as its config allows
    pub fn new(db: &Database, config: TokenServiceConfig, context: LockContext) -> Self {
        Self {
            pool: db.pool().clone(),
            config,
            context,
            retry_count: db.config().retry_count,
        }
    }

    /// A handle on the same store acting for a different caller
    pub fn with_context(&self, context: LockContext) -> Self {
        Self {
            pool: self.pool.clone(),
            config: self.config.clone(),
            context,
            retry_count: self.retry_count,
        }
    }

    /// Override the number of attempts per operation
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &TokenServiceConfig {
        &self.config
    }

    /// Run `attempt` until it succeeds, is rejected, or the retries run out
    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> LockResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let attempts = self.retry_count.max(1);
        let mut last_error = None;

        for round in 1..=attempts {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Rejected(err)) => return Err(err),
                Err(AttemptError::Database(err)) => {
                    warn!(
                        operation = operation,
                        attempt = round,
                        max_attempts = attempts,
                        error = %err,
                        "Lock store operation failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(LockError::Storage {
            attempts,
            message: last_error.map(|err| err.to_string()).unwrap_or_default(),
        })
    }

    async fn try_acquire(
        &self,
        expire_date: DateTime<Utc>,
        tokens: &[Token],
        batch_id: &str,
    ) -> Result<Vec<Uuid>, AttemptError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = expire_date.timestamp_millis();
        let owner = self.context.principal();
        let operation = self.context.operation();
        let node = self.context.node_id();

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(tokens.len());

        for (seq, token) in tokens.iter().enumerate() {
            let key = token.key();
            let lock_key = key.storage_key();

            let slot_id = match select_slot_for_update(&mut tx, &lock_key).await? {
                Some(slot) => {
                    if slot.exclusive || token.is_exclusive() {
                        let swept = sqlx::query(
                            "DELETE FROM lock_tokens WHERE lock_id = ? AND expires_at <= ?",
                        )
                        .bind(&slot.id)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                        if swept > 0 {
                            debug!(key = %key, swept = swept, "Dropped expired tokens");
                        }

                        let holder = sqlx::query_as::<_, HolderRow>(
                            "SELECT owner_branch, owner_id, owner_type, expires_at, cluster_node \
                             FROM lock_tokens WHERE lock_id = ? \
                             ORDER BY acquired_at, rowid LIMIT 1",
                        )
                        .bind(&slot.id)
                        .fetch_optional(&mut *tx)
                        .await?;

                        if let Some(holder) = holder {
                            let err = self.config.conflict(key, || Some(holder.into_holder()));
                            return Err(AttemptError::Rejected(err));
                        }

                        sqlx::query("UPDATE lock_slots SET exclusive = ? WHERE id = ?")
                            .bind(token.is_exclusive())
                            .bind(&slot.id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    slot.id
                }
                None => {
                    let slot_id = Uuid::new_v4().to_string();
                    let target = token.target();
                    sqlx::query(
                        "INSERT INTO lock_slots \
                         (id, lock_key, target_branch, target_id, target_type, aspect_name, exclusive, created_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&slot_id)
                    .bind(&lock_key)
                    .bind(target.map(|t| t.branch))
                    .bind(target.map(|t| t.id.as_str()))
                    .bind(target.map(|t| t.type_name.as_str()))
                    .bind(token.aspect())
                    .bind(token.is_exclusive())
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    slot_id
                }
            };

            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO lock_tokens \
                 (id, lock_id, expires_at, acquired_at, owner_branch, owner_id, owner_type, \
                  batch_id, seq, operation, cluster_node) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(&slot_id)
            .bind(expires_at)
            .bind(now)
            .bind(owner.as_ref().map(|o| o.branch))
            .bind(owner.as_ref().map(|o| o.id.as_str()))
            .bind(owner.as_ref().map(|o| o.type_name.as_str()))
            .bind(batch_id)
            .bind(seq as i64)
            .bind(operation.as_deref())
            .bind(node)
            .execute(&mut *tx)
            .await?;

            debug!(key = %key, kind = %token.kind(), token_id = %id, "Token granted");
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn try_all_valid(&self, tokens: &[Token]) -> Result<bool, AttemptError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for token in tokens {
            let Some(id) = token.id() else {
                return Ok(false);
            };

            let row: Option<(String,)> = sqlx::query_as(
                "SELECT t.id FROM lock_tokens t JOIN lock_slots s ON s.id = t.lock_id \
                 WHERE t.id = ? AND s.lock_key = ? AND t.expires_at > ?",
            )
            .bind(id.to_string())
            .bind(token.key().storage_key())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if row.is_none() {
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Move every token to `expire_date`, or change nothing and return false
    async fn try_renew(
        &self,
        expire_date: DateTime<Utc>,
        tokens: &[Token],
    ) -> Result<bool, AttemptError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = expire_date.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for token in tokens {
            let Some(id) = token.id() else {
                return Ok(false);
            };

            let updated = sqlx::query(
                "UPDATE lock_tokens SET expires_at = ? \
                 WHERE id = ? AND expires_at > ? \
                 AND lock_id IN (SELECT id FROM lock_slots WHERE lock_key = ?)",
            )
            .bind(expires_at)
            .bind(id.to_string())
            .bind(now)
            .bind(token.key().storage_key())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                // Dropping the transaction rolls back the tokens renewed so far
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn try_release(&self, tokens: &[Token]) -> Result<u64, AttemptError> {
        let mut tx = self.pool.begin().await?;
        let mut released = 0;

        for token in tokens {
            let Some(id) = token.id() else {
                continue;
            };
            let lock_key = token.key().storage_key();

            released += sqlx::query(
                "DELETE FROM lock_tokens WHERE id = ? \
                 AND lock_id IN (SELECT id FROM lock_slots WHERE lock_key = ?)",
            )
            .bind(id.to_string())
            .bind(&lock_key)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            sqlx::query(
                "DELETE FROM lock_slots WHERE lock_key = ? \
                 AND NOT EXISTS (SELECT 1 FROM lock_tokens WHERE lock_id = lock_slots.id)",
            )
            .bind(&lock_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(released)
    }

    async fn try_all_locks(&self) -> Result<Vec<LockRow>, AttemptError> {
        let rows = sqlx::query_as::<_, LockRow>(
            "SELECT t.id AS token_id, t.expires_at, t.owner_branch, t.owner_id, t.owner_type, \
                    t.batch_id, t.seq, t.acquired_at, t.operation, t.cluster_node, \
                    s.target_branch, s.target_id, s.target_type, s.aspect_name, s.exclusive \
             FROM lock_tokens t JOIN lock_slots s ON s.id = t.lock_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Fold rows of the same batch into one `LockInfo`
    ///
    /// A batch is written by one transaction with a single acquisition time,
    /// so batches are listed by that time and their tokens by call position.
    fn group_locks(&self, rows: Vec<LockRow>) -> Vec<LockInfo> {
        let mut batches: BTreeMap<(i64, String), Vec<LockRow>> = BTreeMap::new();
        for row in rows {
            batches
                .entry((row.acquired_at, row.batch_id.clone()))
                .or_default()
                .push(row);
        }

        batches
            .into_values()
            .filter_map(|mut rows| {
                rows.sort_by_key(|row| row.seq);

                let tokens: Vec<Token> = rows.iter().filter_map(LockRow::token).collect();
                if tokens.is_empty() {
                    return None;
                }

                let timeout = rows.iter().map(|row| from_millis(row.expires_at)).min()?;
                let owner = rows.iter().find_map(LockRow::owner);
                let operation = rows.iter().find_map(|row| row.operation.clone());
                let cluster_node = rows.iter().find_map(|row| row.cluster_node);

                Some(LockInfo {
                    owner_name: self.context.owner_name(owner.as_ref()),
                    owner,
                    timeout,
                    operation,
                    cluster_node,
                    tokens,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TokenService for PersistentTokenService {
    async fn acquire(&self, expire_date: DateTime<Utc>, tokens: &mut [Token]) -> LockResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }

        let batch_id = Uuid::new_v4().to_string();
        let result = {
            let requested: &[Token] = tokens;
            let batch: &str = &batch_id;
            self.with_retries("acquire", move || {
                self.try_acquire(expire_date, requested, batch)
            })
            .await
        };

        let ids = match result {
            Ok(ids) => ids,
            Err(err) => {
                if err.is_conflict() {
                    warn!(batch = %batch_id, error = %err, "Lock conflict");
                }
                return Err(err);
            }
        };

        for (token, id) in tokens.iter_mut().zip(ids) {
            token.assign_id(id);
        }
        self.context.invalidate_store();

        info!(
            batch = %batch_id,
            tokens = tokens.len(),
            expires_at = %expire_date,
            "Tokens acquired"
        );
        Ok(())
    }

    async fn all_valid(&self, tokens: &[Token]) -> LockResult<bool> {
        self.with_retries("all_valid", move || self.try_all_valid(tokens))
            .await
    }

    async fn renew(&self, expire_date: DateTime<Utc>, tokens: &[Token]) -> LockResult<bool> {
        let renewed = self
            .with_retries("renew", move || self.try_renew(expire_date, tokens))
            .await?;

        if renewed {
            debug!(tokens = tokens.len(), expires_at = %expire_date, "Tokens renewed");
        } else {
            self.release(tokens).await?;
            info!(tokens = tokens.len(), "Renewal failed, released token batch");
        }
        Ok(renewed)
    }

    async fn release(&self, tokens: &[Token]) -> LockResult<()> {
        let released = self
            .with_retries("release", move || self.try_release(tokens))
            .await?;
        debug!(requested = tokens.len(), released = released, "Tokens released");
        Ok(())
    }

    async fn all_locks(&self) -> LockResult<Vec<LockInfo>> {
        let rows = self
            .with_retries("all_locks", move || self.try_all_locks())
            .await?;
        Ok(self.group_locks(rows))
    }
}
