//! In-process token service
//!
//! Keeps every lock slot in one map guarded by a single mutex. Suitable for
//! single-node deployments: the locks vanish with the process and are not
//! visible to other processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::LockContext;
use super::service::TokenService;
use super::token::{Key, ObjectRef, Token, TokenKind};
use super::types::{LockHolder, LockInfo, LockResult, TokenServiceConfig};

/// Token service holding its locks in process memory
#[derive(Debug, Clone)]
pub struct EphemeralTokenService {
    /// Conflict reporting policy
    config: TokenServiceConfig,

    /// Caller, cluster and display collaborators
    context: LockContext,

    /// Lock slots, shared between clones
    table: Arc<Mutex<SlotTable>>,
}

/// All lock slots of one service plus the batch counter
#[derive(Debug, Default)]
struct SlotTable {
    /// Id of the most recent `acquire` call
    last_batch: u64,

    slots: HashMap<Key, Semaphore>,
}

/// The tokens currently granted on one key, all of the same kind
#[derive(Debug)]
struct Semaphore {
    kind: TokenKind,
    holders: Vec<TokenRef>,
}

/// One granted token with its bookkeeping
#[derive(Debug, Clone)]
struct TokenRef {
    token: Token,
    expires_at: DateTime<Utc>,
    owner: Option<ObjectRef>,
    operation: Option<String>,
    batch: u64,
    /// Position of the token within its `acquire` call
    seq: usize,
}

impl TokenRef {
    fn id(&self) -> Option<Uuid> {
        self.token.id()
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl Semaphore {
    fn new(kind: TokenKind) -> Self {
        Self {
            kind,
            holders: Vec::new(),
        }
    }

    /// Drop every expired holder, returning how many were dropped
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.holders.len();
        self.holders.retain(|holder| holder.is_live(now));
        before - self.holders.len()
    }

    fn find(&self, id: Uuid) -> Option<&TokenRef> {
        self.holders.iter().find(|holder| holder.id() == Some(id))
    }

    fn find_mut(&mut self, id: Uuid) -> Option<&mut TokenRef> {
        self.holders.iter_mut().find(|holder| holder.id() == Some(id))
    }

    fn remove(&mut self, id: Uuid) -> bool {
        let before = self.holders.len();
        self.holders.retain(|holder| holder.id() != Some(id));
        before != self.holders.len()
    }
}

impl SlotTable {
    fn next_batch(&mut self) -> u64 {
        self.last_batch += 1;
        self.last_batch
    }

    /// Grant `token` on its key, or report the conflict
    fn grant(
        &mut self,
        token: &Token,
        grant: TokenRef,
        now: DateTime<Utc>,
        config: &TokenServiceConfig,
    ) -> LockResult<Uuid> {
        let key = token.key();
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Semaphore::new(token.kind()));

        let swept = slot.sweep(now);
        if swept > 0 {
            debug!(key = %key, swept = swept, "Dropped expired tokens");
        }

        if !slot.holders.is_empty() && slot.kind.conflicts_with(token.kind()) {
            return Err(config.conflict(key, || {
                slot.holders.first().map(|holder| LockHolder {
                    owner: holder.owner.clone(),
                    expires_at: holder.expires_at,
                    cluster_node: None,
                })
            }));
        }

        if slot.holders.is_empty() {
            slot.kind = token.kind();
        }

        let id = Uuid::new_v4();
        let mut grant = grant;
        grant.token.assign_id(id);
        slot.holders.push(grant);

        debug!(key = %key, kind = %token.kind(), token_id = %id, "Token granted");
        Ok(id)
    }

    /// Look up the live grant for `token`
    fn live(&self, token: &Token, now: DateTime<Utc>) -> Option<&TokenRef> {
        let id = token.id()?;
        self.slots
            .get(token.key())
            .and_then(|slot| slot.find(id))
            .filter(|holder| holder.is_live(now))
    }

    /// Remove the grant with `id` from `key`, dropping the slot once empty
    fn revoke(&mut self, key: &Key, id: Uuid) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };

        let removed = slot.remove(id);
        if slot.holders.is_empty() {
            self.slots.remove(key);
        }
        removed
    }

    fn release_all(&mut self, tokens: &[Token]) -> usize {
        let mut released = 0;
        for token in tokens {
            if let Some(id) = token.id() {
                if self.revoke(token.key(), id) {
                    released += 1;
                }
            }
        }
        released
    }
}

impl EphemeralTokenService {
    /// Create a new in-process token service
    pub fn new(config: TokenServiceConfig, context: LockContext) -> Self {
        Self {
            config,
            context,
            table: Arc::new(Mutex::new(SlotTable::default())),
        }
    }

    /// Create a service with default policy and an anonymous caller
    pub fn with_defaults() -> Self {
        Self::new(TokenServiceConfig::default(), LockContext::default())
    }

    /// A handle on the same locks acting for a different caller
    pub fn with_context(&self, context: LockContext) -> Self {
        Self {
            config: self.config.clone(),
            context,
            table: self.table.clone(),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &TokenServiceConfig {
        &self.config
    }
}

#[async_trait]
impl TokenService for EphemeralTokenService {
    async fn acquire(&self, expire_date: DateTime<Utc>, tokens: &mut [Token]) -> LockResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let owner = self.context.principal();
        let operation = self.context.operation();

        let mut table = self.table.lock().await;
        let batch = table.next_batch();

        let mut granted: Vec<Uuid> = Vec::with_capacity(tokens.len());
        for (seq, token) in tokens.iter().enumerate() {
            let grant = TokenRef {
                token: token.clone(),
                expires_at: expire_date,
                owner: owner.clone(),
                operation: operation.clone(),
                batch,
                seq,
            };

            match table.grant(token, grant, now, &self.config) {
                Ok(id) => granted.push(id),
                Err(err) => {
                    // Nobody can have seen the partial grant, the mutex is still held
                    for (earlier, id) in tokens.iter().zip(&granted) {
                        table.revoke(earlier.key(), *id);
                    }
                    warn!(key = %token.key(), batch = batch, "Lock conflict");
                    return Err(err);
                }
            }
        }
        drop(table);

        for (token, id) in tokens.iter_mut().zip(granted) {
            token.assign_id(id);
        }

        info!(
            batch = batch,
            tokens = tokens.len(),
            expires_at = %expire_date,
            "Tokens acquired"
        );
        Ok(())
    }

    async fn all_valid(&self, tokens: &[Token]) -> LockResult<bool> {
        let now = Utc::now();
        let table = self.table.lock().await;
        Ok(tokens.iter().all(|token| table.live(token, now).is_some()))
    }

    async fn renew(&self, expire_date: DateTime<Utc>, tokens: &[Token]) -> LockResult<bool> {
        let now = Utc::now();
        let mut table = self.table.lock().await;

        if !tokens.iter().all(|token| table.live(token, now).is_some()) {
            let released = table.release_all(tokens);
            info!(released = released, "Renewal failed, released token batch");
            return Ok(false);
        }

        for token in tokens {
            let holder = token.id().and_then(|id| {
                table
                    .slots
                    .get_mut(token.key())
                    .and_then(|slot| slot.find_mut(id))
            });
            if let Some(holder) = holder {
                holder.expires_at = expire_date;
            }
        }

        debug!(tokens = tokens.len(), expires_at = %expire_date, "Tokens renewed");
        Ok(true)
    }

    async fn release(&self, tokens: &[Token]) -> LockResult<()> {
        let mut table = self.table.lock().await;
        let released = table.release_all(tokens);
        debug!(requested = tokens.len(), released = released, "Tokens released");
        Ok(())
    }

    async fn all_locks(&self) -> LockResult<Vec<LockInfo>> {
        let table = self.table.lock().await;

        let mut batches: BTreeMap<u64, Vec<&TokenRef>> = BTreeMap::new();
        for holder in table.slots.values().flat_map(|slot| &slot.holders) {
            batches.entry(holder.batch).or_default().push(holder);
        }

        let locks = batches
            .into_values()
            .filter_map(|mut holders| {
                holders.sort_by_key(|holder| holder.seq);

                let timeout = holders.iter().map(|holder| holder.expires_at).min()?;
                let owner = holders.iter().find_map(|holder| holder.owner.clone());
                let operation = holders.iter().find_map(|holder| holder.operation.clone());

                Some(LockInfo {
                    owner_name: self.context.owner_name(owner.as_ref()),
                    owner,
                    timeout,
                    operation,
                    cluster_node: None,
                    tokens: holders.into_iter().map(|holder| holder.token.clone()).collect(),
                })
            })
            .collect();

        Ok(locks)
    }
}
