//! The token service contract and its construction from configuration

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::context::{LockContext, StaticNode};
use super::ephemeral::EphemeralTokenService;
use super::persistent::PersistentTokenService;
use super::token::Token;
use super::types::{LockBackend, LockInfo, LockResult, TokenServiceConfig};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::{Database, DatabaseConfig};

/// Grants, checks, renews and releases lock tokens
///
/// Tokens on the same key conflict iff at least one of them is exclusive.
/// Every granted token carries an absolute expiry; expired tokens are treated
/// as released but are only cleaned up when their key is touched again.
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Acquire all `tokens` until `expire_date`
    ///
    /// Either every token is granted and gets its id assigned, or none is and
    /// the first conflict is returned.
    async fn acquire(&self, expire_date: DateTime<Utc>, tokens: &mut [Token]) -> LockResult<()>;

    /// Whether every token is still held and not expired
    async fn all_valid(&self, tokens: &[Token]) -> LockResult<bool>;

    /// Move the expiry of all `tokens` to `expire_date`
    ///
    /// Returns `false` if any token was no longer held; the whole batch is
    /// released in that case.
    async fn renew(&self, expire_date: DateTime<Utc>, tokens: &[Token]) -> LockResult<bool>;

    /// Release `tokens`; unknown and expired tokens are ignored
    async fn release(&self, tokens: &[Token]) -> LockResult<()>;

    /// Snapshot of all locks, one entry per `acquire` call
    async fn all_locks(&self) -> LockResult<Vec<LockInfo>>;

    /// Acquire `tokens` for `ttl` from now
    ///
    /// A `ttl` reaching past the last representable instant never expires.
    async fn acquire_for(&self, ttl: Duration, tokens: &mut [Token]) -> LockResult<()> {
        let expire_date = expiry_after(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.acquire(expire_date, tokens).await
    }
}

/// The absolute expiry `ttl` from now, if it is representable
pub fn expiry_after(ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    Utc::now().checked_add_signed(ttl)
}

/// Build the token service selected by `config`
///
/// The persistent backend opens the configured database (running pending
/// migrations); the cluster node id from the configuration is installed
/// unless `context` already carries one. An invalid configuration fails with
/// [`Error::ConfigError`], an unusable database with [`Error::DatabaseError`].
pub async fn build_token_service(
    config: &Config,
    context: LockContext,
) -> Result<Arc<dyn TokenService>> {
    config
        .validate()
        .map_err(|err| Error::ConfigError(format!("{:#}", err)))?;

    let policy =
        TokenServiceConfig::default().with_owner_details(config.locking.report_lock_owner_details);

    let context = match (context.node_id(), config.cluster.node_id) {
        (None, Some(node)) => context.with_cluster(StaticNode(Some(node))),
        _ => context,
    };

    info!(backend = %config.locking.backend, "Starting token service");

    let service: Arc<dyn TokenService> = match config.locking.backend {
        LockBackend::Ephemeral => Arc::new(EphemeralTokenService::new(policy, context)),
        LockBackend::Persistent => {
            let db = Database::new(DatabaseConfig::from_settings(&config.database))
                .await
                .map_err(|err| Error::DatabaseError(format!("{:#}", err)))?;
            Arc::new(PersistentTokenService::new(&db, policy, context))
        }
    };

    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::token::ObjectRef;
    use tempfile::TempDir;

    #[test]
    fn test_expiry_after_is_in_the_future() {
        let before = Utc::now();
        let expiry = expiry_after(Duration::from_secs(60)).unwrap();
        assert!(expiry >= before + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_expiry_after_rejects_unrepresentable_ttl() {
        assert!(expiry_after(Duration::from_secs(u64::MAX)).is_none());
        assert!(expiry_after(Duration::from_secs(10_000_000_000_000)).is_none());
    }

    #[tokio::test]
    async fn test_acquire_for_huge_ttl_never_expires() {
        let service = build_token_service(&Config::default(), LockContext::default())
            .await
            .expect("Failed to build service");

        let mut tokens = vec![Token::exclusive(ObjectRef::new("Order", "1"))];
        service
            .acquire_for(Duration::from_secs(u64::MAX), &mut tokens)
            .await
            .unwrap();

        assert!(service.all_valid(&tokens).await.unwrap());
        let locks = service.all_locks().await.unwrap();
        assert_eq!(locks[0].timeout, DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_build_ephemeral_service() {
        let service = build_token_service(&Config::default(), LockContext::default())
            .await
            .expect("Failed to build service");

        let mut tokens = vec![Token::exclusive(ObjectRef::new("Order", "1"))];
        service
            .acquire_for(Duration::from_secs(60), &mut tokens)
            .await
            .unwrap();
        assert!(service.all_valid(&tokens).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.database.retry_count = 0;

        let err = build_token_service(&config, LockContext::default())
            .await
            .err()
            .expect("Invalid config was accepted");
        assert_eq!(err.code(), "E600");
        assert!(err.to_string().contains("retry_count"));
    }

    #[tokio::test]
    async fn test_build_reports_unusable_database() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let mut config = Config::default();
        config.locking.backend = LockBackend::Persistent;
        config.database.path = Some(blocker.join("locks.db"));

        let err = build_token_service(&config, LockContext::default())
            .await
            .err()
            .expect("Database under a file was opened");
        assert_eq!(err.code(), "E400");
        assert_eq!(err.suggestion().as_deref(), Some("tokenlock doctor"));
    }

    #[tokio::test]
    async fn test_build_persistent_service() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let mut config = Config::default();
        config.locking.backend = LockBackend::Persistent;
        config.locking.report_lock_owner_details = true;
        config.database.path = Some(temp.path().join("locks.db"));
        config.cluster.node_id = Some(7);

        let service = build_token_service(&config, LockContext::default())
            .await
            .expect("Failed to build service");

        let mut tokens = vec![Token::global("maintenance")];
        service
            .acquire_for(Duration::from_secs(60), &mut tokens)
            .await
            .unwrap();

        let locks = service.all_locks().await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].cluster_node, Some(7));

        let mut again = vec![Token::global("maintenance")];
        let err = service
            .acquire_for(Duration::from_secs(60), &mut again)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cluster node 7"));
    }
}
