//! Behaviour every token service implementation must share
//!
//! Each check runs against the in-process service and against the database
//! backed service, through `Arc<dyn TokenService>` the way callers use them.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokenlock_core::config::Config;
use tokenlock_core::domain::locking::{
    EphemeralTokenService, LockBackend, LockContext, ObjectRef, ObjectResolver,
    PersistentTokenService, StaticCaller, StoreInvalidation, Token, TokenKind, TokenService,
    TokenServiceConfig, build_token_service,
};
use tokenlock_core::storage::Database;
use uuid::Uuid;

fn order() -> ObjectRef {
    ObjectRef::new("Order", "o-17")
}

fn person(name: &str) -> ObjectRef {
    ObjectRef::new("Person", name)
}

fn caller(name: &str) -> LockContext {
    LockContext::default().with_caller(StaticCaller::new(person(name)))
}

fn in_a_minute() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(60)
}

type Handles = (&'static str, Arc<dyn TokenService>, Arc<dyn TokenService>);

/// Two handles on the same lock state, acting for alice and bob
async fn services() -> Vec<Handles> {
    let ephemeral = EphemeralTokenService::new(TokenServiceConfig::default(), caller("alice"));
    let ephemeral_bob: Arc<dyn TokenService> = Arc::new(ephemeral.with_context(caller("bob")));
    let ephemeral: Arc<dyn TokenService> = Arc::new(ephemeral);

    let db = Database::in_memory()
        .await
        .expect("Failed to create database");
    let persistent =
        PersistentTokenService::new(&db, TokenServiceConfig::default(), caller("alice"));
    let persistent_bob: Arc<dyn TokenService> = Arc::new(persistent.with_context(caller("bob")));
    let persistent: Arc<dyn TokenService> = Arc::new(persistent);

    vec![
        ("ephemeral", ephemeral, ephemeral_bob),
        ("persistent", persistent, persistent_bob),
    ]
}

#[tokio::test]
async fn test_exclusive_token_blocks_other_owner() {
    for (name, alice, bob) in services().await {
        let mut t1 = vec![Token::exclusive_on(order(), "editValues")];
        alice.acquire(in_a_minute(), &mut t1).await.unwrap();
        assert!(alice.all_valid(&t1).await.unwrap(), "{}", name);

        let mut t2 = vec![Token::exclusive_on(order(), "editValues")];
        let err = bob.acquire(in_a_minute(), &mut t2).await.unwrap_err();
        assert!(err.is_conflict(), "{}", name);
        assert_eq!(err.code(), "E301", "{}", name);
    }
}

#[tokio::test]
async fn test_shared_tokens_from_different_owners_coexist() {
    for (name, alice, bob) in services().await {
        let mut s1 = vec![Token::shared_on(order(), "read")];
        let mut s2 = vec![Token::shared_on(order(), "read")];
        alice.acquire(in_a_minute(), &mut s1).await.unwrap();
        bob.acquire(in_a_minute(), &mut s2).await.unwrap();

        let locks = alice.all_locks().await.unwrap();
        assert_eq!(locks.len(), 2, "{}", name);
        let owners: Vec<_> = locks.iter().filter_map(|lock| lock.owner.clone()).collect();
        assert!(owners.contains(&person("alice")), "{}", name);
        assert!(owners.contains(&person("bob")), "{}", name);
    }
}

#[tokio::test]
async fn test_exclusive_and_shared_never_coexist() {
    for (name, alice, bob) in services().await {
        let mut shared = vec![Token::shared(order())];
        alice.acquire(in_a_minute(), &mut shared).await.unwrap();

        let mut exclusive = vec![Token::exclusive(order())];
        assert!(bob.acquire(in_a_minute(), &mut exclusive).await.is_err(), "{}", name);

        alice.release(&shared).await.unwrap();
        bob.acquire(in_a_minute(), &mut exclusive).await.unwrap();

        let mut late = vec![Token::shared(order())];
        assert!(alice.acquire(in_a_minute(), &mut late).await.is_err(), "{}", name);
    }
}

#[tokio::test]
async fn test_expired_token_gives_way() {
    for (name, alice, bob) in services().await {
        let mut t1 = vec![Token::exclusive_on(order(), "editValues")];
        alice
            .acquire(Utc::now() + Duration::milliseconds(50), &mut t1)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut t2 = vec![Token::exclusive_on(order(), "editValues")];
        bob.acquire(in_a_minute(), &mut t2).await.unwrap();
        assert!(!alice.all_valid(&t1).await.unwrap(), "{}", name);
        assert!(bob.all_valid(&t2).await.unwrap(), "{}", name);
    }
}

#[tokio::test]
async fn test_untouched_expired_lock_is_still_listed() {
    for (name, alice, _) in services().await {
        let mut stale = vec![Token::exclusive_on(order(), "a")];
        alice
            .acquire(Utc::now() - Duration::seconds(1), &mut stale)
            .await
            .unwrap();

        assert!(!alice.all_valid(&stale).await.unwrap(), "{}", name);
        let locks = alice.all_locks().await.unwrap();
        assert_eq!(locks.len(), 1, "{}", name);
        assert!(locks[0].is_expired(), "{}", name);
    }
}

#[tokio::test]
async fn test_release_of_unknown_token_is_silent() {
    for (name, alice, _) in services().await {
        let unknown = Token::restore(TokenKind::Shared, Some(order()), "read", Uuid::new_v4());
        alice.release(&[unknown.clone()]).await.unwrap();
        alice.release(&[Token::shared(order())]).await.unwrap();
        assert!(!alice.all_valid(&[unknown]).await.unwrap(), "{}", name);
    }
}

#[tokio::test]
async fn test_release_then_reacquire_succeeds() {
    for (name, alice, bob) in services().await {
        let mut held = vec![Token::exclusive(order()), Token::global("maintenance")];
        alice.acquire(in_a_minute(), &mut held).await.unwrap();
        alice.release(&held).await.unwrap();

        let mut again = vec![Token::exclusive(order()), Token::global("maintenance")];
        bob.acquire(in_a_minute(), &mut again).await.unwrap();
        assert_eq!(bob.all_locks().await.unwrap().len(), 1, "{}", name);
    }
}

#[tokio::test]
async fn test_renew_releases_whole_batch_on_failure() {
    for (name, alice, _) in services().await {
        let mut live = vec![Token::exclusive_on(order(), "a")];
        alice.acquire(in_a_minute(), &mut live).await.unwrap();
        let mut dead = vec![Token::exclusive_on(order(), "b")];
        alice
            .acquire(Utc::now() - Duration::seconds(1), &mut dead)
            .await
            .unwrap();

        let batch = [live[0].clone(), dead[0].clone()];
        assert!(!alice.renew(in_a_minute(), &batch).await.unwrap(), "{}", name);
        assert!(!alice.all_valid(&live).await.unwrap(), "{}", name);
        assert!(alice.all_locks().await.unwrap().is_empty(), "{}", name);

        let mut fresh = vec![Token::exclusive_on(order(), "a")];
        alice.acquire(in_a_minute(), &mut fresh).await.unwrap();
        assert!(alice.renew(in_a_minute(), &fresh).await.unwrap(), "{}", name);
    }
}

#[tokio::test]
async fn test_tokens_survive_a_json_round_trip() {
    for (name, alice, _) in services().await {
        let mut tokens = vec![Token::shared_on(order(), "read")];
        alice.acquire(in_a_minute(), &mut tokens).await.unwrap();

        let json = serde_json::to_string(&tokens).unwrap();
        let restored: Vec<Token> = serde_json::from_str(&json).unwrap();

        assert!(alice.all_valid(&restored).await.unwrap(), "{}", name);
        alice.release(&restored).await.unwrap();
        assert!(!alice.all_valid(&tokens).await.unwrap(), "{}", name);
    }
}

struct Directory;

impl ObjectResolver for Directory {
    fn display_name(&self, object: &ObjectRef) -> Option<String> {
        (object.type_name == "Person").then(|| object.id.to_uppercase())
    }
}

#[derive(Default)]
struct Invalidations(AtomicUsize);

impl StoreInvalidation for Invalidations {
    fn invalidate(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_persistent_acquire_invalidates_store_and_resolves_owner() {
    let invalidations = Arc::new(Invalidations::default());
    let db = Database::in_memory().await.unwrap();
    let service = PersistentTokenService::new(
        &db,
        TokenServiceConfig::default(),
        caller("alice")
            .with_resolver(Arc::new(Directory))
            .with_invalidation(invalidations.clone()),
    );

    let mut tokens = vec![Token::exclusive(order())];
    service.acquire(in_a_minute(), &mut tokens).await.unwrap();
    assert_eq!(invalidations.0.load(Ordering::SeqCst), 1);

    let mut conflicting = vec![Token::exclusive(order())];
    assert!(service.acquire(in_a_minute(), &mut conflicting).await.is_err());
    assert_eq!(invalidations.0.load(Ordering::SeqCst), 1);

    let locks = service.all_locks().await.unwrap();
    assert_eq!(locks[0].owner_name.as_deref(), Some("ALICE"));
}

#[tokio::test]
async fn test_build_token_service_from_config_file_settings() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.set("locking.backend", "persistent").unwrap();
    config
        .set("database.path", &temp.path().join("locks.db").display().to_string())
        .unwrap();

    let first = build_token_service(&config, caller("alice")).await.unwrap();
    let second = build_token_service(&config, caller("bob")).await.unwrap();

    let mut tokens = vec![Token::exclusive(order())];
    first.acquire(in_a_minute(), &mut tokens).await.unwrap();

    // Two services on one database see each other's locks
    let mut wanted = vec![Token::exclusive(order())];
    assert!(second.acquire(in_a_minute(), &mut wanted).await.is_err());

    config.locking.backend = LockBackend::Ephemeral;
    let isolated = build_token_service(&config, caller("carol")).await.unwrap();
    isolated.acquire(in_a_minute(), &mut wanted).await.unwrap();
}
