//! Token-based locking of business objects
//!
//! This module hands out expiring lock tokens that let independent callers
//! coordinate access to an aspect of a business object, or to a named
//! system-global resource.
//!
//! # Architecture
//!
//! - **Tokens**: `Token`, `Key`, `ObjectRef` - what is requested and what competes
//! - **Service**: `TokenService` - acquire, check, renew, release, list
//! - **Implementations**: `EphemeralTokenService` (in-process) and
//!   `PersistentTokenService` (shared by every node on one database)
//! - **Context**: `LockContext` - caller, cluster node and display collaborators
//!
//! # Semantics
//!
//! - Two tokens on the same key conflict iff at least one is exclusive
//! - `acquire` grants all requested tokens or none
//! - Expiry is enforced lazily, when the key is touched again
//! - A renewal that finds any token gone releases the whole batch
//!
//! # Example
//!
//! ```ignore
//! use tokenlock_core::domain::locking::{EphemeralTokenService, ObjectRef, Token, TokenService};
//! use std::time::Duration;
//!
//! let service = EphemeralTokenService::with_defaults();
//! let order = ObjectRef::new("Order", "o-17");
//!
//! let mut tokens = vec![Token::exclusive_on(order, "editValues")];
//! service.acquire_for(Duration::from_secs(60), &mut tokens).await?;
//!
//! // ... edit the order ...
//!
//! service.release(&tokens).await?;
//! ```

pub mod context;
pub mod ephemeral;
pub mod persistent;
pub mod service;
pub mod token;
pub mod types;

// Re-export main types
pub use context::{
    CallerContext, ClusterMembership, LockContext, ObjectResolver, StaticCaller, StaticNode,
    StoreInvalidation,
};
pub use ephemeral::EphemeralTokenService;
pub use persistent::PersistentTokenService;
pub use service::{TokenService, build_token_service, expiry_after};
pub use token::{DEFAULT_ASPECT, Key, ObjectRef, ParseObjectRefError, TRUNK_BRANCH, Token, TokenKind};
pub use types::{
    LockBackend, LockConflict, LockError, LockHolder, LockInfo, LockResult, TokenServiceConfig,
};
