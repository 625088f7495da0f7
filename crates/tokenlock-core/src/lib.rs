//! Tokenlock Core Library
//!
//! This crate provides the core functionality for Tokenlock, including:
//! - The lock token model (tokens, keys, target references)
//! - The `TokenService` contract
//! - An in-process token service for single-node deployments
//! - A database-backed token service for clustered deployments
//! - Storage (SQLite pool + schema migrations)
//! - Configuration persisted as TOML

pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::locking::{
        LockError, LockInfo, LockResult, ObjectRef, Token, TokenKind, TokenService,
    };
    pub use crate::error::{Error, Result};
}
