//! Lock types and error definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::token::{Key, ObjectRef, Token};

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// A requested token collides with a token somebody else holds
    #[error("{0}")]
    Conflict(LockConflict),

    /// The lock store kept failing until the retry budget ran out
    #[error("Lock storage unavailable after {attempts} attempt(s): {message}")]
    Storage { attempts: u32, message: String },
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "E301",
            Self::Storage { .. } => "E306",
        }
    }

    /// Whether this error is a lock conflict (as opposed to a storage failure)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// The current holder of a contended key, as far as it may be revealed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// Principal holding the lock
    pub owner: Option<ObjectRef>,
    /// Expiry of the holder's token
    pub expires_at: DateTime<Utc>,
    /// Cluster node the holder acquired the lock on
    pub cluster_node: Option<i64>,
}

/// A failed acquisition
///
/// Carries the holder only if the service was configured to report lock
/// owner details; otherwise the message stays generic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub key: Key,
    pub holder: Option<LockHolder>,
}

impl fmt::Display for LockConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock conflict: '{}' is already locked", self.key)?;

        if let Some(holder) = &self.holder {
            match &holder.owner {
                Some(owner) => write!(f, " by {}", owner)?,
                None => write!(f, " by an anonymous holder")?,
            }
            write!(f, " until {}", holder.expires_at.to_rfc3339())?;
            if let Some(node) = holder.cluster_node {
                write!(f, " (cluster node {})", node)?;
            }
        }

        Ok(())
    }
}

/// Information about one lock, that is the tokens granted by one `acquire`
/// call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Principal that acquired the tokens
    pub owner: Option<ObjectRef>,

    /// Human readable name of the owner, if the resolver knows one
    pub owner_name: Option<String>,

    /// Earliest expiry among the tokens
    pub timeout: DateTime<Utc>,

    /// Name of the operation that acquired the tokens
    pub operation: Option<String>,

    /// Cluster node the tokens were acquired on
    pub cluster_node: Option<i64>,

    /// The granted tokens, ids included
    pub tokens: Vec<Token>,
}

impl LockInfo {
    /// Check if the earliest token of the lock is expired
    pub fn is_expired(&self) -> bool {
        self.timeout <= Utc::now()
    }
}

/// Which token service implementation to construct at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// In-process, in-memory locks
    #[default]
    Ephemeral,
    /// Cluster-wide locks in the database
    Persistent,
}

impl LockBackend {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Persistent => "persistent",
        }
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ephemeral" => Some(Self::Ephemeral),
            "persistent" => Some(Self::Persistent),
            _ => None,
        }
    }
}

impl fmt::Display for LockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Policy shared by all token service implementations
#[derive(Debug, Clone, Default)]
pub struct TokenServiceConfig {
    /// Name the current holder, its timeout and node in conflict errors
    pub report_lock_owner_details: bool,
}

impl TokenServiceConfig {
    /// Enable or disable owner details in conflict errors
    pub fn with_owner_details(mut self, report: bool) -> Self {
        self.report_lock_owner_details = report;
        self
    }

    /// Build the conflict error for `key`
    ///
    /// `holder` is only evaluated when owner details are reported.
    pub fn conflict(&self, key: &Key, holder: impl FnOnce() -> Option<LockHolder>) -> LockError {
        let holder = if self.report_lock_owner_details {
            holder()
        } else {
            None
        };

        LockError::Conflict(LockConflict {
            key: key.clone(),
            holder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::new(Some(ObjectRef::new("Order", "o-1")), "editValues")
    }

    fn holder() -> LockHolder {
        LockHolder {
            owner: Some(ObjectRef::new("Person", "alice")),
            expires_at: Utc::now(),
            cluster_node: Some(3),
        }
    }

    #[test]
    fn test_generic_conflict_hides_owner() {
        let config = TokenServiceConfig::default();
        let err = config.conflict(&key(), || panic!("holder must not be looked up"));

        let message = err.to_string();
        assert!(message.contains("editValues on Order:o-1@1"));
        assert!(!message.contains("alice"));
        assert_eq!(err.code(), "E301");
        assert!(err.is_conflict());
    }

    #[test]
    fn test_detailed_conflict_names_owner_and_node() {
        let config = TokenServiceConfig::default().with_owner_details(true);
        let err = config.conflict(&key(), || Some(holder()));

        let message = err.to_string();
        assert!(message.contains("Person:alice@1"));
        assert!(message.contains("cluster node 3"));
    }

    #[test]
    fn test_storage_error() {
        let err = LockError::Storage {
            attempts: 3,
            message: "database is locked".to_string(),
        };

        assert_eq!(err.code(), "E306");
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn test_lock_backend_round_trip_names() {
        for backend in [LockBackend::Ephemeral, LockBackend::Persistent] {
            assert_eq!(LockBackend::parse(backend.as_str()), Some(backend));
        }
        assert_eq!(LockBackend::parse("redis"), None);
        assert_eq!(LockBackend::default(), LockBackend::Ephemeral);
    }
}
