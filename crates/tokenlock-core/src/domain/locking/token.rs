//! Lock tokens and the keys they compete on
//!
//! A [`Token`] is a request for (and, once acquired, a grant of) exclusive or
//! shared access to one aspect of one business object. Tokens compete with
//! each other when their [`Key`]s are equal; the kind of the token does not
//! take part in the key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Aspect name used when the caller does not name one
pub const DEFAULT_ASPECT: &str = "default";

/// Branch that object references live on unless stated otherwise
pub const TRUNK_BRANCH: i64 = 1;

/// Reference to a business object by its raw (branch, id, type) triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Branch the object lives on
    pub branch: i64,
    /// Object identifier within its type
    pub id: String,
    /// Name of the object's type
    pub type_name: String,
}

impl ObjectRef {
    /// Reference an object on the trunk branch
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            branch: TRUNK_BRANCH,
            id: id.into(),
            type_name: type_name.into(),
        }
    }

    /// Move the reference to another branch
    pub fn on_branch(mut self, branch: i64) -> Self {
        self.branch = branch;
        self
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.type_name, self.id, self.branch)
    }
}

/// Error parsing an [`ObjectRef`] from its `TYPE:ID[@BRANCH]` form
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid object reference '{0}': expected TYPE:ID[@BRANCH]")]
pub struct ParseObjectRefError(String);

impl FromStr for ObjectRef {
    type Err = ParseObjectRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseObjectRefError(s.to_string());

        let (type_name, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (id, branch) = match rest.rsplit_once('@') {
            Some((id, branch)) => (id, branch.parse::<i64>().map_err(|_| invalid())?),
            None => (rest, TRUNK_BRANCH),
        };

        if type_name.is_empty() || id.is_empty() {
            return Err(invalid());
        }

        Ok(ObjectRef::new(type_name, id).on_branch(branch))
    }
}

/// Kind of access a token grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Sole access; excludes every other token on the same key
    Exclusive,
    /// Access shared with other shared tokens on the same key
    Shared,
}

impl TokenKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
        }
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exclusive" => Some(Self::Exclusive),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive)
    }

    /// Two requests on the same key conflict iff either of them is exclusive
    pub fn conflicts_with(&self, other: TokenKind) -> bool {
        self.is_exclusive() || other.is_exclusive()
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity under which tokens compete: a target plus an aspect name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    target: Option<ObjectRef>,
    aspect: String,
}

impl Key {
    pub fn new(target: Option<ObjectRef>, aspect: impl Into<String>) -> Self {
        Self {
            target,
            aspect: aspect.into(),
        }
    }

    /// The locked object, `None` for a system-global lock
    pub fn target(&self) -> Option<&ObjectRef> {
        self.target.as_ref()
    }

    pub fn aspect(&self) -> &str {
        &self.aspect
    }

    /// Canonical, collision-free string form used as the database key
    ///
    /// Variable-length parts are length-prefixed so that no choice of type
    /// name, id or aspect can make two different keys render the same.
    pub fn storage_key(&self) -> String {
        match &self.target {
            None => format!("g/{}", self.aspect),
            Some(target) => format!(
                "o/{}/{}:{}/{}:{}/{}",
                target.branch,
                target.type_name.len(),
                target.type_name,
                target.id.len(),
                target.id,
                self.aspect
            ),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} on {}", self.aspect, target),
            None => write!(f, "{} (global)", self.aspect),
        }
    }
}

/// A lock request that becomes a lock grant once acquired
///
/// Equality compares kind, target and aspect only. The id is assigned by the
/// token service on acquisition and merely identifies the grant for later
/// renewal and release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "TokenRecord", into = "TokenRecord")]
pub struct Token {
    kind: TokenKind,
    key: Key,
    id: Option<Uuid>,
}

impl Token {
    /// Create a token for the given kind, target and aspect
    ///
    /// # Panics
    ///
    /// Panics if `target` is `None` and `aspect` is [`DEFAULT_ASPECT`]: an
    /// unscoped global lock is always a programming error.
    pub fn new(kind: TokenKind, target: Option<ObjectRef>, aspect: impl Into<String>) -> Self {
        let aspect = aspect.into();
        assert!(
            !(target.is_none() && aspect == DEFAULT_ASPECT),
            "a global token must name an aspect other than '{DEFAULT_ASPECT}'"
        );

        Self {
            kind,
            key: Key::new(target, aspect),
            id: None,
        }
    }

    /// Exclusive system-global token
    pub fn global(aspect: impl Into<String>) -> Self {
        Self::new(TokenKind::Exclusive, None, aspect)
    }

    /// Exclusive token on the default aspect of `target`
    pub fn exclusive(target: ObjectRef) -> Self {
        Self::new(TokenKind::Exclusive, Some(target), DEFAULT_ASPECT)
    }

    /// Exclusive token on a named aspect of `target`
    pub fn exclusive_on(target: ObjectRef, aspect: impl Into<String>) -> Self {
        Self::new(TokenKind::Exclusive, Some(target), aspect)
    }

    /// Shared token on the default aspect of `target`
    pub fn shared(target: ObjectRef) -> Self {
        Self::new(TokenKind::Shared, Some(target), DEFAULT_ASPECT)
    }

    /// Shared token on a named aspect of `target`
    pub fn shared_on(target: ObjectRef, aspect: impl Into<String>) -> Self {
        Self::new(TokenKind::Shared, Some(target), aspect)
    }

    /// Rebuild a token that was handed out by a token service earlier
    pub fn restore(
        kind: TokenKind,
        target: Option<ObjectRef>,
        aspect: impl Into<String>,
        id: Uuid,
    ) -> Self {
        let mut token = Self::new(kind, target, aspect);
        token.id = Some(id);
        token
    }

    /// Rebuild a token from stored parts that were validated when the token
    /// was first created
    pub(crate) fn from_stored(
        kind: TokenKind,
        target: Option<ObjectRef>,
        aspect: String,
        id: Uuid,
    ) -> Self {
        Self {
            kind,
            key: Key::new(target, aspect),
            id: Some(id),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn is_exclusive(&self) -> bool {
        self.kind.is_exclusive()
    }

    pub fn target(&self) -> Option<&ObjectRef> {
        self.key.target()
    }

    pub fn aspect(&self) -> &str {
        self.key.aspect()
    }

    /// Id assigned on acquisition, `None` before
    pub fn id(&self) -> Option<Uuid> {
        self.id
    }

    /// The kind-independent identity this token competes on
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub(crate) fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.key == other.key
    }
}

impl Eq for Token {}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Wire form of a token; deserialization re-checks the global-aspect rule
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<ObjectRef>,
    aspect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
}

impl TryFrom<TokenRecord> for Token {
    type Error = String;

    fn try_from(record: TokenRecord) -> Result<Self, Self::Error> {
        if record.target.is_none() && record.aspect == DEFAULT_ASPECT {
            return Err(format!(
                "a global token must name an aspect other than '{DEFAULT_ASPECT}'"
            ));
        }

        Ok(Token {
            kind: record.kind,
            key: Key::new(record.target, record.aspect),
            id: record.id,
        })
    }
}

impl From<Token> for TokenRecord {
    fn from(token: Token) -> Self {
        TokenRecord {
            kind: token.kind,
            target: token.key.target,
            aspect: token.key.aspect,
            id: token.id,
        }
    }
}
