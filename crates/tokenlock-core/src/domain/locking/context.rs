//! Collaborators the token services consume
//!
//! The services do not know how a request is authenticated, how the cluster
//! is organized, or how raw object references map to domain objects. Those
//! answers are supplied through the traits in this module, bundled into a
//! [`LockContext`] at construction time.

use std::fmt;
use std::sync::Arc;

use super::token::ObjectRef;

/// Supplies the principal and operation on whose behalf locks are taken
pub trait CallerContext: Send + Sync {
    /// The principal of the current request, `None` if anonymous
    fn current_principal(&self) -> Option<ObjectRef>;

    /// Name of the operation currently being executed
    fn current_operation(&self) -> Option<String>;
}

/// Supplies the id of the local cluster node
pub trait ClusterMembership: Send + Sync {
    /// `None` when clustering is inactive
    fn local_node_id(&self) -> Option<i64>;
}

/// Forces other in-process readers of the persistent store to refetch
pub trait StoreInvalidation: Send + Sync {
    fn invalidate(&self);
}

/// Resolves raw object references for display in lock listings
pub trait ObjectResolver: Send + Sync {
    fn display_name(&self, object: &ObjectRef) -> Option<String>;
}

/// Caller context with a fixed principal and operation
#[derive(Debug, Clone, Default)]
pub struct StaticCaller {
    principal: Option<ObjectRef>,
    operation: Option<String>,
}

impl StaticCaller {
    pub fn new(principal: ObjectRef) -> Self {
        Self {
            principal: Some(principal),
            operation: None,
        }
    }

    /// Caller without a principal
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

impl CallerContext for StaticCaller {
    fn current_principal(&self) -> Option<ObjectRef> {
        self.principal.clone()
    }

    fn current_operation(&self) -> Option<String> {
        self.operation.clone()
    }
}

/// Cluster membership configured once at startup
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticNode(pub Option<i64>);

impl ClusterMembership for StaticNode {
    fn local_node_id(&self) -> Option<i64> {
        self.0
    }
}

/// Everything a token service needs to know about its surroundings
#[derive(Clone)]
pub struct LockContext {
    caller: Arc<dyn CallerContext>,
    cluster: Arc<dyn ClusterMembership>,
    resolver: Option<Arc<dyn ObjectResolver>>,
    invalidation: Option<Arc<dyn StoreInvalidation>>,
}

impl Default for LockContext {
    fn default() -> Self {
        Self {
            caller: Arc::new(StaticCaller::anonymous()),
            cluster: Arc::new(StaticNode(None)),
            resolver: None,
            invalidation: None,
        }
    }
}

impl LockContext {
    pub fn with_caller(mut self, caller: impl CallerContext + 'static) -> Self {
        self.caller = Arc::new(caller);
        self
    }

    pub fn with_cluster(mut self, cluster: impl ClusterMembership + 'static) -> Self {
        self.cluster = Arc::new(cluster);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ObjectResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_invalidation(mut self, invalidation: Arc<dyn StoreInvalidation>) -> Self {
        self.invalidation = Some(invalidation);
        self
    }

    pub fn principal(&self) -> Option<ObjectRef> {
        self.caller.current_principal()
    }

    pub fn operation(&self) -> Option<String> {
        self.caller.current_operation()
    }

    pub fn node_id(&self) -> Option<i64> {
        self.cluster.local_node_id()
    }

    /// Display name of `owner`, if a resolver is installed and knows it
    pub fn owner_name(&self, owner: Option<&ObjectRef>) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        owner.and_then(|owner| resolver.display_name(owner))
    }

    /// Notify the store that new locks were committed
    pub fn invalidate_store(&self) {
        if let Some(invalidation) = &self.invalidation {
            invalidation.invalidate();
        }
    }
}

impl fmt::Debug for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockContext")
            .field("principal", &self.principal())
            .field("operation", &self.operation())
            .field("node_id", &self.node_id())
            .field("resolver", &self.resolver.is_some())
            .field("invalidation", &self.invalidation.is_some())
            .finish()
    }
}
