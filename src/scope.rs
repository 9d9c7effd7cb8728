//! Scope support
//!
//! A scope is a bounded region (for example one request) that owns the
//! instances of scoped implementations created through it. Disposing the
//! scope evicts those instances and releases them through the lifetime
//! manager.

use crate::descriptor::ImplementationDescriptor;
use crate::error::{DiError, Result};
use crate::factory::ScopedFactory;
use crate::lifecycle::LifetimeManager;
use crate::provider::ServiceProvider;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(feature = "logging")]
use tracing::debug;

/// Unique scope identifier.
///
/// Each scope gets a unique ID for tracking and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope(u64);

impl Scope {
    /// Generate a new unique scope ID.
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

struct ScopeState {
    id: Scope,
    factories: Mutex<Vec<Arc<ScopedFactory>>>,
    disposed: AtomicBool,
    lifetimes: Arc<LifetimeManager>,
}

/// Shared handle that scoped factories and nested providers use to reach a scope
#[derive(Clone)]
pub(crate) struct ScopeHandle {
    state: Arc<ScopeState>,
}

impl ScopeHandle {
    fn new(lifetimes: Arc<LifetimeManager>) -> Self {
        Self {
            state: Arc::new(ScopeState {
                id: Scope::new(),
                factories: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
                lifetimes,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> Scope {
        self.state.id
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::Acquire)
    }

    pub fn ensure_active(&self, descriptor: &ImplementationDescriptor) -> Result<()> {
        if self.is_disposed() {
            return Err(DiError::ScopeDisposed {
                scope: self.state.id.to_string(),
                implementation: descriptor.readable_name(),
            });
        }
        Ok(())
    }

    /// Remember a factory that stored an instance for this scope
    pub fn register(&self, factory: Arc<ScopedFactory>) {
        self.state.factories.lock().push(factory);
    }

    /// Evict and delete every scoped instance, most recently created first
    fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let factories = std::mem::take(&mut *self.state.factories.lock());

        #[cfg(feature = "logging")]
        debug!(
            target: "liman_di",
            scope_id = self.state.id.id(),
            instances = factories.len(),
            "Disposing scope"
        );

        for factory in factories.into_iter().rev() {
            if let Some(instance) = factory.evict(self.state.id) {
                self.state.lifetimes.delete(&instance);
            }
        }
    }
}

/// A scope together with the provider that resolves within it.
///
/// Dropping the scope disposes it.
///
/// # Examples
///
/// ```rust
/// use liman_di::{Container, ContainerOptions, ImplementationDescriptor, Lifetime, ServiceRegistry};
/// use std::sync::Arc;
///
/// struct RequestContext;
///
/// let registry = ServiceRegistry::new();
/// registry
///     .add(
///         ImplementationDescriptor::builder::<RequestContext>(Lifetime::Scoped)
///             .construct(|_| Ok(RequestContext))
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
/// let container = Container::build(registry, ContainerOptions::default()).unwrap();
///
/// let scope = container.create_scope();
/// let a = scope.provider().get::<RequestContext>().unwrap();
/// let b = scope.provider().get::<RequestContext>().unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
pub struct ServiceScope {
    handle: ScopeHandle,
    provider: ServiceProvider,
}

impl ServiceScope {
    pub(crate) fn new(lifetimes: Arc<LifetimeManager>, provider: impl FnOnce(&ScopeHandle) -> ServiceProvider) -> Self {
        let handle = ScopeHandle::new(lifetimes);
        let provider = provider(&handle);

        #[cfg(feature = "logging")]
        debug!(
            target: "liman_di",
            scope_id = handle.id().id(),
            "Created scope"
        );

        Self { handle, provider }
    }

    /// Get the scope identifier.
    #[inline]
    pub fn id(&self) -> Scope {
        self.handle.id()
    }

    /// Provider bound to this scope
    #[inline]
    pub fn provider(&self) -> &ServiceProvider {
        &self.provider
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.handle.is_disposed()
    }

    /// Release every scoped instance created in this scope.
    ///
    /// Instances of other lifetimes resolved through the scope are not affected.
    pub fn dispose(&self) {
        self.handle.dispose();
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        self.handle.dispose();
    }
}

impl std::fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceScope")
            .field("id", &self.handle.id())
            .field("disposed", &self.handle.is_disposed())
            .finish()
    }
}
