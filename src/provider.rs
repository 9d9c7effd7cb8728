//! Service providers
//!
//! [`ServiceProvider`] is the resolution handle handed to callers and, as a
//! nested provider, to constructed instances. It may be bound to a scope and
//! to a user object; transients resolved through a bound provider are
//! recorded as held by that user.
//!
//! `FactoryProvider` sits underneath every provider of a container. It
//! memoizes one factory per service and per implementation, and tracks the
//! constructions in progress on each thread so it can detect cycles and run
//! initialize hooks only after the outermost construction completes.
//!
//! Unbound providers record no ownership edges. The disposable transients
//! they hand out are indexed weakly so that `remove_service` can still find
//! and delete them; the caller owns them otherwise.

use crate::descriptor::{
    CustomArgument, ImplementationDescriptor, Instance, InstanceId, Parameter, WeakInstance,
};
use crate::error::{DiError, Result};
use crate::factory::ServiceFactory;
use crate::key::{GenericType, TypeKey, readable_name};
use crate::lifecycle::LifetimeManager;
use crate::lifetime::{Injectable, Lifetime};
use crate::registry::ServiceRegistry;
use crate::scope::{Scope, ScopeHandle, ServiceScope};
use ahash::RandomState;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

// =============================================================================
// Factory Provider
// =============================================================================

/// Size of the detached index below which dead entries are not pruned
const DETACHED_PRUNE_FLOOR: usize = 64;

#[derive(Default)]
struct CreationState {
    in_progress: Vec<Arc<ImplementationDescriptor>>,
    uninitialized: VecDeque<Instance>,
    draining: bool,
}

impl CreationState {
    fn is_idle(&self) -> bool {
        self.in_progress.is_empty() && self.uninitialized.is_empty() && !self.draining
    }
}

/// Clears the draining flag even if an initialize hook panics
struct Draining<'a> {
    factories: &'a FactoryProvider,
    thread: ThreadId,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        let mut creation = self.factories.creation.lock();
        if let Some(state) = creation.get_mut(&self.thread) {
            state.draining = false;
            if state.is_idle() {
                creation.remove(&self.thread);
            }
        }
    }
}

pub(crate) struct FactoryProvider {
    registry: Arc<ServiceRegistry>,
    lifetimes: Arc<LifetimeManager>,
    validate: bool,
    by_service: DashMap<TypeKey, ServiceFactory, RandomState>,
    /// Lookups by closed generic key, which may include materialized templates
    by_closed_service: DashMap<TypeKey, ServiceFactory, RandomState>,
    by_implementation: DashMap<TypeKey, ServiceFactory, RandomState>,
    creation: Mutex<HashMap<ThreadId, CreationState, RandomState>>,
    detached: DashMap<InstanceId, WeakInstance, RandomState>,
    prune_at: AtomicUsize,
}

impl FactoryProvider {
    pub fn new(registry: Arc<ServiceRegistry>, lifetimes: Arc<LifetimeManager>, validate: bool) -> Self {
        Self {
            registry,
            lifetimes,
            validate,
            by_service: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
            by_closed_service: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                RandomState::new(),
                8,
            ),
            by_implementation: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                RandomState::new(),
                8,
            ),
            creation: Mutex::new(HashMap::default()),
            detached: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
            prune_at: AtomicUsize::new(DETACHED_PRUNE_FLOOR),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    #[inline]
    pub fn lifetimes(&self) -> &Arc<LifetimeManager> {
        &self.lifetimes
    }

    /// Factory for a service type; a null factory when nothing is registered.
    ///
    /// Only closed generic keys reach open-generic templates, so they are
    /// memoized apart from plain keys of the same type.
    pub fn get(&self, service: &TypeKey) -> Result<ServiceFactory> {
        let cache = if service.is_closed_generic() {
            &self.by_closed_service
        } else {
            &self.by_service
        };
        if let Some(factory) = cache.get(service) {
            return Ok(factory.value().clone());
        }

        match self.registry.try_resolve_single(service)? {
            None => Ok(ServiceFactory::Null(service.clone())),
            Some(descriptor) => {
                let factory = self.get_for(&descriptor)?;
                Ok(cache.entry(service.clone()).or_insert(factory).value().clone())
            }
        }
    }

    /// Factory for a specific implementation
    pub fn get_for(&self, descriptor: &Arc<ImplementationDescriptor>) -> Result<ServiceFactory> {
        if let Some(factory) = self.by_implementation.get(descriptor.key()) {
            return Ok(factory.value().clone());
        }

        if self.validate {
            self.registry.validate(descriptor)?;
        }
        let lifetime = self.registry.effective_lifetime(descriptor)?;

        #[cfg(feature = "logging")]
        debug!(
            target: "liman_di",
            implementation = %descriptor.key(),
            declared = %descriptor.lifetime(),
            effective = %lifetime,
            "Creating factory"
        );

        let factory = ServiceFactory::for_descriptor(Arc::clone(descriptor), lifetime);
        Ok(self
            .by_implementation
            .entry(descriptor.key().clone())
            .or_insert(factory)
            .value()
            .clone())
    }

    /// Factories for each container-resolved parameter of an implementation
    pub fn used_services(&self, descriptor: &ImplementationDescriptor) -> Result<Vec<ServiceFactory>> {
        descriptor
            .dependency_parameters()
            .iter()
            .map(|parameter| match parameter {
                Parameter::Injected(key) | Parameter::Optional(key) => self.get(key),
                Parameter::Provider | Parameter::Deferred(_) => Ok(ServiceFactory::Provider),
                Parameter::OwnType => Ok(ServiceFactory::Constant(descriptor.key().clone())),
                Parameter::Custom(key) => Err(DiError::Internal(format!(
                    "custom parameter {key} of {} cannot be injected",
                    descriptor.key()
                ))),
            })
            .collect()
    }

    /// An unbound provider sharing this container, optionally within a scope
    pub fn nested_provider(self: &Arc<Self>, scope: Option<&ScopeHandle>) -> ServiceProvider {
        ServiceProvider::new(Arc::clone(self), scope.cloned())
    }

    /// A provider for an instance under construction.
    ///
    /// Until [`ServiceProvider::adopt`] binds it to the finished instance, it
    /// holds what it resolves under its own identity.
    pub fn construction_provider(self: &Arc<Self>, scope: Option<&ScopeHandle>) -> ServiceProvider {
        let provider = self.nested_provider(scope);
        provider.inner.awaiting_owner.store(true, Ordering::Release);
        provider
    }

    /// Index a cleanup-relevant transient handed out without a user
    fn detach(&self, instance: &Instance) {
        if !self.lifetimes.needs_cleanup(instance.descriptor()) {
            return;
        }
        self.detached.insert(instance.id(), instance.downgrade());

        if self.detached.len() >= self.prune_at.load(Ordering::Relaxed) {
            self.detached.retain(|_, weak| weak.is_alive());
            let live = self.detached.len();
            self.prune_at
                .store((live * 2).max(DETACHED_PRUNE_FLOOR), Ordering::Relaxed);

            #[cfg(feature = "logging")]
            trace!(target: "liman_di", live, "Pruned detached transients");
        }
    }

    /// Number of live detached transients
    #[cfg(test)]
    pub(crate) fn detached_count(&self) -> usize {
        self.detached.iter().filter(|entry| entry.value().is_alive()).count()
    }

    /// A cleanup-relevant transient this container handed out, if still alive
    pub fn resolved_transient(&self, id: InstanceId) -> Option<Instance> {
        self.lifetimes
            .tracked_transient(id)
            .or_else(|| self.detached.get(&id).and_then(|weak| weak.upgrade()))
    }

    fn cycle_error(in_progress: &[Arc<ImplementationDescriptor>], descriptor: &ImplementationDescriptor) -> DiError {
        let mut chain: Vec<String> = in_progress.iter().map(|d| d.readable_name()).collect();
        chain.push(descriptor.readable_name());
        DiError::CircularDependency { chain }
    }

    /// Fail if `descriptor` is already being constructed on this thread
    pub fn ensure_not_in_progress(&self, descriptor: &ImplementationDescriptor) -> Result<()> {
        let creation = self.creation.lock();
        if let Some(state) = creation.get(&thread::current().id()) {
            if state.in_progress.iter().any(|d| d.key() == descriptor.key()) {
                return Err(Self::cycle_error(&state.in_progress, descriptor));
            }
        }
        Ok(())
    }

    /// Push `descriptor` onto this thread's construction stack
    pub fn prepare_creation(&self, descriptor: &Arc<ImplementationDescriptor>) -> Result<()> {
        let mut creation = self.creation.lock();
        let state = creation.entry(thread::current().id()).or_default();
        if state.in_progress.iter().any(|d| d.key() == descriptor.key()) {
            return Err(Self::cycle_error(&state.in_progress, descriptor));
        }
        state.in_progress.push(Arc::clone(descriptor));
        Ok(())
    }

    /// Pop `descriptor`, queue the instance for initialization and run the
    /// queue once no construction is left in progress on this thread
    pub fn finish_creation(&self, descriptor: &ImplementationDescriptor, instance: Option<&Instance>) {
        let thread = thread::current().id();
        {
            let mut creation = self.creation.lock();
            let Some(state) = creation.get_mut(&thread) else {
                return;
            };
            if let Some(position) = state
                .in_progress
                .iter()
                .rposition(|d| d.key() == descriptor.key())
            {
                state.in_progress.remove(position);
            }
            if let Some(instance) = instance.filter(|i| i.is_initializable()) {
                state.uninitialized.push_back(instance.clone());
            }
            if state.is_idle() {
                creation.remove(&thread);
                return;
            }
        }
        self.drain_initializations(thread);
    }

    fn drain_initializations(&self, thread: ThreadId) {
        {
            let mut creation = self.creation.lock();
            let Some(state) = creation.get_mut(&thread) else {
                return;
            };
            if state.draining || !state.in_progress.is_empty() {
                return;
            }
            state.draining = true;
        }
        let _draining = Draining {
            factories: self,
            thread,
        };

        loop {
            let next = self
                .creation
                .lock()
                .get_mut(&thread)
                .and_then(|state| state.uninitialized.pop_front());
            let Some(instance) = next else {
                break;
            };

            #[cfg(feature = "logging")]
            trace!(
                target: "liman_di",
                implementation = %instance.type_key(),
                "Initializing instance"
            );

            instance.initialize();
        }
    }

    /// Drop every cached factory and the instances they hold
    pub fn clear(&self) {
        self.by_service.clear();
        self.by_closed_service.clear();
        self.by_implementation.clear();
        self.detached.clear();
    }
}

// =============================================================================
// Service Provider
// =============================================================================

struct ProviderInner {
    factories: Arc<FactoryProvider>,
    scope: OnceCell<ScopeHandle>,
    user: OnceCell<InstanceId>,
    awaiting_owner: AtomicBool,
}

/// Resolution handle for services.
///
/// Cheap to clone; clones share their bindings.
#[derive(Clone)]
pub struct ServiceProvider {
    inner: Arc<ProviderInner>,
}

impl ServiceProvider {
    pub(crate) fn new(factories: Arc<FactoryProvider>, scope: Option<ScopeHandle>) -> Self {
        let provider = Self {
            inner: Arc::new(ProviderInner {
                factories,
                scope: OnceCell::new(),
                user: OnceCell::new(),
                awaiting_owner: AtomicBool::new(false),
            }),
        };
        if let Some(scope) = scope {
            let _ = provider.bind_scope(scope);
        }
        provider
    }

    /// Resolve service `S`, failing when it is not registered
    #[inline]
    pub fn get<S: ?Sized + Injectable>(&self) -> Result<Arc<S>> {
        self.get_with::<S>(Vec::new())
    }

    /// Resolve service `S`, passing values for its custom parameters
    pub fn get_with<S: ?Sized + Injectable>(&self, custom: Vec<CustomArgument>) -> Result<Arc<S>> {
        self.try_get_with::<S>(custom)?
            .ok_or_else(DiError::not_found::<S>)
    }

    /// Resolve service `S` if registered
    #[inline]
    pub fn try_get<S: ?Sized + Injectable>(&self) -> Result<Option<Arc<S>>> {
        self.try_get_with::<S>(Vec::new())
    }

    pub fn try_get_with<S: ?Sized + Injectable>(&self, custom: Vec<CustomArgument>) -> Result<Option<Arc<S>>> {
        self.get_service(&TypeKey::of::<S>(), custom)?
            .map(|instance| Self::cast::<S>(&instance))
            .transpose()
    }

    /// Resolve a closed generic service, materializing open generic
    /// registrations as needed
    pub fn get_closed<S: ?Sized + Injectable + GenericType>(&self) -> Result<Arc<S>> {
        self.get_service(&TypeKey::closed::<S>(), Vec::new())?
            .map(|instance| Self::cast::<S>(&instance))
            .transpose()?
            .ok_or_else(DiError::not_found::<S>)
    }

    /// Resolve by key
    pub fn get_service(&self, service: &TypeKey, custom: Vec<CustomArgument>) -> Result<Option<Instance>> {
        #[cfg(feature = "logging")]
        trace!(
            target: "liman_di",
            service = %service,
            scope = ?self.scope(),
            "Resolving service"
        );

        let factories = &self.inner.factories;
        let factory = factories.get(service)?;
        let instance = factory.get(factories, self.inner.scope.get(), custom)?;
        if let Some(instance) = &instance {
            self.track(&factory, instance);
        }
        Ok(instance)
    }

    /// Resolve every implementation of `S`, in registration order
    pub fn get_all<S: ?Sized + Injectable>(&self) -> Result<Vec<Arc<S>>> {
        let factories = &self.inner.factories;
        let descriptors = factories.registry().get_all(&TypeKey::of::<S>())?;

        let mut services = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let factory = factories.get_for(&descriptor)?;
            if let Some(instance) = factory.get(factories, self.inner.scope.get(), Vec::new())? {
                self.track(&factory, &instance);
                services.push(Self::cast::<S>(&instance)?);
            }
        }
        Ok(services)
    }

    /// Instantiate every application-lifetime implementation
    pub fn application_services(&self) -> Result<Vec<Instance>> {
        let factories = &self.inner.factories;
        let mut instances = Vec::new();
        for descriptor in factories.registry().application_implementations() {
            let factory = factories.get_for(&descriptor)?;
            if let Some(instance) = factory.get(factories, None, Vec::new())? {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    /// Release a service obtained through this provider.
    ///
    /// A provider bound to a user drops that user's hold on the instance.
    /// An unbound provider deletes a transient outright and refuses any
    /// other lifetime.
    pub fn remove_service<S: ?Sized + 'static>(&self, service: &Arc<S>) -> Result<()> {
        let id = InstanceId::of(service);
        let factories = &self.inner.factories;

        if let Some(user) = self.holder() {
            factories.lifetimes().delete_transient_dependency(user, id);
            return Ok(());
        }

        if let Some(instance) = factories.resolved_transient(id) {
            factories.detached.remove(&id);
            factories.lifetimes().delete(&instance);
            return Ok(());
        }

        // Transients that need no cleanup are never indexed
        match factories.get(&TypeKey::of::<S>())?.lifetime() {
            Lifetime::Transient => Ok(()),
            _ => Err(DiError::IllegalRemoval {
                type_name: readable_name(std::any::type_name::<S>()),
            }),
        }
    }

    /// Record that this provider's user holds `dependency`.
    ///
    /// Returns whether an edge was recorded; only transients that need
    /// cleanup are tracked.
    pub fn register_dependency<S: ?Sized + 'static>(&self, dependency: &Arc<S>) -> Result<bool> {
        let user = self
            .holder()
            .ok_or_else(|| DiError::not_bound::<S>("register dependency"))?;
        Ok(self.add_dependency(user, dependency))
    }

    /// Drop this provider's user's hold on `dependency`
    pub fn deregister_dependency<S: ?Sized + 'static>(&self, dependency: &Arc<S>) -> Result<()> {
        let user = self
            .holder()
            .ok_or_else(|| DiError::not_bound::<S>("deregister dependency"))?;
        self.inner
            .factories
            .lifetimes()
            .delete_transient_dependency(user, InstanceId::of(dependency));
        Ok(())
    }

    /// Record that an arbitrary `user` holds `dependency`
    pub fn register_dependency_for<U: ?Sized, S: ?Sized>(&self, user: &Arc<U>, dependency: &Arc<S>) -> bool {
        self.add_dependency(InstanceId::of(user), dependency)
    }

    /// Drop `user`'s hold on `dependency`, deleting it once nothing holds it
    pub fn deregister_dependency_for<U: ?Sized, S: ?Sized>(&self, user: &Arc<U>, dependency: &Arc<S>) {
        self.inner
            .factories
            .lifetimes()
            .delete_transient_dependency(InstanceId::of(user), InstanceId::of(dependency));
    }

    fn add_dependency<S: ?Sized>(&self, user: InstanceId, dependency: &Arc<S>) -> bool {
        let factories = &self.inner.factories;
        match factories.resolved_transient(InstanceId::of(dependency)) {
            Some(instance) => factories.lifetimes().add_transient_dependency(user, &instance),
            None => false,
        }
    }

    /// Bind this provider to an external user object.
    ///
    /// Transients resolved afterwards are held by `user`.
    pub fn register_user<U: ?Sized>(&self, user: &Arc<U>) -> Result<()> {
        self.bind_user(InstanceId::of(user))
    }

    pub(crate) fn bind_user(&self, user: InstanceId) -> Result<()> {
        self.inner
            .user
            .set(user)
            .map_err(|_| DiError::AlreadyBound { binding: "user" })
    }

    pub(crate) fn bind_scope(&self, scope: ScopeHandle) -> Result<()> {
        self.inner
            .scope
            .set(scope)
            .map_err(|_| DiError::AlreadyBound { binding: "scope" })
    }

    #[inline]
    pub fn user(&self) -> Option<InstanceId> {
        self.inner.user.get().copied()
    }

    #[inline]
    pub fn scope(&self) -> Option<Scope> {
        self.inner.scope.get().map(ScopeHandle::id)
    }

    /// Open a new scope; the returned scope's provider resolves within it
    pub fn create_scope(&self) -> ServiceScope {
        let factories = &self.inner.factories;
        ServiceScope::new(Arc::clone(factories.lifetimes()), |handle| {
            factories.nested_provider(Some(handle))
        })
    }

    /// Bind a construction provider to the instance it was built for and
    /// move whatever it resolved during construction onto that instance
    pub(crate) fn adopt(&self, owner: InstanceId) -> Result<()> {
        self.bind_user(owner)?;
        if self.inner.awaiting_owner.swap(false, Ordering::AcqRel) {
            self.inner
                .factories
                .lifetimes()
                .transfer_user(self.placeholder(), owner);
        }
        Ok(())
    }

    /// Release what a construction provider resolved for a failed construction
    pub(crate) fn abandon(&self) {
        if self.inner.awaiting_owner.swap(false, Ordering::AcqRel) {
            self.inner.factories.lifetimes().delete_user(self.placeholder());
        }
    }

    #[inline]
    fn placeholder(&self) -> InstanceId {
        InstanceId::of(&self.inner)
    }

    /// Identity holding transients resolved through this provider
    fn holder(&self) -> Option<InstanceId> {
        self.user().or_else(|| {
            self.inner
                .awaiting_owner
                .load(Ordering::Acquire)
                .then(|| self.placeholder())
        })
    }

    /// Record the hold on a resolved transient, or index it when no user holds it
    fn track(&self, factory: &ServiceFactory, instance: &Instance) {
        if factory.lifetime() != Lifetime::Transient {
            return;
        }
        match self.holder() {
            Some(user) => factory.register_user(&self.inner.factories, user, instance),
            None => self.inner.factories.detach(instance),
        }
    }

    fn cast<S: ?Sized + 'static>(instance: &Instance) -> Result<Arc<S>> {
        instance.cast::<S>().ok_or_else(|| {
            DiError::Internal(format!(
                "{} is registered as {} but cannot be cast to it",
                instance.type_key(),
                readable_name(std::any::type_name::<S>())
            ))
        })
    }
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("scope", &self.scope())
            .field("user", &self.user())
            .finish()
    }
}
