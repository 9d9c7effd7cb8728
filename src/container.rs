//! Container: the owner of one resolved service graph
//!
//! A [`Container`] is built from a [`ServiceRegistry`], freezes it, and owns
//! the lifetime manager and factory memo shared by every provider and scope
//! it hands out. Dropping (or disposing) the container disposes every
//! remaining singleton and tracked transient.

use crate::descriptor::{CustomArgument, Instance};
use crate::error::Result;
use crate::key::GenericType;
use crate::lifecycle::LifetimeManager;
use crate::lifetime::Injectable;
use crate::provider::{FactoryProvider, ServiceProvider};
use crate::registry::ServiceRegistry;
use crate::scope::ServiceScope;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, info};

/// Options controlling validation.
///
/// # Examples
///
/// ```rust
/// use liman_di::ContainerOptions;
///
/// let options = ContainerOptions::new().validate(true).validate_on_build(true);
/// assert!(options.validates_on_build());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOptions {
    validate: bool,
    validate_on_build: bool,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate each implementation's graph when its factory is first created
    pub fn validate(mut self, enabled: bool) -> Self {
        self.validate = enabled;
        self
    }

    /// Validate every registration eagerly in [`Container::build`]
    pub fn validate_on_build(mut self, enabled: bool) -> Self {
        self.validate_on_build = enabled;
        self
    }

    #[inline]
    pub fn validates(&self) -> bool {
        self.validate
    }

    #[inline]
    pub fn validates_on_build(&self) -> bool {
        self.validate_on_build
    }
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            validate: true,
            validate_on_build: false,
        }
    }
}

/// Dependency injection container with lifetime management.
///
/// # Examples
///
/// ```rust
/// use liman_di::{Container, ContainerOptions, ImplementationDescriptor, Lifetime, ServiceRegistry};
/// use std::sync::Arc;
///
/// struct MyService {
///     name: String,
/// }
///
/// let registry = ServiceRegistry::new();
/// registry
///     .add(
///         ImplementationDescriptor::builder::<MyService>(Lifetime::Singleton)
///             .construct(|_| Ok(MyService { name: "test".into() }))
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
///
/// let container = Container::build(registry, ContainerOptions::default()).unwrap();
/// let a = container.get::<MyService>().unwrap();
/// let b = container.get::<MyService>().unwrap();
/// assert_eq!(a.name, "test");
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
pub struct Container {
    registry: Arc<ServiceRegistry>,
    lifetimes: Arc<LifetimeManager>,
    factories: Arc<FactoryProvider>,
    provider: ServiceProvider,
    disposed: AtomicBool,
}

impl Container {
    /// Build a container, freezing the registry
    pub fn build(registry: ServiceRegistry, options: ContainerOptions) -> Result<Self> {
        registry.freeze();
        if options.validate_on_build {
            registry.validate_all()?;
        }

        let registry = Arc::new(registry);
        let lifetimes = Arc::new(LifetimeManager::new(Arc::clone(&registry)));
        let factories = Arc::new(FactoryProvider::new(
            Arc::clone(&registry),
            Arc::clone(&lifetimes),
            options.validate,
        ));
        let provider = factories.nested_provider(None);

        #[cfg(feature = "logging")]
        debug!(
            target: "liman_di",
            implementations = registry.len(),
            validate = options.validate,
            validate_on_build = options.validate_on_build,
            "Built DI container"
        );

        Ok(Self {
            registry,
            lifetimes,
            factories,
            provider,
            disposed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Tracking state for everything this container must eventually release
    #[inline]
    pub fn lifetimes(&self) -> &LifetimeManager {
        &self.lifetimes
    }

    /// Root provider, bound to neither a scope nor a user
    #[inline]
    pub fn provider(&self) -> &ServiceProvider {
        &self.provider
    }

    #[inline]
    pub fn get<S: ?Sized + Injectable>(&self) -> Result<Arc<S>> {
        self.provider.get::<S>()
    }

    #[inline]
    pub fn try_get<S: ?Sized + Injectable>(&self) -> Result<Option<Arc<S>>> {
        self.provider.try_get::<S>()
    }

    #[inline]
    pub fn get_with<S: ?Sized + Injectable>(&self, custom: Vec<CustomArgument>) -> Result<Arc<S>> {
        self.provider.get_with::<S>(custom)
    }

    #[inline]
    pub fn get_closed<S: ?Sized + Injectable + GenericType>(&self) -> Result<Arc<S>> {
        self.provider.get_closed::<S>()
    }

    #[inline]
    pub fn get_all<S: ?Sized + Injectable>(&self) -> Result<Vec<Arc<S>>> {
        self.provider.get_all::<S>()
    }

    /// Open a new scope
    #[inline]
    pub fn create_scope(&self) -> ServiceScope {
        self.provider.create_scope()
    }

    /// Create every application-lifetime service
    pub fn start(&self) -> Result<Vec<Instance>> {
        let instances = self.provider.application_services()?;

        #[cfg(feature = "logging")]
        info!(
            target: "liman_di",
            application_services = instances.len(),
            "Container started"
        );

        Ok(instances)
    }

    /// Dispose every singleton (newest first) and every tracked transient.
    ///
    /// Later calls are no-ops. Live scopes keep their scoped instances until
    /// they are disposed themselves.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "logging")]
        debug!(target: "liman_di", "Disposing DI container");

        self.lifetimes.delete_all_services();
        self.factories.clear();
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("registry", &self.registry)
            .field("lifetimes", &self.lifetimes)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{AllImplementations, Closed, Deferred, Service};
    use crate::descriptor::{DescriptorBuilder, ImplementationDescriptor, InstanceId};
    use crate::error::DiError;
    use crate::lifetime::{Dispose, Initialize, Lifetime};
    use crate::scope::ServiceScope;
    use crate::test_support::{Action, LifetimeLog, Order, Store, User, memory_store_template};
    use parking_lot::Mutex;

    macro_rules! logged_service {
        ($name:ident) => {
            struct $name {
                log: Arc<LifetimeLog>,
                id: u64,
            }

            impl Dispose for $name {
                fn dispose(&self) {
                    self.log.record(Action::Dispose, stringify!($name), self.id);
                }
            }

            impl Initialize for $name {
                fn initialize(&self) {
                    self.log.record(Action::Initialize, stringify!($name), self.id);
                }
            }

            impl $name {
                fn new(log: &Arc<LifetimeLog>) -> Self {
                    let id = log.next_id();
                    log.record(Action::Construct, stringify!($name), id);
                    Self {
                        log: Arc::clone(log),
                        id,
                    }
                }

                #[allow(dead_code)]
                fn describe(lifetime: Lifetime, log: &Arc<LifetimeLog>) -> DescriptorBuilder<Self> {
                    let log = Arc::clone(log);
                    ImplementationDescriptor::builder::<Self>(lifetime)
                        .construct(move |_| Ok(Self::new(&log)))
                        .disposable()
                        .initializable()
                }
            }
        };
    }

    logged_service!(Child);
    logged_service!(Sibling);

    fn build(registry: ServiceRegistry) -> Container {
        Container::build(registry, ContainerOptions::default()).unwrap()
    }

    fn single(lifetime: Lifetime) -> (Container, Arc<LifetimeLog>) {
        let log = Arc::new(LifetimeLog::default());
        let registry = ServiceRegistry::new();
        registry.add(Child::describe(lifetime, &log).build().unwrap()).unwrap();
        (build(registry), log)
    }

    // =========================================================================
    // Lifetime semantics
    // =========================================================================

    #[test]
    fn test_transient_instances_are_distinct() {
        let (container, _) = single(Lifetime::Transient);
        let a = container.get::<Child>().unwrap();
        let b = container.get::<Child>().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_singleton_shared_across_scopes() {
        for lifetime in [Lifetime::Singleton, Lifetime::Application, Lifetime::Any] {
            let (container, _) = single(lifetime);
            let root = container.get::<Child>().unwrap();
            let first = container.create_scope();
            let second = container.create_scope();

            assert!(Arc::ptr_eq(&root, &first.provider().get::<Child>().unwrap()));
            assert!(Arc::ptr_eq(&root, &second.provider().get::<Child>().unwrap()));
        }
    }

    #[test]
    fn test_scoped_requires_scope() {
        let (container, log) = single(Lifetime::Scoped);
        assert!(matches!(
            container.get::<Child>(),
            Err(DiError::ScopeRequired { .. })
        ));
        assert_eq!(log.count(Action::Construct), 0);
    }

    #[test]
    fn test_scoped_shared_within_scope_only() {
        let (container, _) = single(Lifetime::Scoped);
        let first = container.create_scope();
        let second = container.create_scope();

        let a = first.provider().get::<Child>().unwrap();
        let b = first.provider().get::<Child>().unwrap();
        let c = second.provider().get::<Child>().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    struct Holder {
        child: Arc<Child>,
    }

    #[test]
    fn test_any_with_scoped_dependency_behaves_as_scoped() {
        let log = Arc::new(LifetimeLog::default());
        let registry = ServiceRegistry::new();
        registry.add(Child::describe(Lifetime::Scoped, &log).build().unwrap()).unwrap();
        registry
            .add(
                ImplementationDescriptor::builder::<Holder>(Lifetime::Any)
                    .inject::<Child>()
                    .construct(|args| Ok(Holder { child: args.instance()? }))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let container = build(registry);

        assert!(matches!(
            container.get::<Holder>(),
            Err(DiError::ScopeRequired { .. })
        ));

        let first = container.create_scope();
        let second = container.create_scope();
        let a = first.provider().get::<Holder>().unwrap();
        let b = first.provider().get::<Holder>().unwrap();
        let c = second.provider().get::<Holder>().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&a.child, &first.provider().get::<Child>().unwrap()));
    }

    #[test]
    fn test_singleton_with_scoped_dependency_rejected() {
        let log = Arc::new(LifetimeLog::default());
        let registry = ServiceRegistry::new();
        registry.add(Child::describe(Lifetime::Scoped, &log).build().unwrap()).unwrap();
        registry
            .add(
                ImplementationDescriptor::builder::<Holder>(Lifetime::Singleton)
                    .inject::<Child>()
                    .construct(|args| Ok(Holder { child: args.instance()? }))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let container = build(registry);
        let scope = container.create_scope();

        assert!(matches!(
            scope.provider().get::<Holder>(),
            Err(DiError::InvalidLifetimeCombination { .. })
        ));
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    #[test]
    fn test_singletons_disposed_at_teardown() {
        for lifetime in [Lifetime::Singleton, Lifetime::Application, Lifetime::Any] {
            let (container, log) = single(lifetime);
            let child = container.get::<Child>().unwrap();
            assert_eq!(log.count(Action::Dispose), 0);

            drop(container);
            assert!(log.has(Action::Dispose, "Child", child.id));
            assert_eq!(log.count(Action::Dispose), 1);
        }
    }

    #[test]
    fn test_teardown_in_reverse_construction_order() {
        let log = Arc::new(LifetimeLog::default());
        let registry = ServiceRegistry::new();
        registry.add(Child::describe(Lifetime::Singleton, &log).build().unwrap()).unwrap();
        registry.add(Sibling::describe(Lifetime::Application, &log).build().unwrap()).unwrap();
        let container = build(registry);

        let sibling = container.get::<Sibling>().unwrap();
        let child = container.get::<Child>().unwrap();
        container.dispose();
        assert!(container.is_disposed());
        assert_eq!(log.ids(Action::Dispose), vec![child.id, sibling.id]);

        container.dispose();
        assert_eq!(log.count(Action::Dispose), 2);
    }

    #[test]
    fn test_application_services_created_on_start() {
        let (container, log) = single(Lifetime::Application);
        assert_eq!(log.count(Action::Construct), 0);

        let started = container.start().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(log.count_of(Action::Construct, "Child"), 1);

        container.get::<Child>().unwrap();
        assert_eq!(log.count_of(Action::Construct, "Child"), 1);
    }

    #[test]
    fn test_scoped_disposed_with_scope() {
        let (container, log) = single(Lifetime::Scoped);
        let scope = container.create_scope();
        let child = scope.provider().get::<Child>().unwrap();

        scope.dispose();
        assert!(log.has(Action::Dispose, "Child", child.id));
        assert!(scope.is_disposed());
        assert!(matches!(
            scope.provider().get::<Child>(),
            Err(DiError::ScopeDisposed { .. })
        ));
    }

    #[test]
    fn test_scope_disposal_leaves_other_lifetimes() {
        for lifetime in [Lifetime::Singleton, Lifetime::Application, Lifetime::Any, Lifetime::Transient] {
            let (container, log) = single(lifetime);
            let scope = container.create_scope();
            scope.provider().get::<Child>().unwrap();
            drop(scope);

            assert_eq!(log.count(Action::Dispose), 0, "{lifetime} instance disposed by scope");
        }
    }

    struct Node {
        log: Arc<LifetimeLog>,
        id: u64,
        provider: ServiceProvider,
    }

    impl Dispose for Node {
        fn dispose(&self) {
            self.log.record(Action::Dispose, "Node", self.id);
        }
    }

    impl Node {
        fn create_child(&self) -> Arc<Node> {
            self.provider.get::<Node>().unwrap()
        }

        fn delete_child(&self, child: &Arc<Node>) {
            self.provider.remove_service(child).unwrap();
        }
    }

    fn node_container(log: &Arc<LifetimeLog>) -> Container {
        let log = Arc::clone(log);
        let registry = ServiceRegistry::new();
        registry
            .add(
                ImplementationDescriptor::builder::<Node>(Lifetime::Transient)
                    .provider()
                    .construct(move |args| {
                        let id = log.next_id();
                        log.record(Action::Construct, "Node", id);
                        Ok(Node {
                            log: Arc::clone(&log),
                            id,
                            provider: args.provider()?,
                        })
                    })
                    .disposable()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        build(registry)
    }

    #[test]
    fn test_transient_child_disposed_when_removed() {
        let log = Arc::new(LifetimeLog::default());
        let container = node_container(&log);

        let parent = container.get::<Node>().unwrap();
        let child = parent.create_child();
        assert_eq!(log.count(Action::Dispose), 0);

        parent.delete_child(&child);
        assert!(log.has(Action::Dispose, "Node", child.id));
        assert!(!log.has(Action::Dispose, "Node", parent.id));
    }

    #[test]
    fn test_transient_child_disposed_when_parent_deleted() {
        let log = Arc::new(LifetimeLog::default());
        let container = node_container(&log);

        let grand_parent = container.get::<Node>().unwrap();
        let parent = grand_parent.create_child();
        let child = parent.create_child();

        grand_parent.delete_child(&parent);
        assert!(log.has(Action::Dispose, "Node", parent.id));
        assert!(log.has(Action::Dispose, "Node", child.id));
        assert!(!log.has(Action::Dispose, "Node", grand_parent.id));

        // Parent is disposed before the child it obtained
        let disposed = log.ids(Action::Dispose);
        assert_eq!(disposed, vec![parent.id, child.id]);
    }

    #[test]
    fn test_unbound_removal_of_transient() {
        let (container, log) = single(Lifetime::Transient);
        let child = container.get::<Child>().unwrap();
        container.provider().remove_service(&child).unwrap();
        assert_eq!(log.ids(Action::Dispose), vec![child.id]);

        let (container, _) = single(Lifetime::Singleton);
        let child = container.get::<Child>().unwrap();
        assert!(matches!(
            container.provider().remove_service(&child),
            Err(DiError::IllegalRemoval { .. })
        ));
    }

    #[test]
    fn test_external_user_holds_transients() {
        let (container, log) = single(Lifetime::Transient);
        let owner = Arc::new(String::from("owner"));
        let scope = container.create_scope();
        let provider = scope.provider();
        provider.register_user(&owner).unwrap();

        let first = provider.get::<Child>().unwrap();
        let second = provider.get::<Child>().unwrap();
        provider.remove_service(&first).unwrap();
        assert_eq!(log.ids(Action::Dispose), vec![first.id]);

        container.lifetimes().delete_user(InstanceId::of(&owner));
        assert_eq!(log.ids(Action::Dispose), vec![first.id, second.id]);
        assert_eq!(container.lifetimes().tracked_transient_count(), 0);
    }

    #[test]
    fn test_unbound_providers_record_no_holds() {
        let (container, log) = single(Lifetime::Transient);
        for _ in 0..200 {
            container.get::<Child>().unwrap();
        }
        for _ in 0..20 {
            let scope = container.create_scope();
            scope.provider().get::<Child>().unwrap();
        }

        assert_eq!(container.lifetimes().tracked_transient_count(), 0);
        assert_eq!(container.factories.detached_count(), 0);

        // Unremoved transients belong to the caller, not the container
        drop(container);
        assert_eq!(log.count(Action::Dispose), 0);
    }

    #[test]
    fn test_transient_shared_by_two_users() {
        let (container, log) = single(Lifetime::Transient);
        let first_user = Arc::new(String::from("first"));
        let second_user = Arc::new(String::from("second"));
        let scope = container.create_scope();
        let provider = scope.provider();
        provider.register_user(&first_user).unwrap();

        let child = provider.get::<Child>().unwrap();
        assert!(provider.register_dependency_for(&second_user, &child));

        provider.remove_service(&child).unwrap();
        assert_eq!(log.count(Action::Dispose), 0);

        provider.deregister_dependency_for(&second_user, &child);
        assert_eq!(log.ids(Action::Dispose), vec![child.id]);
        assert_eq!(container.lifetimes().tracked_transient_count(), 0);
    }

    #[test]
    fn test_dependencies_registered_through_bound_provider() {
        let (container, log) = single(Lifetime::Transient);
        let detached = container.get::<Child>().unwrap();

        assert!(matches!(
            container.provider().register_dependency(&detached),
            Err(DiError::NotBound { .. })
        ));
        assert!(matches!(
            container.provider().deregister_dependency(&detached),
            Err(DiError::NotBound { .. })
        ));

        let owner = Arc::new(String::from("owner"));
        let scope = container.create_scope();
        let provider = scope.provider();
        provider.register_user(&owner).unwrap();

        assert!(provider.register_dependency(&detached).unwrap());
        assert!(!provider.register_dependency(&Arc::new(7u8)).unwrap());
        assert_eq!(log.count(Action::Dispose), 0);

        provider.deregister_dependency(&detached).unwrap();
        assert_eq!(log.ids(Action::Dispose), vec![detached.id]);
    }

    struct Eager {
        child: Deferred<Child>,
    }

    fn eager_container(log: &Arc<LifetimeLog>, fail: bool) -> Container {
        let registry = ServiceRegistry::new();
        registry.add(Child::describe(Lifetime::Transient, log).build().unwrap()).unwrap();
        registry
            .add(
                ImplementationDescriptor::builder::<Eager>(Lifetime::Transient)
                    .deferred::<Child>()
                    .construct(move |args| {
                        let child = args.deferred::<Child>()?;
                        child.get()?;
                        if fail {
                            return Err(DiError::creation_failed::<Eager>("refused"));
                        }
                        Ok(Eager { child })
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        build(registry)
    }

    #[test]
    fn test_deferred_forced_during_construction_owned_by_instance() {
        let log = Arc::new(LifetimeLog::default());
        let container = eager_container(&log, false);

        let eager = container.get::<Eager>().unwrap();
        assert!(eager.child.is_resolved());
        assert_eq!(container.lifetimes().tracked_transient_count(), 1);

        container.provider().remove_service(&eager).unwrap();
        assert_eq!(log.count_of(Action::Dispose, "Child"), 1);
        assert_eq!(container.lifetimes().tracked_transient_count(), 0);
    }

    #[test]
    fn test_deferred_forced_by_failed_construction_released() {
        let log = Arc::new(LifetimeLog::default());
        let container = eager_container(&log, true);

        assert!(matches!(
            container.get::<Eager>(),
            Err(DiError::CreationFailed { .. })
        ));
        assert_eq!(log.count_of(Action::Dispose, "Child"), 1);
        assert_eq!(container.lifetimes().tracked_transient_count(), 0);
    }

    #[test]
    fn test_scope_disposed_during_scoped_construction() {
        let log = Arc::new(LifetimeLog::default());
        let slot: Arc<Mutex<Option<ServiceScope>>> = Arc::default();
        let closer = Arc::clone(&slot);
        let child_log = Arc::clone(&log);
        let registry = ServiceRegistry::new();
        registry
            .add(
                ImplementationDescriptor::builder::<Child>(Lifetime::Scoped)
                    .construct(move |_| {
                        drop(closer.lock().take());
                        Ok(Child::new(&child_log))
                    })
                    .disposable()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let container = build(registry);

        let scope = container.create_scope();
        let provider = scope.provider().clone();
        *slot.lock() = Some(scope);

        assert!(matches!(
            provider.get::<Child>(),
            Err(DiError::ScopeDisposed { .. })
        ));
        assert_eq!(log.count_of(Action::Construct, "Child"), 1);
        assert_eq!(log.count_of(Action::Dispose, "Child"), 1);

        drop(container);
        assert_eq!(log.count_of(Action::Dispose, "Child"), 1);
    }

    #[allow(dead_code)]
    struct Fragile {
        child: Arc<Child>,
    }

    #[test]
    fn test_failed_construction_releases_transient_dependencies() {
        let log = Arc::new(LifetimeLog::default());
        let registry = ServiceRegistry::new();
        registry.add(Child::describe(Lifetime::Transient, &log).build().unwrap()).unwrap();
        registry
            .add(
                ImplementationDescriptor::builder::<Fragile>(Lifetime::Transient)
                    .inject::<Child>()
                    .construct(|args| {
                        let _child = args.instance::<Child>()?;
                        Err(DiError::creation_failed::<Fragile>("refused"))
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let container = build(registry);

        assert!(matches!(
            container.get::<Fragile>(),
            Err(DiError::CreationFailed { .. })
        ));
        assert_eq!(log.count_of(Action::Dispose, "Child"), 1);
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    struct Parent {
        child: Arc<Child>,
        log: Arc<LifetimeLog>,
    }

    impl Initialize for Parent {
        fn initialize(&self) {
            self.log.record(Action::Initialize, "Parent", 0);
        }
    }

    #[test]
    fn test_initialization_order() {
        let log = Arc::new(LifetimeLog::default());
        let registry = ServiceRegistry::new();
        registry.add(Child::describe(Lifetime::Any, &log).build().unwrap()).unwrap();
        let parent_log = Arc::clone(&log);
        registry
            .add(
                ImplementationDescriptor::builder::<Parent>(Lifetime::Any)
                    .inject::<Child>()
                    .construct(move |args| {
                        let child = args.instance::<Child>()?;
                        parent_log.record(Action::Construct, "Parent", 0);
                        Ok(Parent {
                            child,
                            log: Arc::clone(&parent_log),
                        })
                    })
                    .initializable()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let container = build(registry);

        let parent = container.get::<Parent>().unwrap();
        assert!(Arc::ptr_eq(&parent.child, &container.get::<Child>().unwrap()));
        assert_eq!(
            log.actions(),
            vec![
                (Action::Construct, "Child"),
                (Action::Construct, "Parent"),
                (Action::Initialize, "Child"),
                (Action::Initialize, "Parent"),
            ]
        );
    }

    struct ChildService {
        log: Arc<LifetimeLog>,
    }

    impl Initialize for ChildService {
        fn initialize(&self) {
            self.log.record(Action::Initialize, "ChildService", 0);
        }
    }

    impl Service for ChildService {
        type Dependencies = Arc<LifetimeLog>;

        fn create(log: Self::Dependencies) -> Self {
            log.record(Action::Construct, "ChildService", 0);
            ChildService { log }
        }

        fn configure(builder: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
            builder.initializable()
        }
    }

    struct ParentService {
        log: Arc<LifetimeLog>,
        _child: Arc<ChildService>,
    }

    impl Initialize for ParentService {
        fn initialize(&self) {
            self.log.record(Action::Initialize, "ParentService", 0);
        }
    }

    impl Service for ParentService {
        type Dependencies = (Arc<LifetimeLog>, Arc<ChildService>);

        fn create((log, child): Self::Dependencies) -> Self {
            log.record(Action::Construct, "ParentService", 0);
            ParentService { log, _child: child }
        }

        fn configure(builder: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
            builder.initializable()
        }
    }

    #[test]
    fn test_transient_initialization_order() {
        let registry = ServiceRegistry::new();
        registry
            .add(
                ImplementationDescriptor::builder::<LifetimeLog>(Lifetime::Singleton)
                    .construct(|_| Ok(LifetimeLog::default()))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry.register::<ChildService>(Lifetime::Transient).unwrap();
        registry.register::<ParentService>(Lifetime::Transient).unwrap();
        let container = build(registry);

        container.get::<ParentService>().unwrap();
        let log = container.get::<LifetimeLog>().unwrap();
        assert_eq!(
            log.actions(),
            vec![
                (Action::Construct, "ChildService"),
                (Action::Construct, "ParentService"),
                (Action::Initialize, "ChildService"),
                (Action::Initialize, "ParentService"),
            ]
        );
    }

    // =========================================================================
    // Custom arguments
    // =========================================================================

    struct Greeting {
        text: String,
        count: u32,
    }

    fn greeting_container() -> Container {
        let registry = ServiceRegistry::new();
        registry
            .add(
                ImplementationDescriptor::builder::<Greeting>(Lifetime::Transient)
                    .custom::<String>()
                    .custom::<u32>()
                    .construct(|args| {
                        Ok(Greeting {
                            text: args.custom()?,
                            count: args.custom()?,
                        })
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        build(registry)
    }

    #[test]
    fn test_custom_arguments_passed() {
        let container = greeting_container();
        let greeting = container
            .get_with::<Greeting>(vec![CustomArgument::new(String::from("hi")), CustomArgument::new(3u32)])
            .unwrap();
        assert_eq!(greeting.text, "hi");
        assert_eq!(greeting.count, 3);
    }

    #[test]
    fn test_custom_arguments_missing() {
        let container = greeting_container();
        assert!(matches!(
            container.get::<Greeting>(),
            Err(DiError::CustomArgumentMismatch { .. })
        ));
    }

    #[test]
    fn test_custom_arguments_too_many_or_wrong_type() {
        let container = greeting_container();
        let too_many = container.get_with::<Greeting>(vec![
            CustomArgument::new(String::from("hi")),
            CustomArgument::new(3u32),
            CustomArgument::new(true),
        ]);
        assert!(matches!(too_many, Err(DiError::CustomArgumentMismatch { .. })));

        let wrong = container
            .get_with::<Greeting>(vec![CustomArgument::new(3u32), CustomArgument::new(String::from("hi"))]);
        match wrong {
            Err(DiError::CustomArgumentMismatch { expected, received, .. }) => {
                assert_eq!(expected, vec!["String", "u32"]);
                assert_eq!(received, vec!["u32", "String"]);
            }
            other => panic!("expected mismatch, got {:?}", other.map(|_| ())),
        }
    }

    // =========================================================================
    // Cycles, deferred and collections
    // =========================================================================

    struct Left {
        right: Arc<Right>,
    }

    impl Service for Left {
        type Dependencies = Arc<Right>;

        fn create(right: Self::Dependencies) -> Self {
            Left { right }
        }
    }

    struct Right {
        left: Deferred<Left>,
    }

    impl Service for Right {
        type Dependencies = Deferred<Left>;

        fn create(left: Self::Dependencies) -> Self {
            Right { left }
        }
    }

    #[test]
    fn test_deferred_breaks_cycle() {
        let registry = ServiceRegistry::new();
        registry.register::<Left>(Lifetime::Singleton).unwrap();
        registry.register::<Right>(Lifetime::Singleton).unwrap();
        let container = Container::build(registry, ContainerOptions::new().validate_on_build(true)).unwrap();

        let left = container.get::<Left>().unwrap();
        assert!(!left.right.left.is_resolved());
        let back = left.right.left.get().unwrap();
        assert!(Arc::ptr_eq(&left, &back));
    }

    struct Loop {
        _inner: Arc<Loop>,
    }

    impl Service for Loop {
        type Dependencies = Arc<Loop>;

        fn create(inner: Self::Dependencies) -> Self {
            Loop { _inner: inner }
        }
    }

    #[test]
    fn test_direct_cycle_detected() {
        for options in [ContainerOptions::new(), ContainerOptions::new().validate(false)] {
            let registry = ServiceRegistry::new();
            registry.register::<Loop>(Lifetime::Transient).unwrap();
            let container = Container::build(registry, options).unwrap();

            match container.get::<Loop>() {
                Err(DiError::CircularDependency { chain }) => {
                    assert_eq!(chain.first().map(String::as_str), Some("Loop"));
                    assert_eq!(chain.last().map(String::as_str), Some("Loop"));
                }
                Err(other) => panic!("expected a cycle, got {other}"),
                Ok(_) => panic!("expected a cycle"),
            }
        }
    }

    struct Ping;
    struct Pong;

    #[test]
    fn test_two_node_cycle_constructs_nothing() {
        for options in [ContainerOptions::new(), ContainerOptions::new().validate(false)] {
            let log = Arc::new(LifetimeLog::default());
            let registry = ServiceRegistry::new();
            let ping_log = Arc::clone(&log);
            registry
                .add(
                    ImplementationDescriptor::builder::<Ping>(Lifetime::Transient)
                        .inject::<Pong>()
                        .construct(move |args| {
                            args.instance::<Pong>()?;
                            ping_log.record(Action::Construct, "Ping", 0);
                            Ok(Ping)
                        })
                        .build()
                        .unwrap(),
                )
                .unwrap();
            let pong_log = Arc::clone(&log);
            registry
                .add(
                    ImplementationDescriptor::builder::<Pong>(Lifetime::Transient)
                        .inject::<Ping>()
                        .construct(move |args| {
                            args.instance::<Ping>()?;
                            pong_log.record(Action::Construct, "Pong", 0);
                            Ok(Pong)
                        })
                        .build()
                        .unwrap(),
                )
                .unwrap();
            let container = Container::build(registry, options).unwrap();

            match container.get::<Ping>() {
                Err(DiError::CircularDependency { chain }) => {
                    assert_eq!(chain.first().map(String::as_str), Some("Ping"));
                    assert_eq!(chain.last().map(String::as_str), Some("Ping"));
                    assert!(chain.iter().any(|name| name == "Pong"));
                }
                Err(other) => panic!("expected a cycle, got {other}"),
                Ok(_) => panic!("expected a cycle"),
            }
            assert_eq!(log.count(Action::Construct), 0);
        }
    }

    #[test]
    fn test_validate_on_build_reports_cycle() {
        let registry = ServiceRegistry::new();
        registry.register::<Loop>(Lifetime::Singleton).unwrap();
        assert!(matches!(
            Container::build(registry, ContainerOptions::new().validate_on_build(true)),
            Err(DiError::CircularDependency { .. })
        ));
    }

    trait Plugin: Send + Sync {
        fn name(&self) -> &'static str;
    }

    impl Plugin for Child {
        fn name(&self) -> &'static str {
            "child"
        }
    }

    impl Plugin for Sibling {
        fn name(&self) -> &'static str {
            "sibling"
        }
    }

    struct PluginHost {
        plugins: AllImplementations<dyn Plugin>,
    }

    impl Service for PluginHost {
        type Dependencies = AllImplementations<dyn Plugin>;

        fn create(plugins: Self::Dependencies) -> Self {
            PluginHost { plugins }
        }
    }

    #[test]
    fn test_lazy_collection() {
        let log = Arc::new(LifetimeLog::default());
        let registry = ServiceRegistry::new();
        registry
            .add(
                Child::describe(Lifetime::Singleton, &log)
                    .implements::<dyn Plugin>(|c| c)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .add(
                Sibling::describe(Lifetime::Transient, &log)
                    .implements::<dyn Plugin>(|s| s)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry.register::<PluginHost>(Lifetime::Singleton).unwrap();
        let container = build(registry);

        let host = container.get::<PluginHost>().unwrap();
        assert_eq!(log.count(Action::Construct), 0);

        let names: Vec<_> = host.plugins.get().unwrap().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["child", "sibling"]);
        assert_eq!(log.count(Action::Construct), 2);

        // Ambiguous as a single service
        assert!(matches!(
            container.get::<dyn Plugin>(),
            Err(DiError::AmbiguousService { .. })
        ));

        // The transient is held by the host and released with the container
        drop(host);
        drop(container);
        assert_eq!(log.count_of(Action::Dispose, "Sibling"), 1);
        assert_eq!(log.count_of(Action::Dispose, "Child"), 1);
    }

    // =========================================================================
    // Generics and threads
    // =========================================================================

    #[test]
    fn test_open_generic_resolution() {
        let registry = ServiceRegistry::new();
        registry.add_open_generic(memory_store_template(Lifetime::Singleton)).unwrap();
        let container = build(registry);

        let users = container.get_closed::<dyn Store<User>>().unwrap();
        let orders = container.get_closed::<dyn Store<Order>>().unwrap();
        assert_eq!(users.entity(), "User");
        assert_eq!(orders.entity(), "Order");
        assert!(Arc::ptr_eq(&users, &container.get_closed::<dyn Store<User>>().unwrap()));
        assert!(matches!(
            container.get_closed::<dyn Store<u8>>(),
            Err(DiError::NotFound { .. })
        ));
    }

    #[test]
    fn test_plain_lookup_of_generic_service_independent_of_order() {
        let registry = ServiceRegistry::new();
        registry.add_open_generic(memory_store_template(Lifetime::Singleton)).unwrap();
        let container = build(registry);

        assert!(container.try_get::<dyn Store<Order>>().unwrap().is_none());
        container.get_closed::<dyn Store<Order>>().unwrap();
        assert!(container.try_get::<dyn Store<Order>>().unwrap().is_none());
        assert!(container.try_get::<dyn Store<User>>().unwrap().is_none());
    }

    struct Report {
        users: Closed<dyn Store<User>>,
    }

    impl Service for Report {
        type Dependencies = Closed<dyn Store<User>>;

        fn create(users: Self::Dependencies) -> Self {
            Report { users }
        }
    }

    #[test]
    fn test_closed_dependency_served_by_open_generic() {
        let registry = ServiceRegistry::new();
        registry.add_open_generic(memory_store_template(Lifetime::Singleton)).unwrap();
        registry.register::<Report>(Lifetime::Transient).unwrap();
        let container = Container::build(registry, ContainerOptions::new().validate_on_build(true)).unwrap();

        let report = container.get::<Report>().unwrap();
        assert_eq!(report.users.entity(), "User");
        assert!(Arc::ptr_eq(&*report.users, &container.get_closed::<dyn Store<User>>().unwrap()));
    }

    #[test]
    fn test_concurrent_singleton_resolution() {
        use std::thread;

        let (container, log) = single(Lifetime::Singleton);
        let container = Arc::new(container);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let container = Arc::clone(&container);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    let child = container.get::<Child>().unwrap();
                    seen.lock().push(child.id);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|id| *id == seen[0]));
        assert_eq!(log.count(Action::Construct), 1);
        assert_eq!(log.count(Action::Initialize), 1);
    }

    #[test]
    fn test_registry_frozen_after_build() {
        let (container, log) = single(Lifetime::Singleton);
        assert!(container.registry().is_frozen());
        assert!(matches!(
            container
                .registry()
                .add(Sibling::describe(Lifetime::Singleton, &log).build().unwrap()),
            Err(DiError::Configuration { .. })
        ));
    }
}
