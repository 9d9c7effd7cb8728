//! Factory types for creating service instances
//!
//! One factory exists per implementation (per effective lifetime) and owns
//! the lifetime-specific storage: the singleton slot, the per-scope map, or
//! nothing for transients. All of them share the same creation pipeline in
//! [`FactoryCore`]: argument checks, cycle guard, dependency resolution,
//! construction, storage, user registration and deferred initialization.
//!
//! Dispatch is an enum rather than a trait object, with a few constant
//! variants for parameters that are not backed by a descriptor.

use crate::descriptor::{Argument, Arguments, CustomArgument, ImplementationDescriptor, Instance, InstanceId};
use crate::error::{DiError, Result};
use crate::key::TypeKey;
use crate::lifetime::Lifetime;
use crate::provider::{FactoryProvider, ServiceProvider};
use crate::scope::{Scope, ScopeHandle};
use ahash::RandomState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Something a constructor received that must be wired up after construction
enum Used {
    Instance(ServiceFactory, Instance),
    Provider(ServiceProvider),
}

// =============================================================================
// Shared creation pipeline
// =============================================================================

struct FactoryCore {
    descriptor: Arc<ImplementationDescriptor>,
    dependencies: OnceCell<Vec<ServiceFactory>>,
}

impl FactoryCore {
    fn new(descriptor: Arc<ImplementationDescriptor>) -> Self {
        Self {
            descriptor,
            dependencies: OnceCell::new(),
        }
    }

    fn check_custom(&self, custom: &[CustomArgument]) -> Result<()> {
        let expected: Vec<&TypeKey> = self.descriptor.custom_parameter_types().collect();
        let matches = custom.len() == expected.len()
            && custom.iter().zip(&expected).all(|(argument, key)| argument.matches(key));
        if matches {
            return Ok(());
        }
        Err(DiError::CustomArgumentMismatch {
            implementation: self.descriptor.readable_name(),
            expected: expected.iter().map(|key| key.readable_name()).collect(),
            received: custom.iter().map(CustomArgument::readable_name).collect(),
        })
    }

    /// Build a new instance.
    ///
    /// `store` runs after construction and before deferred initialization,
    /// so re-entrant lookups from initialize hooks find the stored instance.
    fn create(
        &self,
        factories: &Arc<FactoryProvider>,
        scope: Option<&ScopeHandle>,
        custom: Vec<CustomArgument>,
        store: impl FnOnce(&Instance),
    ) -> Result<Instance> {
        self.check_custom(&custom)?;
        factories.prepare_creation(&self.descriptor)?;

        let mut used = Vec::new();
        match self.construct(factories, scope, custom, &mut used) {
            Ok(instance) => {
                store(&instance);
                let wired = self.wire(factories, &instance, used);
                factories.finish_creation(&self.descriptor, wired.is_ok().then_some(&instance));
                wired.map(|()| instance)
            }
            Err(err) => {
                factories.finish_creation(&self.descriptor, None);
                for entry in used {
                    match entry {
                        Used::Instance(ServiceFactory::Transient(_), orphan) => {
                            factories.lifetimes().delete(&orphan)
                        }
                        Used::Provider(provider) => provider.abandon(),
                        Used::Instance(..) => {}
                    }
                }

                #[cfg(feature = "logging")]
                debug!(
                    target: "liman_di",
                    implementation = %self.descriptor.key(),
                    error = %err,
                    "Construction failed"
                );

                Err(err)
            }
        }
    }

    fn construct(
        &self,
        factories: &Arc<FactoryProvider>,
        scope: Option<&ScopeHandle>,
        custom: Vec<CustomArgument>,
        used: &mut Vec<Used>,
    ) -> Result<Instance> {
        let dependencies = self
            .dependencies
            .get_or_try_init(|| factories.used_services(&self.descriptor))?;

        let mut arguments = Vec::with_capacity(dependencies.len() + custom.len());
        for factory in dependencies {
            let argument = match factory {
                ServiceFactory::Null(key) => Argument::Missing(key.clone()),
                ServiceFactory::Constant(key) => Argument::OwnType(key.clone()),
                ServiceFactory::Provider => {
                    let provider = factories.construction_provider(scope);
                    used.push(Used::Provider(provider.clone()));
                    Argument::Provider(provider)
                }
                resolved => {
                    let Some(instance) = resolved.get(factories, scope, Vec::new())? else {
                        return Err(DiError::Internal(format!(
                            "factory for a dependency of {} produced nothing",
                            self.descriptor.key()
                        )));
                    };
                    used.push(Used::Instance(resolved.clone(), instance.clone()));
                    Argument::Instance(instance)
                }
            };
            arguments.push(argument);
        }
        arguments.extend(custom.into_iter().map(Argument::Custom));

        let mut arguments = Arguments::new(self.descriptor.key(), arguments);
        let value = self.descriptor.construct(&mut arguments)?;
        Ok(Instance::new(value, Arc::clone(&self.descriptor)))
    }

    /// Bind nested providers to the new instance and record the transients it holds
    fn wire(&self, factories: &Arc<FactoryProvider>, instance: &Instance, used: Vec<Used>) -> Result<()> {
        for entry in used {
            match entry {
                Used::Instance(factory, dependency) => {
                    factory.register_user(factories, instance.id(), &dependency)
                }
                Used::Provider(provider) => provider.adopt(instance.id())?,
            }
        }
        Ok(())
    }
}

// =============================================================================
// Singleton Factory
// =============================================================================

/// Creates the instance on first access, then shares it.
///
/// Also used for `Application` implementations and for `Any` implementations
/// without scoped dependencies.
pub(crate) struct SingletonFactory {
    core: FactoryCore,
    lifetime: Lifetime,
    instance: OnceCell<Instance>,
    construction: Mutex<()>,
}

impl SingletonFactory {
    fn new(descriptor: Arc<ImplementationDescriptor>, lifetime: Lifetime) -> Self {
        Self {
            core: FactoryCore::new(descriptor),
            lifetime,
            instance: OnceCell::new(),
            construction: Mutex::new(()),
        }
    }

    fn get(&self, factories: &Arc<FactoryProvider>, custom: Vec<CustomArgument>) -> Result<Instance> {
        if let Some(instance) = self.instance.get() {
            return Ok(instance.clone());
        }

        // A cycle on this thread must fail instead of waiting on itself
        factories.ensure_not_in_progress(&self.core.descriptor)?;
        let _guard = self.construction.lock();
        if let Some(instance) = self.instance.get() {
            return Ok(instance.clone());
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "liman_di",
            implementation = %self.core.descriptor.key(),
            lifetime = %self.lifetime,
            "Creating singleton on first access"
        );

        self.core.create(factories, None, custom, |instance| {
            let _ = self.instance.set(instance.clone());
            factories.lifetimes().add_singleton(instance);
        })
    }
}

// =============================================================================
// Scoped Factory
// =============================================================================

/// One instance per scope
pub(crate) struct ScopedFactory {
    core: FactoryCore,
    instances: DashMap<Scope, Instance, RandomState>,
}

impl ScopedFactory {
    fn new(descriptor: Arc<ImplementationDescriptor>) -> Self {
        Self {
            core: FactoryCore::new(descriptor),
            instances: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
        }
    }

    fn get(
        self: &Arc<Self>,
        factories: &Arc<FactoryProvider>,
        scope: Option<&ScopeHandle>,
        custom: Vec<CustomArgument>,
    ) -> Result<Instance> {
        let Some(scope) = scope else {
            return Err(DiError::ScopeRequired {
                implementation: self.core.descriptor.readable_name(),
            });
        };
        if let Some(instance) = self.instances.get(&scope.id()) {
            return Ok(instance.value().clone());
        }
        scope.ensure_active(&self.core.descriptor)?;

        let mut winner = None;
        let mut closed = false;
        let instance = self.core.create(factories, Some(scope), custom, |instance| {
            let inserted = match self.instances.entry(scope.id()) {
                Entry::Occupied(existing) => {
                    winner = Some(existing.get().clone());
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(instance.clone());
                    true
                }
            };
            if inserted {
                scope.register(Arc::clone(self));
                // The scope may have been disposed while this instance was built
                closed = scope.is_disposed();
            }
        })?;

        if closed {
            self.instances
                .remove_if(&scope.id(), |_, stored| stored.id() == instance.id());
            factories.lifetimes().delete(&instance);
            scope.ensure_active(&self.core.descriptor)?;
        }

        match winner {
            Some(winner) => {
                #[cfg(feature = "logging")]
                trace!(
                    target: "liman_di",
                    implementation = %self.core.descriptor.key(),
                    scope = %scope.id(),
                    "Lost scoped creation race, discarding duplicate"
                );
                factories.lifetimes().delete(&instance);
                Ok(winner)
            }
            None => Ok(instance),
        }
    }

    /// Remove the instance held for a scope
    pub(crate) fn evict(&self, scope: Scope) -> Option<Instance> {
        self.instances.remove(&scope).map(|(_, instance)| instance)
    }
}

// =============================================================================
// Transient Factory
// =============================================================================

/// New instance on every resolve
pub(crate) struct TransientFactory {
    core: FactoryCore,
}

impl TransientFactory {
    fn new(descriptor: Arc<ImplementationDescriptor>) -> Self {
        Self {
            core: FactoryCore::new(descriptor),
        }
    }

    fn get(
        &self,
        factories: &Arc<FactoryProvider>,
        scope: Option<&ScopeHandle>,
        custom: Vec<CustomArgument>,
    ) -> Result<Instance> {
        #[cfg(feature = "logging")]
        trace!(
            target: "liman_di",
            implementation = %self.core.descriptor.key(),
            "Creating new transient instance"
        );

        self.core.create(factories, scope, custom, |_| {})
    }
}

// =============================================================================
// ServiceFactory - Enum-based dispatch
// =============================================================================

#[derive(Clone)]
pub(crate) enum ServiceFactory {
    /// Nothing registered for the requested service
    Null(TypeKey),
    /// The key of the implementation being constructed
    Constant(TypeKey),
    /// A nested provider for the instance being constructed
    Provider,
    Singleton(Arc<SingletonFactory>),
    Scoped(Arc<ScopedFactory>),
    Transient(Arc<TransientFactory>),
}

impl ServiceFactory {
    /// Create the factory for an implementation with its effective lifetime
    pub fn for_descriptor(descriptor: Arc<ImplementationDescriptor>, lifetime: Lifetime) -> Self {
        match lifetime {
            Lifetime::Scoped => ServiceFactory::Scoped(Arc::new(ScopedFactory::new(descriptor))),
            Lifetime::Transient => {
                ServiceFactory::Transient(Arc::new(TransientFactory::new(descriptor)))
            }
            Lifetime::Any | Lifetime::Singleton | Lifetime::Application => {
                ServiceFactory::Singleton(Arc::new(SingletonFactory::new(descriptor, lifetime)))
            }
        }
    }

    /// Effective lifetime of what this factory produces
    pub fn lifetime(&self) -> Lifetime {
        match self {
            ServiceFactory::Null(_) | ServiceFactory::Constant(_) => Lifetime::Singleton,
            ServiceFactory::Provider | ServiceFactory::Transient(_) => Lifetime::Transient,
            ServiceFactory::Singleton(factory) => factory.lifetime,
            ServiceFactory::Scoped(_) => Lifetime::Scoped,
        }
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceFactory::Transient(_))
    }

    /// Produce an instance; `None` for factories not backed by a descriptor
    pub fn get(
        &self,
        factories: &Arc<FactoryProvider>,
        scope: Option<&ScopeHandle>,
        custom: Vec<CustomArgument>,
    ) -> Result<Option<Instance>> {
        match self {
            ServiceFactory::Null(_) | ServiceFactory::Constant(_) | ServiceFactory::Provider => {
                Ok(None)
            }
            ServiceFactory::Singleton(factory) => factory.get(factories, custom).map(Some),
            ServiceFactory::Scoped(factory) => factory.get(factories, scope, custom).map(Some),
            ServiceFactory::Transient(factory) => factory.get(factories, scope, custom).map(Some),
        }
    }

    /// Record that `user` holds an instance produced by this factory
    pub fn register_user(&self, factories: &FactoryProvider, user: InstanceId, instance: &Instance) {
        if self.is_transient() {
            factories.lifetimes().add_transient_dependency(user, instance);
        }
    }
}
