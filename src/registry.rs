//! Service registry
//!
//! The registry maps service types to the implementations registered for
//! them and answers every graph question the container asks before building
//! anything: which implementation satisfies a service, what lifetime an
//! `Any` implementation effectively has, and whether a dependency graph is
//! free of construction cycles and lifetime violations.
//!
//! Uses DashMap for concurrent access; registration is expected to finish
//! before the container is built, after which the registry is frozen.

use crate::dependency::Service;
use crate::descriptor::{ImplementationDescriptor, OpenGenericDescriptor, Parameter};
use crate::error::{DiError, Result};
use crate::key::{GenericDefinition, TypeKey};
use crate::lifetime::Lifetime;
use ahash::RandomState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

type MaterializedKey = (GenericDefinition, Vec<TypeKey>);

fn new_map<K: Eq + std::hash::Hash, V>() -> DashMap<K, V, RandomState> {
    DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8)
}

/// Registered implementations, indexed by service and by implementation
pub struct ServiceRegistry {
    /// Service type to implementations, in registration order
    by_service: DashMap<TypeKey, Vec<Arc<ImplementationDescriptor>>, RandomState>,
    /// Open generic service definition to templates implementing it
    generics_by_service: DashMap<GenericDefinition, Vec<Arc<OpenGenericDescriptor>>, RandomState>,
    /// Implementation type to descriptor, including materialized generics
    by_implementation: DashMap<TypeKey, Arc<ImplementationDescriptor>, RandomState>,
    /// Open generic templates by their own definition
    templates: DashMap<GenericDefinition, Arc<OpenGenericDescriptor>, RandomState>,
    /// Materialized closed implementations per template and type arguments
    materialized: DashMap<MaterializedKey, Arc<ImplementationDescriptor>, RandomState>,
    registrations: Mutex<Vec<(TypeKey, Arc<ImplementationDescriptor>)>>,
    application: Mutex<Vec<Arc<ImplementationDescriptor>>>,
    frozen: AtomicBool,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            by_service: new_map(),
            generics_by_service: new_map(),
            by_implementation: new_map(),
            templates: new_map(),
            materialized: new_map(),
            registrations: Mutex::new(Vec::new()),
            application: Mutex::new(Vec::new()),
            frozen: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register an implementation under each of its service types.
    ///
    /// Registering an implementation type a second time is a no-op.
    pub fn add(&self, descriptor: ImplementationDescriptor) -> Result<()> {
        self.ensure_open(descriptor.key())?;

        let descriptor = Arc::new(descriptor);
        match self.by_implementation.entry(descriptor.key().clone()) {
            Entry::Occupied(_) => {
                #[cfg(feature = "logging")]
                trace!(
                    target: "liman_di",
                    implementation = %descriptor.key(),
                    "Implementation already registered, ignoring"
                );
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&descriptor));
            }
        }

        let mut registrations = self.registrations.lock();
        for service in descriptor.service_types() {
            self.by_service
                .entry(service.clone())
                .or_default()
                .push(Arc::clone(&descriptor));
            registrations.push((service.clone(), Arc::clone(&descriptor)));
        }
        drop(registrations);

        if descriptor.lifetime() == Lifetime::Application {
            self.application.lock().push(Arc::clone(&descriptor));
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "liman_di",
            implementation = %descriptor.key(),
            lifetime = %descriptor.lifetime(),
            services = descriptor.service_types().count(),
            "Registered implementation"
        );

        Ok(())
    }

    /// Register a [`Service`] with the given lifetime
    pub fn register<T: Service>(&self, lifetime: Lifetime) -> Result<()> {
        self.add(T::descriptor(lifetime)?)
    }

    /// Register an open generic implementation template
    pub fn add_open_generic(&self, template: OpenGenericDescriptor) -> Result<()> {
        let name = template.key().readable_name();
        self.ensure_open(template.key())?;

        if template.lifetime() == Lifetime::Application {
            return Err(DiError::configuration(
                name,
                "open generic implementations cannot have the application lifetime",
            ));
        }
        if let Some(service) = template.service_types().iter().find(|s| !s.is_open()) {
            return Err(DiError::configuration(
                name,
                format!("open generic implementation cannot implement non-generic service {service}"),
            ));
        }
        let Some(definition) = template.key().generic_definition() else {
            return Err(DiError::Internal(format!("{name} has no generic definition")));
        };

        let template = Arc::new(template);
        match self.templates.entry(definition) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&template));
            }
        }

        for service in template.service_types() {
            if let Some(service_definition) = service.generic_definition() {
                self.generics_by_service
                    .entry(service_definition)
                    .or_default()
                    .push(Arc::clone(&template));
            }
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "liman_di",
            implementation = %template.key(),
            lifetime = %template.lifetime(),
            "Registered open generic implementation"
        );

        Ok(())
    }

    /// Reject further registrations
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    fn ensure_open(&self, key: &TypeKey) -> Result<()> {
        if self.is_frozen() {
            return Err(DiError::configuration(
                key.readable_name(),
                "the registry is frozen because a container was built from it",
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Number of registered concrete implementations
    #[inline]
    pub fn len(&self) -> usize {
        self.by_implementation.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_implementation.is_empty() && self.templates.is_empty()
    }

    /// Descriptor of a registered (or already materialized) implementation
    pub fn implementation(&self, key: &TypeKey) -> Option<Arc<ImplementationDescriptor>> {
        self.by_implementation
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All implementations of a service, materializing open generics on demand
    pub fn get_all(&self, service: &TypeKey) -> Result<Vec<Arc<ImplementationDescriptor>>> {
        let mut found = self
            .by_service
            .get(service)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        if service.is_closed_generic() {
            let templates = service
                .generic_definition()
                .and_then(|definition| self.generics_by_service.get(&definition))
                .map(|entry| entry.value().clone())
                .unwrap_or_default();

            for template in templates {
                if let Some(descriptor) = self.materialize(&template, service)? {
                    if !found.iter().any(|d| d.key() == descriptor.key()) {
                        found.push(descriptor);
                    }
                }
            }
        }

        Ok(found)
    }

    /// The single implementation of a service, if any
    pub fn try_resolve_single(&self, service: &TypeKey) -> Result<Option<Arc<ImplementationDescriptor>>> {
        let mut all = self.get_all(service)?;
        match all.len() {
            0 | 1 => Ok(all.pop()),
            _ => Err(DiError::AmbiguousService {
                service: service.readable_name(),
                implementations: all.iter().map(|d| d.readable_name()).collect(),
            }),
        }
    }

    fn materialize(
        &self,
        template: &OpenGenericDescriptor,
        service: &TypeKey,
    ) -> Result<Option<Arc<ImplementationDescriptor>>> {
        let Some(definition) = template.key().generic_definition() else {
            return Ok(None);
        };
        let cache_key = (definition, service.generic_arguments().to_vec());

        let cached = self
            .materialized
            .get(&cache_key)
            .map(|entry| Arc::clone(entry.value()));
        let descriptor = match cached {
            Some(descriptor) => descriptor,
            None => {
                let Some(descriptor) = template.materialize(service.generic_arguments())? else {
                    return Ok(None);
                };
                if descriptor.lifetime() != template.lifetime() {
                    return Err(DiError::configuration(
                        descriptor.readable_name(),
                        format!(
                            "materialized with lifetime {} but {} is registered as {}",
                            descriptor.lifetime(),
                            template.key(),
                            template.lifetime()
                        ),
                    ));
                }

                #[cfg(feature = "logging")]
                trace!(
                    target: "liman_di",
                    template = %template.key(),
                    implementation = %descriptor.key(),
                    "Materialized open generic implementation"
                );

                let descriptor = Arc::new(descriptor);
                let descriptor = Arc::clone(
                    self.by_implementation
                        .entry(descriptor.key().clone())
                        .or_insert(descriptor)
                        .value(),
                );
                Arc::clone(self.materialized.entry(cache_key).or_insert(descriptor).value())
            }
        };

        if !descriptor.implements(service) {
            return Err(DiError::configuration(
                descriptor.readable_name(),
                format!("materialized from {} but does not implement {service}", template.key()),
            ));
        }
        Ok(Some(descriptor))
    }

    /// Implementations registered with the application lifetime
    pub fn application_implementations(&self) -> Vec<Arc<ImplementationDescriptor>> {
        self.application.lock().clone()
    }

    /// Every concrete (service type, implementation) registration
    pub fn get_all_service_implementations(&self) -> Vec<(TypeKey, Arc<ImplementationDescriptor>)> {
        self.registrations.lock().clone()
    }

    // =========================================================================
    // Lifetime analysis
    // =========================================================================

    /// Resolve `Any` to scoped or singleton; other lifetimes are returned as is
    pub fn effective_lifetime(&self, descriptor: &ImplementationDescriptor) -> Result<Lifetime> {
        match descriptor.lifetime() {
            Lifetime::Any => Ok(if self.has_scoped_dependency(descriptor)? {
                Lifetime::Scoped
            } else {
                Lifetime::Singleton
            }),
            lifetime => Ok(lifetime),
        }
    }

    /// Whether any eager dependency path reaches a scoped implementation
    /// through `Any` or transient implementations
    pub fn has_scoped_dependency(&self, descriptor: &ImplementationDescriptor) -> Result<bool> {
        Ok(!self.scoped_dependency_paths(descriptor)?.is_empty())
    }

    /// Every dependency path from `descriptor` to a scoped implementation
    pub fn scoped_dependency_paths(&self, descriptor: &ImplementationDescriptor) -> Result<Vec<String>> {
        let mut path = vec![descriptor.key().clone()];
        let mut paths = Vec::new();
        self.collect_scoped_paths(descriptor, &mut path, &mut paths)?;
        Ok(paths)
    }

    fn collect_scoped_paths(
        &self,
        descriptor: &ImplementationDescriptor,
        path: &mut Vec<TypeKey>,
        paths: &mut Vec<String>,
    ) -> Result<()> {
        for key in descriptor.eager_dependencies() {
            let Some(dependency) = self.try_resolve_single(key)? else {
                continue;
            };
            if path.contains(dependency.key()) {
                continue;
            }

            path.push(dependency.key().clone());
            match dependency.lifetime() {
                Lifetime::Scoped => paths.push(render_chain(path).join(" -> ")),
                Lifetime::Any | Lifetime::Transient => {
                    self.collect_scoped_paths(&dependency, path, paths)?
                }
                Lifetime::Singleton | Lifetime::Application => {}
            }
            path.pop();
        }
        Ok(())
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate one implementation's dependency graph.
    ///
    /// Fails when a singleton-like implementation has scoped dependencies,
    /// when a required eager dependency is not registered, or when eager
    /// dependencies form a cycle. Deferred and provider parameters are not
    /// followed.
    pub fn validate(&self, descriptor: &ImplementationDescriptor) -> Result<()> {
        if descriptor.lifetime().is_singleton_like() {
            let paths = self.scoped_dependency_paths(descriptor)?;
            if !paths.is_empty() {
                return Err(DiError::InvalidLifetimeCombination {
                    implementation: descriptor.readable_name(),
                    lifetime: descriptor.lifetime().to_string(),
                    paths,
                });
            }
        }

        let mut stack = vec![descriptor.key().clone()];
        let mut done = HashSet::new();
        self.validate_dependencies(descriptor, &mut stack, &mut done)
    }

    fn validate_dependencies(
        &self,
        descriptor: &ImplementationDescriptor,
        stack: &mut Vec<TypeKey>,
        done: &mut HashSet<TypeKey>,
    ) -> Result<()> {
        for parameter in descriptor.dependency_parameters() {
            let (key, required) = match parameter {
                Parameter::Injected(key) => (key, true),
                Parameter::Optional(key) => (key, false),
                _ => continue,
            };

            let dependency = match self.try_resolve_single(key)? {
                Some(dependency) => dependency,
                None if required => {
                    return Err(DiError::UnregisteredDependency {
                        implementation: descriptor.readable_name(),
                        dependency: key.readable_name(),
                    });
                }
                None => continue,
            };

            if stack.contains(dependency.key()) {
                let mut chain = render_chain(stack);
                chain.push(dependency.readable_name());
                return Err(DiError::CircularDependency { chain });
            }
            if done.contains(dependency.key()) {
                continue;
            }

            stack.push(dependency.key().clone());
            self.validate_dependencies(&dependency, stack, done)?;
            stack.pop();
            done.insert(dependency.key().clone());
        }
        Ok(())
    }

    /// Validate every registered implementation
    pub fn validate_all(&self) -> Result<()> {
        let descriptors: Vec<_> = self
            .by_implementation
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for descriptor in descriptors {
            self.validate(&descriptor)?;
        }
        Ok(())
    }

    /// Validate the implementation registered for a service
    pub fn validate_service(&self, service: &TypeKey) -> Result<()> {
        match self.try_resolve_single(service)? {
            Some(descriptor) => self.validate(&descriptor),
            None => Err(DiError::NotFound {
                type_name: service.readable_name(),
            }),
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("implementations", &self.by_implementation.len())
            .field("open_generics", &self.templates.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

fn render_chain(keys: &[TypeKey]) -> Vec<String> {
    keys.iter().map(TypeKey::readable_name).collect()
}
