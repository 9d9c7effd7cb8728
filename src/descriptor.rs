//! Implementation descriptors
//!
//! An [`ImplementationDescriptor`] is the immutable record of one registered
//! implementation: its identity, lifetime, the service types it can be cast
//! to, its constructor parameters and its lifecycle capabilities. Descriptors
//! are built with [`DescriptorBuilder`] and shared behind `Arc` once added to
//! a registry.

use crate::dependency::Deferred;
use crate::error::{DiError, Result};
use crate::key::{GenericDefinition, GenericType, TypeKey, readable_name};
use crate::lifetime::{Dispose, Initialize, Injectable, Lifetime};
use crate::provider::ServiceProvider;
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

/// Type-erased instance storage
pub(crate) type Erased = Arc<dyn Any + Send + Sync>;

type Caster = Box<dyn Fn(&Erased) -> Option<Box<dyn Any>> + Send + Sync>;
type Constructor = Box<dyn Fn(&mut Arguments) -> Result<Erased> + Send + Sync>;
type Hook = Box<dyn Fn(&Erased) + Send + Sync>;
type Materializer =
    Box<dyn Fn(&[TypeKey], Lifetime) -> Result<Option<ImplementationDescriptor>> + Send + Sync>;

// =============================================================================
// Parameters
// =============================================================================

/// One constructor parameter of an implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// Required service resolved before construction
    Injected(TypeKey),
    /// Service resolved before construction if registered
    Optional(TypeKey),
    /// Nested service provider bound to the constructed instance
    Provider,
    /// Service resolved on first use through a nested provider
    Deferred(TypeKey),
    /// Key of the implementation being constructed
    OwnType,
    /// Not injected; supplied by the caller at resolution time
    Custom(TypeKey),
}

impl Parameter {
    #[inline]
    pub fn is_custom(&self) -> bool {
        matches!(self, Parameter::Custom(_))
    }

    /// Key of an eagerly resolved service parameter
    #[inline]
    pub fn eager_dependency(&self) -> Option<&TypeKey> {
        match self {
            Parameter::Injected(key) | Parameter::Optional(key) => Some(key),
            _ => None,
        }
    }
}

struct ServiceBinding {
    key: TypeKey,
    cast: Caster,
}

// =============================================================================
// Implementation descriptor
// =============================================================================

/// Immutable description of one registered implementation
pub struct ImplementationDescriptor {
    key: TypeKey,
    lifetime: Lifetime,
    parameters: Vec<Parameter>,
    custom_start: usize,
    own: ServiceBinding,
    services: Vec<ServiceBinding>,
    constructor: Constructor,
    dispose: Option<Hook>,
    initialize: Option<Hook>,
}

impl ImplementationDescriptor {
    /// Start describing implementation `T`
    pub fn builder<T: Injectable>(lifetime: Lifetime) -> DescriptorBuilder<T> {
        DescriptorBuilder::new(lifetime)
    }

    #[inline]
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    #[inline]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// All constructor parameters in order
    #[inline]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Parameters resolved by the container, in order
    #[inline]
    pub fn dependency_parameters(&self) -> &[Parameter] {
        &self.parameters[..self.custom_start]
    }

    /// Eagerly resolved service dependencies, in order
    pub fn eager_dependencies(&self) -> impl Iterator<Item = &TypeKey> {
        self.dependency_parameters()
            .iter()
            .filter_map(Parameter::eager_dependency)
    }

    /// Types of the trailing caller-supplied parameters
    pub fn custom_parameter_types(&self) -> impl Iterator<Item = &TypeKey> {
        self.parameters[self.custom_start..]
            .iter()
            .filter_map(|parameter| match parameter {
                Parameter::Custom(key) => Some(key),
                _ => None,
            })
    }

    #[inline]
    pub fn custom_parameter_count(&self) -> usize {
        self.parameters.len() - self.custom_start
    }

    /// Service types this implementation is registered under
    pub fn service_types(&self) -> impl Iterator<Item = &TypeKey> {
        let own = self.services.is_empty().then_some(&self.own.key);
        own.into_iter()
            .chain(self.services.iter().map(|binding| &binding.key))
    }

    /// Whether this implementation can be resolved as `service`
    pub fn implements(&self, service: &TypeKey) -> bool {
        self.service_types().any(|key| key == service)
    }

    #[inline]
    pub fn is_disposable(&self) -> bool {
        self.dispose.is_some()
    }

    #[inline]
    pub fn is_initializable(&self) -> bool {
        self.initialize.is_some()
    }

    #[inline]
    pub fn readable_name(&self) -> String {
        self.key.readable_name()
    }

    pub(crate) fn construct(&self, arguments: &mut Arguments) -> Result<Erased> {
        (self.constructor)(arguments)
    }

    fn cast<S: ?Sized + 'static>(&self, value: &Erased) -> Option<Arc<S>> {
        let wanted = TypeId::of::<S>();
        let binding = if self.own.key.type_id() == Some(wanted) {
            &self.own
        } else {
            self.services
                .iter()
                .find(|binding| binding.key.type_id() == Some(wanted))?
        };
        (binding.cast)(value)?
            .downcast::<Arc<S>>()
            .ok()
            .map(|boxed| *boxed)
    }
}

impl fmt::Debug for ImplementationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationDescriptor")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("parameters", &self.parameters)
            .field("services", &self.service_types().collect::<Vec<_>>())
            .field("disposable", &self.is_disposable())
            .field("initializable", &self.is_initializable())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ImplementationDescriptor`]
///
/// # Examples
///
/// ```rust
/// use liman_di::{ImplementationDescriptor, Lifetime};
/// use std::sync::Arc;
///
/// trait Greeter: Send + Sync {
///     fn greet(&self) -> String;
/// }
///
/// struct English;
///
/// impl Greeter for English {
///     fn greet(&self) -> String {
///         "hello".into()
///     }
/// }
///
/// let descriptor = ImplementationDescriptor::builder::<English>(Lifetime::Singleton)
///     .implements::<dyn Greeter>(|e| e)
///     .construct(|_| Ok(English))
///     .build()
///     .unwrap();
///
/// assert_eq!(descriptor.service_types().count(), 1);
/// ```
pub struct DescriptorBuilder<T> {
    key: TypeKey,
    lifetime: Lifetime,
    parameters: Vec<Parameter>,
    services: Vec<ServiceBinding>,
    include_self: bool,
    constructor: Option<Constructor>,
    dispose: Option<Hook>,
    initialize: Option<Hook>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Injectable> DescriptorBuilder<T> {
    fn new(lifetime: Lifetime) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            lifetime,
            parameters: Vec::new(),
            services: Vec::new(),
            include_self: false,
            constructor: None,
            dispose: None,
            initialize: None,
            _marker: PhantomData,
        }
    }

    /// Identify the implementation as a closed generic so open-generic
    /// service lookups can reach it
    pub fn closed_generic(mut self) -> Self
    where
        T: GenericType,
    {
        self.key = TypeKey::closed::<T>();
        self
    }

    /// Append a constructor parameter
    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Append several constructor parameters
    pub fn parameters(mut self, parameters: impl IntoIterator<Item = Parameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    /// Require service `S`
    pub fn inject<S: ?Sized + Injectable>(self) -> Self {
        self.parameter(Parameter::Injected(TypeKey::of::<S>()))
    }

    /// Require the closed generic service `S`
    pub fn inject_closed<S: ?Sized + Injectable + GenericType>(self) -> Self {
        self.parameter(Parameter::Injected(TypeKey::closed::<S>()))
    }

    /// Resolve service `S` if registered
    pub fn optional<S: ?Sized + Injectable>(self) -> Self {
        self.parameter(Parameter::Optional(TypeKey::of::<S>()))
    }

    /// Receive a nested [`ServiceProvider`] bound to the new instance
    pub fn provider(self) -> Self {
        self.parameter(Parameter::Provider)
    }

    /// Receive a [`Deferred`] handle for service `S`
    pub fn deferred<S: ?Sized + Injectable>(self) -> Self {
        self.parameter(Parameter::Deferred(TypeKey::of::<S>()))
    }

    /// Receive the implementation's own [`TypeKey`]
    pub fn own_type(self) -> Self {
        self.parameter(Parameter::OwnType)
    }

    /// Take a caller-supplied argument of type `A`
    pub fn custom<A: Any + Send>(self) -> Self {
        self.parameter(Parameter::Custom(TypeKey::of::<A>()))
    }

    /// Register the implementation under service type `S`.
    ///
    /// The first call replaces the default service type (the implementation
    /// itself); use [`as_self`](Self::as_self) to keep it.
    pub fn implements<S>(self, cast: impl Fn(Arc<T>) -> Arc<S> + Send + Sync + 'static) -> Self
    where
        S: ?Sized + Injectable,
    {
        self.bind(TypeKey::of::<S>(), cast)
    }

    /// Register the implementation under the closed generic service type `S`
    pub fn implements_closed<S>(
        self,
        cast: impl Fn(Arc<T>) -> Arc<S> + Send + Sync + 'static,
    ) -> Self
    where
        S: ?Sized + Injectable + GenericType,
    {
        self.bind(TypeKey::closed::<S>(), cast)
    }

    /// Keep the implementation type itself among the service types
    pub fn as_self(mut self) -> Self {
        self.include_self = true;
        self
    }

    fn bind<S>(mut self, key: TypeKey, cast: impl Fn(Arc<T>) -> Arc<S> + Send + Sync + 'static) -> Self
    where
        S: ?Sized + Injectable,
    {
        let cast: Caster = Box::new(move |value| {
            let concrete = Arc::clone(value).downcast::<T>().ok()?;
            Some(Box::new(cast(concrete)) as Box<dyn Any>)
        });
        self.services.retain(|binding| binding.key != key);
        self.services.push(ServiceBinding { key, cast });
        self
    }

    /// Set the constructor delegate
    pub fn construct(
        mut self,
        constructor: impl Fn(&mut Arguments) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.constructor = Some(Box::new(move |arguments| {
            constructor(arguments).map(|value| Arc::new(value) as Erased)
        }));
        self
    }

    /// Call [`Dispose::dispose`] when the container releases an instance
    pub fn disposable(mut self) -> Self
    where
        T: Dispose,
    {
        self.dispose = Some(Box::new(|value| {
            if let Some(instance) = value.downcast_ref::<T>() {
                instance.dispose();
            }
        }));
        self
    }

    /// Call [`Initialize::initialize`] once the outermost construction finishes
    pub fn initializable(mut self) -> Self
    where
        T: Initialize,
    {
        self.initialize = Some(Box::new(|value| {
            if let Some(instance) = value.downcast_ref::<T>() {
                instance.initialize();
            }
        }));
        self
    }

    pub fn build(self) -> Result<ImplementationDescriptor> {
        let name = self.key.readable_name();
        let constructor = self
            .constructor
            .ok_or_else(|| DiError::configuration(&name, "no constructor was provided"))?;

        let custom_start = self
            .parameters
            .iter()
            .position(Parameter::is_custom)
            .unwrap_or(self.parameters.len());
        if self.parameters[custom_start..].iter().any(|p| !p.is_custom()) {
            return Err(DiError::configuration(
                &name,
                "custom parameters must be the last parameters of the constructor",
            ));
        }
        if self.lifetime == Lifetime::Application && custom_start < self.parameters.len() {
            return Err(DiError::configuration(
                &name,
                "application services are created at startup and cannot take custom parameters",
            ));
        }

        let own = ServiceBinding {
            key: self.key.clone(),
            cast: Box::new(|value| {
                let concrete = Arc::clone(value).downcast::<T>().ok()?;
                Some(Box::new(concrete) as Box<dyn Any>)
            }),
        };
        let mut services = self.services;
        if self.include_self && !services.is_empty() {
            services.retain(|binding| binding.key != own.key);
            services.insert(
                0,
                ServiceBinding {
                    key: own.key.clone(),
                    cast: Box::new(|value| {
                        let concrete = Arc::clone(value).downcast::<T>().ok()?;
                        Some(Box::new(concrete) as Box<dyn Any>)
                    }),
                },
            );
        }

        Ok(ImplementationDescriptor {
            key: self.key,
            lifetime: self.lifetime,
            parameters: self.parameters,
            custom_start,
            own,
            services,
            constructor,
            dispose: self.dispose,
            initialize: self.initialize,
        })
    }
}

// =============================================================================
// Open generic descriptor
// =============================================================================

/// Registration template for an open generic implementation.
///
/// The materializer receives the type arguments of a requested closed
/// service and returns the descriptor of the matching closed implementation,
/// or `None` when it does not support those arguments.
pub struct OpenGenericDescriptor {
    key: TypeKey,
    lifetime: Lifetime,
    services: Vec<TypeKey>,
    materialize: Materializer,
}

impl OpenGenericDescriptor {
    pub fn new<F>(definition: GenericDefinition, lifetime: Lifetime, materialize: F) -> Self
    where
        F: Fn(&[TypeKey], Lifetime) -> Result<Option<ImplementationDescriptor>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            key: TypeKey::open(definition),
            lifetime,
            services: Vec::new(),
            materialize: Box::new(materialize),
        }
    }

    /// Register the template under an open generic service type
    pub fn implements(mut self, service: TypeKey) -> Self {
        self.services.push(service);
        self
    }

    #[inline]
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    #[inline]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn service_types(&self) -> &[TypeKey] {
        if self.services.is_empty() {
            std::slice::from_ref(&self.key)
        } else {
            &self.services
        }
    }

    pub(crate) fn materialize(&self, arguments: &[TypeKey]) -> Result<Option<ImplementationDescriptor>> {
        (self.materialize)(arguments, self.lifetime)
    }
}

impl fmt::Debug for OpenGenericDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenGenericDescriptor")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("services", &self.service_types())
            .finish()
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Identity of an object graph node: the address of the shared value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(usize);

impl InstanceId {
    #[inline]
    pub fn of<T: ?Sized>(value: &Arc<T>) -> Self {
        Self(Arc::as_ptr(value) as *const () as usize)
    }
}

struct InstanceInner {
    value: Erased,
    descriptor: Arc<ImplementationDescriptor>,
    disposed: AtomicBool,
}

/// A constructed object together with the descriptor it was built from
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl Instance {
    pub(crate) fn new(value: Erased, descriptor: Arc<ImplementationDescriptor>) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                value,
                descriptor,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> InstanceId {
        InstanceId::of(&self.inner.value)
    }

    #[inline]
    pub fn descriptor(&self) -> &Arc<ImplementationDescriptor> {
        &self.inner.descriptor
    }

    #[inline]
    pub fn type_key(&self) -> &TypeKey {
        self.inner.descriptor.key()
    }

    /// View the instance as one of its service types (or its own type)
    pub fn cast<S: ?Sized + 'static>(&self) -> Option<Arc<S>> {
        self.inner.descriptor.cast::<S>(&self.inner.value)
    }

    #[inline]
    pub fn is_disposable(&self) -> bool {
        self.inner.descriptor.is_disposable()
    }

    #[inline]
    pub fn is_initializable(&self) -> bool {
        self.inner.descriptor.is_initializable()
    }

    /// Run the disposal hook; later calls are no-ops
    pub(crate) fn dispose(&self) {
        if let Some(hook) = &self.inner.descriptor.dispose {
            if !self.inner.disposed.swap(true, Ordering::AcqRel) {
                hook(&self.inner.value);
            }
        }
    }

    pub(crate) fn initialize(&self) {
        if let Some(hook) = &self.inner.descriptor.initialize {
            hook(&self.inner.value);
        }
    }

    pub(crate) fn downgrade(&self) -> WeakInstance {
        WeakInstance {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning handle to an [`Instance`]
#[derive(Clone)]
pub(crate) struct WeakInstance {
    inner: Weak<InstanceInner>,
}

impl WeakInstance {
    #[inline]
    pub fn upgrade(&self) -> Option<Instance> {
        self.inner.upgrade().map(|inner| Instance { inner })
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type", self.type_key())
            .field("id", &self.id())
            .finish()
    }
}

// =============================================================================
// Constructor arguments
// =============================================================================

/// Caller-supplied value for a non-injected parameter
pub struct CustomArgument {
    value: Box<dyn Any + Send>,
    type_id: TypeId,
    type_name: &'static str,
}

impl CustomArgument {
    pub fn new<A: Any + Send>(value: A) -> Self {
        Self {
            value: Box::new(value),
            type_id: TypeId::of::<A>(),
            type_name: std::any::type_name::<A>(),
        }
    }

    #[inline]
    pub(crate) fn matches(&self, key: &TypeKey) -> bool {
        key.type_id() == Some(self.type_id)
    }

    #[inline]
    pub fn readable_name(&self) -> String {
        readable_name(self.type_name)
    }
}

impl fmt::Debug for CustomArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomArgument({})", self.readable_name())
    }
}

pub(crate) enum Argument {
    Instance(Instance),
    Missing(TypeKey),
    Provider(ServiceProvider),
    OwnType(TypeKey),
    Custom(CustomArgument),
}

/// Resolved constructor arguments, consumed in parameter order
pub struct Arguments {
    implementation: String,
    values: std::vec::IntoIter<Argument>,
}

impl Arguments {
    pub(crate) fn new(implementation: &TypeKey, values: Vec<Argument>) -> Self {
        Self {
            implementation: implementation.readable_name(),
            values: values.into_iter(),
        }
    }

    fn next(&mut self) -> Result<Argument> {
        self.values.next().ok_or_else(|| {
            DiError::Internal(format!(
                "constructor of {} read more arguments than it declares",
                self.implementation
            ))
        })
    }

    fn unexpected(&self, wanted: &str) -> DiError {
        DiError::Internal(format!(
            "constructor of {} expected {wanted} at this position",
            self.implementation
        ))
    }

    fn downcast<S: ?Sized + 'static>(&self, instance: Instance) -> Result<Arc<S>> {
        instance.cast::<S>().ok_or_else(|| {
            DiError::Internal(format!(
                "{} cannot be used as {}",
                instance.type_key(),
                readable_name(std::any::type_name::<S>())
            ))
        })
    }

    /// Next required service
    pub fn instance<S: ?Sized + Injectable>(&mut self) -> Result<Arc<S>> {
        match self.next()? {
            Argument::Instance(instance) => self.downcast(instance),
            Argument::Missing(key) => Err(DiError::UnregisteredDependency {
                implementation: self.implementation.clone(),
                dependency: key.readable_name(),
            }),
            _ => Err(self.unexpected("an injected service")),
        }
    }

    /// Next optional service
    pub fn optional<S: ?Sized + Injectable>(&mut self) -> Result<Option<Arc<S>>> {
        match self.next()? {
            Argument::Instance(instance) => self.downcast(instance).map(Some),
            Argument::Missing(_) => Ok(None),
            _ => Err(self.unexpected("an optional service")),
        }
    }

    /// Next nested service provider
    pub fn provider(&mut self) -> Result<ServiceProvider> {
        match self.next()? {
            Argument::Provider(provider) => Ok(provider),
            _ => Err(self.unexpected("a service provider")),
        }
    }

    /// Next deferred service handle
    pub fn deferred<S: ?Sized + Injectable>(&mut self) -> Result<Deferred<S>> {
        self.provider().map(Deferred::new)
    }

    /// The key of the implementation being constructed
    pub fn own_type(&mut self) -> Result<TypeKey> {
        match self.next()? {
            Argument::OwnType(key) => Ok(key),
            _ => Err(self.unexpected("the implementation type")),
        }
    }

    /// Next caller-supplied value
    pub fn custom<A: Any + Send>(&mut self) -> Result<A> {
        match self.next()? {
            Argument::Custom(argument) => argument
                .value
                .downcast::<A>()
                .map(|boxed| *boxed)
                .map_err(|_| self.unexpected(std::any::type_name::<A>())),
            _ => Err(self.unexpected("a custom argument")),
        }
    }
}
