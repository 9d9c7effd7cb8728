//! Typed dependency declarations
//!
//! This module lets a service declare its constructor dependencies as Rust
//! types, from which the registration's parameter list and the argument
//! extraction are derived.
//!
//! # Example
//!
//! ```rust
//! use liman_di::{Container, ContainerOptions, Lifetime, Service, ServiceRegistry};
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: String,
//! }
//!
//! impl Service for Database {
//!     type Dependencies = ();
//!
//!     fn create(_deps: Self::Dependencies) -> Self {
//!         Database { url: "postgres://localhost".into() }
//!     }
//! }
//!
//! struct UserRepository {
//!     db: Arc<Database>,
//! }
//!
//! impl Service for UserRepository {
//!     type Dependencies = Arc<Database>;
//!
//!     fn create(db: Self::Dependencies) -> Self {
//!         UserRepository { db }
//!     }
//! }
//!
//! let registry = ServiceRegistry::new();
//! registry.register::<Database>(Lifetime::Singleton).unwrap();
//! registry.register::<UserRepository>(Lifetime::Transient).unwrap();
//!
//! let container = Container::build(registry, ContainerOptions::default()).unwrap();
//! let repo = container.get::<UserRepository>().unwrap();
//! assert_eq!(repo.db.url, "postgres://localhost");
//! ```

use crate::descriptor::{Arguments, DescriptorBuilder, ImplementationDescriptor, Parameter};
use crate::error::Result;
use crate::key::{GenericType, TypeKey};
use crate::lifetime::{Injectable, Lifetime};
use crate::provider::ServiceProvider;
use once_cell::sync::OnceCell;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

// =============================================================================
// Service Trait
// =============================================================================

/// A service that declares its dependencies as types.
///
/// # Supported Dependency Types
///
/// - `()` - No dependencies
/// - `Arc<T>` - Required service
/// - `Option<Arc<T>>` - Optional service
/// - `Closed<T>` - Closed generic service, served by open-generic registrations
/// - `ServiceProvider` - Nested provider bound to the new instance
/// - `Deferred<T>` - Service resolved on first use
/// - `AllImplementations<T>` - Every implementation of `T`, resolved on first use
/// - `TypeKey` - The implementation's own type
/// - Tuples of the above, up to 8 elements
pub trait Service: Injectable + Sized {
    /// The dependencies this service requires
    type Dependencies: Dependencies;

    /// Create the service from its resolved dependencies
    fn create(deps: Self::Dependencies) -> Self;

    /// Adjust the registration, e.g. to add service types or lifecycle hooks
    fn configure(builder: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
        builder
    }

    /// Build the descriptor for this service
    fn descriptor(lifetime: Lifetime) -> Result<ImplementationDescriptor> {
        let builder = ImplementationDescriptor::builder::<Self>(lifetime)
            .parameters(Self::Dependencies::parameters())
            .construct(|arguments| Ok(Self::create(Self::Dependencies::extract(arguments)?)));
        Self::configure(builder).build()
    }
}

// =============================================================================
// Dependency Traits
// =============================================================================

/// A single injectable constructor dependency
pub trait Dependency: Sized {
    fn parameter() -> Parameter;

    fn extract(arguments: &mut Arguments) -> Result<Self>;
}

/// An ordered set of constructor dependencies
pub trait Dependencies: Sized {
    fn parameters() -> Vec<Parameter>;

    fn extract(arguments: &mut Arguments) -> Result<Self>;
}

impl<T: ?Sized + Injectable> Dependency for Arc<T> {
    #[inline]
    fn parameter() -> Parameter {
        Parameter::Injected(TypeKey::of::<T>())
    }

    #[inline]
    fn extract(arguments: &mut Arguments) -> Result<Self> {
        arguments.instance::<T>()
    }
}

impl<T: ?Sized + Injectable> Dependency for Option<Arc<T>> {
    #[inline]
    fn parameter() -> Parameter {
        Parameter::Optional(TypeKey::of::<T>())
    }

    #[inline]
    fn extract(arguments: &mut Arguments) -> Result<Self> {
        arguments.optional::<T>()
    }
}

impl<T: ?Sized + Injectable + GenericType> Dependency for Closed<T> {
    #[inline]
    fn parameter() -> Parameter {
        Parameter::Injected(TypeKey::closed::<T>())
    }

    #[inline]
    fn extract(arguments: &mut Arguments) -> Result<Self> {
        arguments.instance::<T>().map(Closed)
    }
}

impl Dependency for ServiceProvider {
    #[inline]
    fn parameter() -> Parameter {
        Parameter::Provider
    }

    #[inline]
    fn extract(arguments: &mut Arguments) -> Result<Self> {
        arguments.provider()
    }
}

impl<T: ?Sized + Injectable> Dependency for Deferred<T> {
    #[inline]
    fn parameter() -> Parameter {
        Parameter::Deferred(TypeKey::of::<T>())
    }

    #[inline]
    fn extract(arguments: &mut Arguments) -> Result<Self> {
        arguments.deferred::<T>()
    }
}

impl<T: ?Sized + Injectable> Dependency for AllImplementations<T> {
    #[inline]
    fn parameter() -> Parameter {
        Parameter::Deferred(TypeKey::of::<T>())
    }

    #[inline]
    fn extract(arguments: &mut Arguments) -> Result<Self> {
        arguments.provider().map(AllImplementations::new)
    }
}

impl Dependency for TypeKey {
    #[inline]
    fn parameter() -> Parameter {
        Parameter::OwnType
    }

    #[inline]
    fn extract(arguments: &mut Arguments) -> Result<Self> {
        arguments.own_type()
    }
}

impl Dependencies for () {
    #[inline]
    fn parameters() -> Vec<Parameter> {
        Vec::new()
    }

    #[inline]
    fn extract(_arguments: &mut Arguments) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_dependencies_single {
    ($([$($generics:tt)*] $ty:ty),+ $(,)?) => {
        $(
            impl<$($generics)*> Dependencies for $ty {
                #[inline]
                fn parameters() -> Vec<Parameter> {
                    vec![<$ty as Dependency>::parameter()]
                }

                #[inline]
                fn extract(arguments: &mut Arguments) -> Result<Self> {
                    <$ty as Dependency>::extract(arguments)
                }
            }
        )+
    };
}

impl_dependencies_single!(
    [T: ?Sized + Injectable] Arc<T>,
    [T: ?Sized + Injectable] Option<Arc<T>>,
    [T: ?Sized + Injectable + GenericType] Closed<T>,
    [T: ?Sized + Injectable] Deferred<T>,
    [T: ?Sized + Injectable] AllImplementations<T>,
    [] ServiceProvider,
    [] TypeKey,
);

macro_rules! impl_dependencies_tuple {
    ($($T:ident),+) => {
        impl<$($T: Dependency),+> Dependencies for ($($T,)+) {
            #[inline]
            fn parameters() -> Vec<Parameter> {
                vec![$($T::parameter()),+]
            }

            #[inline]
            fn extract(arguments: &mut Arguments) -> Result<Self> {
                Ok(($($T::extract(arguments)?,)+))
            }
        }
    };
}

impl_dependencies_tuple!(A);
impl_dependencies_tuple!(A, B);
impl_dependencies_tuple!(A, B, C);
impl_dependencies_tuple!(A, B, C, D);
impl_dependencies_tuple!(A, B, C, D, E);
impl_dependencies_tuple!(A, B, C, D, E, F);
impl_dependencies_tuple!(A, B, C, D, E, F, G);
impl_dependencies_tuple!(A, B, C, D, E, F, G, H);

// =============================================================================
// Closed Generics
// =============================================================================

/// A required closed generic service such as `dyn Store<User>`.
///
/// Unlike `Arc<T>`, the dependency carries `T`'s generic definition, so it can
/// be satisfied by an open-generic registration.
pub struct Closed<T: ?Sized>(Arc<T>);

impl<T: ?Sized> Closed<T> {
    #[inline]
    pub fn into_inner(self) -> Arc<T> {
        self.0
    }
}

impl<T: ?Sized> Deref for Closed<T> {
    type Target = Arc<T>;

    #[inline]
    fn deref(&self) -> &Arc<T> {
        &self.0
    }
}

impl<T: ?Sized> Clone for Closed<T> {
    fn clone(&self) -> Self {
        Closed(Arc::clone(&self.0))
    }
}

// =============================================================================
// Deferred Resolution
// =============================================================================

/// A service resolved on first access instead of at construction time.
///
/// Deferred dependencies do not take part in construction-cycle detection,
/// which makes them the way to connect two services that need each other.
/// The value is memoized after the first successful resolution.
pub struct Deferred<T: ?Sized> {
    provider: ServiceProvider,
    value: OnceCell<Arc<T>>,
}

impl<T: ?Sized + Injectable> Deferred<T> {
    pub(crate) fn new(provider: ServiceProvider) -> Self {
        Self {
            provider,
            value: OnceCell::new(),
        }
    }

    /// Resolve (once) and return the service
    pub fn get(&self) -> Result<Arc<T>> {
        self.value
            .get_or_try_init(|| self.provider.get::<T>())
            .map(Arc::clone)
    }

    /// Whether the service has been resolved already
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.value.get().is_some()
    }
}

impl<T: ?Sized> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("type", &std::any::type_name::<T>())
            .field("resolved", &self.value.get().is_some())
            .finish()
    }
}

/// Every implementation of `T`, resolved together on first access
pub struct AllImplementations<T: ?Sized> {
    provider: ServiceProvider,
    items: OnceCell<Vec<Arc<T>>>,
}

impl<T: ?Sized + Injectable> AllImplementations<T> {
    pub(crate) fn new(provider: ServiceProvider) -> Self {
        Self {
            provider,
            items: OnceCell::new(),
        }
    }

    /// Resolve (once) and return all implementations in registration order
    pub fn get(&self) -> Result<&[Arc<T>]> {
        self.items
            .get_or_try_init(|| self.provider.get_all::<T>())
            .map(Vec::as_slice)
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.items.get().is_some()
    }
}

impl<T: ?Sized> fmt::Debug for AllImplementations<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllImplementations")
            .field("type", &std::any::type_name::<T>())
            .field("resolved", &self.items.get().map(Vec::len))
            .finish()
    }
}
