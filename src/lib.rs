//! # Liman DI - Lifetime-Managed Dependency Injection for Rust
//!
//! A dependency injection container that resolves object graphs on demand,
//! enforces lifetime rules and tears down what it owns.
//!
//! ## Features
//!
//! - 🧬 **Five lifetimes** - `Any`, `Singleton`, `Application`, `Scoped` and `Transient`
//! - 🔍 **Graph validation** - Unregistered dependencies, cycles and
//!   singleton-over-scoped chains are reported before anything is built
//! - ♻️ **Reference-counted transients** - Released when their last user lets go
//! - 🧹 **Ordered teardown** - Scopes and containers dispose what they created
//! - 🧩 **Open generics** - Closed implementations materialized on first request
//! - 📊 **Observable** - Optional tracing integration with JSON or pretty output
//!
//! ## Quick Start
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
//!     fn create(_: ()) -> Self {
//!         Database { url: "postgres://localhost".into() }
//!     }
//! }
//!
//! struct UserService {
//!     db: Arc<Database>,
//! }
//!
//! impl Service for UserService {
//!     type Dependencies = Arc<Database>;
//!
//!     fn create(db: Arc<Database>) -> Self {
//!         UserService { db }
//!     }
//! }
//!
//! let registry = ServiceRegistry::new();
//! registry.register::<Database>(Lifetime::Singleton).unwrap();
//! registry.register::<UserService>(Lifetime::Transient).unwrap();
//!
//! let container = Container::build(registry, ContainerOptions::default()).unwrap();
//! let users = container.get::<UserService>().unwrap();
//! assert_eq!(users.db.url, "postgres://localhost");
//! ```
//!
//! ## Lifetimes
//!
//! | Lifetime      | Instances                                                   |
//! |---------------|-------------------------------------------------------------|
//! | `Singleton`   | One per container, created on first access                  |
//! | `Application` | One per container, created by [`Container::start`]          |
//! | `Scoped`      | One per [`ServiceScope`]; resolving without a scope fails   |
//! | `Transient`   | A new one per resolution, released with its last user       |
//! | `Any`         | `Scoped` if it depends on anything scoped, else `Singleton` |
//!
//! ## Scopes and Disposal
//!
//! ```rust
//! use liman_di::{Container, ContainerOptions, Dispose, ImplementationDescriptor, Lifetime, ServiceRegistry};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! static CLOSED: AtomicBool = AtomicBool::new(false);
//!
//! struct Connection;
//!
//! impl Dispose for Connection {
//!     fn dispose(&self) {
//!         CLOSED.store(true, Ordering::SeqCst);
//!     }
//! }
//!
//! let registry = ServiceRegistry::new();
//! registry
//!     .add(
//!         ImplementationDescriptor::builder::<Connection>(Lifetime::Scoped)
//!             .construct(|_| Ok(Connection))
//!             .disposable()
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//! let container = Container::build(registry, ContainerOptions::default()).unwrap();
//!
//! let scope = container.create_scope();
//! let _connection = scope.provider().get::<Connection>().unwrap();
//! drop(scope);
//! assert!(CLOSED.load(Ordering::SeqCst));
//! ```

mod container;
mod dependency;
mod descriptor;
mod error;
mod factory;
mod key;
mod lifecycle;
mod lifetime;
#[cfg(feature = "logging")]
pub mod logging;
mod provider;
mod registry;
mod scope;

#[cfg(test)]
mod test_support;

pub use container::{Container, ContainerOptions};
pub use dependency::{AllImplementations, Closed, Deferred, Dependencies, Dependency, Service};
pub use descriptor::{
    Arguments, CustomArgument, DescriptorBuilder, ImplementationDescriptor, Instance, InstanceId,
    OpenGenericDescriptor, Parameter,
};
pub use error::*;
pub use key::{GenericDefinition, GenericType, TypeKey, readable_name};
pub use lifecycle::LifetimeManager;
pub use lifetime::{Dispose, Initialize, Injectable, Lifetime};
pub use provider::ServiceProvider;
pub use registry::ServiceRegistry;
pub use scope::{Scope, ServiceScope};

// Re-export for convenience
pub use std::sync::Arc;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AllImplementations, Closed, Container, ContainerOptions, Deferred, DiError, Dispose,
        ImplementationDescriptor, Initialize, Lifetime, Result, Service, ServiceProvider,
        ServiceRegistry, ServiceScope,
    };
    pub use std::sync::Arc;
}
