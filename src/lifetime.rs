//! Lifetimes and lifecycle capabilities
//!
//! These traits define what types can be injected and which lifecycle hooks
//! the container calls on them.

use std::fmt;

/// Marker trait for types that can be injected via the DI container.
///
/// This is automatically implemented for all types (sized or not) that are
/// `Send + Sync + 'static`, so `dyn Trait` service types qualify as long as
/// the trait has `Send + Sync` supertraits.
///
/// # Examples
///
/// ```rust
/// trait Greeter: Send + Sync {
///     fn greet(&self) -> String;
/// }
///
/// fn assert_injectable<T: ?Sized + liman_di::Injectable>() {}
/// assert_injectable::<dyn Greeter>();
/// ```
pub trait Injectable: Send + Sync + 'static {}

// Blanket implementation - everything that's Send + Sync + 'static is Injectable
impl<T: ?Sized + Send + Sync + 'static> Injectable for T {}

/// Service lifetime specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifetime {
    /// Scoped if any eager dependency (transitively) is scoped, otherwise singleton
    #[default]
    Any,

    /// Single instance shared across all resolves, created lazily
    Singleton,

    /// Singleton created eagerly when the container starts
    Application,

    /// One instance per scope
    Scoped,

    /// New instance created on every resolve
    Transient,
}

impl Lifetime {
    /// Whether instances live until container teardown
    #[inline]
    pub fn is_singleton_like(self) -> bool {
        matches!(self, Lifetime::Singleton | Lifetime::Application)
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lifetime::Any => "any",
            Lifetime::Singleton => "singleton",
            Lifetime::Application => "application",
            Lifetime::Scoped => "scoped",
            Lifetime::Transient => "transient",
        })
    }
}

/// Disposal hook called once when the container releases an instance.
///
/// Declare it on a registration with `DescriptorBuilder::disposable`.
pub trait Dispose: Send + Sync {
    fn dispose(&self);
}

/// Post-construction hook.
///
/// Runs after the outermost construction in progress completes, so an
/// instance is initialized only once every object built alongside it exists.
/// Declare it on a registration with `DescriptorBuilder::initializable`.
pub trait Initialize: Send + Sync {
    fn initialize(&self);
}
