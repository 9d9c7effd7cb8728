//! Error types for dependency injection

use crate::key::readable_name;
use thiserror::Error;

/// Errors that can occur while registering, resolving or tearing down services.
///
/// Every variant fails the operation synchronously; nothing is retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiError {
    /// Malformed registration
    #[error("Invalid configuration for '{implementation}': {reason}")]
    Configuration {
        implementation: String,
        reason: String,
    },

    /// More than one implementation satisfies a requested service type
    #[error(
        "Service '{service}' could not be injected, because multiple implementations were found: {}",
        .implementations.join(", ")
    )]
    AmbiguousService {
        service: String,
        implementations: Vec<String>,
    },

    /// A declared dependency has no registered implementation
    #[error("Service '{implementation}' depends on '{dependency}' which is not registered")]
    UnregisteredDependency {
        implementation: String,
        dependency: String,
    },

    /// A mandatory lookup yielded no value
    #[error("Service not found: {type_name}")]
    NotFound { type_name: String },

    /// Direct constructor-injection cycle
    #[error(
        "Circular dependency detected for '{}'; injection order: {}",
        .chain.last().map(String::as_str).unwrap_or_default(),
        .chain.join(" -> ")
    )]
    CircularDependency { chain: Vec<String> },

    /// A singleton-like implementation transitively depends on a scoped one
    #[error(
        "Cannot instantiate {lifetime} '{implementation}' because it has scoped dependencies ({})",
        .paths.join("; ")
    )]
    InvalidLifetimeCombination {
        implementation: String,
        lifetime: String,
        paths: Vec<String>,
    },

    /// A scoped implementation was requested without an active scope
    #[error("Service implementation '{implementation}' cannot be instantiated without a scope")]
    ScopeRequired { implementation: String },

    /// The scope used for resolution has already been disposed
    #[error("Scope {scope} has been disposed; '{implementation}' cannot be created in it")]
    ScopeDisposed { scope: String, implementation: String },

    /// Caller-supplied non-injected arguments do not match the descriptor
    #[error(
        "Invalid custom arguments for implementation '{implementation}'. Expected types '{}', received '{}'",
        .expected.join(", "),
        .received.join(", ")
    )]
    CustomArgumentMismatch {
        implementation: String,
        expected: Vec<String>,
        received: Vec<String>,
    },

    /// Forced removal of a non-transient instance
    #[error("Cannot remove service '{type_name}', because it is not a transient service")]
    IllegalRemoval { type_name: String },

    /// A provider was bound twice to a user or scope
    #[error("A {binding} was already registered for this service provider")]
    AlreadyBound { binding: &'static str },

    /// A user-relative operation on a provider without a user
    #[error("Cannot {operation} '{type_name}', because the service provider is not tied to a user")]
    NotBound {
        operation: &'static str,
        type_name: String,
    },

    /// A constructor delegate reported a failure
    #[error("Failed to create service {type_name}: {reason}")]
    CreationFailed { type_name: String, reason: String },

    /// Internal error
    #[error("Internal DI error: {0}")]
    Internal(String),
}

impl DiError {
    /// Create a Configuration error for a named implementation
    #[inline]
    pub fn configuration(implementation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            implementation: implementation.into(),
            reason: reason.into(),
        }
    }

    /// Create a NotFound error for a type
    #[inline]
    pub fn not_found<T: ?Sized + 'static>() -> Self {
        Self::NotFound {
            type_name: readable_name(std::any::type_name::<T>()),
        }
    }

    /// Create a NotBound error for a dependency of type `T`
    #[inline]
    pub fn not_bound<T: ?Sized + 'static>(operation: &'static str) -> Self {
        Self::NotBound {
            operation,
            type_name: readable_name(std::any::type_name::<T>()),
        }
    }

    /// Create a CreationFailed error
    ///
    /// Constructor delegates return this to report domain failures.
    #[inline]
    pub fn creation_failed<T: ?Sized + 'static>(reason: impl Into<String>) -> Self {
        Self::CreationFailed {
            type_name: readable_name(std::any::type_name::<T>()),
            reason: reason.into(),
        }
    }
}

/// Result type alias for DI operations
pub type Result<T> = std::result::Result<T, DiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_message_names_full_chain() {
        let err = DiError::CircularDependency {
            chain: vec!["Parent".into(), "Child".into(), "Parent".into()],
        };
        let message = err.to_string();
        assert!(message.contains("'Parent'"));
        assert!(message.contains("Parent -> Child -> Parent"));
    }

    #[test]
    fn test_ambiguous_lists_implementations() {
        let err = DiError::AmbiguousService {
            service: "dyn Greeter".into(),
            implementations: vec!["English".into(), "French".into()],
        };
        assert!(err.to_string().ends_with("English, French"));
    }

    #[test]
    fn test_not_found_uses_readable_name() {
        struct Database;
        let err = DiError::not_found::<Database>();
        assert_eq!(err.to_string(), "Service not found: Database");
    }

    #[test]
    fn test_not_bound_names_operation() {
        struct Session;
        let err = DiError::not_bound::<Session>("register dependency");
        assert_eq!(
            err.to_string(),
            "Cannot register dependency 'Session', because the service provider is not tied to a user"
        );
    }
}
