//! Runtime type identity for services and implementations
//!
//! A [`TypeKey`] identifies either a concrete type, a closed generic type
//! (a concrete type that also knows its generic definition and arguments), or
//! an open generic definition that still has unbound parameters.
//!
//! Equality and hashing only consider identity, so `TypeKey::of::<Repo<User>>()`
//! and `TypeKey::closed::<Repo<User>>()` address the same registry slot. The
//! closed form additionally carries what open-generic materialization needs.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of an open generic definition such as `Repository<_>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericDefinition {
    name: &'static str,
    arity: usize,
}

impl GenericDefinition {
    /// Declare a generic definition with `arity` type parameters.
    ///
    /// Names must be unique across all definitions used with one registry.
    pub const fn new(name: &'static str, arity: usize) -> Self {
        Self { name, arity }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl fmt::Display for GenericDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        f.write_str("<")?;
        for i in 0..self.arity {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str("_")?;
        }
        f.write_str(">")
    }
}

/// A type that is a closed instance of a [`GenericDefinition`].
///
/// Implement this for generic implementations and generic service traits
/// (for example `impl<T: 'static> GenericType for dyn Store<T>`) so that the
/// registry can materialize open-generic registrations for them.
pub trait GenericType: 'static {
    fn definition() -> GenericDefinition;

    fn arguments() -> Vec<TypeKey>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Identity {
    Concrete(TypeId),
    Open(GenericDefinition),
}

#[derive(Debug)]
struct ClosedGeneric {
    definition: GenericDefinition,
    arguments: Vec<TypeKey>,
}

/// Identity of a service or implementation type
#[derive(Clone)]
pub struct TypeKey {
    identity: Identity,
    name: &'static str,
    generic: Option<Arc<ClosedGeneric>>,
}

impl TypeKey {
    /// Key of a concrete (possibly unsized) type
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            identity: Identity::Concrete(TypeId::of::<T>()),
            name: std::any::type_name::<T>(),
            generic: None,
        }
    }

    /// Key of a closed generic type, carrying its definition and arguments
    pub fn closed<T: ?Sized + GenericType>() -> Self {
        Self {
            identity: Identity::Concrete(TypeId::of::<T>()),
            name: std::any::type_name::<T>(),
            generic: Some(Arc::new(ClosedGeneric {
                definition: T::definition(),
                arguments: T::arguments(),
            })),
        }
    }

    /// Key of an open generic definition
    #[inline]
    pub fn open(definition: GenericDefinition) -> Self {
        Self {
            identity: Identity::Open(definition),
            name: definition.name,
            generic: None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.identity, Identity::Open(_))
    }

    #[inline]
    pub fn is_closed_generic(&self) -> bool {
        self.generic.is_some()
    }

    /// The generic definition of an open or closed generic key
    pub fn generic_definition(&self) -> Option<GenericDefinition> {
        match (&self.identity, &self.generic) {
            (Identity::Open(definition), _) => Some(*definition),
            (_, Some(closed)) => Some(closed.definition),
            _ => None,
        }
    }

    /// Type arguments of a closed generic key; empty otherwise
    pub fn generic_arguments(&self) -> &[TypeKey] {
        self.generic
            .as_ref()
            .map(|closed| closed.arguments.as_slice())
            .unwrap_or_default()
    }

    /// `TypeId` of a concrete or closed key
    #[inline]
    pub fn type_id(&self) -> Option<TypeId> {
        match self.identity {
            Identity::Concrete(id) => Some(id),
            Identity::Open(_) => None,
        }
    }

    #[inline]
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.type_id() == Some(TypeId::of::<T>())
    }

    /// Full type name as reported by the compiler
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without module paths, used in all diagnostics
    pub fn readable_name(&self) -> String {
        match self.identity {
            Identity::Open(definition) => definition.to_string(),
            Identity::Concrete(_) => readable_name(self.name),
        }
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.readable_name())
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.readable_name())
    }
}

/// Strip module paths from a compiler type name.
///
/// `alloc::sync::Arc<app::db::Pool>` becomes `Arc<Pool>`.
pub fn readable_name(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    let mut segment_start = 0;
    let mut chars = type_name.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                out.truncate(segment_start);
            }
            c if c.is_alphanumeric() || c == '_' => out.push(c),
            c => {
                out.push(c);
                segment_start = out.len();
            }
        }
    }
    out
}
