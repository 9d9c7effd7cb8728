//! Shared fixtures for unit tests

use crate::descriptor::{ImplementationDescriptor, OpenGenericDescriptor};
use crate::error::Result;
use crate::key::{GenericDefinition, GenericType, TypeKey, readable_name};
use crate::lifetime::Lifetime;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Construct,
    Initialize,
    Dispose,
}

/// Records lifecycle events in the order they happen
#[derive(Default)]
pub struct LifetimeLog {
    entries: Mutex<Vec<(Action, &'static str, u64)>>,
    next: AtomicU64,
}

impl LifetimeLog {
    /// Identity for the next logged object, starting at 1
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record(&self, action: Action, service: &'static str, id: u64) {
        self.entries.lock().push((action, service, id));
    }

    pub fn actions(&self) -> Vec<(Action, &'static str)> {
        self.entries
            .lock()
            .iter()
            .map(|(action, service, _)| (*action, *service))
            .collect()
    }

    pub fn count(&self, action: Action) -> usize {
        self.entries.lock().iter().filter(|(a, _, _)| *a == action).count()
    }

    pub fn count_of(&self, action: Action, service: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(a, s, _)| *a == action && *s == service)
            .count()
    }

    pub fn ids(&self, action: Action) -> Vec<u64> {
        self.entries
            .lock()
            .iter()
            .filter(|(a, _, _)| *a == action)
            .map(|(_, _, id)| *id)
            .collect()
    }

    pub fn has(&self, action: Action, service: &str, id: u64) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|(a, s, i)| *a == action && *s == service && *i == id)
    }
}

// =============================================================================
// Open generic fixtures
// =============================================================================

pub const STORE: GenericDefinition = GenericDefinition::new("Store", 1);
pub const MEMORY_STORE: GenericDefinition = GenericDefinition::new("MemoryStore", 1);

pub struct User;
pub struct Order;

pub trait Store<T>: Send + Sync {
    fn entity(&self) -> String;
}

pub struct MemoryStore<T>(PhantomData<fn() -> T>);

impl<T: 'static> Store<T> for MemoryStore<T> {
    fn entity(&self) -> String {
        readable_name(std::any::type_name::<T>())
    }
}

impl<T: 'static> GenericType for dyn Store<T> {
    fn definition() -> GenericDefinition {
        STORE
    }

    fn arguments() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }
}

impl<T: 'static> GenericType for MemoryStore<T> {
    fn definition() -> GenericDefinition {
        MEMORY_STORE
    }

    fn arguments() -> Vec<TypeKey> {
        vec![TypeKey::of::<T>()]
    }
}

fn memory_store<T: 'static>(lifetime: Lifetime) -> Result<ImplementationDescriptor> {
    ImplementationDescriptor::builder::<MemoryStore<T>>(lifetime)
        .closed_generic()
        .implements_closed::<dyn Store<T>>(|store| store)
        .construct(|_| Ok(MemoryStore(PhantomData)))
        .build()
}

/// `MemoryStore<_>` registered as `Store<_>`, closable over `User` and `Order`
pub fn memory_store_template(lifetime: Lifetime) -> OpenGenericDescriptor {
    OpenGenericDescriptor::new(MEMORY_STORE, lifetime, |arguments, lifetime| {
        if arguments == [TypeKey::of::<User>()] {
            return memory_store::<User>(lifetime).map(Some);
        }
        if arguments == [TypeKey::of::<Order>()] {
            return memory_store::<Order>(lifetime).map(Some);
        }
        Ok(None)
    })
    .implements(TypeKey::open(STORE))
}
