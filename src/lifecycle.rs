//! Lifetime manager
//!
//! Tracks which constructed objects the container must eventually release:
//! cleanup-relevant singletons in creation order, and a reference graph of
//! cleanup-relevant transients keyed by the objects that obtained them.
//! A transient is released once its last user lets go of it, and releasing
//! any object cascades to the transients it obtained.
//!
//! The graph is mutated under a single lock. Dispose hooks run after the
//! lock is released, in cascade order, so hooks may call back into the
//! container.

use crate::descriptor::{ImplementationDescriptor, Instance, InstanceId, Parameter};
use crate::registry::ServiceRegistry;
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

struct TrackedTransient {
    instance: Instance,
    users: Vec<InstanceId>,
}

#[derive(Default)]
struct LifetimeState {
    singletons: Vec<Instance>,
    transients: HashMap<InstanceId, TrackedTransient, RandomState>,
    transients_by_user: HashMap<InstanceId, Vec<InstanceId>, RandomState>,
}

impl LifetimeState {
    /// Forget `node` entirely and cascade to what it obtained.
    ///
    /// Instances that need disposal are appended to `doomed` in cascade order.
    fn delete(&mut self, node: InstanceId, instance: Option<Instance>, doomed: &mut Vec<Instance>) {
        if let Some(instance) = instance {
            if instance.is_disposable() {
                doomed.push(instance);
            }
        }

        if let Some(tracked) = self.transients.remove(&node) {
            for user in tracked.users {
                remove_one(&mut self.transients_by_user, user, node);
            }
        }

        if let Some(obtained) = self.transients_by_user.remove(&node) {
            for transient in obtained {
                self.delete_edge(node, transient, doomed);
            }
        }
    }

    /// Remove one `user -> transient` edge, deleting the transient when no
    /// users remain
    fn delete_edge(&mut self, user: InstanceId, transient: InstanceId, doomed: &mut Vec<Instance>) {
        let Some(tracked) = self.transients.get_mut(&transient) else {
            return;
        };
        let Some(position) = tracked.users.iter().position(|u| *u == user) else {
            return;
        };
        tracked.users.swap_remove(position);
        let orphaned = tracked.users.is_empty();
        remove_one(&mut self.transients_by_user, user, transient);

        if orphaned {
            if let Some(tracked) = self.transients.remove(&transient) {
                self.delete(transient, Some(tracked.instance), doomed);
            }
        }
    }
}

fn remove_one(
    map: &mut HashMap<InstanceId, Vec<InstanceId>, RandomState>,
    key: InstanceId,
    value: InstanceId,
) {
    if let Some(values) = map.get_mut(&key) {
        if let Some(position) = values.iter().position(|v| *v == value) {
            values.swap_remove(position);
        }
        if values.is_empty() {
            map.remove(&key);
        }
    }
}

fn dispose_all(doomed: Vec<Instance>) {
    for instance in doomed {
        #[cfg(feature = "logging")]
        trace!(
            target: "liman_di",
            implementation = %instance.type_key(),
            "Disposing instance"
        );
        instance.dispose();
    }
}

/// Tracks constructed instances that need cleanup
pub struct LifetimeManager {
    registry: Arc<ServiceRegistry>,
    state: Mutex<LifetimeState>,
    needs_cleanup: DashMap<crate::key::TypeKey, bool, RandomState>,
}

impl LifetimeManager {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(LifetimeState::default()),
            needs_cleanup: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
        }
    }

    /// Whether instances of an implementation must be tracked.
    ///
    /// True when the implementation is disposable, receives a provider or
    /// deferred handle, or eagerly depends on something that needs cleanup.
    pub fn needs_cleanup(&self, descriptor: &ImplementationDescriptor) -> bool {
        let mut visiting = Vec::new();
        self.compute_needs_cleanup(descriptor, &mut visiting)
    }

    fn compute_needs_cleanup(
        &self,
        descriptor: &ImplementationDescriptor,
        visiting: &mut Vec<crate::key::TypeKey>,
    ) -> bool {
        if let Some(known) = self.needs_cleanup.get(descriptor.key()) {
            return *known;
        }
        if visiting.contains(descriptor.key()) {
            return false;
        }

        visiting.push(descriptor.key().clone());
        let result = descriptor.is_disposable()
            || descriptor.dependency_parameters().iter().any(|parameter| match parameter {
                Parameter::Provider | Parameter::Deferred(_) => true,
                Parameter::Injected(key) | Parameter::Optional(key) => self
                    .registry
                    .try_resolve_single(key)
                    .ok()
                    .flatten()
                    .is_some_and(|dependency| self.compute_needs_cleanup(&dependency, visiting)),
                Parameter::OwnType | Parameter::Custom(_) => false,
            });
        visiting.pop();

        self.needs_cleanup.insert(descriptor.key().clone(), result);
        result
    }

    /// Track a newly created singleton if it needs cleanup
    pub fn add_singleton(&self, instance: &Instance) {
        if self.needs_cleanup(instance.descriptor()) {
            self.state.lock().singletons.push(instance.clone());
        }
    }

    /// Record that `user` obtained `transient`.
    ///
    /// Returns whether the edge was recorded, i.e. whether the transient
    /// needs cleanup at all.
    pub fn add_transient_dependency(&self, user: InstanceId, transient: &Instance) -> bool {
        if !self.needs_cleanup(transient.descriptor()) {
            return false;
        }

        let id = transient.id();
        let mut state = self.state.lock();
        state
            .transients
            .entry(id)
            .or_insert_with(|| TrackedTransient {
                instance: transient.clone(),
                users: Vec::new(),
            })
            .users
            .push(user);
        state.transients_by_user.entry(user).or_default().push(id);

        #[cfg(feature = "logging")]
        trace!(
            target: "liman_di",
            implementation = %transient.type_key(),
            users = state.transients.get(&id).map_or(0, |t| t.users.len()),
            "Tracking transient dependency"
        );

        true
    }

    /// Remove one `user -> transient` edge; deletes the transient when it
    /// has no users left
    pub fn delete_transient_dependency(&self, user: InstanceId, transient: InstanceId) {
        let mut doomed = Vec::new();
        self.state.lock().delete_edge(user, transient, &mut doomed);
        dispose_all(doomed);
    }

    /// Delete an instance: dispose it if disposable and release every
    /// transient it obtained
    pub fn delete(&self, instance: &Instance) {
        let mut doomed = Vec::new();
        self.state
            .lock()
            .delete(instance.id(), Some(instance.clone()), &mut doomed);
        dispose_all(doomed);
    }

    /// Release everything obtained by an object that is not itself tracked,
    /// such as an external user bound to a provider
    pub fn delete_user(&self, user: InstanceId) {
        let mut doomed = Vec::new();
        {
            let mut state = self.state.lock();
            let instance = state.transients.get(&user).map(|t| t.instance.clone());
            state.delete(user, instance, &mut doomed);
        }
        dispose_all(doomed);
    }

    /// Hand every transient held by `from` over to `to`
    pub fn transfer_user(&self, from: InstanceId, to: InstanceId) {
        let mut state = self.state.lock();
        let Some(obtained) = state.transients_by_user.remove(&from) else {
            return;
        };
        for transient in &obtained {
            if let Some(tracked) = state.transients.get_mut(transient) {
                for user in tracked.users.iter_mut().filter(|user| **user == from) {
                    *user = to;
                }
            }
        }

        #[cfg(feature = "logging")]
        trace!(
            target: "liman_di",
            transients = obtained.len(),
            "Transferring transient dependencies"
        );

        state.transients_by_user.entry(to).or_default().extend(obtained);
    }

    /// The tracked transient with this identity, if any
    pub fn tracked_transient(&self, id: InstanceId) -> Option<Instance> {
        self.state
            .lock()
            .transients
            .get(&id)
            .map(|tracked| tracked.instance.clone())
    }

    /// Number of transients currently tracked
    pub fn tracked_transient_count(&self) -> usize {
        self.state.lock().transients.len()
    }

    /// Container teardown: singletons in reverse creation order, then every
    /// remaining transient root
    pub fn delete_all_services(&self) {
        let mut doomed = Vec::new();
        {
            let mut state = self.state.lock();
            let singletons = std::mem::take(&mut state.singletons);

            #[cfg(feature = "logging")]
            debug!(
                target: "liman_di",
                singletons = singletons.len(),
                transients = state.transients.len(),
                "Deleting all services"
            );

            for singleton in singletons.into_iter().rev() {
                state.delete(singleton.id(), Some(singleton), &mut doomed);
            }

            let roots: Vec<InstanceId> = state
                .transients_by_user
                .keys()
                .filter(|user| !state.transients.contains_key(user))
                .copied()
                .collect();
            for root in roots {
                state.delete(root, None, &mut doomed);
            }

            // Whatever is left only references itself
            while let Some(user) = state.transients_by_user.keys().next().copied() {
                let instance = state.transients.get(&user).map(|t| t.instance.clone());
                state.delete(user, instance, &mut doomed);
            }
            for (_, tracked) in state.transients.drain() {
                if tracked.instance.is_disposable() {
                    doomed.push(tracked.instance);
                }
            }
        }
        dispose_all(doomed);
    }
}

impl std::fmt::Debug for LifetimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LifetimeManager")
            .field("singletons", &state.singletons.len())
            .field("transients", &state.transients.len())
            .field("users", &state.transients_by_user.len())
            .finish()
    }
}
