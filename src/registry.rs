//! The subscription registry (C5): a per-connection map from operation id
//! to whatever that connection associates with it — a cancellation handle
//! on the server, a [`Subscriber`](crate::client::Subscriber) on the
//! client.
//!
//! `juniper_graphql_ws` inlines this as a bare
//! `HashMap<String, oneshot::Sender<()>>` field on its connection state.
//! This crate pulls the same map out into one generic type so the server
//! and client engines (§4.3, §4.4) share one implementation of `add`/
//! `get`/`remove`/`drain`, all O(1) expected per `spec.md` §4.5.

use std::collections::HashMap;
use std::hash::Hash;

/// An id was already registered when [`Registry::add`] was called for it.
#[derive(Debug, thiserror::Error)]
#[error("id already registered")]
pub struct AlreadyRegistered;

/// A map from operation id to whatever a connection associates with an
/// active operation.
#[derive(Debug)]
pub struct Registry<K, V> {
    entries: HashMap<K, V>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `id`. Fails if `id` is already active,
    /// enforcing the id-uniqueness invariant of `spec.md` §3.
    pub fn add(&mut self, id: K, value: V) -> Result<(), AlreadyRegistered> {
        if self.entries.contains_key(&id) {
            return Err(AlreadyRegistered);
        }
        self.entries.insert(id, value);
        Ok(())
    }

    /// Returns `true` if `id` is currently active.
    pub fn contains(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns a reference to the value registered under `id`, if active.
    pub fn get(&self, id: &K) -> Option<&V> {
        self.entries.get(id)
    }

    /// Returns a mutable reference to the value registered under `id`, if
    /// active.
    pub fn get_mut(&mut self, id: &K) -> Option<&mut V> {
        self.entries.get_mut(id)
    }

    /// Removes and returns the value registered under `id`, if any.
    /// Removing an id that was never (or no longer) active is a silent
    /// no-op, per `spec.md` §4.3 "Unknown id on Complete".
    pub fn remove(&mut self, id: &K) -> Option<V> {
        self.entries.remove(id)
    }

    /// The number of currently active operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no operations are currently active.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every active entry, for use when a socket
    /// closes and every in-flight operation must be cancelled at once
    /// (`spec.md` §4.3 "Socket close", §5 "Cancellation").
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.entries.drain().collect()
    }

    /// Iterates over the currently active ids in arbitrary order.
    pub fn ids(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Keeps only entries for which `f` returns `true`.
    pub fn retain(&mut self, f: impl FnMut(&K, &mut V) -> bool) {
        self.entries.retain(f);
    }
}
