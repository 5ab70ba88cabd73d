use std::collections::HashMap;
use std::hash::Hash;

/// Keyed store of pending call results.
///
/// A [`Coalesce`](crate::Coalesce) keeps exactly one entry per key while a
/// call is in flight and deletes it at settlement; entries never expire by
/// time or capacity. All methods are called inside one synchronous critical
/// section, so implementations need no locking of their own.
pub trait CallStore<K, P> {
    /// Look up the pending result for a key.
    fn get(&mut self, key: &K) -> Option<P>;

    /// Store the pending result for a key.
    fn set(&mut self, key: K, pending: P);

    /// Remove the entry for a key, if present.
    fn delete(&mut self, key: &K);

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Is the store empty?
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The default store. A pre-populated map may be supplied via
/// [`Coalesce::with_store`](crate::Coalesce::with_store) to seed a key with a
/// settled or externally produced result.
impl<K, P> CallStore<K, P> for HashMap<K, P>
where
    K: Eq + Hash,
    P: Clone,
{
    fn get(&mut self, key: &K) -> Option<P> {
        HashMap::get(self, key).cloned()
    }

    fn set(&mut self, key: K, pending: P) {
        self.insert(key, pending);
    }

    fn delete(&mut self, key: &K) {
        self.remove(key);
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }
}
