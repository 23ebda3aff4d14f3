//! Wrappers around `std::collections`.

use std::default::Default;

pub type RandomState = std::hash::BuildHasherDefault<fxhash::FxHasher>;

/// A `HashMap` with a faster hashing function.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet` with a faster hashing function.
pub type HashSet<T> = std::collections::HashSet<T, RandomState>;

/// Creates a new `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::with_hasher(Default::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<T>() -> HashSet<T> {
    HashSet::with_hasher(Default::default())
}

/// Creates a new `HashMap`, with a custom capacity.
pub fn hash_map_capacity<K, V>(cap: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(cap, Default::default())
}

/// Creates a new `HashSet`, with a custom capacity.
pub fn hash_set_capacity<T>(cap: usize) -> HashSet<T> {
    HashSet::with_capacity_and_hasher(cap, Default::default())
}
