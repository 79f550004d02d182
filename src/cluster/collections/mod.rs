//! This module provides access to the collections used by `coven`,
//! parameterized over the configured hash function.

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandomState = std::hash::BuildHasherDefault<::twox_hash::XxHash64>;

#[cfg(feature = "collections_randomstate_std")]
type RandomState = std::collections::hash_map::RandomState;

/// A map which keeps no particular ordering of its keys.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A set of unordered keys.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// A map which preserves the insertion order of its keys.
pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V, RandomState>;

/// Creates a new `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Creates a new `HashMap` with the given capacity.
pub fn hash_map_capacity<K, V>(n: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(n, Default::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<K>() -> HashSet<K> {
    HashSet::default()
}

/// Creates a new `OrderedMap`.
pub fn ordered_map<K: std::hash::Hash + Eq, V>() -> OrderedMap<K, V> {
    OrderedMap::with_hasher(Default::default())
}
