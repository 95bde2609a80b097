//! Core algorithms and data structures of shoal.

use ahash::{AHashMap, AHashSet};

pub mod blob;
pub mod corpus;
pub mod dict;
pub mod feature;
pub mod frontier;
pub mod mutation;
pub mod shard;
pub mod util;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;

/// Raw bytes of one target input.
pub type ByteArray = Vec<u8>;
