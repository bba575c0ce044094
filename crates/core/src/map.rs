//! RawMap - Separately Chained Hash Table
//!
//! String-keyed map payload. Buckets are a power of two; lookups use the
//! key's precomputed FNV-1a hash. Two resize triggers:
//!
//! - Load factor above 0.7 doubles the table.
//! - Any chain deeper than `MAX_CHAIN_DEPTH` forces a doubling, which caps
//!   the damage of hash-flood keys.
//!
//! The depth check runs only after the load-factor resize, so one insert
//! performs at most one resize.
//!
//! The map stores value references without touching refcounts; the
//! COW-aware operations in `containers` own the retain/release discipline.

use crate::strings::BlocString;
use crate::value::Value;

/// Chains deeper than this force a resize
pub const MAX_CHAIN_DEPTH: usize = 16;

/// Initial bucket count on first insert
const MIN_BUCKETS: usize = 8;

/// An owned key and a value reference
#[derive(Debug)]
pub struct MapEntry {
    pub key: BlocString,
    pub value: Value,
}

/// Separately chained hash table keyed by UTF-8 string
pub struct RawMap {
    buckets: Vec<Vec<MapEntry>>,
    len: usize,
}

impl Default for RawMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RawMap {
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current bucket capacity (0 until the first insert)
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Bucket index a key would land in; `None` while the table is empty.
    /// The inline cache stores this index keyed by the map's shape.
    pub fn bucket_for(&self, key: &BlocString) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        Some(self.bucket_index(key.hash()))
    }

    pub fn get(&self, key: &BlocString) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let idx = self.bucket_index(key.hash());
        self.get_in_bucket(idx, key)
    }

    /// Lookup within a known bucket; used by inline-cache hits to skip the
    /// index computation.
    pub fn get_in_bucket(&self, bucket: usize, key: &BlocString) -> Option<Value> {
        self.buckets
            .get(bucket)?
            .iter()
            .find(|e| e.key == *key)
            .map(|e| e.value)
    }

    pub fn contains_key(&self, key: &BlocString) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace. Returns the previous value for the key, if any;
    /// the caller releases it. The value reference passed in is adopted.
    pub fn insert(&mut self, key: BlocString, value: Value) -> Option<Value> {
        if self.buckets.is_empty() {
            self.buckets = (0..MIN_BUCKETS).map(|_| Vec::new()).collect();
        }
        let idx = self.bucket_index(key.hash());
        if let Some(entry) = self.buckets[idx].iter_mut().find(|e| e.key == key) {
            return Some(std::mem::replace(&mut entry.value, value));
        }
        self.buckets[idx].push(MapEntry { key: key.clone(), value });
        self.len += 1;

        // Load factor 0.7 doubles the table
        if self.len * 10 > self.buckets.len() * 7 {
            self.resize(self.buckets.len() * 2);
        }
        // Depth check only after the load-factor resize
        let idx = self.bucket_index(key.hash());
        if self.buckets[idx].len() > MAX_CHAIN_DEPTH {
            self.resize(self.buckets.len() * 2);
        }
        None
    }

    /// Remove a key, returning its value for the caller to release
    pub fn remove(&mut self, key: &BlocString) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let idx = self.bucket_index(key.hash());
        let chain = &mut self.buckets[idx];
        let pos = chain.iter().position(|e| e.key == *key)?;
        let entry = chain.swap_remove(pos);
        self.len -= 1;
        Some(entry.value)
    }

    fn resize(&mut self, new_buckets: usize) {
        let mut fresh: Vec<Vec<MapEntry>> = (0..new_buckets).map(|_| Vec::new()).collect();
        let mask = new_buckets - 1;
        for chain in self.buckets.drain(..) {
            for entry in chain {
                let idx = (entry.key.hash() as usize) & mask;
                fresh[idx].push(entry);
            }
        }
        self.buckets = fresh;
    }

    pub fn for_each_value(&self, f: &mut impl FnMut(Value)) {
        for chain in &self.buckets {
            for entry in chain {
                f(entry.value);
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.buckets.iter().flatten()
    }

    /// Longest chain in the table (diagnostics and resize tests)
    pub fn max_chain_depth(&self) -> usize {
        self.buckets.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Order-insensitive structural equality, parameterized on value
    /// equality so this module stays independent of `value`'s recursion.
    pub fn structural_eq(&self, other: &RawMap, value_eq: fn(Value, Value) -> bool) -> bool {
        if self.len != other.len {
            return false;
        }
        self.entries().all(|e| match other.get(&e.key) {
            Some(v) => value_eq(e.value, v),
            None => false,
        })
    }

    /// Rough payload footprint for allocation accounting
    pub fn footprint(&self) -> usize {
        self.buckets.capacity() * std::mem::size_of::<Vec<MapEntry>>()
            + self
                .buckets
                .iter()
                .map(|c| c.capacity() * std::mem::size_of::<MapEntry>())
                .sum::<usize>()
            + self.entries().map(|e| e.key.len()).sum::<usize>()
    }

    /// Clone the table structure, handing each (key, value) pair to the
    /// caller so it can retain the value into the clone.
    pub fn clone_with(&self, mut adopt: impl FnMut(Value) -> Value) -> RawMap {
        let mut out = RawMap::new();
        for entry in self.entries() {
            out.insert(entry.key.clone(), adopt(entry.value));
        }
        out
    }
}

impl std::fmt::Debug for RawMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMap")
            .field("len", &self.len)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
