//! Cuckoo-hashed associative array with dense-id addressing.
//!
//! Keys are 64-bit integers, values any `Copy` type of one size. Buckets
//! hold four slots; every key lives in one of two buckets derived from two
//! XOR-mixed hashes folded over a prime bucket count. Prime sizes matter:
//! with composite counts, random inputs quickly produce many keys that
//! collide on the same bucket pair and force regrowth no matter how empty
//! the table is.
//!
//! A dense id is `bucket * 4 + slot` and stays valid only until the next
//! mutation that grows, compacts or shifts entries.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use rand_xoshiro::rand_core::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub type DenseId = u32;
pub type KeyType = u64;

pub const NPOS: DenseId = u32::MAX;

const BUCKET_LENGTH: usize = 4;
const MASK1: u64 = 0xc949d7c7509e6557;
const MASK2: u64 = 0x9ae16a3b2f90404f;
const MIN_BUCKETS: u64 = 5;
const GROW_ATTEMPTS: u32 = 10;

// Lemire's fastmod: x % d via a precomputed 128-bit reciprocal.
#[derive(Clone, Copy)]
struct FastMod {
  d: u64,
  m: u128,
}

impl FastMod {
  fn new(d: u64) -> FastMod {
    FastMod {
      d,
      m: (u128::MAX / d as u128).wrapping_add(1),
    }
  }

  #[inline(always)]
  fn rem(&self, x: u64) -> u64 {
    let low = self.m.wrapping_mul(x as u128);
    let l0 = low as u64 as u128;
    let l1 = (low >> 64) as u128;
    let d = self.d as u128;
    ((l1 * d + ((l0 * d) >> 64)) >> 64) as u64
  }
}

fn is_prime(n: u64) -> bool {
  if n < 2 {
    return false;
  }
  if n % 2 == 0 {
    return n == 2;
  }
  let mut d = 3;
  while d * d <= n {
    if n % d == 0 {
      return false;
    }
    d += 2;
  }
  true
}

fn next_prime(n: u64) -> u64 {
  let mut n = n.max(2);
  while !is_prime(n) {
    n += 1;
  }
  n
}

fn shifts_limit_for(bucket_count: u64) -> u32 {
  8 * (64 - bucket_count.leading_zeros())
}

/// Map from u64 keys to fixed-size `Copy` values.
pub struct CuckooMap<V: Copy + Default> {
  keys: Vec<u64>,
  values: Vec<V>,
  size: usize,
  empty_key: u64,
  empty_key_set: bool,
  bucket_count: u64,
  fold: FastMod,
  growth: f32,
  shifts_limit: u32,
  rng: Xoshiro256PlusPlus,
  // pair displaced by the last failed eviction walk
  pending: Option<(u64, V)>,
}

/// Set of u64 keys: a map with zero-sized values.
pub type CuckooSet = CuckooMap<()>;

impl<V: Copy + Default> CuckooMap<V> {
  /// Allocates space for at least `capacity` key-value pairs.
  pub fn with_capacity(capacity: u32) -> CuckooMap<V> {
    let buckets = next_prime((capacity as u64 / BUCKET_LENGTH as u64 + 1).max(MIN_BUCKETS));
    Self::with_buckets(buckets, 0, false, 1.5)
  }

  fn with_buckets(
    bucket_count: u64,
    empty_key: u64,
    empty_key_set: bool,
    growth: f32,
  ) -> CuckooMap<V> {
    let slots = (bucket_count as usize) * BUCKET_LENGTH;
    CuckooMap {
      keys: vec![empty_key; slots],
      values: vec![V::default(); slots],
      size: 0,
      empty_key,
      empty_key_set,
      bucket_count,
      fold: FastMod::new(bucket_count),
      growth,
      shifts_limit: shifts_limit_for(bucket_count),
      rng: Xoshiro256PlusPlus::seed_from_u64(bucket_count ^ MASK1),
      pending: None,
    }
  }

  /// Must be called before insertions take place; `k` can never be used as
  /// a key afterwards.
  pub fn set_empty_key(&mut self, k: u64) {
    assert!(!self.empty_key_set, "empty key already set");
    self.empty_key = k;
    self.empty_key_set = true;
    for slot in self.keys.iter_mut() {
      *slot = k;
    }
  }

  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  /// Upper bound (exclusive) for dense ids.
  pub fn capacity(&self) -> DenseId {
    (self.bucket_count as usize * BUCKET_LENGTH) as DenseId
  }

  pub fn utilization(&self) -> f64 {
    self.size as f64 / self.capacity() as f64
  }

  pub fn bytes_allocated(&self) -> usize {
    self.keys.capacity() * std::mem::size_of::<u64>()
      + self.values.capacity() * std::mem::size_of::<V>()
  }

  /// Growth factor applied when an insert cannot be placed. Must exceed 1.01.
  pub fn set_growth(&mut self, growth: f32) {
    assert!(growth > 1.01);
    self.growth = growth;
  }

  pub fn clear(&mut self) {
    self.size = 0;
    for slot in self.keys.iter_mut() {
      *slot = self.empty_key;
    }
  }

  #[inline(always)]
  fn hash1(&self, k: u64) -> u64 {
    self.fold.rem(MASK1 ^ k)
  }

  #[inline(always)]
  fn hash2(&self, k: u64) -> u64 {
    self.fold.rem(MASK2 ^ k)
  }

  fn id_pair(&self, k: u64) -> (u64, u64) {
    let b1 = self.hash1(k);
    let mut b2 = self.hash2(k);
    if b2 == b1 {
      b2 = (b1 + 1) % self.bucket_count;
    }
    (b1, b2)
  }

  #[inline(always)]
  fn to_dense(bucket: u64, slot: usize) -> DenseId {
    (bucket as usize * BUCKET_LENGTH + slot) as DenseId
  }

  /// Alternate bucket of `k` relative to `from`.
  fn other_bucket(&self, k: u64, from: u64) -> u64 {
    let (b1, b2) = self.id_pair(k);
    if b1 == from {
      b2
    } else {
      b1
    }
  }

  pub fn find(&self, k: u64) -> DenseId {
    if !self.empty_key_set {
      return NPOS;
    }
    let (b1, b2) = self.id_pair(k);
    for &bucket in [b1, b2].iter() {
      let base = bucket as usize * BUCKET_LENGTH;
      for i in 0..BUCKET_LENGTH {
        if self.keys[base + i] == k {
          return Self::to_dense(bucket, i);
        }
      }
    }
    NPOS
  }

  /// Key and value stored at dense id `d`. Slots holding the empty key are
  /// unoccupied.
  pub fn from_dense_id(&self, d: DenseId) -> (u64, &V) {
    let d = d as usize;
    (self.keys[d], &self.values[d])
  }

  pub fn from_dense_id_mut(&mut self, d: DenseId) -> (u64, &mut V) {
    let d = d as usize;
    (self.keys[d], &mut self.values[d])
  }

  /// Inserts `k`. On a duplicate key returns the existing id and `false`
  /// without overwriting the value. Invalidates all previously returned
  /// dense ids whenever it has to shift, grow or rebuild.
  pub fn insert(&mut self, k: u64, v: V) -> (DenseId, bool) {
    assert!(self.empty_key_set, "set_empty_key was not called");
    assert!(k != self.empty_key, "the empty key cannot be inserted");
    let existing = self.find(k);
    if existing != NPOS {
      return (existing, false);
    }
    self.size += 1;
    if let Some(id) = self.try_place(k, v) {
      // A long eviction walk can displace k itself after placing it.
      let id = if self.keys[id as usize] == k {
        id
      } else {
        self.find(k)
      };
      return (id, true);
    }
    // The walk placed k but displaced another pair; give that pair the
    // exhaustive treatment before resorting to growth.
    let (pk, pv) = self.pending.take().expect("failed walk leaves a pending pair");
    if self.insert_exhaustive_pair(pk, pv) {
      return (self.find(k), true);
    }
    self.grow(Some((pk, pv)));
    (self.find(k), true)
  }

  // Direct placement into an empty slot of either bucket, then a bounded
  // random-walk eviction chain. On failure the displaced pair lands in
  // `self.pending` and None is returned.
  fn try_place(&mut self, k: u64, v: V) -> Option<DenseId> {
    let (b1, b2) = self.id_pair(k);
    for &bucket in [b1, b2].iter() {
      let base = bucket as usize * BUCKET_LENGTH;
      for i in 0..BUCKET_LENGTH {
        if self.keys[base + i] == self.empty_key {
          self.keys[base + i] = k;
          self.values[base + i] = v;
          return Some(Self::to_dense(bucket, i));
        }
      }
    }
    let start = if self.rng.next_u32() & 1 == 0 { b1 } else { b2 };
    self.roll_pending(k, v, start)
  }

  fn roll_pending(&mut self, k: u64, v: V, start: u64) -> Option<DenseId> {
    let mut pending_key = k;
    let mut pending_val = v;
    let mut bucket = start;
    let mut result = NPOS;
    for _ in 0..self.shifts_limit {
      let base = bucket as usize * BUCKET_LENGTH;
      for i in 0..BUCKET_LENGTH {
        if self.keys[base + i] == self.empty_key {
          self.keys[base + i] = pending_key;
          self.values[base + i] = pending_val;
          let id = Self::to_dense(bucket, i);
          return Some(if result == NPOS { id } else { result });
        }
      }
      let slot = (self.rng.next_u32() as usize) % BUCKET_LENGTH;
      std::mem::swap(&mut self.keys[base + slot], &mut pending_key);
      std::mem::swap(&mut self.values[base + slot], &mut pending_val);
      if result == NPOS {
        result = Self::to_dense(bucket, slot);
      }
      bucket = self.other_bucket(pending_key, bucket);
    }
    self.pending = Some((pending_key, pending_val));
    None
  }

  // Breadth-first search over the bucket graph for any reachable free slot;
  // shifts entries along the discovered path. Statistically improbable to
  // be needed with prime bucket counts, but it keeps inserts lossless.
  fn insert_exhaustive_pair(&mut self, k: u64, v: V) -> bool {
    let (b1, b2) = self.id_pair(k);
    let mut visited: HashMap<u64, (u64, usize)> = HashMap::new();
    let mut queue: VecDeque<u64> = VecDeque::new();
    visited.insert(b1, (u64::MAX, usize::MAX));
    queue.push_back(b1);
    if let Entry::Vacant(e) = visited.entry(b2) {
      e.insert((u64::MAX, usize::MAX));
      queue.push_back(b2);
    }
    while let Some(bucket) = queue.pop_front() {
      let base = bucket as usize * BUCKET_LENGTH;
      if let Some(free) = (0..BUCKET_LENGTH).find(|&i| self.keys[base + i] == self.empty_key) {
        // Walk parents back to a root bucket, shifting keys forward.
        let mut cur = bucket;
        let mut free_slot = free;
        loop {
          let &(parent, slot) = visited.get(&cur).expect("visited parent");
          if parent == u64::MAX {
            break;
          }
          let src = parent as usize * BUCKET_LENGTH + slot;
          let dst = cur as usize * BUCKET_LENGTH + free_slot;
          self.keys[dst] = self.keys[src];
          self.values[dst] = self.values[src];
          self.keys[src] = self.empty_key;
          cur = parent;
          free_slot = slot;
        }
        let dst = cur as usize * BUCKET_LENGTH + free_slot;
        self.keys[dst] = k;
        self.values[dst] = v;
        return true;
      }
      for slot in 0..BUCKET_LENGTH {
        let victim = self.keys[base + slot];
        let next = self.other_bucket(victim, bucket);
        if let Entry::Vacant(e) = visited.entry(next) {
          e.insert((bucket, slot));
          queue.push_back(next);
        }
      }
    }
    false
  }

  fn grow(&mut self, pending: Option<(u64, V)>) {
    let mut target = next_prime((self.bucket_count as f64 * self.growth as f64) as u64 + 1);
    for _ in 0..GROW_ATTEMPTS {
      if let Some(fresh) = self.rebuild_into(target) {
        *self = fresh;
        if let Some((pk, pv)) = pending {
          if self.try_place(pk, pv).is_none() {
            let (qk, qv) = self.pending.take().expect("pending after failed walk");
            if !self.insert_exhaustive_pair(qk, qv) {
              target = next_prime((target as f64 * self.growth as f64) as u64 + 1);
              continue;
            }
          }
        }
        return;
      }
      target = next_prime((target as f64 * self.growth as f64) as u64 + 1);
    }
    panic!("cuckoo table cannot grow past {} buckets", self.bucket_count);
  }

  // Builds a table with `bucket_count` buckets holding every current entry.
  // Returns None if some entry cannot be placed even exhaustively.
  fn rebuild_into(&self, bucket_count: u64) -> Option<CuckooMap<V>> {
    let mut fresh: CuckooMap<V> =
      CuckooMap::with_buckets(bucket_count, self.empty_key, self.empty_key_set, self.growth);
    fresh.size = self.size;
    let mut stragglers: Vec<(u64, V)> = Vec::new();
    for d in 0..self.keys.len() {
      let k = self.keys[d];
      if k == self.empty_key {
        continue;
      }
      let v = self.values[d];
      if fresh.try_place(k, v).is_none() {
        let p = fresh.pending.take().expect("pending after failed walk");
        stragglers.push(p);
      }
    }
    for (k, v) in stragglers {
      if !fresh.insert_exhaustive_pair(k, v) {
        return None;
      }
    }
    Some(fresh)
  }

  /// Compacts to roughly `len() * ratio` slots. Returns false, leaving the
  /// table untouched, when the target is too tight to hold every key.
  pub fn compact(&mut self, ratio: f64) -> bool {
    assert!(ratio > 1.0);
    let target_slots = (self.size as f64 * ratio).ceil() as u64;
    let buckets = next_prime((target_slots / BUCKET_LENGTH as u64).max(1));
    if let Some(fresh) = self.rebuild_into(buckets) {
      *self = fresh;
      true
    } else {
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::Rng;

  #[test]
  fn test_basic_map_seq() {
    let mut m: CuckooMap<i32> = CuckooMap::with_capacity(0);
    assert_eq!(m.find(200), NPOS);
    m.set_empty_key(0);
    let length = 100_000u64;
    for k in 1..=length {
      let data = (k + 117) as i32;
      let (id, inserted) = m.insert(k, data);
      assert!(inserted);
      let (key, val) = m.from_dense_id(id);
      assert_eq!(key, k);
      assert_eq!(*val, data);
      assert_eq!(m.find(k), id);
    }
    let (id, inserted) = m.insert(1, 10);
    assert!(!inserted);
    assert_eq!(m.from_dense_id(id).0, 1);
    for k in 1..=length {
      assert_ne!(m.find(k), NPOS, "lost key {}", k);
    }
    for k in length + 1..=length * 2 {
      assert_eq!(m.find(k), NPOS);
    }
    assert_eq!(m.len() as u64, length);
    assert!(m.utilization() > 0.45 && m.utilization() <= 1.0);

    m.clear();
    assert!(m.is_empty());
    assert_eq!(m.len(), 0);
  }

  #[test]
  fn test_random_input() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut m: CuckooMap<u64> = CuckooMap::with_capacity(0);
    m.set_empty_key(0);
    let length = 100_000;
    for _ in 0..length {
      let mut v: u64 = rng.gen();
      while v == 0 || m.find(v) != NPOS {
        v = rng.gen();
      }
      let data = v.wrapping_mul(2);
      let (id, inserted) = m.insert(v, data);
      assert!(inserted);
      assert_eq!(m.find(v), id);
      let (key, val) = m.from_dense_id(id);
      assert_eq!(key, v);
      assert_eq!(*val, data);
    }
    assert_eq!(m.len(), length);
  }

  #[test]
  fn test_compact() {
    for iter in 17..200u64 {
      let mut m: CuckooMap<u64> = CuckooMap::with_capacity(0);
      m.set_empty_key(0);
      for k in 1..iter {
        m.insert(k * k, k);
      }
      assert!(m.compact(1.05), "compact failed at {}", iter);
      let mut count = 0;
      for d in 0..m.capacity() {
        let (key, val) = m.from_dense_id(d);
        if key == 0 {
          continue;
        }
        count += 1;
        assert_eq!(m.find(key), d, "inconsistent dense id for {}", key);
        assert_eq!(key, val * val);
      }
      assert_eq!(count as usize, m.len());
      for k in 1..iter {
        let id = m.find(k * k);
        assert_ne!(id, NPOS);
        assert_eq!(m.from_dense_id(id).0, k * k);
      }
    }
  }

  #[test]
  fn test_compact_preserves_on_failure() {
    let mut m: CuckooMap<u8> = CuckooMap::with_capacity(1000);
    m.set_empty_key(u64::MAX);
    for k in 0..800u64 {
      m.insert(k * 3 + 1, (k % 255) as u8);
    }
    // Whether or not an aggressive ratio succeeds, nothing may be lost.
    let _ = m.compact(1.01);
    assert_eq!(m.len(), 800);
    for k in 0..800u64 {
      assert_ne!(m.find(k * 3 + 1), NPOS);
    }
  }

  #[test]
  fn test_cuckoo_set() {
    let mut s: CuckooSet = CuckooMap::with_capacity(16);
    s.set_empty_key(0);
    for i in 1..=1000u64 {
      assert!(s.insert(i * i + 1, ()).1);
    }
    assert_eq!(s.len(), 1000);
    assert!(!s.insert(2, ()).1);
  }

  #[test]
  fn test_growth_factor() {
    let mut m: CuckooMap<u32> = CuckooMap::with_capacity(4);
    m.set_empty_key(0);
    m.set_growth(1.2);
    for k in 1..=50_000u64 {
      m.insert(k.wrapping_mul(0x9e3779b97f4a7c15), k as u32);
    }
    assert_eq!(m.len(), 50_000);
  }
}
