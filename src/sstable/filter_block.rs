use std::sync::Arc;

use crate::fixed;
use crate::sstable::FilterPolicy;

// Generate a new filter every 2KiB of data-block offset range.
const FILTER_BASE_LG: usize = 11;
const FILTER_BASE: usize = 1 << FILTER_BASE_LG;

/// Accumulates the keys of each data block and emits the filter block:
/// all filters back to back, then the u32 offset of each filter, the u32
/// offset of that offset array, and the base-lg byte.
pub struct FilterBlockBuilder {
  policy: Arc<dyn FilterPolicy>,
  // flattened keys plus their start offsets
  keys: Vec<u8>,
  starts: Vec<usize>,
  result: Vec<u8>,
  filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
  pub fn new(policy: Arc<dyn FilterPolicy>) -> FilterBlockBuilder {
    FilterBlockBuilder {
      policy,
      keys: Vec::new(),
      starts: Vec::new(),
      result: Vec::new(),
      filter_offsets: Vec::new(),
    }
  }

  pub fn start_block(&mut self, block_offset: u64) {
    let filter_index = block_offset as usize / FILTER_BASE;
    debug_assert!(filter_index >= self.filter_offsets.len());
    while filter_index > self.filter_offsets.len() {
      self.generate_filter();
    }
  }

  pub fn add_key(&mut self, key: &[u8]) {
    self.starts.push(self.keys.len());
    self.keys.extend_from_slice(key);
  }

  pub fn finish(&mut self) -> &[u8] {
    if !self.starts.is_empty() {
      self.generate_filter();
    }
    let array_offset = self.result.len() as u32;
    let offsets = std::mem::take(&mut self.filter_offsets);
    for &off in &offsets {
      fixed::append32(&mut self.result, off);
    }
    self.filter_offsets = offsets;
    fixed::append32(&mut self.result, array_offset);
    self.result.push(FILTER_BASE_LG as u8);
    &self.result
  }

  fn generate_filter(&mut self) {
    let num_keys = self.starts.len();
    self.filter_offsets.push(self.result.len() as u32);
    if num_keys == 0 {
      // No keys since the last filter: reuse the previous offset.
      return;
    }
    let keys = std::mem::take(&mut self.keys);
    let mut starts = std::mem::take(&mut self.starts);
    starts.push(keys.len()); // simplify length computation
    let key_slices: Vec<&[u8]> = (0..num_keys)
      .map(|i| &keys[starts[i]..starts[i + 1]])
      .collect();
    let policy = self.policy.clone();
    policy.create_filter(&key_slices, &mut self.result);
  }
}

/// Looks up the per-range filter for a data block offset.
pub struct FilterBlockReader {
  policy: Arc<dyn FilterPolicy>,
  data: Vec<u8>,
  // offset array position and entry count
  offsets_at: usize,
  num: usize,
  base_lg: usize,
}

impl FilterBlockReader {
  pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> FilterBlockReader {
    let mut reader = FilterBlockReader {
      policy,
      data,
      offsets_at: 0,
      num: 0,
      base_lg: 0,
    };
    let n = reader.data.len();
    if n < 5 {
      return reader;
    }
    reader.base_lg = reader.data[n - 1] as usize;
    let last_word = fixed::decode32(&reader.data[n - 5..]) as usize;
    if last_word > n - 5 {
      return reader;
    }
    reader.offsets_at = last_word;
    reader.num = (n - 5 - last_word) / 4;
    reader
  }

  pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
    let index = (block_offset >> self.base_lg) as usize;
    if index < self.num {
      let start = fixed::decode32(&self.data[self.offsets_at + index * 4..]) as usize;
      let limit = fixed::decode32(&self.data[self.offsets_at + index * 4 + 4..]) as usize;
      if start <= limit && limit <= self.offsets_at {
        let filter = &self.data[start..limit];
        return self.policy.key_may_match(key, filter);
      } else if start == limit {
        // Empty filters do not match any key.
        return false;
      }
    }
    // Errors are treated as potential matches.
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sstable::FilterPolicy;

  // Emits one fixed32 hash per key; exact membership for testing.
  struct TestHashFilter;

  impl FilterPolicy for TestHashFilter {
    fn name(&self) -> &str {
      "TestHashFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
      for key in keys {
        let mut h: u32 = 1;
        for &b in key.iter() {
          h = h.wrapping_mul(31).wrapping_add(b as u32);
        }
        fixed::append32(dst, h);
      }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
      let mut h: u32 = 1;
      for &b in key.iter() {
        h = h.wrapping_mul(31).wrapping_add(b as u32);
      }
      filter
        .chunks_exact(4)
        .any(|c| fixed::decode32(c) == h)
    }
  }

  fn reader_for(builder: &mut FilterBlockBuilder) -> FilterBlockReader {
    let block = builder.finish().to_vec();
    FilterBlockReader::new(Arc::new(TestHashFilter), block)
  }

  #[test]
  fn test_empty_builder() {
    let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
    let block = builder.finish().to_vec();
    assert_eq!(block, vec![0, 0, 0, 0, FILTER_BASE_LG as u8]);
    let reader = FilterBlockReader::new(Arc::new(TestHashFilter), block);
    assert!(reader.key_may_match(0, b"foo"));
    assert!(reader.key_may_match(100_000, b"foo"));
  }

  #[test]
  fn test_single_chunk() {
    let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
    builder.start_block(100);
    builder.add_key(b"foo");
    builder.add_key(b"bar");
    builder.add_key(b"box");
    builder.start_block(200);
    builder.add_key(b"box");
    builder.start_block(300);
    builder.add_key(b"hello");
    let reader = reader_for(&mut builder);
    assert!(reader.key_may_match(100, b"foo"));
    assert!(reader.key_may_match(100, b"bar"));
    assert!(reader.key_may_match(100, b"box"));
    assert!(reader.key_may_match(100, b"hello"));
    assert!(!reader.key_may_match(100, b"missing"));
    assert!(!reader.key_may_match(100, b"other"));
  }

  #[test]
  fn test_multi_chunk() {
    let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
    // First filter
    builder.start_block(0);
    builder.add_key(b"foo");
    builder.start_block(2000);
    builder.add_key(b"bar");
    // Second filter
    builder.start_block(3100);
    builder.add_key(b"box");
    // Third filter is empty
    // Last filter
    builder.start_block(9000);
    builder.add_key(b"box");
    builder.add_key(b"hello");
    let reader = reader_for(&mut builder);

    assert!(reader.key_may_match(0, b"foo"));
    assert!(reader.key_may_match(2000, b"bar"));
    assert!(!reader.key_may_match(0, b"box"));
    assert!(!reader.key_may_match(0, b"hello"));

    assert!(reader.key_may_match(3100, b"box"));
    assert!(!reader.key_may_match(3100, b"foo"));
    assert!(!reader.key_may_match(3100, b"bar"));
    assert!(!reader.key_may_match(3100, b"hello"));

    assert!(!reader.key_may_match(4100, b"foo"));
    assert!(!reader.key_may_match(4100, b"box"));

    assert!(reader.key_may_match(9000, b"box"));
    assert!(reader.key_may_match(9000, b"hello"));
    assert!(!reader.key_may_match(9000, b"foo"));
    assert!(!reader.key_may_match(9000, b"bar"));
  }
}
