use std::sync::Arc;

use crate::errors::{LstError, LstResult};
use crate::fixed;
use crate::sstable::block_builder::BlockBuilder;
use crate::varint;

/// Immutable block contents plus the decoded restart-array geometry.
pub struct Block {
  data: Vec<u8>,
  restart_offset: usize,
  num_restarts: u32,
}

impl Block {
  pub fn new(data: Vec<u8>) -> LstResult<Arc<Block>> {
    if data.len() < fixed::FIXED32_BYTES {
      return Err(LstError::io("block too small for restart count"));
    }
    let num_restarts = fixed::decode32(&data[data.len() - 4..]);
    // Even an empty block carries one restart point; a zero count only
    // appears in corrupt or crafted data and would underflow the seek
    // arithmetic below.
    if num_restarts == 0 {
      return Err(LstError::io("empty restart array in block"));
    }
    let tail = (num_restarts as usize + 1) * fixed::FIXED32_BYTES;
    if tail > data.len() {
      return Err(LstError::io("bad restart count in block"));
    }
    let restart_offset = data.len() - tail;
    Ok(Arc::new(Block {
      data,
      restart_offset,
      num_restarts,
    }))
  }

  pub fn size(&self) -> usize {
    self.data.len()
  }

  pub fn from_builder(builder: &mut BlockBuilder) -> Arc<Block> {
    Block::new(builder.finish().to_vec()).expect("fresh block is well formed")
  }

  fn restart_point(&self, i: u32) -> usize {
    fixed::decode32(&self.data[self.restart_offset + i as usize * 4..]) as usize
  }

  pub fn iter(self: Arc<Block>) -> BlockIter {
    let current = self.restart_offset;
    let restart_index = self.num_restarts;
    BlockIter {
      block: self,
      current,
      restart_index,
      key: Vec::new(),
      value_offset: 0,
      value_len: 0,
      status: None,
    }
  }
}

/// Cursor over a block's entries. Initially invalid: position it with one
/// of the seek methods first.
pub struct BlockIter {
  block: Arc<Block>,
  // offset of the current entry in data, == restart_offset when invalid
  current: usize,
  restart_index: u32,
  key: Vec<u8>,
  value_offset: usize,
  value_len: usize,
  status: Option<LstError>,
}

impl BlockIter {
  pub fn valid(&self) -> bool {
    self.status.is_none() && self.current < self.block.restart_offset
  }

  pub fn status(&self) -> LstResult<()> {
    match &self.status {
      None => Ok(()),
      Some(e) => Err(e.clone()),
    }
  }

  pub fn key(&self) -> &[u8] {
    debug_assert!(self.valid());
    &self.key
  }

  pub fn value(&self) -> &[u8] {
    debug_assert!(self.valid());
    &self.block.data[self.value_offset..self.value_offset + self.value_len]
  }

  fn next_entry_offset(&self) -> usize {
    self.value_offset + self.value_len
  }

  fn corruption(&mut self) {
    self.current = self.block.restart_offset;
    self.restart_index = self.block.num_restarts;
    self.status = Some(LstError::io("bad entry in block"));
    self.key.clear();
    self.value_offset = 0;
    self.value_len = 0;
  }

  fn seek_to_restart_point(&mut self, index: u32) {
    self.key.clear();
    self.restart_index = index;
    // parse_next_key picks the entry up from here
    self.value_offset = self.block.restart_point(index);
    self.value_len = 0;
  }

  fn parse_next_key(&mut self) -> bool {
    self.current = self.next_entry_offset();
    if self.current >= self.block.restart_offset {
      // No more entries; mark invalid.
      self.current = self.block.restart_offset;
      self.restart_index = self.block.num_restarts;
      return false;
    }
    let data = &self.block.data[..self.block.restart_offset];
    let mut p = self.current;
    let parse3 = |p: &mut usize| -> LstResult<(u32, u32, u32)> {
      let (shared, n) = varint::parse32(&data[*p..])?;
      *p += n;
      let (non_shared, n) = varint::parse32(&data[*p..])?;
      *p += n;
      let (value_len, n) = varint::parse32(&data[*p..])?;
      *p += n;
      Ok((shared, non_shared, value_len))
    };
    let (shared, non_shared, value_len) = match parse3(&mut p) {
      Ok(v) => v,
      Err(_) => {
        self.corruption();
        return false;
      }
    };
    if self.key.len() < shared as usize
      || p + non_shared as usize + value_len as usize > self.block.restart_offset
    {
      self.corruption();
      return false;
    }
    self.key.truncate(shared as usize);
    self
      .key
      .extend_from_slice(&self.block.data[p..p + non_shared as usize]);
    self.value_offset = p + non_shared as usize;
    self.value_len = value_len as usize;
    while self.restart_index + 1 < self.block.num_restarts
      && self.block.restart_point(self.restart_index + 1) < self.current
    {
      self.restart_index += 1;
    }
    true
  }

  pub fn seek_to_first(&mut self) {
    self.seek_to_restart_point(0);
    self.parse_next_key();
  }

  pub fn seek_to_last(&mut self) {
    self.seek_to_restart_point(self.block.num_restarts - 1);
    while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {
      // advance to the last entry
    }
  }

  /// Positions at the first entry with key >= target.
  pub fn seek(&mut self, target: &[u8]) {
    // Binary search over restart points for the last one with a key less
    // than the target.
    let mut left: u32 = 0;
    let mut right: u32 = self.block.num_restarts - 1;
    while left < right {
      let mid = (left + right + 1) / 2;
      let region_offset = self.block.restart_point(mid);
      let data = &self.block.data;
      let parse_at = |mut p: usize| -> LstResult<(u32, u32, u32, usize)> {
        let (shared, n) = varint::parse32(&data[p..])?;
        p += n;
        let (non_shared, n) = varint::parse32(&data[p..])?;
        p += n;
        let (value_len, n) = varint::parse32(&data[p..])?;
        p += n;
        Ok((shared, non_shared, value_len, p))
      };
      match parse_at(region_offset) {
        Ok((shared, non_shared, _, p)) if shared == 0 => {
          let mid_key = &data[p..p + non_shared as usize];
          if mid_key < target {
            left = mid;
          } else {
            right = mid - 1;
          }
        }
        _ => {
          self.corruption();
          return;
        }
      }
    }
    self.seek_to_restart_point(left);
    loop {
      if !self.parse_next_key() {
        return;
      }
      if self.key.as_slice() >= target {
        return;
      }
    }
  }

  pub fn next(&mut self) {
    debug_assert!(self.valid());
    self.parse_next_key();
  }

  pub fn prev(&mut self) {
    debug_assert!(self.valid());
    // Back up to a restart point before the current entry, then scan
    // forward to the entry just before it.
    let original = self.current;
    while self.block.restart_point(self.restart_index) >= original {
      if self.restart_index == 0 {
        // No entries before the first one.
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
        return;
      }
      self.restart_index -= 1;
    }
    self.seek_to_restart_point(self.restart_index);
    while self.parse_next_key() && self.next_entry_offset() < original {
      // walk forward
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sstable::BlockBuilder;

  fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
    let mut builder = BlockBuilder::new(restart_interval);
    for (k, v) in entries {
      builder.add(k, v);
    }
    Block::from_builder(&mut builder)
  }

  fn sample() -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..100u32)
      .map(|i| {
        (
          format!("key{:04}", i * 3).into_bytes(),
          format!("value-{}", i).into_bytes(),
        )
      })
      .collect()
  }

  #[test]
  fn test_forward_scan() {
    for &interval in &[1usize, 4, 16, 1024] {
      let entries = sample();
      let refs: Vec<(&[u8], &[u8])> =
        entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
      let block = build_block(&refs, interval);
      let mut it = block.clone().iter();
      assert!(!it.valid());
      it.seek_to_first();
      for (k, v) in &entries {
        assert!(it.valid());
        assert_eq!(it.key(), k.as_slice());
        assert_eq!(it.value(), v.as_slice());
        it.next();
      }
      assert!(!it.valid());
    }
  }

  #[test]
  fn test_backward_scan() {
    for &interval in &[1usize, 16, 1024] {
      let entries = sample();
      let refs: Vec<(&[u8], &[u8])> =
        entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
      let block = build_block(&refs, interval);
      let mut it = block.clone().iter();
      it.seek_to_last();
      for (k, v) in entries.iter().rev() {
        assert!(it.valid());
        assert_eq!(it.key(), k.as_slice());
        assert_eq!(it.value(), v.as_slice());
        it.prev();
      }
      assert!(!it.valid());
    }
  }

  #[test]
  fn test_seek() {
    for &interval in &[1usize, 16, 1024] {
      let entries = sample();
      let refs: Vec<(&[u8], &[u8])> =
        entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
      let block = build_block(&refs, interval);
      let mut it = block.clone().iter();
      // Exact hits.
      it.seek(b"key0099");
      assert!(it.valid());
      assert_eq!(it.key(), b"key0099");
      // Between keys: lands on the next one.
      it.seek(b"key0100");
      assert!(it.valid());
      assert_eq!(it.key(), b"key0102");
      // Before everything.
      it.seek(b"a");
      assert!(it.valid());
      assert_eq!(it.key(), b"key0000");
      // Past everything.
      it.seek(b"z");
      assert!(!it.valid());
    }
  }

  #[test]
  fn test_empty_block() {
    let mut builder = BlockBuilder::new(16);
    let block = Block::from_builder(&mut builder);
    let mut it = block.clone().iter();
    it.seek_to_first();
    assert!(!it.valid());
    it.seek(b"anything");
    assert!(!it.valid());
  }

  #[test]
  fn test_zero_restart_count_rejected() {
    // Four zero bytes decode to num_restarts == 0: corrupt, not seekable.
    assert!(Block::new(vec![0, 0, 0, 0]).is_err());
    assert!(Block::new(Vec::new()).is_err());
    assert!(Block::new(vec![1, 2, 3]).is_err());
  }
}
