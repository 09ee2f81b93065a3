use std::collections::BTreeMap;

use crate::crc32c;
use crate::errors::{LstError, LstResult};
use crate::fixed;
use crate::sinksource::Sink;
use crate::sstable::block_builder::BlockBuilder;
use crate::sstable::filter_block::FilterBlockBuilder;
use crate::sstable::format::{BlockHandle, Footer, BLOCK_TRAILER_SIZE};
use crate::sstable::{CompressionType, Options, FILTER_NAME_PREFIX, META_BLOCK_KEY};
use crate::varint;

// Shortest key in [start, limit) sharing start's prefix; shrinks the index.
fn shortest_separator(start: &mut Vec<u8>, limit: &[u8]) {
  let min_len = start.len().min(limit.len());
  let mut diff = 0;
  while diff < min_len && start[diff] == limit[diff] {
    diff += 1;
  }
  if diff >= min_len {
    // One is a prefix of the other; leave start alone.
    return;
  }
  let byte = start[diff];
  if byte < 0xff && byte + 1 < limit[diff] {
    start[diff] = byte + 1;
    start.truncate(diff + 1);
    debug_assert!(start.as_slice() < limit);
  }
}

// Shortest key >= key.
fn shortest_successor(key: &mut Vec<u8>) {
  for i in 0..key.len() {
    if key[i] != 0xff {
      key[i] += 1;
      key.truncate(i + 1);
      return;
    }
  }
  // Run of 0xff: leave as is.
}

/// Streams strictly-increasing key/value pairs into a table file.
///
/// Data blocks flush once they pass `options.block_size`; each flushed
/// block contributes one index entry keyed by a shortened separator. Call
/// `finish` to emit the filter, meta-index, index and footer.
pub struct TableBuilder<W: Sink> {
  options: Options,
  sink: W,
  offset: u64,
  num_entries: u64,
  closed: bool,
  data_block: BlockBuilder,
  index_block: BlockBuilder,
  last_key: Vec<u8>,
  filter_block: Option<FilterBlockBuilder>,
  pending_index_entry: bool,
  pending_handle: BlockHandle,
  meta: BTreeMap<Vec<u8>, Vec<u8>>,
  compressed_scratch: Vec<u8>,
}

impl<W: Sink> TableBuilder<W> {
  pub fn new(options: Options, sink: W) -> TableBuilder<W> {
    let filter_block = options
      .filter_policy
      .as_ref()
      .map(|p| FilterBlockBuilder::new(p.clone()));
    let restart_interval = options.block_restart_interval;
    TableBuilder {
      options,
      sink,
      offset: 0,
      num_entries: 0,
      closed: false,
      data_block: BlockBuilder::new(restart_interval),
      // The index block keys one entry per data block; restart interval 1
      // keeps its entries independently seekable.
      index_block: BlockBuilder::new(1),
      last_key: Vec::new(),
      filter_block,
      pending_index_entry: false,
      pending_handle: BlockHandle::default(),
      meta: BTreeMap::new(),
      compressed_scratch: Vec::new(),
    }
  }

  pub fn num_entries(&self) -> u64 {
    self.num_entries
  }

  pub fn file_size(&self) -> u64 {
    self.offset
  }

  pub fn sink(&self) -> &W {
    &self.sink
  }

  /// Adds a key/value pair to the table meta map, stored in the meta-index
  /// block under `!meta_block`.
  pub fn add_meta<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) {
    assert!(!self.closed);
    self.meta.insert(key.into(), value.into());
  }

  pub fn add(&mut self, key: &[u8], value: &[u8]) -> LstResult<()> {
    assert!(!self.closed, "add after finish");
    if self.num_entries > 0 && key <= self.last_key.as_slice() {
      return Err(LstError::invalid_argument(
        "keys must be added in strictly increasing order",
      ));
    }
    if self.pending_index_entry {
      debug_assert!(self.data_block.is_empty());
      shortest_separator(&mut self.last_key, key);
      let mut handle_encoding = Vec::new();
      self.pending_handle.encode_to(&mut handle_encoding);
      self.index_block.add(&self.last_key, &handle_encoding);
      self.pending_index_entry = false;
    }
    if let Some(fb) = self.filter_block.as_mut() {
      fb.add_key(key);
    }
    self.last_key.clear();
    self.last_key.extend_from_slice(key);
    self.num_entries += 1;
    self.data_block.add(key, value);
    if self.data_block.current_size_estimate() >= self.options.block_size {
      self.flush()?;
    }
    Ok(())
  }

  /// Forces the pending data block out.
  pub fn flush(&mut self) -> LstResult<()> {
    assert!(!self.closed, "flush after finish");
    if self.data_block.is_empty() {
      return Ok(());
    }
    debug_assert!(!self.pending_index_entry);
    self.pending_handle = self.write_block_from_builder(self.options.compression)?;
    self.pending_index_entry = true;
    if let Some(fb) = self.filter_block.as_mut() {
      fb.start_block(self.offset);
    }
    Ok(())
  }

  fn write_block_from_builder(&mut self, compression: CompressionType) -> LstResult<BlockHandle> {
    let raw = self.data_block.finish();
    let mut block_type = CompressionType::None;
    let mut contents: &[u8] = raw;
    if compression == CompressionType::Snappy {
      match snap::raw::Encoder::new().compress_vec(raw) {
        Ok(c) if c.len() < raw.len() => {
          self.compressed_scratch = c;
          contents = &self.compressed_scratch;
          block_type = CompressionType::Snappy;
        }
        Ok(_) => {}
        Err(e) => log::warn!("snappy error, storing block raw: {}", e),
      }
    }
    let contents = contents.to_vec();
    self.data_block.reset();
    self.write_raw_block(&contents, block_type)
  }

  fn write_raw_block(&mut self, contents: &[u8], block_type: CompressionType) -> LstResult<BlockHandle> {
    let handle = BlockHandle::new(self.offset, contents.len() as u64);
    self.sink.append(contents)?;
    let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
    trailer[0] = block_type as u8;
    let crc = crc32c::extend(crc32c::value(contents), &trailer[..1]);
    fixed::encode32(crc32c::mask(crc), &mut trailer[1..]);
    self.sink.append(&trailer)?;
    self.offset += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
    Ok(handle)
  }

  /// Flushes the last data block and writes filter, meta-index, index and
  /// footer. The builder is unusable afterwards.
  pub fn finish(&mut self) -> LstResult<()> {
    self.flush()?;
    assert!(!self.closed);
    self.closed = true;

    // Filter block, stored uncompressed.
    let mut filter_handle = None;
    if let Some(mut fb) = self.filter_block.take() {
      let contents = fb.finish().to_vec();
      filter_handle = Some(self.write_raw_block(&contents, CompressionType::None)?);
    }

    // Meta-index block: filter handle and inline meta map, keyed by
    // internal names.
    let mut meta_index_block = BlockBuilder::new(self.options.block_restart_interval);
    if let Some(handle) = filter_handle {
      let name = self
        .options
        .filter_policy
        .as_ref()
        .map(|p| p.name().to_string())
        .unwrap_or_default();
      let key = format!("{}{}", FILTER_NAME_PREFIX, name);
      let mut handle_encoding = Vec::new();
      handle.encode_to(&mut handle_encoding);
      meta_index_block.add(key.as_bytes(), &handle_encoding);
    }
    if !self.meta.is_empty() {
      let mut encoded = Vec::new();
      varint::append32(&mut encoded, self.meta.len() as u32);
      for (k, v) in &self.meta {
        varint::append32(&mut encoded, k.len() as u32);
        varint::append32(&mut encoded, v.len() as u32);
        encoded.extend_from_slice(k);
        encoded.extend_from_slice(v);
      }
      meta_index_block.add(META_BLOCK_KEY, &encoded);
    }
    let metaindex_contents = meta_index_block.finish().to_vec();
    let metaindex_handle = self.write_raw_block(&metaindex_contents, CompressionType::None)?;

    // Index block.
    if self.pending_index_entry {
      shortest_successor(&mut self.last_key);
      let mut handle_encoding = Vec::new();
      self.pending_handle.encode_to(&mut handle_encoding);
      self.index_block.add(&self.last_key, &handle_encoding);
      self.pending_index_entry = false;
    }
    let index_contents = self.index_block.finish().to_vec();
    let index_handle = self.write_raw_block(&index_contents, CompressionType::None)?;

    let footer = Footer {
      metaindex_handle,
      index_handle,
    };
    let mut footer_encoding = Vec::new();
    footer.encode_to(&mut footer_encoding);
    self.sink.append(&footer_encoding)?;
    self.offset += footer_encoding.len() as u64;
    log::debug!(
      "finished table: {} entries, {} bytes",
      self.num_entries,
      self.offset
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_shortest_separator() {
    let mut k = b"abcdefghijk".to_vec();
    shortest_separator(&mut k, b"abzzz");
    assert_eq!(k, b"abd");

    let mut k = b"abc".to_vec();
    shortest_separator(&mut k, b"abcdef");
    assert_eq!(k, b"abc");

    // Adjacent bytes cannot shorten.
    let mut k = b"abc1".to_vec();
    shortest_separator(&mut k, b"abc2");
    assert_eq!(k, b"abc1");

    let mut k = b"a\xffb".to_vec();
    shortest_separator(&mut k, b"c");
    assert_eq!(k, b"b");
  }

  #[test]
  fn test_shortest_successor() {
    let mut k = b"abc".to_vec();
    shortest_successor(&mut k);
    assert_eq!(k, b"b");

    let mut k = b"\xff\xffq".to_vec();
    shortest_successor(&mut k);
    assert_eq!(k, b"\xff\xffr");

    let mut k = b"\xff\xff".to_vec();
    shortest_successor(&mut k);
    assert_eq!(k, b"\xff\xff");
  }
}
