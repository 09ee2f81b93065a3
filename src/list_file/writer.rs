use std::collections::BTreeMap;

use crate::crc32c;
use crate::errors::LstResult;
use crate::fixed;
use crate::list_file::*;
use crate::sinksource::Sink;
use crate::varint;

/// Appends records to a record-log stream.
///
/// `init` writes the file header (and meta block, if any) and must precede
/// `add_record`. Small records accumulate into an ARRAY record spanning the
/// rest of the current block; a record that cannot fit the remainder of a
/// block is fragmented into FIRST/MIDDLE/LAST pieces. `flush` closes the
/// open array; dropping an unflushed writer loses at most the open array.
pub struct ListWriter<W: Sink> {
  dest: W,
  options: Options,
  block_size: usize,
  init_called: bool,
  meta: BTreeMap<Vec<u8>, Vec<u8>>,

  array_store: Vec<u8>,
  array_next: usize,
  array_end: usize,
  array_records: u32,

  block_offset: usize,
  records_added: u64,
  bytes_added: u64,
}

impl<W: Sink> ListWriter<W> {
  pub fn new(dest: W, options: Options) -> ListWriter<W> {
    assert!(
      options.block_size_multiplier >= 1 && options.block_size_multiplier <= 100,
      "block size multiplier out of range"
    );
    let block_size = BLOCK_SIZE_FACTOR * options.block_size_multiplier as usize;
    ListWriter {
      dest,
      options,
      block_size,
      init_called: false,
      meta: BTreeMap::new(),
      array_store: vec![0; block_size],
      array_next: 0,
      array_end: 0,
      array_records: 0,
      block_offset: 0,
      records_added: 0,
      bytes_added: 0,
    }
  }

  /// Attaches user meta information to the file. Must precede `init`.
  pub fn add_meta<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) {
    assert!(!self.init_called, "add_meta after init");
    self.meta.insert(key.into(), value.into());
  }

  pub fn init(&mut self) -> LstResult<()> {
    assert!(!self.init_called, "init called twice");
    self.dest.append(MAGIC)?;
    let ext = if self.meta.is_empty() {
      NO_EXTENSION
    } else {
      META_EXTENSION
    };
    self.dest.append(&[self.options.block_size_multiplier, ext])?;
    if !self.meta.is_empty() {
      // Meta format: crc32, fixed32 block size, varint map size, then
      // (varint key size, key, varint value size, value) pairs.
      let mut buf = Vec::new();
      varint::append32(&mut buf, self.meta.len() as u32);
      for (k, v) in &self.meta {
        varint::append32(&mut buf, k.len() as u32);
        buf.extend_from_slice(k);
        varint::append32(&mut buf, v.len() as u32);
        buf.extend_from_slice(v);
      }
      let mut meta_header = [0u8; 8];
      let crc = crc32c::mask(crc32c::value(&buf));
      fixed::encode32(crc, &mut meta_header[..4]);
      fixed::encode32(buf.len() as u32, &mut meta_header[4..]);
      self.dest.append(&meta_header)?;
      self.dest.append(&buf)?;
    }
    self.init_called = true;
    Ok(())
  }

  pub fn records_added(&self) -> u64 {
    self.records_added
  }

  pub fn bytes_added(&self) -> u64 {
    self.bytes_added
  }

  #[inline]
  fn block_leftover(&self) -> usize {
    self.block_size - self.block_offset
  }

  pub fn add_record(&mut self, record: &[u8]) -> LstResult<()> {
    assert!(self.init_called, "add_record before init");
    let mut size_enc = Vec::with_capacity(varint::MAX_VARINT32_BYTES);
    varint::append32(&mut size_enc, record.len() as u32);
    let record_size_total = size_enc.len() + record.len();

    self.records_added += 1;
    let mut rest = record;
    let mut fragmenting = false;
    loop {
      if self.array_records > 0 {
        if self.array_next + record_size_total <= self.array_end {
          self.add_record_to_array(&size_enc, rest);
          return Ok(());
        }
        // No room for this record; the array flushes and the record either
        // moves to the next block or fragments.
        self.flush_array()?;
      }
      if self.block_leftover() < BLOCK_HEADER_SIZE {
        // Block trailing bytes, zero-filled.
        let filling = [0u8; BLOCK_HEADER_SIZE];
        self.dest.append(&filling[..self.block_leftover()])?;
        self.block_offset = 0;
      }
      if fragmenting {
        let mut fragment_length = rest.len();
        let mut rec_type = LAST_TYPE;
        if fragment_length > self.block_leftover() - BLOCK_HEADER_SIZE {
          fragment_length = self.block_leftover() - BLOCK_HEADER_SIZE;
          rec_type = MIDDLE_TYPE;
        }
        self.emit_physical_record(rec_type, &rest[..fragment_length])?;
        if rec_type == LAST_TYPE {
          return Ok(());
        }
        rest = &rest[fragment_length..];
        continue;
      }
      if record_size_total + ARRAY_RECORD_MAX_HEADER_SIZE < self.block_leftover() {
        // Start array accumulation, leaving space to prepend the count.
        self.array_next = ARRAY_RECORD_MAX_HEADER_SIZE;
        self.array_end = self.block_leftover();
        self.add_record_to_array(&size_enc, rest);
        return Ok(());
      }
      if BLOCK_HEADER_SIZE + rest.len() <= self.block_leftover() {
        // Room for exactly one record in this block.
        return self.emit_physical_record(FULL_TYPE, rest);
      }
      // Fragment.
      fragmenting = true;
      let fragment_length = self.block_leftover() - BLOCK_HEADER_SIZE;
      self.emit_physical_record(FIRST_TYPE, &rest[..fragment_length])?;
      rest = &rest[fragment_length..];
    }
  }

  /// Flushes the open array record, if any.
  pub fn flush(&mut self) -> LstResult<()> {
    let status = self.flush_array();
    status.and_then(|_| self.dest.flush())
  }

  pub fn sink(&self) -> &W {
    &self.dest
  }

  fn add_record_to_array(&mut self, size_enc: &[u8], record: &[u8]) {
    let n = self.array_next;
    self.array_store[n..n + size_enc.len()].copy_from_slice(size_enc);
    self.array_store[n + size_enc.len()..n + size_enc.len() + record.len()]
      .copy_from_slice(record);
    self.array_next = n + size_enc.len() + record.len();
    self.array_records += 1;
  }

  fn flush_array(&mut self) -> LstResult<()> {
    if self.array_records == 0 {
      return Ok(());
    }
    let mut count_enc = Vec::with_capacity(varint::MAX_VARINT32_BYTES);
    varint::append32(&mut count_enc, self.array_records);
    // The count lands immediately before the packed records.
    let start = ARRAY_RECORD_MAX_HEADER_SIZE - count_enc.len();
    let end = self.array_next;
    let mut store = std::mem::take(&mut self.array_store);
    store[start..ARRAY_RECORD_MAX_HEADER_SIZE].copy_from_slice(&count_enc);
    let status = self.emit_physical_record(ARRAY_TYPE, &store[start..end]);
    self.array_store = store;
    self.array_records = 0;
    status
  }

  fn emit_physical_record(&mut self, rec_type: u8, payload: &[u8]) -> LstResult<()> {
    debug_assert!(BLOCK_HEADER_SIZE + payload.len() <= self.block_leftover());
    let mut type_byte = rec_type;
    let mut out_payload = payload;
    let mut compressed = Vec::new();
    if self.options.use_compression && payload.len() >= 128 {
      match snap::raw::Encoder::new().compress_vec(payload) {
        Ok(c) => {
          log::trace!(
            "compressed record of {} bytes to ratio {:.3}",
            payload.len(),
            c.len() as f64 / payload.len() as f64
          );
          if c.len() < payload.len() - payload.len() / 8 {
            type_byte |= COMPRESSED_MASK;
            compressed.reserve(c.len() + 1);
            compressed.push(COMPRESSION_SNAPPY);
            compressed.extend_from_slice(&c);
            out_payload = &compressed;
          }
        }
        Err(e) => log::warn!("snappy error: {}", e),
      }
    }
    let mut header = [0u8; BLOCK_HEADER_SIZE];
    header[8] = type_byte;
    fixed::encode32(out_payload.len() as u32, &mut header[4..8]);
    let crc = crc32c::extend(crc32c::value(&header[8..9]), out_payload);
    fixed::encode32(crc32c::mask(crc), &mut header[..4]);
    self.dest.append(&header)?;
    self.dest.append(out_payload)?;
    self.bytes_added += (BLOCK_HEADER_SIZE + out_payload.len()) as u64;
    self.block_offset += BLOCK_HEADER_SIZE + out_payload.len();
    Ok(())
  }
}

impl<W: Sink> Drop for ListWriter<W> {
  fn drop(&mut self) {
    if self.array_records > 0 {
      if let Err(e) = self.flush_array() {
        log::error!("flush on drop failed: {}", e);
      }
    }
  }
}
