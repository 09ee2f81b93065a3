use std::collections::BTreeMap;

use crate::crc32c;
use crate::errors::{LstError, LstResult};
use crate::fixed;
use crate::list_file::*;
use crate::sinksource::Source;
use crate::varint;

/// Invoked with (approximate dropped byte count, reason) whenever corrupt
/// data is skipped.
pub type CorruptionReporter = Box<dyn FnMut(usize, &LstError)>;

enum Physical {
  Eof,
  Bad,
  Rec(u8, Vec<u8>),
}

/// Sequential reader over a record-log stream. Corrupt records are
/// reported and skipped by resyncing to the next block boundary; only
/// unrecoverable source errors surface as `Err`.
pub struct ListReader<S: Source> {
  src: S,
  reporter: Option<CorruptionReporter>,
  checksum: bool,

  block_size: usize,
  eof: bool,
  header_done: bool,
  meta: BTreeMap<Vec<u8>, Vec<u8>>,

  block_buffer: Vec<u8>,
  block_pos: usize,

  array_store: Vec<u8>,
  array_pos: usize,
  array_records: u32,

  scratch: Vec<u8>,
  in_fragmented_record: bool,
}

impl<S: Source> ListReader<S> {
  pub fn new(src: S, checksum: bool, reporter: Option<CorruptionReporter>) -> ListReader<S> {
    ListReader {
      src,
      reporter,
      checksum,
      block_size: 0,
      eof: false,
      header_done: false,
      meta: BTreeMap::new(),
      block_buffer: Vec::new(),
      block_pos: 0,
      array_store: Vec::new(),
      array_pos: 0,
      array_records: 0,
      scratch: Vec::new(),
      in_fragmented_record: false,
    }
  }

  /// The file's meta map; forces the header read.
  pub fn meta(&mut self) -> LstResult<&BTreeMap<Vec<u8>, Vec<u8>>> {
    self.read_header()?;
    Ok(&self.meta)
  }

  /// Next logical record, or `None` at end of stream.
  pub fn read_record(&mut self) -> LstResult<Option<Vec<u8>>> {
    if !self.read_header()? {
      return Ok(None);
    }
    loop {
      if self.array_records > 0 {
        match self.next_array_item() {
          Some(item) => return Ok(Some(item)),
          None => {
            let dropped = self.array_store.len() - self.array_pos;
            self.report(dropped, &LstError::io("invalid array record"));
            self.array_records = 0;
          }
        }
        continue;
      }
      match self.read_physical_record()? {
        Physical::Rec(FULL_TYPE, payload) => {
          if self.in_fragmented_record {
            let len = self.scratch.len();
            self.report(len, &LstError::io("partial record without end(1)"));
            self.in_fragmented_record = false;
          }
          self.scratch.clear();
          return Ok(Some(payload));
        }
        Physical::Rec(FIRST_TYPE, payload) => {
          if self.in_fragmented_record && !self.scratch.is_empty() {
            let len = self.scratch.len();
            self.report(len, &LstError::io("partial record without end(2)"));
          }
          self.scratch = payload;
          self.in_fragmented_record = true;
        }
        Physical::Rec(MIDDLE_TYPE, payload) => {
          if !self.in_fragmented_record {
            self.report(
              payload.len(),
              &LstError::io("missing start of fragmented record(1)"),
            );
          } else {
            self.scratch.extend_from_slice(&payload);
          }
        }
        Physical::Rec(LAST_TYPE, payload) => {
          if !self.in_fragmented_record {
            self.report(
              payload.len(),
              &LstError::io("missing start of fragmented record(2)"),
            );
          } else {
            self.scratch.extend_from_slice(&payload);
            self.in_fragmented_record = false;
            return Ok(Some(std::mem::take(&mut self.scratch)));
          }
        }
        Physical::Rec(ARRAY_TYPE, payload) => {
          if self.in_fragmented_record {
            let len = self.scratch.len();
            self.report(len, &LstError::io("partial record without end(1)"));
            self.in_fragmented_record = false;
            self.scratch.clear();
          }
          match varint::parse32(&payload) {
            Ok((count, used)) if count > 0 => {
              self.array_records = count;
              self.array_store = payload;
              self.array_pos = used;
            }
            _ => self.report(payload.len(), &LstError::io("invalid array record")),
          }
        }
        Physical::Rec(kind, payload) => {
          let dropped = payload.len()
            + if self.in_fragmented_record {
              self.scratch.len()
            } else {
              0
            };
          self.report(dropped, &LstError::io(format!("unknown record type {}", kind)));
          self.in_fragmented_record = false;
          self.scratch.clear();
        }
        Physical::Bad => {
          if self.in_fragmented_record {
            let len = self.scratch.len();
            self.report(len, &LstError::io("error in middle of record"));
            self.in_fragmented_record = false;
            self.scratch.clear();
          }
        }
        Physical::Eof => {
          if self.in_fragmented_record {
            let len = self.scratch.len();
            self.report(len, &LstError::io("partial record without end(3)"));
            self.in_fragmented_record = false;
            self.scratch.clear();
          }
          return Ok(None);
        }
      }
    }
  }

  fn next_array_item(&mut self) -> Option<Vec<u8>> {
    let rest = &self.array_store[self.array_pos..];
    match varint::parse32(rest) {
      Ok((item_size, used)) if used + item_size as usize <= rest.len() => {
        let start = self.array_pos + used;
        let end = start + item_size as usize;
        self.array_pos = end;
        self.array_records -= 1;
        Some(self.array_store[start..end].to_vec())
      }
      _ => None,
    }
  }

  fn report(&mut self, bytes: usize, reason: &LstError) {
    log::error!("dropping {} bytes: {}", bytes, reason);
    if let Some(reporter) = self.reporter.as_mut() {
      reporter(bytes, reason);
    }
  }

  // Pulls exactly n bytes unless the source ends first.
  fn fill(&mut self, n: usize, dest: &mut Vec<u8>) -> LstResult<()> {
    dest.clear();
    while dest.len() < n {
      let chunk = self.src.peek(n - dest.len())?;
      if chunk.is_empty() {
        break;
      }
      let take = chunk.len().min(n - dest.len());
      dest.extend_from_slice(&chunk[..take]);
      self.src.skip(take);
    }
    Ok(())
  }

  fn read_header(&mut self) -> LstResult<bool> {
    if self.header_done {
      return Ok(!self.eof || self.block_size != 0);
    }
    if self.eof {
      return Ok(false);
    }
    self.header_done = true;
    let mut buf = Vec::new();
    self.fill(FILE_HEADER_SIZE, &mut buf)?;
    if buf.len() != FILE_HEADER_SIZE
      || &buf[..MAGIC.len()] != MAGIC
      || buf[MAGIC.len()] == 0
      || buf[MAGIC.len()] > 100
    {
      self.eof = true;
      self.report(FILE_HEADER_SIZE, &LstError::io("invalid header"));
      return Ok(false);
    }
    self.block_size = buf[MAGIC.len()] as usize * BLOCK_SIZE_FACTOR;
    if buf[MAGIC.len() + 1] == META_EXTENSION {
      let mut meta_header = Vec::new();
      self.fill(8, &mut meta_header)?;
      if meta_header.len() != 8 {
        self.fail_header("truncated meta block");
        return Ok(false);
      }
      let crc = crc32c::unmask(fixed::decode32(&meta_header));
      let length = fixed::decode32(&meta_header[4..]) as usize;
      let mut meta_buf = Vec::new();
      self.fill(length, &mut meta_buf)?;
      if meta_buf.len() != length || crc != crc32c::value(&meta_buf) {
        self.fail_header("corrupted meta data");
        return Ok(false);
      }
      if self.parse_meta(&meta_buf).is_none() {
        self.fail_header("corrupted meta data");
        return Ok(false);
      }
    }
    Ok(true)
  }

  fn fail_header(&mut self, reason: &str) {
    self.block_size = 0;
    self.eof = true;
    self.report(0, &LstError::io(reason));
  }

  fn parse_meta(&mut self, buf: &[u8]) -> Option<()> {
    let (count, mut pos) = varint::parse32(buf).ok()?;
    for _ in 0..count {
      let (klen, used) = varint::parse32(&buf[pos..]).ok()?;
      pos += used;
      let key = buf.get(pos..pos + klen as usize)?.to_vec();
      pos += klen as usize;
      let (vlen, used) = varint::parse32(&buf[pos..]).ok()?;
      pos += used;
      let value = buf.get(pos..pos + vlen as usize)?.to_vec();
      pos += vlen as usize;
      self.meta.insert(key, value);
    }
    Some(())
  }

  fn read_physical_record(&mut self) -> LstResult<Physical> {
    loop {
      if self.block_buffer.len() - self.block_pos < BLOCK_HEADER_SIZE {
        if !self.eof {
          let block_size = self.block_size;
          let mut buf = std::mem::take(&mut self.block_buffer);
          let status = self.fill(block_size, &mut buf);
          self.block_buffer = buf;
          self.block_pos = 0;
          if let Err(e) = status {
            self.report(block_size, &e);
            self.eof = true;
            return Ok(Physical::Eof);
          }
          if self.block_buffer.len() < block_size {
            self.eof = true;
          }
          continue;
        } else if self.block_buffer.len() == self.block_pos {
          return Ok(Physical::Eof);
        } else {
          let drop_size = self.block_buffer.len() - self.block_pos;
          self.clear_block();
          self.report(drop_size, &LstError::io("truncated record at end of file"));
          return Ok(Physical::Eof);
        }
      }
      let header_at = self.block_pos;
      let rec_type = self.block_buffer[header_at + 8];
      let length = fixed::decode32(&self.block_buffer[header_at + 4..]) as usize;
      let remaining = self.block_buffer.len() - self.block_pos;
      if length + BLOCK_HEADER_SIZE > remaining {
        log::debug!("invalid record length {}", length);
        let drop_size = remaining;
        self.clear_block();
        self.report(
          drop_size,
          &LstError::io("bad record length or truncated record at eof"),
        );
        return Ok(Physical::Bad);
      }
      if rec_type == ZERO_TYPE && length == 0 {
        // Zero-filled regions from preallocation, skipped without a report.
        self.clear_block();
        return Ok(Physical::Bad);
      }
      let data_at = header_at + BLOCK_HEADER_SIZE;
      if self.checksum {
        let expected = crc32c::unmask(fixed::decode32(&self.block_buffer[header_at..]));
        let actual = crc32c::value(&self.block_buffer[header_at + 8..data_at + length]);
        if expected != actual {
          // The length field itself may be corrupt; trusting it could land
          // on bytes that merely look like a record.
          let drop_size = remaining;
          self.clear_block();
          self.report(drop_size, &LstError::io("checksum mismatch"));
          return Ok(Physical::Bad);
        }
      }
      self.block_pos = data_at + length;
      let mut payload = self.block_buffer[data_at..data_at + length].to_vec();
      if rec_type & COMPRESSED_MASK != 0 {
        if payload.is_empty() || payload[0] != COMPRESSION_SNAPPY {
          self.report(
            length + BLOCK_HEADER_SIZE,
            &LstError::io("unknown compression method"),
          );
          return Ok(Physical::Bad);
        }
        match snap::raw::Decoder::new().decompress_vec(&payload[1..]) {
          Ok(raw) => payload = raw,
          Err(_) => {
            self.report(length + BLOCK_HEADER_SIZE, &LstError::io("uncompress failed"));
            return Ok(Physical::Bad);
          }
        }
      }
      return Ok(Physical::Rec(rec_type & RECORD_TYPE_MASK, payload));
    }
  }

  fn clear_block(&mut self) {
    self.block_pos = self.block_buffer.len();
  }
}
