//! String column: a u32 stream of lengths followed by the concatenated
//! literal payloads, optionally zlib-compressed when that pays for itself.
//!
//! Header byte: `enc:2 | method:2 | uncompressed_size_bytes:2 |
//! lengths_blob_size_bytes:2`, then the optional big-endian uncompressed
//! size, the big-endian lengths-blob size, the lengths blob and the blob.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::bits::{load_big_endian, num_fixed_bytes, store_big_endian};
use crate::errors::{LstError, LstResult};
use crate::int_coder::{UInt32Decoder, UInt32Encoder};
use crate::sinksource::Sink;

const ENC_RAW: u8 = 0;
const ENC_COMPRESSED: u8 = 1;
const METHOD_ZLIB: u8 = 0;

// compression only below this literal size never pays off
const MIN_COMPRESS_SIZE: usize = 64;

#[derive(Default)]
pub struct StringEncoder {
  buf: Vec<u8>,
  buf2: Vec<u8>,
  lengths: Vec<u32>,
  uncompr_sz: u32,
  header: u8,
  header_sz: u8,
  count: u32,
  finalized: bool,
}

impl StringEncoder {
  pub fn new() -> StringEncoder {
    StringEncoder {
      header_sz: 5,
      ..Default::default()
    }
  }

  pub fn add(&mut self, s: &[u8]) {
    debug_assert!(!self.finalized);
    self.buf.extend_from_slice(s);
    self.lengths.push(s.len() as u32);
    self.count += 1;
  }

  pub fn count(&self) -> u32 {
    self.count
  }

  /// Exact after `finalize`, an upper estimate before.
  pub fn byte_size(&self) -> usize {
    self.buf.len() + self.buf2.len() + self.header_sz as usize
  }

  pub fn finalize(&mut self) {
    if self.finalized {
      return;
    }
    self.finalized = true;
    let mut coder = UInt32Encoder::new();
    coder.encode(&self.lengths, true);
    self.buf2 = coder.take_buffer();
    let bc = num_fixed_bytes(self.buf2.len() as u32);
    self.header_sz = bc + 2;
    self.header = ENC_RAW | (bc << 6);
    if self.buf.len() >= MIN_COMPRESS_SIZE {
      let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
      let compressed = enc
        .write_all(&self.buf)
        .and_then(|_| enc.finish())
        .map_err(|e| log::error!("compression error: {}", e));
      if let Ok(compressed) = compressed {
        if compressed.len() + self.buf.len() / 6 <= self.buf.len() {
          log::debug!("compressing from {} to {}", self.buf.len(), compressed.len());
          self.uncompr_sz = self.buf.len() as u32;
          let ubc = num_fixed_bytes(self.uncompr_sz);
          self.header_sz += ubc + 1;
          self.buf = compressed;
          self.header |= ENC_COMPRESSED | (METHOD_ZLIB << 2) | (ubc << 4);
        }
      }
    }
  }

  pub fn serialize_to(&self, sink: &mut dyn Sink) -> LstResult<()> {
    debug_assert!(self.finalized);
    let mut tmp = Vec::with_capacity(self.header_sz as usize);
    tmp.push(self.header);
    if self.uncompr_sz != 0 {
      store_big_endian(self.uncompr_sz, (self.header >> 4) & 3, &mut tmp);
    }
    store_big_endian(self.buf2.len() as u32, self.header >> 6, &mut tmp);
    debug_assert_eq!(self.header_sz as usize, tmp.len());
    sink.append(&tmp)?;
    sink.append(&self.buf2)?;
    sink.append(&self.buf)
  }
}

pub struct StringDecoder<'a> {
  count: u32,
  length_dec: Option<UInt32Decoder<'a>>,
  raw_src: &'a [u8],
  inflated: Vec<u8>,
  compressed: bool,
  pos: usize,
}

impl<'a> StringDecoder<'a> {
  pub fn new(slice: &'a [u8]) -> LstResult<StringDecoder<'a>> {
    let parse_err = || LstError::io("bad string column format");
    if slice.len() < 2 {
      return Err(parse_err());
    }
    let header = slice[0];
    let mut next = 1usize;
    let enc_type = header & 3;
    let compressed = enc_type == ENC_COMPRESSED;
    let mut inflated_size = 0usize;
    if compressed {
      let method = (header >> 2) & 3;
      if method != METHOD_ZLIB {
        return Err(LstError::io("invalid string compress method"));
      }
      let ubc = (header >> 4) & 3;
      if next + ubc as usize >= slice.len() {
        return Err(parse_err());
      }
      inflated_size = load_big_endian(&slice[next..], ubc) as usize;
      next += ubc as usize + 1;
    }
    let bc = (header >> 6) & 3;
    if next + bc as usize >= slice.len() {
      return Err(parse_err());
    }
    let lenc_sz = load_big_endian(&slice[next..], bc) as usize;
    next += bc as usize + 1;
    if lenc_sz == 0 {
      return Ok(StringDecoder {
        count: 0,
        length_dec: None,
        raw_src: &[],
        inflated: Vec::new(),
        compressed: false,
        pos: 0,
      });
    }
    if next + lenc_sz > slice.len() {
      return Err(parse_err());
    }
    let lengths_blob = &slice[next..next + lenc_sz];
    let mut length_dec = UInt32Decoder::new(lengths_blob);
    let mut total_sz: u64 = 0;
    let mut count = 0u32;
    let mut len = 0u32;
    while length_dec.next(&mut len)? {
      total_sz += len as u64;
      count += 1;
    }
    let dstart = next + lenc_sz;
    if count == 0 {
      return Err(parse_err());
    }
    let mut inflated = Vec::new();
    let raw_len;
    if compressed {
      log::debug!(
        "inflating {} bytes into {}",
        slice.len() - dstart,
        inflated_size
      );
      let mut dec = ZlibDecoder::new(&slice[dstart..]);
      inflated.reserve(inflated_size);
      dec
        .read_to_end(&mut inflated)
        .map_err(|e| LstError::io(format!("zlib error: {}", e)))?;
      if inflated.len() != inflated_size {
        return Err(LstError::io("inconsistent inflated size"));
      }
      raw_len = inflated.len();
    } else {
      raw_len = slice.len() - dstart;
    }
    if total_sz != raw_len as u64 {
      return Err(LstError::io("inconsistent string column lengths"));
    }
    length_dec.restart();
    Ok(StringDecoder {
      count,
      length_dec: Some(length_dec),
      raw_src: &slice[dstart..],
      inflated,
      compressed,
      pos: 0,
    })
  }

  pub fn size(&self) -> u32 {
    self.count
  }

  /// Yields the next string as a view valid until the following call.
  pub fn next(&mut self) -> LstResult<Option<&[u8]>> {
    let dec = match self.length_dec.as_mut() {
      Some(dec) => dec,
      None => return Ok(None),
    };
    let mut len = 0u32;
    if !dec.next(&mut len)? {
      return Ok(None);
    }
    let raw: &[u8] = if self.compressed {
      &self.inflated
    } else {
      self.raw_src
    };
    let start = self.pos;
    self.pos += len as usize;
    Ok(Some(&raw[start..self.pos]))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sinksource::VecSink;

  fn round_trip(strings: &[&[u8]]) -> usize {
    let mut enc = StringEncoder::new();
    for s in strings {
      enc.add(s);
    }
    enc.finalize();
    let mut sink = VecSink::new();
    enc.serialize_to(&mut sink).unwrap();
    let buf = sink.into_contents();
    assert_eq!(buf.len(), enc.byte_size());
    let mut dec = StringDecoder::new(&buf).unwrap();
    assert_eq!(dec.size() as usize, strings.len());
    for s in strings {
      let got = dec.next().unwrap().expect("decoder underrun");
      assert_eq!(&got, s);
    }
    assert!(dec.next().unwrap().is_none());
    buf.len()
  }

  #[test]
  fn test_basic() {
    round_trip(&[b"hello", b"", b"world", b"a longer string as well"]);
  }

  #[test]
  fn test_empty_column() {
    round_trip(&[]);
  }

  #[test]
  fn test_compressible() {
    let blob = vec![b'a'; 4000];
    let strings: Vec<&[u8]> = (0..40).map(|_| &blob[..100]).collect();
    let size = round_trip(&strings);
    assert!(size < 500, "compressible column took {} bytes", size);
  }

  #[test]
  fn test_incompressible_stays_raw() {
    let mut state = 0x853c49e6748fea9bu64;
    let blob: Vec<u8> = (0..4096)
      .map(|_| {
        state = state
          .wrapping_mul(6364136223846793005)
          .wrapping_add(1442695040888963407);
        (state >> 33) as u8
      })
      .collect();
    let strings: Vec<&[u8]> = blob.chunks(128).collect();
    let size = round_trip(&strings);
    assert!(size >= blob.len(), "incompressible column shrank to {}", size);
  }

  #[test]
  fn test_below_compression_threshold() {
    round_trip(&[b"aaaaaaaaaaaaaaaaaaaaa", b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]);
  }

  #[test]
  fn test_corrupt_method() {
    let mut enc = StringEncoder::new();
    let blob = vec![b'x'; 3000];
    enc.add(&blob);
    enc.finalize();
    let mut sink = VecSink::new();
    enc.serialize_to(&mut sink).unwrap();
    let mut buf = sink.into_contents();
    assert_eq!(buf[0] & 3, ENC_COMPRESSED);
    buf[0] |= 1 << 2; // unknown compression method
    assert!(StringDecoder::new(&buf).is_err());
  }
}
