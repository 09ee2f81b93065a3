//! Chunked integer streams. A stream is a sequence of chunks, each led by a
//! header byte `type:3 | payload:5`:
//!
//! * `REPEATED` - run of one varint value. The 5-bit field stores
//!   `count - 8` up to 28; values 29..31 mean 1..3 extra big-endian count
//!   bytes follow, holding `count - 8 - 29`.
//! * `DELTA` - field is `(base_byte_count - 1) | sign << 3`; a big-endian
//!   base follows, then exactly one more chunk whose values unroll as deltas
//!   on the running base.
//! * `DIRECT_256` - field is `bit_width - 1`, next byte `count - 1`
//!   (up to 128), then the bit-packed payload.
//! * `DIRECT_PFOR` - u32 LE payload byte size, then a FastPFOR stream.
//!
//! A u64 stream is two u32 streams (low halves, then high halves) with a
//! u32 LE length prefix of the first.

use crate::bit_pack::{pack32, packed_byte_count, unpack32, BIT_PACK_MARGIN};
use crate::bits::{bsr32, load_big_endian, store_big_endian, width32};
use crate::errors::{LstError, LstResult};
use crate::fastpfor::FastPFor;
use crate::fixed;
use crate::sinksource::Sink;
use crate::varint;

const HEADER_TYPE_BITS: u8 = 3;
const TYPE_REPEATED: u8 = 0;
const TYPE_DELTA: u8 = 1;
const TYPE_DIRECT_256: u8 = 2;
const TYPE_DIRECT_PFOR: u8 = 3;

const MIN_REPEAT_CNT: u32 = 8;
const DELTA_THRESHOLD: u32 = 8;
const EXT_REP_CNT: u32 = 29;

// values an encoder may withhold waiting for more input
const MAX_HELD_BACK: usize = 1024;

#[derive(Default)]
struct DeltaResult {
  max_delta_width: u8,
  max_prebase_width: u8,
  is_repeated: bool,
  rep_delta: u32,
}

/// Streaming u32 encoder. `encode` consumes a prefix of its input and
/// appends chunks to the internal buffer; with `encode_everything` false a
/// tail of fewer than 1024 values may be held back for a later call.
#[derive(Default)]
pub struct UInt32Encoder {
  buffer: Vec<u8>,
  values: Vec<u32>,
  repeated_overhead: u32,
  delta_overhead: u32,
  direct_overhead: u32,
  pfor: FastPFor,
}

impl UInt32Encoder {
  pub fn new() -> UInt32Encoder {
    UInt32Encoder::default()
  }

  pub fn reset(&mut self) {
    self.buffer.clear();
    self.values.clear();
    self.direct_overhead = 0;
    self.repeated_overhead = 0;
    self.delta_overhead = 0;
  }

  pub fn byte_size(&self) -> usize {
    self.buffer.len()
  }

  pub fn buffer(&self) -> &[u8] {
    &self.buffer
  }

  pub fn take_buffer(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buffer)
  }

  pub fn header_overhead(&self) -> u32 {
    self.direct_overhead + self.repeated_overhead + self.delta_overhead
  }

  pub fn repeated_overhead(&self) -> u32 {
    self.repeated_overhead
  }

  pub fn direct_overhead(&self) -> u32 {
    self.direct_overhead
  }

  pub fn delta_overhead(&self) -> u32 {
    self.delta_overhead
  }

  /// Scans `src`, emitting chunks at every encoding break. Returns the
  /// number of source values consumed.
  pub fn encode(&mut self, src: &[u32], encode_everything: bool) -> usize {
    let length = src.len();
    if length == 0 {
      return 0;
    }
    let mut pending = 0usize;
    let mut repeated_cnt: u32 = 1;
    let mut delta_cnt: u32 = 0;
    let mut prev = src[0];
    let mut cur = 0u32;
    let mut max_val = prev;
    for index in 1..=length {
      if index < length {
        cur = src[index];
        if cur == prev {
          repeated_cnt += 1;
          continue;
        }
      }
      if repeated_cnt > 1 {
        let mut flushed = false;
        if repeated_cnt >= MIN_REPEAT_CNT {
          let end_direct = index - repeated_cnt as usize;
          // 12: what breaking an already-started direct encoding costs.
          let repeated_switch_cost = if pending == end_direct { 0 } else { 12 };
          let max_width = width32(max_val);
          if packed_byte_count(repeated_cnt as usize, max_width) > repeated_switch_cost {
            // Encode the numbers before the repeated block. If a delta run
            // precedes it, its last value doubles as the first repeated one.
            let delta_flushed = delta_cnt > DELTA_THRESHOLD + 1
              && self.maybe_encode_delta(&src[pending..end_direct], delta_cnt - 1, max_width);
            if !delta_flushed {
              self.encode_direct(&src[pending..end_direct], max_width);
            }
            self.add_repeat_chunk(prev, repeated_cnt);
            pending = index;
            max_val = cur;
            delta_cnt = 0;
            repeated_cnt = 1;
            flushed = true;
          }
        }
        if !flushed {
          // The equal run may still fold into a delta encoding.
          delta_cnt += repeated_cnt - 1;
          repeated_cnt = 1;
        }
        if flushed {
          prev = cur;
          continue;
        }
      }
      if cur > prev {
        delta_cnt += 1;
        max_val = max_val.max(cur);
        prev = cur;
        continue;
      }
      if delta_cnt > DELTA_THRESHOLD {
        let max_width = width32(max_val);
        if self.maybe_encode_delta(&src[pending..index], delta_cnt, max_width) {
          pending = index;
          max_val = cur;
        }
      }
      delta_cnt = 0;
      prev = cur;
    }
    if encode_everything || length - pending >= MAX_HELD_BACK {
      self.encode_direct(&src[pending..length], width32(max_val));
      pending = length;
    }
    pending
  }

  fn should_encode_delta(
    region: &[u32],
    delta_cnt: u32,
    max_width: u8,
    result: &mut DeltaResult,
  ) -> bool {
    // for 1000, 800, 270, 275, 280, 285: delta_cnt = 3, base = region[2].
    debug_assert!(delta_cnt > 0 && (delta_cnt as usize) < region.len());
    let direct_price = packed_byte_count(region.len(), max_width);
    let base_idx = region.len() - delta_cnt as usize - 1;
    if direct_price < 32 && base_idx != 0 {
      // do not bother creating fragmented parts
      return false;
    }
    if packed_byte_count(delta_cnt as usize, max_width) < 10 {
      return false;
    }
    let mut max_delta: u32 = 0;
    let mut min_delta: u32 = u32::MAX;
    let mut prev = region[base_idx];
    for &v in &region[base_idx + 1..] {
      debug_assert!(v >= prev);
      let d = v - prev;
      max_delta |= d;
      min_delta &= d;
      prev = v;
    }
    let mut delta_price;
    if max_delta == min_delta && delta_cnt >= MIN_REPEAT_CNT {
      result.is_repeated = true;
      result.rep_delta = max_delta;
      delta_price = 7;
    } else {
      result.max_delta_width = width32(max_delta);
      delta_price = packed_byte_count(delta_cnt as usize, result.max_delta_width) + 5;
      if delta_price >= direct_price {
        return false;
      }
    }
    if base_idx != 0 {
      let mut max_prebase = region[0];
      for &v in &region[1..base_idx] {
        max_prebase |= v;
      }
      result.max_prebase_width = width32(max_prebase);
      delta_price += 7 + packed_byte_count(base_idx, result.max_prebase_width);
    }
    delta_price < direct_price
  }

  fn maybe_encode_delta(&mut self, region: &[u32], delta_cnt: u32, max_width: u8) -> bool {
    let mut result = DeltaResult::default();
    if !Self::should_encode_delta(region, delta_cnt, max_width, &mut result) {
      return false;
    }
    let base_idx = region.len() - delta_cnt as usize - 1;
    self.encode_direct(&region[..base_idx], result.max_prebase_width);
    self.encode_delta(&region[base_idx..], delta_cnt, &result);
    true
  }

  fn encode_direct(&mut self, vals: &[u32], bit_width: u8) {
    if vals.is_empty() {
      return;
    }
    let prev_size = self.buffer.len();
    if vals.len() < 128 {
      let header = TYPE_DIRECT_256 | ((bit_width - 1) << HEADER_TYPE_BITS);
      let bytes_count = packed_byte_count(vals.len(), bit_width);
      self.buffer.push(header);
      self.buffer.push((vals.len() - 1) as u8);
      let at = self.buffer.len();
      self.buffer.resize(at + bytes_count + BIT_PACK_MARGIN, 0);
      let written = pack32(vals, bit_width, &mut self.buffer[at..]);
      debug_assert_eq!(written, bytes_count);
      self.buffer.truncate(at + written);
      self.direct_overhead += 2;
    } else {
      let words = self.pfor.encode(vals);
      self.buffer.push(TYPE_DIRECT_PFOR);
      fixed::append32(&mut self.buffer, (words.len() * 4) as u32);
      for w in &words {
        self.buffer.extend_from_slice(&w.to_le_bytes());
      }
      self.direct_overhead += 5;
    }
    log::trace!(
      "direct chunk: {} values, width {}, {} bytes",
      vals.len(),
      bit_width,
      self.buffer.len() - prev_size
    );
  }

  fn add_repeat_chunk(&mut self, val: u32, count: u32) {
    debug_assert!(count >= MIN_REPEAT_CNT);
    let mut written_count = count - MIN_REPEAT_CNT;
    if written_count >= EXT_REP_CNT {
      written_count -= EXT_REP_CNT;
      let bytes = (bsr32(written_count) / 8) as u8;
      debug_assert!(bytes < 3);
      self
        .buffer
        .push(TYPE_REPEATED | (((EXT_REP_CNT + bytes as u32) as u8) << HEADER_TYPE_BITS));
      store_big_endian(written_count, bytes, &mut self.buffer);
      self.repeated_overhead += bytes as u32 + 2;
    } else {
      self
        .buffer
        .push(TYPE_REPEATED | ((written_count as u8) << HEADER_TYPE_BITS));
      self.repeated_overhead += 1;
    }
    varint::append32(&mut self.buffer, val);
    log::trace!("repeat chunk: val {}, count {}", val, count);
  }

  fn encode_delta(&mut self, region: &[u32], delta_cnt: u32, result: &DeltaResult) {
    debug_assert!(delta_cnt > 0);
    let mut base = region[0];
    let bc = (bsr32(base) / 8) as u8;
    self.buffer.push(TYPE_DELTA | (bc << HEADER_TYPE_BITS));
    store_big_endian(base, bc, &mut self.buffer);
    self.delta_overhead += bc as u32 + 2;
    if result.is_repeated {
      self.add_repeat_chunk(result.rep_delta, delta_cnt);
    } else {
      self.values.clear();
      for &v in &region[1..=delta_cnt as usize] {
        debug_assert!(base <= v);
        self.values.push(v - base);
        base = v;
      }
      let deltas = std::mem::take(&mut self.values);
      self.encode_direct(&deltas, result.max_delta_width);
      self.values = deltas;
    }
    log::trace!("delta chunk: base {}, count {}", region[0], delta_cnt);
  }
}

/// Pull-based u32 stream decoder over a borrowed buffer.
pub struct UInt32Decoder<'a> {
  data: &'a [u8],
  next: usize,

  tmp_buf: [u32; 64],
  delta_base: u32,

  direct_count: u32,
  repeated_count: u32,
  buf_size: u8,
  consumed_in_buf: u8,
  bit_width: u8,

  delta_sign: i8,
  delta_cnt: i8,
  pfor_vec: Vec<u32>,
  next_pfor: usize,
  pfor: FastPFor,
}

impl<'a> UInt32Decoder<'a> {
  pub fn new(data: &'a [u8]) -> UInt32Decoder<'a> {
    UInt32Decoder {
      data,
      next: 0,
      tmp_buf: [0; 64],
      delta_base: 0,
      direct_count: 0,
      repeated_count: 0,
      buf_size: 0,
      consumed_in_buf: 0,
      bit_width: 0,
      delta_sign: 0,
      delta_cnt: 0,
      pfor_vec: Vec::new(),
      next_pfor: 0,
      pfor: FastPFor::new(),
    }
  }

  pub fn restart(&mut self) {
    self.next = 0;
    self.delta_sign = 0;
    self.delta_cnt = 0;
    self.direct_count = 0;
    self.repeated_count = 0;
    self.buf_size = 0;
    self.consumed_in_buf = 0;
    self.pfor_vec.clear();
    self.next_pfor = 0;
  }

  #[inline]
  fn unroll_delta(&mut self, b: u32) -> u32 {
    if self.delta_cnt == 1 {
      let signed = b.wrapping_mul(self.delta_sign as u32);
      let v = self.delta_base.wrapping_add(signed);
      self.delta_base = v;
      return v;
    }
    b
  }

  /// Produces the next value. Returns `Ok(false)` at end of stream.
  pub fn next(&mut self, t: &mut u32) -> LstResult<bool> {
    if self.repeated_count > 0 {
      self.repeated_count -= 1;
      *t = self.unroll_delta(self.tmp_buf[0]);
      return Ok(true);
    }
    if self.buf_size > self.consumed_in_buf {
      let v = self.tmp_buf[self.consumed_in_buf as usize];
      self.consumed_in_buf += 1;
      *t = self.unroll_delta(v);
      return Ok(true);
    }
    if self.next_pfor < self.pfor_vec.len() {
      let v = self.pfor_vec[self.next_pfor];
      self.next_pfor += 1;
      if self.next_pfor == self.pfor_vec.len() {
        self.next_pfor = 0;
        self.pfor_vec.clear();
      }
      *t = self.unroll_delta(v);
      return Ok(true);
    }
    if self.direct_count > 0 {
      self.load_direct_chunk()?;
      self.consumed_in_buf = 1;
      *t = self.unroll_delta(self.tmp_buf[0]);
      return Ok(true);
    }
    if self.next == self.data.len() {
      return Ok(false);
    }
    let header = self.data[self.next];
    self.next += 1;
    let chunk_type = header & ((1 << HEADER_TYPE_BITS) - 1);
    let field = header >> HEADER_TYPE_BITS;
    self.bit_width = 0;
    match chunk_type {
      TYPE_REPEATED => {
        self.delta_cnt >>= 1;
        if (field as u32) < EXT_REP_CNT {
          self.repeated_count = field as u32 + MIN_REPEAT_CNT - 1;
        } else {
          let bc = field as u32 - EXT_REP_CNT;
          if self.next + bc as usize >= self.data.len() {
            return Err(LstError::io("truncated repeat count"));
          }
          self.repeated_count = load_big_endian(&self.data[self.next..], bc as u8);
          self.next += bc as usize + 1;
          self.repeated_count += MIN_REPEAT_CNT + EXT_REP_CNT - 1;
        }
        let (v, used) = varint::parse32(&self.data[self.next..])?;
        self.next += used;
        self.tmp_buf[0] = v;
      }
      TYPE_DELTA => {
        debug_assert!(self.delta_cnt <= 1);
        let base_bc = field & 7;
        self.delta_sign = 1 - 2 * ((field >> 3) & 1) as i8;
        if self.next + base_bc as usize >= self.data.len() {
          return Err(LstError::io("truncated delta base"));
        }
        self.delta_base = load_big_endian(&self.data[self.next..], base_bc);
        self.next += base_bc as usize + 1;
        self.delta_cnt = 2;
        *t = self.delta_base;
        return Ok(true);
      }
      TYPE_DIRECT_256 => {
        self.delta_cnt >>= 1;
        self.bit_width = field + 1;
        if self.next >= self.data.len() {
          return Err(LstError::io("truncated direct chunk"));
        }
        self.direct_count = self.data[self.next] as u32 + 1;
        self.next += 1;
        self.load_direct_chunk()?;
        self.consumed_in_buf = 1;
      }
      TYPE_DIRECT_PFOR => {
        // keeps the delta state for exactly one chunk after its header
        self.delta_cnt >>= 1;
        if self.next + 4 > self.data.len() {
          return Err(LstError::io("truncated pfor chunk size"));
        }
        let num_bytes = fixed::decode32(&self.data[self.next..]) as usize;
        self.next += 4;
        if num_bytes % 4 != 0 || self.next + num_bytes > self.data.len() {
          return Err(LstError::io("bad pfor chunk size"));
        }
        let words: Vec<u32> = self.data[self.next..self.next + num_bytes]
          .chunks_exact(4)
          .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
          .collect();
        self.next += num_bytes;
        self.pfor_vec = self.pfor.decode(&words)?;
        if self.pfor_vec.is_empty() {
          return Err(LstError::io("empty pfor chunk"));
        }
        self.next_pfor = 1;
        let v = self.pfor_vec[0];
        *t = self.unroll_delta(v);
        return Ok(true);
      }
      _ => {
        return Err(LstError::io(format!("unknown chunk header {}", chunk_type)));
      }
    }
    *t = self.unroll_delta(self.tmp_buf[0]);
    debug_assert!(self.next <= self.data.len());
    Ok(true)
  }

  fn load_direct_chunk(&mut self) -> LstResult<()> {
    // Multiples of 64 values always end on byte boundaries, so chunked
    // unpacking stays aligned with the packed stream.
    let n = self.direct_count.min(64) as usize;
    self.buf_size = n as u8;
    self.direct_count -= n as u32;
    let need = packed_byte_count(n, self.bit_width);
    if self.next + need > self.data.len() {
      return Err(LstError::io("truncated direct payload"));
    }
    self.next += unpack32(
      &self.data[self.next..],
      n,
      self.bit_width,
      &mut self.tmp_buf[..n],
    );
    Ok(())
  }
}

/// Streaming u64 encoder: values are split into two u32 streams.
#[derive(Default)]
pub struct UInt64Encoder {
  hi: UInt32Encoder,
  lo: UInt32Encoder,
  scratch: Vec<u32>,
}

impl UInt64Encoder {
  pub fn new() -> UInt64Encoder {
    UInt64Encoder::default()
  }

  pub fn encode(&mut self, src: &[u64], encode_everything: bool) -> usize {
    self.scratch.clear();
    self.scratch.extend(src.iter().map(|&v| v as u32));
    let scratch = std::mem::take(&mut self.scratch);
    let consumed = self.lo.encode(&scratch, encode_everything);
    self.scratch = scratch;
    self.scratch.clear();
    self
      .scratch
      .extend(src[..consumed].iter().map(|&v| (v >> 32) as u32));
    let scratch = std::mem::take(&mut self.scratch);
    self.hi.encode(&scratch, true);
    self.scratch = scratch;
    consumed
  }

  pub fn byte_size(&self) -> usize {
    self.hi.byte_size() + self.lo.byte_size() + 4
  }

  pub fn serialize_to(&self, sink: &mut dyn Sink) -> LstResult<()> {
    let mut buf = [0u8; 4];
    fixed::encode32(self.lo.byte_size() as u32, &mut buf);
    sink.append(&buf)?;
    sink.append(self.lo.buffer())?;
    sink.append(self.hi.buffer())
  }
}

pub struct UInt64Decoder<'a> {
  hi: UInt32Decoder<'a>,
  lo: UInt32Decoder<'a>,
}

impl<'a> UInt64Decoder<'a> {
  pub fn new(data: &'a [u8]) -> LstResult<UInt64Decoder<'a>> {
    if data.len() < 4 {
      return Err(LstError::io("u64 stream too short"));
    }
    let lo_size = fixed::decode32(data) as usize;
    if lo_size + 4 > data.len() {
      return Err(LstError::io("u64 stream low half out of range"));
    }
    Ok(UInt64Decoder {
      lo: UInt32Decoder::new(&data[4..4 + lo_size]),
      hi: UInt32Decoder::new(&data[4 + lo_size..]),
    })
  }

  pub fn next(&mut self, t: &mut u64) -> LstResult<bool> {
    let mut lo = 0u32;
    let mut hi = 0u32;
    if !self.lo.next(&mut lo)? {
      return Ok(false);
    }
    if !self.hi.next(&mut hi)? {
      return Err(LstError::io("u64 stream high half underrun"));
    }
    *t = lo as u64 | ((hi as u64) << 32);
    Ok(true)
  }
}
