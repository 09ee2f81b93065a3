use std::io;
use std::io::{Read, Write};

use crate::errors::LstResult;

/// An object that consumes a sequence of bytes via monotonic appends.
pub trait Sink {
  fn append(&mut self, data: &[u8]) -> LstResult<()>;

  /// Flushes internal buffers. The default implementation does nothing.
  fn flush(&mut self) -> LstResult<()> {
    Ok(())
  }
}

/// An object that produces a sequence of bytes.
///
/// `peek` exposes the next flat region without repositioning the source; it
/// may return fewer than `min_size` bytes only at end of stream. `skip`
/// invalidates the previously peeked region.
pub trait Source {
  fn peek(&mut self, min_size: usize) -> LstResult<&[u8]>;
  fn skip(&mut self, n: usize);
}

/// Sink writing into an owned byte vector.
#[derive(Default)]
pub struct VecSink {
  contents: Vec<u8>,
}

impl VecSink {
  pub fn new() -> VecSink {
    VecSink::default()
  }

  pub fn contents(&self) -> &[u8] {
    &self.contents
  }

  pub fn into_contents(self) -> Vec<u8> {
    self.contents
  }
}

impl Sink for VecSink {
  fn append(&mut self, data: &[u8]) -> LstResult<()> {
    self.contents.extend_from_slice(data);
    Ok(())
  }
}

impl Sink for Vec<u8> {
  fn append(&mut self, data: &[u8]) -> LstResult<()> {
    self.extend_from_slice(data);
    Ok(())
  }
}

/// Source over a borrowed byte slice.
pub struct SliceSource<'a> {
  input: &'a [u8],
  // simulates paged reads in tests
  page_size: usize,
}

impl<'a> SliceSource<'a> {
  pub fn new(input: &'a [u8]) -> SliceSource<'a> {
    SliceSource {
      input,
      page_size: usize::MAX,
    }
  }

  pub fn with_page_size(input: &'a [u8], page_size: usize) -> SliceSource<'a> {
    SliceSource { input, page_size }
  }

  pub fn available(&self) -> usize {
    self.input.len()
  }
}

impl<'a> Source for SliceSource<'a> {
  fn peek(&mut self, _min_size: usize) -> LstResult<&[u8]> {
    let n = self.input.len().min(self.page_size);
    Ok(&self.input[..n])
  }

  fn skip(&mut self, n: usize) {
    self.input = &self.input[n..];
  }
}

/// Adapts any `io::Write` into a `Sink`.
pub struct IoSink<W: Write> {
  dest: W,
}

impl<W: Write> IoSink<W> {
  pub fn new(dest: W) -> IoSink<W> {
    IoSink { dest }
  }

  pub fn into_inner(self) -> W {
    self.dest
  }
}

impl<W: Write> Sink for IoSink<W> {
  fn append(&mut self, data: &[u8]) -> LstResult<()> {
    self.dest.write_all(data)?;
    Ok(())
  }

  fn flush(&mut self) -> LstResult<()> {
    self.dest.flush()?;
    Ok(())
  }
}

const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Buffered `Source` over any `io::Read`.
pub struct IoSource<R: Read> {
  src: R,
  buf: Vec<u8>,
  start: usize,
  end: usize,
  eof: bool,
}

impl<R: Read> IoSource<R> {
  pub fn new(src: R) -> IoSource<R> {
    Self::with_buffer_size(src, DEFAULT_BUFFER_SIZE)
  }

  pub fn with_buffer_size(src: R, buf_size: usize) -> IoSource<R> {
    IoSource {
      src,
      buf: vec![0; buf_size],
      start: 0,
      end: 0,
      eof: false,
    }
  }

  fn refill(&mut self, min_size: usize) -> io::Result<()> {
    if self.start > 0 {
      self.buf.copy_within(self.start..self.end, 0);
      self.end -= self.start;
      self.start = 0;
    }
    if min_size > self.buf.len() {
      self.buf.resize(min_size, 0);
    }
    while !self.eof && self.end - self.start < min_size {
      let n = self.src.read(&mut self.buf[self.end..])?;
      if n == 0 {
        self.eof = true;
      }
      self.end += n;
    }
    Ok(())
  }
}

impl<R: Read> Source for IoSource<R> {
  fn peek(&mut self, min_size: usize) -> LstResult<&[u8]> {
    if self.end - self.start < min_size.max(1) && !self.eof {
      self.refill(min_size.max(1))?;
    }
    Ok(&self.buf[self.start..self.end])
  }

  fn skip(&mut self, n: usize) {
    debug_assert!(n <= self.end - self.start);
    self.start += n;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_slice_source_paged() {
    let data: Vec<u8> = (0..100u8).collect();
    let mut src = SliceSource::with_page_size(&data, 7);
    let mut collected = Vec::new();
    loop {
      let chunk = src.peek(1).unwrap();
      if chunk.is_empty() {
        break;
      }
      assert!(chunk.len() <= 7);
      collected.extend_from_slice(chunk);
      let n = chunk.len();
      src.skip(n);
    }
    assert_eq!(collected, data);
  }

  #[test]
  fn test_io_source_round_trip() {
    let data: Vec<u8> = (0..255u8).cycle().take(200_000).collect();
    let mut src = IoSource::with_buffer_size(&data[..], 4096);
    let mut collected = Vec::new();
    loop {
      let got = src.peek(1024).unwrap();
      if got.is_empty() {
        break;
      }
      let n = got.len().min(1000);
      collected.extend_from_slice(&got[..n]);
      src.skip(n);
    }
    assert_eq!(collected, data);
  }
}
