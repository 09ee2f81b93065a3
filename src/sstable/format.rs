use crate::crc32c;
use crate::errors::{LstError, LstResult};
use crate::fixed;
use crate::sstable::{CompressionType, RandomAccessFile, ReadOptions};
use crate::varint;

// Picked by running `echo 'Roman&Jessie' | sha1sum` and taking the leading
// 64 bits.
pub(crate) const TABLE_MAGIC_NUMBER: u64 = 0xf968d1dde8e3d8d6;

// 1-byte type + 32-bit crc
pub(crate) const BLOCK_TRAILER_SIZE: usize = 5;

/// Pointer to the extent of a file that stores a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
  offset: u64,
  size: u64,
}

impl BlockHandle {
  /// Maximum encoded length: two varint64s.
  pub const MAX_ENCODED_LENGTH: usize = 2 * varint::MAX_VARINT64_BYTES;

  pub fn new(offset: u64, size: u64) -> BlockHandle {
    BlockHandle { offset, size }
  }

  pub fn offset(&self) -> u64 {
    self.offset
  }

  pub fn size(&self) -> u64 {
    self.size
  }

  pub fn encode_to(&self, dst: &mut Vec<u8>) {
    varint::append64(dst, self.offset);
    varint::append64(dst, self.size);
  }

  /// Parses a handle from the front of `input`, returning it with the
  /// number of bytes consumed.
  pub fn decode_from(input: &[u8]) -> LstResult<(BlockHandle, usize)> {
    let bad = |_| LstError::io("bad block handle");
    let (offset, n1) = varint::parse64(input).map_err(bad)?;
    let (size, n2) = varint::parse64(&input[n1..]).map_err(bad)?;
    Ok((BlockHandle { offset, size }, n1 + n2))
  }
}

impl Default for BlockHandle {
  fn default() -> BlockHandle {
    BlockHandle {
      offset: !0,
      size: !0,
    }
  }
}

/// Fixed-length tail of every table file: the meta-index and index handles
/// padded to their maximum length, then the magic number.
#[derive(Clone, Copy, Debug, Default)]
pub struct Footer {
  pub metaindex_handle: BlockHandle,
  pub index_handle: BlockHandle,
}

impl Footer {
  pub const ENCODED_LENGTH: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;

  pub fn encode_to(&self, dst: &mut Vec<u8>) {
    let original_size = dst.len();
    self.metaindex_handle.encode_to(dst);
    self.index_handle.encode_to(dst);
    dst.resize(original_size + 2 * BlockHandle::MAX_ENCODED_LENGTH, 0);
    fixed::append64(dst, TABLE_MAGIC_NUMBER);
    debug_assert_eq!(dst.len(), original_size + Self::ENCODED_LENGTH);
  }

  pub fn decode_from(input: &[u8]) -> LstResult<Footer> {
    debug_assert_eq!(input.len(), Self::ENCODED_LENGTH);
    let magic = fixed::decode64(&input[input.len() - 8..]);
    if magic != TABLE_MAGIC_NUMBER {
      return Err(LstError::io("not an sstable (bad magic number)"));
    }
    let (metaindex_handle, used) = BlockHandle::decode_from(input)?;
    let (index_handle, _) = BlockHandle::decode_from(&input[used..])?;
    Ok(Footer {
      metaindex_handle,
      index_handle,
    })
  }
}

/// Reads and verifies the block at `handle`, undoing block compression.
pub fn read_block<F: RandomAccessFile>(
  file: &F,
  options: &ReadOptions,
  handle: &BlockHandle,
) -> LstResult<Vec<u8>> {
  let n = handle.size() as usize;
  let mut buf = vec![0u8; n + BLOCK_TRAILER_SIZE];
  let got = file.read_at(handle.offset(), &mut buf)?;
  if got != buf.len() {
    return Err(LstError::io("truncated block read"));
  }
  if options.verify_checksums {
    let expected = crc32c::unmask(fixed::decode32(&buf[n + 1..]));
    let actual = crc32c::value(&buf[..n + 1]);
    if actual != expected {
      return Err(LstError::io("block checksum mismatch"));
    }
  }
  let compression = buf[n];
  buf.truncate(n);
  match compression {
    t if t == CompressionType::None as u8 => Ok(buf),
    t if t == CompressionType::Snappy as u8 => snap::raw::Decoder::new()
      .decompress_vec(&buf)
      .map_err(|_| LstError::io("corrupted compressed block contents")),
    _ => Err(LstError::io("bad block type")),
  }
}
