//! Record-log container: a stream of byte records framed into fixed-size
//! blocks, in the LevelDB log tradition with two extensions: an ARRAY
//! record type that packs many small records under one header, and an
//! optional key/value meta map in the file header.
//!
//! ```text
//! offset 0 : "LST1\0"
//! offset 5 : block_size_multiplier (1..100), block size = multiplier * 64KiB
//! offset 6 : extension_type (0 = none, 1 = meta map)
//! meta     : u32 LE masked crc, u32 LE length, varint count,
//!            count * (varint klen, key, varint vlen, value)
//! blocks   : records..., zero padding shorter than a record header
//! record   : u32 LE masked crc, u32 LE length, u8 type, payload
//! ```
//!
//! The record type's low 4 bits are the kind; bit 4 marks a compressed
//! payload, which is then prefixed by a compression-method byte.

mod reader;
mod writer;

pub use reader::{CorruptionReporter, ListReader};
pub use writer::ListWriter;

pub const MAGIC: &[u8; 5] = b"LST1\0";
pub const FILE_HEADER_SIZE: usize = MAGIC.len() + 2;
pub const BLOCK_SIZE_FACTOR: usize = 65536;

pub const NO_EXTENSION: u8 = 0;
pub const META_EXTENSION: u8 = 1;

// checksum (4), length (4), type (1)
pub(crate) const BLOCK_HEADER_SIZE: usize = 9;
pub(crate) const ARRAY_RECORD_MAX_HEADER_SIZE: usize =
  crate::varint::MAX_VARINT32_BYTES + BLOCK_HEADER_SIZE;

pub(crate) const RECORD_TYPE_MASK: u8 = 0x0f;
pub(crate) const COMPRESSED_MASK: u8 = 0x10;
pub(crate) const COMPRESSION_SNAPPY: u8 = 1;

// Zero is reserved for preallocated file regions.
pub(crate) const ZERO_TYPE: u8 = 0;
pub(crate) const FULL_TYPE: u8 = 1;
pub(crate) const FIRST_TYPE: u8 = 2;
pub(crate) const MIDDLE_TYPE: u8 = 3;
pub(crate) const ARRAY_TYPE: u8 = 4;
pub(crate) const LAST_TYPE: u8 = 5;

/// Writer knobs. The block size is `block_size_multiplier * 64 KiB`.
#[derive(Clone, Copy, Debug)]
pub struct Options {
  pub block_size_multiplier: u8,
  pub use_compression: bool,
}

impl Default for Options {
  fn default() -> Options {
    Options {
      block_size_multiplier: 1,
      use_compression: true,
    }
  }
}
