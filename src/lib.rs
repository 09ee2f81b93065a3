//! Columnar integer/string codecs and immutable storage containers.
//!
//! The crate stacks three layers:
//!
//! 1. A cuckoo-hashed associative array with dense-id addressing
//!    ([`CuckooMap`]).
//! 2. Columnar codecs: chunked u32/u64 integer streams, a PLWAH bitmap,
//!    a string column, and a field-oriented message block serializer that
//!    rides on top of them ([`int_coder`], [`BitArray`], [`string_coder`],
//!    [`pb`]).
//! 3. Two on-disk immutable containers: a record log with snappy-compressed
//!    blocks ([`list_file`]) and a sorted-key table with index, meta-index
//!    and bloom-filter blocks ([`sstable`]).

pub use bitarray::BitArray;
pub use cuckoo::{CuckooMap, CuckooSet, DenseId, NPOS};
pub use errors::{ErrorKind, LstError, LstResult};
pub use int_coder::{UInt32Decoder, UInt32Encoder, UInt64Decoder, UInt64Encoder};
pub use sinksource::{Sink, SliceSource, Source, VecSink};
pub use string_coder::{StringDecoder, StringEncoder};

pub mod errors;
pub mod list_file;
pub mod pb;
pub mod sstable;

pub mod bit_pack;
pub mod bitarray;
pub mod bits;
pub mod crc32c;
pub mod cuckoo;
pub mod fastpfor;
pub mod fixed;
pub mod int_coder;
pub mod sinksource;
pub mod string_coder;
pub mod varint;

#[cfg(test)]
mod tests;
