use crc::crc32;
use crc::crc32::Hasher32;

const MASK_DELTA: u32 = 0xa282ead8;

/// CRC32C (Castagnoli) of `data`.
pub fn value(data: &[u8]) -> u32 {
  crc32::checksum_castagnoli(data)
}

/// Extends `init` (a crc returned by `value` or `extend`) with `data`.
pub fn extend(init: u32, data: &[u8]) -> u32 {
  let mut digest = crc32::Digest::new_with_initial(crc32::CASTAGNOLI, init);
  digest.write(data);
  digest.sum32()
}

/// Stored checksums are masked so that computing the crc of a string that
/// itself contains embedded crcs stays well-behaved.
#[inline(always)]
pub fn mask(c: u32) -> u32 {
  ((c >> 15) | (c << 17)).wrapping_add(MASK_DELTA)
}

#[inline(always)]
pub fn unmask(c: u32) -> u32 {
  let rot = c.wrapping_sub(MASK_DELTA);
  (rot >> 17) | (rot << 15)
}
