//! Mirror of the block serializer: reads the field-sizes header, hands each
//! column its byte range and reassembles messages by walking the schema in
//! the same pre-order. A schema mismatch is detectable only as a column
//! running out early or finishing late.

use crate::bitarray::{BitArray, IntoIter as BitIter};
use crate::errors::{LstError, LstResult};
use crate::int_coder::{UInt32Decoder, UInt64Decoder};
use crate::pb::schema::{
  unzigzag32, unzigzag64, DynamicMessage, FieldDescriptor, FieldKind, FieldValue, Label,
  MessageDescriptor, Value,
};
use crate::string_coder::StringDecoder;
use crate::varint;
use std::sync::Arc;

fn underrun(tag: &str, field: &str) -> LstError {
  LstError::internal(format!("column underrun ({}) at field {}", tag, field))
}

struct FieldReader<'a> {
  fd: FieldDescriptor,
  children: Vec<usize>,
  arr_sizes: Option<UInt32Decoder<'a>>,
  has_iter: Option<BitIter>,
  dec_u32: Option<UInt32Decoder<'a>>,
  dec_u64: Option<UInt64Decoder<'a>>,
  dec_str: Option<StringDecoder<'a>>,
  bool_iter: Option<BitIter>,
}

impl<'a> FieldReader<'a> {
  fn new(fd: FieldDescriptor) -> FieldReader<'a> {
    FieldReader {
      fd,
      children: Vec::new(),
      arr_sizes: None,
      has_iter: None,
      dec_u32: None,
      dec_u64: None,
      dec_str: None,
      bool_iter: None,
    }
  }

  // Parses the array-size / has-bit preamble, returning the remainder.
  fn init_meta(&mut self, region: &'a [u8]) -> LstResult<&'a [u8]> {
    let (data_sz, used) = varint::parse32(region).map_err(|_| underrun("meta size", &self.fd.name))?;
    let data_sz = data_sz as usize;
    if used + data_sz > region.len() {
      return Err(underrun("meta range", &self.fd.name));
    }
    let meta = &region[used..used + data_sz];
    if self.fd.label == Label::Repeated {
      self.arr_sizes = Some(UInt32Decoder::new(meta));
    } else {
      let (bit_count, bused) =
        varint::parse32(meta).map_err(|_| underrun("bit count", &self.fd.name))?;
      let bits = BitArray::from_parts(bit_count, &meta[bused..])?;
      self.has_iter = Some(bits.into_iter());
    }
    Ok(&region[used + data_sz..])
  }

  fn init(&mut self, region: &'a [u8]) -> LstResult<()> {
    log::trace!("init field {} with {} bytes", self.fd.name, region.len());
    let mut rest = region;
    if self.fd.label != Label::Required {
      rest = self.init_meta(rest)?;
    }
    match self.fd.kind {
      FieldKind::Message(_) => {
        if !rest.is_empty() {
          return Err(LstError::internal(format!(
            "trailing bytes in message field {}",
            self.fd.name
          )));
        }
      }
      FieldKind::Str => self.dec_str = Some(StringDecoder::new(rest)?),
      FieldKind::Uint32 | FieldKind::Int32 | FieldKind::Enum => {
        self.dec_u32 = Some(UInt32Decoder::new(rest));
      }
      FieldKind::Uint64 | FieldKind::Int64 | FieldKind::Double => {
        self.dec_u64 = Some(UInt64Decoder::new(rest)?);
      }
      FieldKind::Bool => {
        let (total, used) = varint::parse32(rest).map_err(|_| underrun("bool size", &self.fd.name))?;
        let total = total as usize;
        if used + total > rest.len() {
          return Err(underrun("bool range", &self.fd.name));
        }
        let sub = &rest[used..used + total];
        let (size, bused) = varint::parse32(sub).map_err(|_| underrun("bool count", &self.fd.name))?;
        let bits = BitArray::from_parts(size, &sub[bused..])?;
        self.bool_iter = Some(bits.into_iter());
      }
    }
    Ok(())
  }
}

/// Reassembles messages from a block, one per `read` call, in the order
/// they were added.
pub struct BlockDeserializer<'a> {
  descriptor: Arc<MessageDescriptor>,
  readers: Vec<FieldReader<'a>>,
  roots: Vec<usize>,
  num_messages: u32,
}

impl<'a> BlockDeserializer<'a> {
  pub fn new(descriptor: &Arc<MessageDescriptor>, block: &'a [u8]) -> LstResult<BlockDeserializer<'a>> {
    let mut readers = Vec::new();
    let roots = Self::build(descriptor, &mut readers);

    let (fs_len, used) = varint::parse32(block).map_err(|_| LstError::internal("bad block size"))?;
    let fs_len = fs_len as usize;
    if used + fs_len > block.len() {
      return Err(LstError::internal("field sizes out of range"));
    }
    let mut sizes = UInt32Decoder::new(&block[used..used + fs_len]);
    let mut num_messages = 0u32;
    if !sizes.next(&mut num_messages)? {
      return Err(LstError::internal("missing message count"));
    }
    let mut next = used + fs_len;
    for r in 0..readers.len() {
      let mut size = 0u32;
      if !sizes.next(&mut size)? {
        return Err(LstError::internal("missing field size"));
      }
      let size = size as usize;
      if next + size > block.len() {
        return Err(LstError::internal(format!(
          "field {} out of block range",
          readers[r].fd.name
        )));
      }
      readers[r].init(&block[next..next + size])?;
      next += size;
    }
    Ok(BlockDeserializer {
      descriptor: descriptor.clone(),
      readers,
      roots,
      num_messages,
    })
  }

  fn build(desc: &Arc<MessageDescriptor>, readers: &mut Vec<FieldReader<'a>>) -> Vec<usize> {
    let mut level = Vec::with_capacity(desc.fields.len());
    for fd in &desc.fields {
      let idx = readers.len();
      readers.push(FieldReader::new(fd.clone()));
      level.push(idx);
      if let FieldKind::Message(sub) = &fd.kind {
        let children = Self::build(sub, readers);
        readers[idx].children = children;
      }
    }
    level
  }

  pub fn num_messages(&self) -> u32 {
    self.num_messages
  }

  pub fn read(&mut self) -> LstResult<DynamicMessage> {
    let mut msg = DynamicMessage::new(self.descriptor.clone());
    let roots = self.roots.clone();
    self.read_fields(&roots, &mut msg)?;
    Ok(msg)
  }

  fn read_fields(&mut self, level: &[usize], msg: &mut DynamicMessage) -> LstResult<()> {
    for (pos, &r) in level.iter().enumerate() {
      let fv = self.read_field(r)?;
      *msg.field_mut(pos) = fv;
    }
    Ok(())
  }

  fn read_field(&mut self, r: usize) -> LstResult<FieldValue> {
    match self.readers[r].fd.label {
      Label::Repeated => {
        let mut count = 0u32;
        let ok = self.readers[r]
          .arr_sizes
          .as_mut()
          .map(|d| d.next(&mut count))
          .transpose()?
          .unwrap_or(false);
        if !ok {
          return Err(underrun("array sizes", &self.readers[r].fd.name));
        }
        let mut vals = Vec::with_capacity(count as usize);
        for _ in 0..count {
          vals.push(self.read_single(r)?);
        }
        Ok(FieldValue::Repeated(vals))
      }
      Label::Optional => {
        let has = self.readers[r]
          .has_iter
          .as_mut()
          .and_then(|it| it.next());
        match has {
          None => Err(underrun("has bits", &self.readers[r].fd.name)),
          Some(false) => Ok(FieldValue::Unset),
          Some(true) => Ok(FieldValue::Single(self.read_single(r)?)),
        }
      }
      Label::Required => Ok(FieldValue::Single(self.read_single(r)?)),
    }
  }

  fn read_single(&mut self, r: usize) -> LstResult<Value> {
    let kind = self.readers[r].fd.kind.clone();
    match kind {
      FieldKind::Int32 => Ok(Value::I32(unzigzag32(self.next_u32(r)?))),
      FieldKind::Uint32 => Ok(Value::U32(self.next_u32(r)?)),
      FieldKind::Enum => Ok(Value::Enum(unzigzag32(self.next_u32(r)?))),
      FieldKind::Int64 => Ok(Value::I64(unzigzag64(self.next_u64(r)?))),
      FieldKind::Uint64 => Ok(Value::U64(self.next_u64(r)?)),
      FieldKind::Double => Ok(Value::Double(f64::from_bits(self.next_u64(r)?))),
      FieldKind::Bool => {
        let reader = &mut self.readers[r];
        match reader.bool_iter.as_mut().and_then(|it| it.next()) {
          Some(b) => Ok(Value::Bool(b)),
          None => Err(underrun("bool column", &reader.fd.name)),
        }
      }
      FieldKind::Str => {
        let reader = &mut self.readers[r];
        let name = reader.fd.name.clone();
        match reader.dec_str.as_mut() {
          Some(dec) => match dec.next()? {
            Some(s) => Ok(Value::Str(s.to_vec())),
            None => Err(underrun("string column", &name)),
          },
          None => Err(underrun("string column", &name)),
        }
      }
      FieldKind::Message(sub) => {
        let children = self.readers[r].children.clone();
        let mut m = DynamicMessage::new(sub);
        self.read_fields(&children, &mut m)?;
        Ok(Value::Message(m))
      }
    }
  }

  fn next_u32(&mut self, r: usize) -> LstResult<u32> {
    let reader = &mut self.readers[r];
    let mut v = 0u32;
    let ok = reader
      .dec_u32
      .as_mut()
      .map(|d| d.next(&mut v))
      .transpose()?
      .unwrap_or(false);
    if !ok {
      return Err(underrun("u32 column", &reader.fd.name));
    }
    Ok(v)
  }

  fn next_u64(&mut self, r: usize) -> LstResult<u64> {
    let reader = &mut self.readers[r];
    let mut v = 0u64;
    let ok = reader
      .dec_u64
      .as_mut()
      .map(|d| d.next(&mut v))
      .transpose()?
      .unwrap_or(false);
    if !ok {
      return Err(underrun("u64 column", &reader.fd.name));
    }
    Ok(v)
  }
}
