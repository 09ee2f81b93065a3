//! Column-per-field block serializer. A batch of messages sharing one
//! schema is packed so that each leaf field's values land in their own
//! codec; the block scales with the fields actually used.
//!
//! No field number, name or wire tag is written. Decoding requires the
//! identical descriptor.

use crate::bitarray::BitArray;
use crate::errors::{LstError, LstResult};
use crate::int_coder::{UInt32Encoder, UInt64Encoder};
use crate::pb::schema::{
  zigzag32, zigzag64, DynamicMessage, FieldDescriptor, FieldKind, FieldValue, Label,
  MessageDescriptor, Value,
};
use crate::sinksource::Sink;
use crate::string_coder::StringEncoder;
use crate::varint;
use std::sync::Arc;

fn byte_size_with_length(v: usize) -> usize {
  v + varint::length32(v as u32)
}

fn serialize_blob(blob: &[u8], sink: &mut dyn Sink) -> LstResult<()> {
  let mut head = Vec::with_capacity(varint::MAX_VARINT32_BYTES);
  varint::append32(&mut head, blob.len() as u32);
  sink.append(&head)?;
  sink.append(blob)
}

fn serialize_bit_array(ba: &BitArray, sink: &mut dyn Sink) -> LstResult<()> {
  let mut head = Vec::with_capacity(2 * varint::MAX_VARINT32_BYTES);
  varint::append32(
    &mut head,
    (ba.byte_size() + varint::length32(ba.size())) as u32,
  );
  varint::append32(&mut head, ba.size());
  sink.append(&head)?;
  sink.append(&ba.to_bytes())
}

fn bit_array_serialized_size(ba: &BitArray) -> usize {
  byte_size_with_length(ba.byte_size() + varint::length32(ba.size()))
}

// One column set per schema field; message-typed fields carry the indices
// of their child writers in the pre-order arena.
struct FieldWriter {
  fd: FieldDescriptor,
  children: Vec<usize>,
  arr_sizes: Vec<u32>,
  val_u32: Vec<u32>,
  val_u64: Vec<u64>,
  sizes_buf: Vec<u8>,
  u32_buf: Vec<u8>,
  enc64: UInt64Encoder,
  has_bit: BitArray,
  val_bool: BitArray,
  str_encoder: StringEncoder,
}

impl FieldWriter {
  fn new(fd: FieldDescriptor) -> FieldWriter {
    FieldWriter {
      fd,
      children: Vec::new(),
      arr_sizes: Vec::new(),
      val_u32: Vec::new(),
      val_u64: Vec::new(),
      sizes_buf: Vec::new(),
      u32_buf: Vec::new(),
      enc64: UInt64Encoder::new(),
      has_bit: BitArray::new(),
      val_bool: BitArray::new(),
      str_encoder: StringEncoder::new(),
    }
  }
}

fn encode_u32_column(vals: &mut Vec<u32>, dest: &mut Vec<u8>) {
  if vals.is_empty() {
    return;
  }
  let mut encoder = UInt32Encoder::new();
  encoder.encode(vals, true);
  *dest = encoder.take_buffer();
  vals.clear();
  vals.shrink_to_fit();
}

/// Packs messages of one schema into a column-oriented block.
///
/// ```text
/// let mut ser = BlockSerializer::new(&descriptor);
/// for msg in batch { ser.add(&msg)?; }
/// ser.serialize_to(&mut sink)?;
/// ```
pub struct BlockSerializer {
  descriptor: Arc<MessageDescriptor>,
  writers: Vec<FieldWriter>,
  roots: Vec<usize>,
  size: u32,
  finalized: bool,
}

impl BlockSerializer {
  pub fn new(descriptor: &Arc<MessageDescriptor>) -> BlockSerializer {
    let mut writers = Vec::new();
    let roots = Self::build(descriptor, &mut writers);
    BlockSerializer {
      descriptor: descriptor.clone(),
      writers,
      roots,
      size: 0,
      finalized: false,
    }
  }

  fn build(desc: &Arc<MessageDescriptor>, writers: &mut Vec<FieldWriter>) -> Vec<usize> {
    let mut level = Vec::with_capacity(desc.fields.len());
    for fd in &desc.fields {
      let idx = writers.len();
      writers.push(FieldWriter::new(fd.clone()));
      level.push(idx);
      if let FieldKind::Message(sub) = &fd.kind {
        let children = Self::build(sub, writers);
        writers[idx].children = children;
      }
    }
    level
  }

  /// Number of messages added so far.
  pub fn num_entries(&self) -> u32 {
    self.size
  }

  pub fn add(&mut self, msg: &DynamicMessage) -> LstResult<()> {
    if self.finalized {
      return Err(LstError::invalid_argument("block already finalized"));
    }
    if !Arc::ptr_eq(msg.descriptor(), &self.descriptor) {
      return Err(LstError::invalid_argument("message schema mismatch"));
    }
    self.size += 1;
    let roots = self.roots.clone();
    self.add_fields(&roots, msg)
  }

  fn add_fields(&mut self, level: &[usize], msg: &DynamicMessage) -> LstResult<()> {
    for (pos, &w) in level.iter().enumerate() {
      self.add_field(w, msg.field(pos))?;
    }
    Ok(())
  }

  fn add_field(&mut self, w: usize, fv: &FieldValue) -> LstResult<()> {
    match self.writers[w].fd.label {
      Label::Repeated => {
        let empty = Vec::new();
        let vals = match fv {
          FieldValue::Repeated(v) => v,
          FieldValue::Unset => &empty,
          FieldValue::Single(_) => {
            return Err(LstError::invalid_argument(format!(
              "singular value in repeated field {}",
              self.writers[w].fd.name
            )));
          }
        };
        self.writers[w].arr_sizes.push(vals.len() as u32);
        for v in vals {
          self.add_single(w, v)?;
        }
      }
      Label::Optional => match fv {
        FieldValue::Unset => self.writers[w].has_bit.push(false),
        FieldValue::Single(v) => {
          self.writers[w].has_bit.push(true);
          self.add_single(w, v)?;
        }
        FieldValue::Repeated(_) => {
          return Err(LstError::invalid_argument(format!(
            "repeated value in optional field {}",
            self.writers[w].fd.name
          )));
        }
      },
      Label::Required => match fv {
        FieldValue::Single(v) => self.add_single(w, v)?,
        _ => {
          return Err(LstError::invalid_argument(format!(
            "missing required field {}",
            self.writers[w].fd.name
          )));
        }
      },
    }
    Ok(())
  }

  fn add_single(&mut self, w: usize, v: &Value) -> LstResult<()> {
    let writer = &mut self.writers[w];
    match (&writer.fd.kind, v) {
      (FieldKind::Int32, Value::I32(x)) => writer.val_u32.push(zigzag32(*x)),
      (FieldKind::Uint32, Value::U32(x)) => writer.val_u32.push(*x),
      (FieldKind::Enum, Value::Enum(x)) => writer.val_u32.push(zigzag32(*x)),
      (FieldKind::Int64, Value::I64(x)) => writer.val_u64.push(zigzag64(*x)),
      (FieldKind::Uint64, Value::U64(x)) => writer.val_u64.push(*x),
      (FieldKind::Double, Value::Double(x)) => writer.val_u64.push(x.to_bits()),
      (FieldKind::Bool, Value::Bool(x)) => writer.val_bool.push(*x),
      (FieldKind::Str, Value::Str(s)) => writer.str_encoder.add(s),
      (FieldKind::Message(_), Value::Message(m)) => {
        let children = writer.children.clone();
        self.add_fields(&children, m)?;
      }
      _ => {
        return Err(LstError::invalid_argument(format!(
          "value kind mismatch in field {}",
          self.writers[w].fd.name
        )));
      }
    }
    Ok(())
  }

  fn finalize(&mut self) {
    if self.finalized {
      return;
    }
    self.finalized = true;
    for writer in self.writers.iter_mut() {
      match writer.fd.label {
        Label::Repeated => {
          let mut sizes = std::mem::take(&mut writer.arr_sizes);
          encode_u32_column(&mut sizes, &mut writer.sizes_buf);
        }
        Label::Optional => writer.has_bit.finalize(),
        Label::Required => {}
      }
      match writer.fd.kind {
        FieldKind::Str => writer.str_encoder.finalize(),
        FieldKind::Uint32 | FieldKind::Int32 | FieldKind::Enum => {
          let mut vals = std::mem::take(&mut writer.val_u32);
          encode_u32_column(&mut vals, &mut writer.u32_buf);
        }
        FieldKind::Uint64 | FieldKind::Int64 | FieldKind::Double => {
          writer.enc64.encode(&writer.val_u64, true);
          writer.val_u64 = Vec::new();
        }
        FieldKind::Bool => writer.val_bool.finalize(),
        FieldKind::Message(_) => {}
      }
    }
  }

  fn field_byte_size(&self, w: usize) -> usize {
    let writer = &self.writers[w];
    let mut size = 0;
    match writer.fd.label {
      Label::Repeated => size += byte_size_with_length(writer.sizes_buf.len()),
      Label::Optional => size += bit_array_serialized_size(&writer.has_bit),
      Label::Required => {}
    }
    size += match writer.fd.kind {
      FieldKind::Str => writer.str_encoder.byte_size(),
      FieldKind::Uint32 | FieldKind::Int32 | FieldKind::Enum => writer.u32_buf.len(),
      FieldKind::Uint64 | FieldKind::Int64 | FieldKind::Double => writer.enc64.byte_size(),
      FieldKind::Bool => bit_array_serialized_size(&writer.val_bool),
      FieldKind::Message(_) => 0,
    };
    size
  }

  fn serialize_field(&self, w: usize, sink: &mut dyn Sink) -> LstResult<()> {
    let writer = &self.writers[w];
    log::trace!("serializing field {}", writer.fd.name);
    match writer.fd.label {
      Label::Repeated => serialize_blob(&writer.sizes_buf, sink)?,
      Label::Optional => serialize_bit_array(&writer.has_bit, sink)?,
      Label::Required => {}
    }
    match writer.fd.kind {
      FieldKind::Str => writer.str_encoder.serialize_to(sink)?,
      FieldKind::Uint32 | FieldKind::Int32 | FieldKind::Enum => sink.append(&writer.u32_buf)?,
      FieldKind::Uint64 | FieldKind::Int64 | FieldKind::Double => writer.enc64.serialize_to(sink)?,
      FieldKind::Bool => serialize_bit_array(&writer.val_bool, sink)?,
      FieldKind::Message(_) => {}
    }
    Ok(())
  }

  /// Finalizes every column and writes the block: a field-sizes stream whose
  /// first value is the message count, then each column in schema pre-order.
  pub fn serialize_to(&mut self, sink: &mut dyn Sink) -> LstResult<()> {
    self.finalize();
    let mut field_sizes = Vec::with_capacity(self.writers.len() + 1);
    field_sizes.push(self.size);
    let mut total = 0usize;
    for w in 0..self.writers.len() {
      let sz = self.field_byte_size(w);
      total += sz;
      field_sizes.push(sz as u32);
    }
    let mut encoder = UInt32Encoder::new();
    encoder.encode(&field_sizes, true);
    let fs_buf = encoder.take_buffer();
    log::debug!(
      "serializing {} messages, {} columns, {} data bytes",
      self.size,
      self.writers.len(),
      total
    );
    serialize_blob(&fs_buf, sink)?;
    for w in 0..self.writers.len() {
      self.serialize_field(w, sink)?;
    }
    Ok(())
  }
}
