//! Field-oriented message block serialization.

pub mod reader;
pub mod schema;
pub mod writer;

pub use reader::BlockDeserializer;
pub use schema::{
  DynamicMessage, FieldDescriptor, FieldKind, FieldValue, Label, MessageDescriptor, Value,
};
pub use writer::BlockSerializer;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sinksource::VecSink;
  use std::sync::Arc;

  fn phone_descriptor() -> Arc<MessageDescriptor> {
    MessageDescriptor::new(
      "PhoneNumber",
      vec![
        FieldDescriptor::new(1, "number", Label::Required, FieldKind::Str),
        FieldDescriptor::new(2, "type", Label::Optional, FieldKind::Enum),
      ],
    )
  }

  fn person_descriptor() -> Arc<MessageDescriptor> {
    MessageDescriptor::new(
      "Person",
      vec![
        FieldDescriptor::new(1, "name", Label::Optional, FieldKind::Str),
        FieldDescriptor::new(2, "id", Label::Required, FieldKind::Int64),
        FieldDescriptor::new(3, "email", Label::Optional, FieldKind::Str),
        FieldDescriptor::new(4, "phone", Label::Repeated, FieldKind::Message(phone_descriptor())),
        FieldDescriptor::new(5, "verified", Label::Optional, FieldKind::Bool),
        FieldDescriptor::new(6, "weight", Label::Optional, FieldKind::Double),
      ],
    )
  }

  fn address_book_descriptor() -> Arc<MessageDescriptor> {
    MessageDescriptor::new(
      "AddressBook",
      vec![
        FieldDescriptor::new(1, "person", Label::Repeated, FieldKind::Message(person_descriptor())),
        FieldDescriptor::new(2, "tmp", Label::Repeated, FieldKind::Uint64),
        FieldDescriptor::new(3, "ts", Label::Repeated, FieldKind::Int64),
      ],
    )
  }

  fn round_trip(desc: &Arc<MessageDescriptor>, msgs: &[DynamicMessage]) -> usize {
    let mut ser = BlockSerializer::new(desc);
    for m in msgs {
      ser.add(m).unwrap();
    }
    let mut sink = VecSink::new();
    ser.serialize_to(&mut sink).unwrap();
    let block = sink.into_contents();
    let mut de = BlockDeserializer::new(desc, &block).unwrap();
    assert_eq!(de.num_messages() as usize, msgs.len());
    for (i, expected) in msgs.iter().enumerate() {
      let actual = de.read().unwrap();
      assert_eq!(&actual, expected, "message {} mismatch", i);
    }
    block.len()
  }

  #[test]
  fn test_address_book_batch() {
    let desc = address_book_descriptor();
    let person_desc = person_descriptor();
    let phone_desc = phone_descriptor();
    let base_id: i64 = 1_234_567_891_234;

    let mut msgs = Vec::new();
    for j in 0..500i64 {
      let mut person = DynamicMessage::new(person_desc.clone());
      person.set(1, Value::Str(b"Jessika Kapara".to_vec()));
      person.set(2, Value::I64(base_id + j));
      person.set(3, Value::Str(b"jessika@alba.com".to_vec()));
      for p in 0..20 {
        let mut phone = DynamicMessage::new(phone_desc.clone());
        phone.set(1, Value::Str(p.to_string().into_bytes()));
        person.push(4, Value::Message(phone));
      }
      let mut book = DynamicMessage::new(desc.clone());
      book.push(1, Value::Message(person));
      for i in 0..20u64 {
        book.push(2, Value::U64(((u32::MAX as u64) << 16) + i * 1024 * 1024));
      }
      for i in 0..20i64 {
        book.push(3, Value::I64(((i32::MAX as i64) << 24) + i * 8192));
      }
      msgs.push(book);
    }
    let size = round_trip(&desc, &msgs);
    // 500 near-identical messages compress to a small fraction of their
    // standalone serialized size.
    assert!(size < 100_000, "block size {}", size);
  }

  #[test]
  fn test_empty_block() {
    let desc = address_book_descriptor();
    let size = round_trip(&desc, &[]);
    // A few bytes per column, nothing per message.
    assert!(size < 150, "empty block took {} bytes", size);
  }

  #[test]
  fn test_unused_repeated_field_is_cheap() {
    let desc = MessageDescriptor::new(
      "BankAccount",
      vec![FieldDescriptor::new(1, "activity_id", Label::Repeated, FieldKind::Uint32)],
    );
    let mut ser = BlockSerializer::new(&desc);
    let mut sink = VecSink::new();
    ser.serialize_to(&mut sink).unwrap();
    assert!(sink.contents().len() < 20, "{} bytes", sink.contents().len());
  }

  #[test]
  fn test_optional_fields_absent() {
    let desc = person_descriptor();
    let mut msgs = Vec::new();
    for i in 0..50i64 {
      let mut p = DynamicMessage::new(desc.clone());
      p.set(2, Value::I64(i * 7));
      if i % 3 == 0 {
        p.set(1, Value::Str(format!("name-{}", i).into_bytes()));
      }
      if i % 4 == 0 {
        p.set(5, Value::Bool(i % 8 == 0));
      }
      if i % 5 == 0 {
        p.set(6, Value::Double(i as f64 * 0.25));
      }
      msgs.push(p);
    }
    round_trip(&desc, &msgs);
  }

  #[test]
  fn test_all_scalar_kinds() {
    let desc = MessageDescriptor::new(
      "Scalars",
      vec![
        FieldDescriptor::new(1, "a", Label::Required, FieldKind::Int32),
        FieldDescriptor::new(2, "b", Label::Required, FieldKind::Uint32),
        FieldDescriptor::new(3, "c", Label::Required, FieldKind::Int64),
        FieldDescriptor::new(4, "d", Label::Required, FieldKind::Uint64),
        FieldDescriptor::new(5, "e", Label::Required, FieldKind::Double),
        FieldDescriptor::new(6, "f", Label::Required, FieldKind::Bool),
        FieldDescriptor::new(7, "g", Label::Required, FieldKind::Str),
        FieldDescriptor::new(8, "h", Label::Required, FieldKind::Enum),
      ],
    );
    let mut msgs = Vec::new();
    for i in 0..100i64 {
      let mut m = DynamicMessage::new(desc.clone());
      m.set(1, Value::I32(-(i as i32) * 3));
      m.set(2, Value::U32(i as u32 * 17));
      m.set(3, Value::I64(i * -1_000_000_007));
      m.set(4, Value::U64((i as u64) << 40));
      m.set(5, Value::Double(i as f64 / 3.0));
      m.set(6, Value::Bool(i % 2 == 0));
      m.set(7, Value::Str(format!("value {}", i).into_bytes()));
      m.set(8, Value::Enum((i % 5) as i32 - 2));
      msgs.push(m);
    }
    round_trip(&desc, &msgs);
  }

  #[test]
  fn test_schema_mismatch_detected() {
    let desc = person_descriptor();
    let mut msgs = Vec::new();
    for i in 0..10i64 {
      let mut p = DynamicMessage::new(desc.clone());
      p.set(2, Value::I64(i));
      msgs.push(p);
    }
    let mut ser = BlockSerializer::new(&desc);
    for m in &msgs {
      ser.add(m).unwrap();
    }
    let mut sink = VecSink::new();
    ser.serialize_to(&mut sink).unwrap();
    let block = sink.into_contents();

    // Decoding with a different schema must fail, not mis-decode silently
    // into valid-looking messages of the wrong shape.
    let other = MessageDescriptor::new(
      "Other",
      vec![
        FieldDescriptor::new(1, "x", Label::Required, FieldKind::Str),
        FieldDescriptor::new(2, "y", Label::Required, FieldKind::Str),
      ],
    );
    let res = BlockDeserializer::new(&other, &block);
    let failed = match res {
      Err(_) => true,
      Ok(mut de) => {
        let mut bad = false;
        for _ in 0..10 {
          if de.read().is_err() {
            bad = true;
            break;
          }
        }
        bad
      }
    };
    assert!(failed, "mismatched schema was not detected");
  }
}
