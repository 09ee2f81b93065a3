use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};

use crate::sinksource::VecSink;
use crate::sstable::{
  BloomFilterPolicy, CompressionType, Options, ReadOptions, Table, TableBuilder,
};

fn build_table(options: Options, entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
  let mut builder = TableBuilder::new(options, VecSink::new());
  for (k, v) in entries {
    builder.add(k, v).unwrap();
  }
  builder.finish().unwrap();
  assert_eq!(builder.sink().contents().len() as u64, builder.file_size());
  builder.sink().contents().to_vec()
}

fn open_table(read_options: ReadOptions, data: Vec<u8>) -> Table<Vec<u8>> {
  Table::open(read_options, data).unwrap()
}

fn between(val: u64, low: u64, high: u64) -> bool {
  val >= low && val <= high
}

#[test]
fn test_approximate_offsets_plain() {
  let mut entries = BTreeMap::new();
  entries.insert(b"k01".to_vec(), b"hello".to_vec());
  entries.insert(b"k02".to_vec(), b"hello2".to_vec());
  entries.insert(b"k03".to_vec(), vec![b'x'; 10000]);
  entries.insert(b"k04".to_vec(), vec![b'x'; 200000]);
  entries.insert(b"k05".to_vec(), vec![b'x'; 300000]);
  entries.insert(b"k06".to_vec(), b"hello3".to_vec());
  entries.insert(b"k07".to_vec(), vec![b'x'; 100000]);
  let options = Options {
    block_size: 1024,
    compression: CompressionType::None,
    ..Default::default()
  };
  let data = build_table(options, &entries);
  let table = open_table(ReadOptions::default(), data);

  assert!(between(table.approximate_offset_of(b"abc"), 0, 0));
  assert!(between(table.approximate_offset_of(b"k01"), 0, 0));
  assert!(between(table.approximate_offset_of(b"k01a"), 0, 0));
  assert!(between(table.approximate_offset_of(b"k02"), 0, 0));
  assert!(between(table.approximate_offset_of(b"k03"), 0, 0));
  assert!(between(table.approximate_offset_of(b"k04"), 10000, 11000));
  assert!(between(table.approximate_offset_of(b"k04a"), 210000, 211000));
  assert!(between(table.approximate_offset_of(b"k05"), 210000, 211000));
  assert!(between(table.approximate_offset_of(b"k06"), 510000, 511000));
  assert!(between(table.approximate_offset_of(b"k07"), 510000, 511000));
  assert!(between(table.approximate_offset_of(b"xyz"), 610000, 612000));
}

#[test]
fn test_approximate_offsets_nondecreasing() {
  let mut entries = BTreeMap::new();
  for i in 0..500u32 {
    entries.insert(
      format!("key{:05}", i).into_bytes(),
      vec![b'v'; (i % 700) as usize],
    );
  }
  let options = Options {
    block_size: 1024,
    compression: CompressionType::None,
    ..Default::default()
  };
  let data = build_table(options, &entries);
  let table = open_table(ReadOptions::default(), data);
  let mut prev = 0;
  for k in entries.keys() {
    let off = table.approximate_offset_of(k);
    assert!(off >= prev, "offset went backwards at {:?}", k);
    prev = off;
  }
}

fn scan_checks(table: &Table<Vec<u8>>, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
  // Forward scan visits every key exactly once, in ascending order.
  let mut it = table.iter();
  assert!(!it.valid());
  it.seek_to_first();
  for (k, v) in model {
    assert!(it.valid(), "iterator ended early at {:?}", k);
    assert_eq!(it.key(), k.as_slice());
    assert_eq!(it.value(), v.as_slice());
    it.next();
  }
  assert!(!it.valid());
  it.status().unwrap();

  // Backward scan.
  let mut it = table.iter();
  it.seek_to_last();
  for (k, v) in model.iter().rev() {
    assert!(it.valid());
    assert_eq!(it.key(), k.as_slice());
    assert_eq!(it.value(), v.as_slice());
    it.prev();
  }
  assert!(!it.valid());
}

fn seek_checks(table: &Table<Vec<u8>>, model: &BTreeMap<Vec<u8>, Vec<u8>>, rng: &mut impl Rng) {
  let keys: Vec<&Vec<u8>> = model.keys().collect();
  let mut it = table.iter();
  for _ in 0..200 {
    let probe: Vec<u8> = if keys.is_empty() || rng.gen_bool(0.3) {
      format!("probe{:05}", rng.gen_range(0..100000)).into_bytes()
    } else {
      let mut k = keys[rng.gen_range(0..keys.len())].clone();
      match rng.gen_range(0..3) {
        0 => {}
        1 => {
          k.push(0);
        }
        _ => {
          k.pop();
        }
      }
      k
    };
    it.seek(&probe);
    match model.range(probe.clone()..).next() {
      Some((k, v)) => {
        assert!(it.valid(), "no entry for probe {:?}", probe);
        assert_eq!(it.key(), k.as_slice());
        assert_eq!(it.value(), v.as_slice());
      }
      None => assert!(!it.valid()),
    }
  }
}

#[test]
fn test_table_harness() {
  let mut rng = rand::rngs::StdRng::seed_from_u64(301);
  for &restart_interval in &[1usize, 16, 1024] {
    for &compression in &[CompressionType::None, CompressionType::Snappy] {
      let mut model = BTreeMap::new();
      for i in 0..800u32 {
        let key = format!("{:03}k{:05}", i % 7, i * 13).into_bytes();
        let len = rng.gen_range(0..120);
        let value: Vec<u8> = (0..len).map(|_| rng.gen_range(b' '..b'~')).collect();
        model.insert(key, value);
      }
      let options = Options {
        block_restart_interval: restart_interval,
        // small blocks exercise boundary conditions harder
        block_size: 256,
        compression,
        ..Default::default()
      };
      let data = build_table(options, &model);
      let table = open_table(ReadOptions::default(), data);
      scan_checks(&table, &model);
      seek_checks(&table, &model, &mut rng);
    }
  }
}

#[test]
fn test_empty_table() {
  let data = build_table(Options::default(), &BTreeMap::new());
  let table = open_table(ReadOptions::default(), data);
  let mut it = table.iter();
  it.seek_to_first();
  assert!(!it.valid());
  it.seek(b"whatever");
  assert!(!it.valid());
}

#[test]
fn test_meta_map() {
  let mut entries = BTreeMap::new();
  entries.insert(b"a".to_vec(), b"1".to_vec());
  let mut builder = TableBuilder::new(Options::default(), VecSink::new());
  builder.add_meta("schema", "my.proto.Type");
  builder.add_meta("writer", "unit-test");
  for (k, v) in &entries {
    builder.add(k, v).unwrap();
  }
  builder.finish().unwrap();
  let table = open_table(ReadOptions::default(), builder.sink().contents().to_vec());
  assert_eq!(table.meta().len(), 2);
  assert_eq!(
    table.meta().get(b"schema".as_ref()).map(|v| v.as_slice()),
    Some(b"my.proto.Type".as_ref())
  );
}

#[test]
fn test_bloom_filter_table() {
  let policy: Arc<dyn crate::sstable::FilterPolicy> = Arc::new(BloomFilterPolicy::new(10));
  let mut entries = BTreeMap::new();
  for i in 0..2000u32 {
    entries.insert(format!("key{:06}", i * 2).into_bytes(), i.to_le_bytes().to_vec());
  }
  let options = Options {
    filter_policy: Some(policy.clone()),
    block_size: 512,
    ..Default::default()
  };
  let data = build_table(options, &entries);
  let read_options = ReadOptions {
    filter_policy: Some(policy),
    verify_checksums: true,
  };
  let table = open_table(read_options, data);
  for (k, v) in &entries {
    assert_eq!(table.get(k).unwrap().as_deref(), Some(v.as_slice()));
  }
  for i in 0..2000u32 {
    let missing = format!("key{:06}", i * 2 + 1).into_bytes();
    assert_eq!(table.get(&missing).unwrap(), None);
  }
}

#[test]
fn test_open_rejects_zero_restart_index_block() {
  use crate::crc32c;
  use crate::fixed;
  use crate::sstable::{BlockHandle, Footer};

  // Four zero bytes decode to an index block with an empty restart array.
  // The CRC check cannot help: a crafted file carries a matching trailer.
  // Open must fail with an Io error, not panic.
  let mut file = Vec::new();
  let contents = [0u8; 4];
  file.extend_from_slice(&contents);
  let mut trailer = [0u8; 5];
  trailer[0] = CompressionType::None as u8;
  let crc = crc32c::extend(crc32c::value(&contents), &trailer[..1]);
  fixed::encode32(crc32c::mask(crc), &mut trailer[1..]);
  file.extend_from_slice(&trailer);
  let handle = BlockHandle::new(0, contents.len() as u64);
  let footer = Footer {
    metaindex_handle: handle,
    index_handle: handle,
  };
  let mut footer_enc = Vec::new();
  footer.encode_to(&mut footer_enc);
  file.extend_from_slice(&footer_enc);

  let err = Table::open(
    ReadOptions {
      verify_checksums: true,
      ..Default::default()
    },
    file,
  )
  .expect_err("zero-restart index block must be rejected");
  assert_eq!(err.kind, crate::errors::ErrorKind::Io);
}

#[test]
fn test_checksum_verification_catches_corruption() {
  let mut entries = BTreeMap::new();
  for i in 0..100u32 {
    entries.insert(format!("k{:04}", i).into_bytes(), vec![b'v'; 50]);
  }
  let options = Options {
    compression: CompressionType::None,
    block_size: 256,
    ..Default::default()
  };
  let mut data = build_table(options, &entries);
  data[10] ^= 0x40; // inside the first data block
  let table = Table::open(
    ReadOptions {
      verify_checksums: true,
      ..Default::default()
    },
    data,
  )
  .unwrap();
  let mut it = table.iter();
  it.seek_to_first();
  // Either the iterator refuses to produce entries from the bad block or it
  // stops with an error; it must not return corrupt data silently.
  let mut count = 0;
  while it.valid() {
    count += 1;
    it.next();
  }
  assert!(it.status().is_err() || count < entries.len());
}
