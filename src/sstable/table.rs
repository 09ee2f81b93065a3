use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{LstError, LstResult};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::filter_block::FilterBlockReader;
use crate::sstable::format::{read_block, BlockHandle, Footer};
use crate::sstable::{RandomAccessFile, ReadOptions, FILTER_NAME_PREFIX, META_BLOCK_KEY};
use crate::varint;

fn parse_meta_map(input: &[u8]) -> LstResult<BTreeMap<Vec<u8>, Vec<u8>>> {
  let bad = || LstError::io("bad meta map");
  let mut meta = BTreeMap::new();
  let (count, mut pos) = varint::parse32(input).map_err(|_| bad())?;
  for _ in 0..count {
    let (ksz, used) = varint::parse32(&input[pos..]).map_err(|_| bad())?;
    pos += used;
    let (vsz, used) = varint::parse32(&input[pos..]).map_err(|_| bad())?;
    pos += used;
    let key = input.get(pos..pos + ksz as usize).ok_or_else(bad)?.to_vec();
    pos += ksz as usize;
    let value = input.get(pos..pos + vsz as usize).ok_or_else(bad)?.to_vec();
    pos += vsz as usize;
    meta.insert(key, value);
  }
  Ok(meta)
}

/// An immutable sorted map from keys to values backed by a table file.
/// Safe for concurrent readers once opened.
pub struct Table<F: RandomAccessFile> {
  file: F,
  options: ReadOptions,
  metaindex_handle: BlockHandle,
  index_block: Arc<Block>,
  filter: Option<FilterBlockReader>,
  meta: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl<F: RandomAccessFile> std::fmt::Debug for Table<F> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Table").finish()
  }
}

impl<F: RandomAccessFile> Table<F> {
  /// Reads the footer, index block and meta blocks of `file`.
  pub fn open(options: ReadOptions, file: F) -> LstResult<Table<F>> {
    let size = file.size();
    if size < Footer::ENCODED_LENGTH as u64 {
      return Err(LstError::invalid_argument(
        "file is too short to be an sstable",
      ));
    }
    let mut footer_space = vec![0u8; Footer::ENCODED_LENGTH];
    let got = file.read_at(size - Footer::ENCODED_LENGTH as u64, &mut footer_space)?;
    if got != footer_space.len() {
      return Err(LstError::io("truncated footer read"));
    }
    let footer = Footer::decode_from(&footer_space)?;

    let index_contents = read_block(&file, &options, &footer.index_handle)?;
    let index_block = Block::new(index_contents)?;

    let mut table = Table {
      file,
      options,
      metaindex_handle: footer.metaindex_handle,
      index_block,
      filter: None,
      meta: BTreeMap::new(),
    };
    table.read_meta(&footer);
    Ok(table)
  }

  // Meta info is not needed for operation; failures only log.
  fn read_meta(&mut self, footer: &Footer) {
    let contents = match read_block(&self.file, &self.options, &footer.metaindex_handle) {
      Ok(c) => c,
      Err(e) => {
        log::error!("error reading meta index block: {}", e);
        return;
      }
    };
    let meta = match Block::new(contents) {
      Ok(b) => b,
      Err(e) => {
        log::error!("bad meta index block: {}", e);
        return;
      }
    };
    if let Some(policy) = self.options.filter_policy.clone() {
      let key = format!("{}{}", FILTER_NAME_PREFIX, policy.name());
      let mut iter = meta.clone().iter();
      iter.seek(key.as_bytes());
      if iter.valid() && iter.key() == key.as_bytes() {
        match BlockHandle::decode_from(iter.value())
          .and_then(|(handle, _)| read_block(&self.file, &self.options, &handle))
        {
          Ok(filter_data) => {
            self.filter = Some(FilterBlockReader::new(policy, filter_data));
          }
          Err(e) => log::error!("error reading filter block: {}", e),
        }
      }
    }
    let mut iter = meta.clone().iter();
    iter.seek(META_BLOCK_KEY);
    if iter.valid() && iter.key() == META_BLOCK_KEY {
      match parse_meta_map(iter.value()) {
        Ok(m) => self.meta = m,
        Err(e) => log::error!("could not decode meta block: {}", e),
      }
    }
  }

  /// The table's meta map, written via `TableBuilder::add_meta`.
  pub fn meta(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
    &self.meta
  }

  fn block_iter(&self, index_value: &[u8]) -> LstResult<BlockIter> {
    let (handle, _) = BlockHandle::decode_from(index_value)?;
    let contents = read_block(&self.file, &self.options, &handle)?;
    Ok(Block::new(contents)?.iter())
  }

  /// Point lookup. Consults the filter block, when present, to skip the
  /// data block read for keys that are provably absent.
  pub fn get(&self, key: &[u8]) -> LstResult<Option<Vec<u8>>> {
    let mut index_iter = self.index_block.clone().iter();
    index_iter.seek(key);
    if !index_iter.valid() {
      return index_iter.status().map(|_| None);
    }
    if let Some(filter) = &self.filter {
      if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
        if !filter.key_may_match(handle.offset(), key) {
          return Ok(None);
        }
      }
    }
    let mut data_iter = self.block_iter(index_iter.value())?;
    data_iter.seek(key);
    if data_iter.valid() && data_iter.key() == key {
      Ok(Some(data_iter.value().to_vec()))
    } else {
      data_iter.status().map(|_| None)
    }
  }

  /// Byte offset in the file near where data for `key` begins (or would
  /// begin). Includes the effect of block compression.
  pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
    let mut index_iter = self.index_block.clone().iter();
    index_iter.seek(key);
    if index_iter.valid() {
      if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
        return handle.offset();
      }
    }
    // Past the last key, or an undecodable entry: the meta-index offset is
    // right near the end of the file.
    self.metaindex_handle.offset()
  }

  /// Two-level iterator over the whole table. Initially invalid.
  pub fn iter(&self) -> TableIter<'_, F> {
    TableIter {
      table: self,
      index_iter: self.index_block.clone().iter(),
      data_iter: None,
      data_block_handle: Vec::new(),
      status: None,
    }
  }
}

/// Walks the index block and lazily opens the data block under the index
/// cursor.
pub struct TableIter<'t, F: RandomAccessFile> {
  table: &'t Table<F>,
  index_iter: BlockIter,
  data_iter: Option<BlockIter>,
  // index value that produced data_iter
  data_block_handle: Vec<u8>,
  status: Option<LstError>,
}

impl<'t, F: RandomAccessFile> TableIter<'t, F> {
  pub fn valid(&self) -> bool {
    self.data_iter.as_ref().map_or(false, |it| it.valid())
  }

  pub fn key(&self) -> &[u8] {
    debug_assert!(self.valid());
    self.data_iter.as_ref().expect("valid iter").key()
  }

  pub fn value(&self) -> &[u8] {
    debug_assert!(self.valid());
    self.data_iter.as_ref().expect("valid iter").value()
  }

  pub fn status(&self) -> LstResult<()> {
    self.index_iter.status()?;
    if let Some(it) = self.data_iter.as_ref() {
      it.status()?;
    }
    match &self.status {
      None => Ok(()),
      Some(e) => Err(e.clone()),
    }
  }

  pub fn seek(&mut self, target: &[u8]) {
    self.index_iter.seek(target);
    if self.init_data_block() {
      if let Some(it) = self.data_iter.as_mut() {
        it.seek(target);
      }
    }
    self.skip_empty_data_blocks_forward();
  }

  pub fn seek_to_first(&mut self) {
    self.index_iter.seek_to_first();
    if self.init_data_block() {
      if let Some(it) = self.data_iter.as_mut() {
        it.seek_to_first();
      }
    }
    self.skip_empty_data_blocks_forward();
  }

  pub fn seek_to_last(&mut self) {
    self.index_iter.seek_to_last();
    if self.init_data_block() {
      if let Some(it) = self.data_iter.as_mut() {
        it.seek_to_last();
      }
    }
    self.skip_empty_data_blocks_backward();
  }

  pub fn next(&mut self) {
    debug_assert!(self.valid());
    if let Some(it) = self.data_iter.as_mut() {
      it.next();
    }
    self.skip_empty_data_blocks_forward();
  }

  pub fn prev(&mut self) {
    debug_assert!(self.valid());
    if let Some(it) = self.data_iter.as_mut() {
      it.prev();
    }
    self.skip_empty_data_blocks_backward();
  }

  fn skip_empty_data_blocks_forward(&mut self) {
    while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
      if !self.index_iter.valid() {
        self.data_iter = None;
        return;
      }
      self.index_iter.next();
      if self.init_data_block() {
        if let Some(it) = self.data_iter.as_mut() {
          it.seek_to_first();
        }
      }
    }
  }

  fn skip_empty_data_blocks_backward(&mut self) {
    while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
      if !self.index_iter.valid() {
        self.data_iter = None;
        return;
      }
      self.index_iter.prev();
      if self.init_data_block() {
        if let Some(it) = self.data_iter.as_mut() {
          it.seek_to_last();
        }
      }
    }
  }

  // Opens the data block under the index cursor unless it is already the
  // current one. Returns whether a data iterator is available.
  fn init_data_block(&mut self) -> bool {
    if !self.index_iter.valid() {
      self.data_iter = None;
      return false;
    }
    let handle = self.index_iter.value().to_vec();
    if self.data_iter.is_some() && handle == self.data_block_handle {
      return true;
    }
    match self.table.block_iter(&handle) {
      Ok(iter) => {
        self.data_block_handle = handle;
        self.data_iter = Some(iter);
        true
      }
      Err(e) => {
        if self.status.is_none() {
          self.status = Some(e);
        }
        self.data_iter = None;
        false
      }
    }
  }
}
