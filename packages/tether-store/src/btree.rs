//! The BTree Layer: an ordered key→value map over a Block Backing.
//!
//! Physically an append-only log (a bitcask-style keydir): each put or
//! delete appends a record to the backing, and the in-memory index
//! tracks only the latest record's (offset, length) per key. Ordering
//! and range iteration fall out of using a `BTreeMap` as that index, so
//! keys compare lexicographically by byte content with no extra sort
//! step.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tether_core::error::Result;
use tracing::warn;

use crate::backing::BlockBacking;

const LIVE: u8 = 0;
const TOMBSTONE: u8 = 1;

#[derive(Debug, Clone, Copy)]
struct RecordLocation {
    offset: u64,
    len: u32,
}

/// An ordered key→value map over a [`BlockBacking`].
pub struct BTreeLayer {
    backing: Box<dyn BlockBacking>,
    index: BTreeMap<Vec<u8>, RecordLocation>,
    cache: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
    append_offset: u64,
}

impl BTreeLayer {
    /// Opens a layer over `backing`, scanning any existing log to
    /// rebuild the index.
    ///
    /// A record truncated mid-append (the expected shape of a crash
    /// between a write and its flush under a best-effort durability
    /// model) is not treated as corruption: the scan stops at the last
    /// complete record and the backing is truncated to that point. A
    /// malformed complete record (lengths that don't add up to a
    /// trailing partial record) still surfaces `ErrCorrupt`.
    pub fn open(backing: Box<dyn BlockBacking>, cache_pages: usize) -> Result<Self> {
        let size = backing.size();
        let bytes = backing.read_at(0, size as usize)?;
        let mut index = BTreeMap::new();
        let mut cursor = 0usize;

        while cursor < bytes.len() {
            let record_start = cursor;
            match parse_record(&bytes, cursor) {
                Some((key, tombstone, value_offset, value_len, next_cursor)) => {
                    if tombstone == LIVE {
                        index.insert(
                            key,
                            RecordLocation {
                                offset: value_offset as u64,
                                len: value_len as u32,
                            },
                        );
                    } else {
                        index.remove(&key);
                    }
                    cursor = next_cursor;
                }
                None => {
                    warn!(
                        offset = record_start,
                        "truncated trailing record at open, discarding"
                    );
                    backing.truncate(record_start as u64)?;
                    break;
                }
            }
        }

        let append_offset = backing.size();
        let cache_capacity = NonZeroUsize::new(cache_pages.max(1)).unwrap();
        Ok(Self {
            backing,
            index,
            cache: Mutex::new(LruCache::new(cache_capacity)),
            append_offset,
        })
    }

    /// Point lookup. Takes only a shared reference: callers hold the
    /// shared read lease, not the Worker's exclusive lease, while
    /// reading.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.lock().unwrap().get(key).cloned() {
            return Ok(Some(cached));
        }
        let Some(location) = self.index.get(key).copied() else {
            return Ok(None);
        };
        let value = self
            .backing
            .read_at(location.offset, location.len as usize)?;
        self.cache.lock().unwrap().put(key.to_vec(), value.clone());
        Ok(Some(value))
    }

    /// Insert or overwrite. Requires exclusive access: only the Worker
    /// calls this, holding the write lease.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let record = encode_record(key, LIVE, value);
        let value_offset = self.append_offset + 4 + key.len() as u64 + 1 + 4;
        self.backing.write_at(self.append_offset, &record)?;
        self.append_offset += record.len() as u64;
        self.index.insert(
            key.to_vec(),
            RecordLocation {
                offset: value_offset,
                len: value.len() as u32,
            },
        );
        self.cache.lock().unwrap().put(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Removes a key, returning whether it previously existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if !self.index.contains_key(key) {
            return Ok(false);
        }
        let record = encode_record(key, TOMBSTONE, &[]);
        self.backing.write_at(self.append_offset, &record)?;
        self.append_offset += record.len() as u64;
        self.index.remove(key);
        self.cache.lock().unwrap().pop(key);
        Ok(true)
    }

    /// Removes every record and resets the backing to empty.
    pub fn clear(&mut self) -> Result<()> {
        self.backing.truncate(0)?;
        self.index.clear();
        self.cache.lock().unwrap().clear();
        self.append_offset = 0;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.backing.flush()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn backing_size(&self) -> u64 {
        self.backing.size()
    }

    /// Lazily decoded ordered iteration over every record whose key
    /// starts with `prefix` (pass `&[]` for the whole key space). The
    /// key snapshot is taken eagerly; each value is read from the
    /// backing only as the caller advances the iterator, so the engine
    /// never fully materialises every document into memory.
    pub fn iter_prefix<'a>(&'a self, prefix: &'a [u8]) -> PrefixIter<'a> {
        let keys: Vec<Vec<u8>> = self
            .index
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        PrefixIter {
            layer: self,
            keys: keys.into_iter(),
        }
    }
}

pub struct PrefixIter<'a> {
    layer: &'a BTreeLayer,
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl Iterator for PrefixIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.keys.next()?;
            match self.layer.get(&key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue, // deleted since the key snapshot was taken
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn encode_record(key: &[u8], tombstone: u8, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + 1 + 4 + value.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.push(tombstone);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Parses one record starting at `cursor`, returning
/// `(key, tombstone, value_offset, value_len, next_cursor)`, or `None`
/// if the bytes available from `cursor` onward don't hold a complete
/// record (a truncated trailing write).
#[allow(clippy::type_complexity)]
fn parse_record(bytes: &[u8], cursor: usize) -> Option<(Vec<u8>, u8, usize, usize, usize)> {
    let key_len = read_u32(bytes, cursor)? as usize;
    let mut cursor = cursor + 4;

    let key_end = cursor.checked_add(key_len)?;
    let key = bytes.get(cursor..key_end)?.to_vec();
    cursor = key_end;

    let tombstone = *bytes.get(cursor)?;
    cursor += 1;

    let value_len = read_u32(bytes, cursor)? as usize;
    cursor += 4;
    let value_offset = cursor;
    let value_end = cursor.checked_add(value_len)?;
    if value_end > bytes.len() {
        return None;
    }
    cursor = value_end;

    Some((key, tombstone, value_offset, value_len, cursor))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes(slice.try_into().unwrap()))
}
