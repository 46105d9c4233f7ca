//! In-process store implementation
//!
//! Mirrors the Redis semantics the library depends on: list push/pop
//! directions, value-based removal, set membership, string values with lazy
//! TTL expiry, and type discipline per key. Backs the test suite and works
//! for single-process embedded use.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::QueueStore;

enum Entry {
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    Value { data: String, expires_at: Option<Instant> },
}

/// [`QueueStore`] held entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn drop_if_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    if let Some(Entry::Value {
        expires_at: Some(at),
        ..
    }) = entries.get(key)
    {
        if *at <= Instant::now() {
            entries.remove(key);
        }
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StoreResult<&'a mut VecDeque<String>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::List(VecDeque::new()))
    {
        Entry::List(list) => Ok(list),
        _ => Err(StoreError::WrongType { key: key.to_string() }),
    }
}

fn set_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StoreResult<&'a mut BTreeSet<String>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Set(BTreeSet::new()))
    {
        Entry::Set(set) => Ok(set),
        _ => Err(StoreError::WrongType { key: key.to_string() }),
    }
}

// Redis removes a list or set key the moment it becomes empty.
fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key) {
        Some(Entry::List(list)) => list.is_empty(),
        Some(Entry::Set(set)) => set.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<i64> {
        let mut entries = self.entries.lock();
        let list = list_mut(&mut entries, key)?;
        list.push_front(value.to_string());
        Ok(list.len() as i64)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock();

        let value = match entries.get_mut(source) {
            None => return Ok(None),
            Some(Entry::List(list)) => match list.pop_back() {
                Some(value) => value,
                None => return Ok(None),
            },
            Some(_) => {
                return Err(StoreError::WrongType {
                    key: source.to_string(),
                })
            }
        };
        drop_if_empty(&mut entries, source);

        let dest = list_mut(&mut entries, destination)?;
        dest.push_front(value.clone());
        Ok(Some(value))
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<i64> {
        let mut entries = self.entries.lock();
        let list = match entries.get_mut(key) {
            None => return Ok(0),
            Some(Entry::List(list)) => list,
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0usize;

        if count >= 0 {
            let mut index = 0;
            while index < list.len() && removed < limit {
                if list[index] == value {
                    list.remove(index);
                    removed += 1;
                } else {
                    index += 1;
                }
            }
        } else {
            let mut index = list.len();
            while index > 0 && removed < limit {
                index -= 1;
                if list[index] == value {
                    list.remove(index);
                    removed += 1;
                }
            }
        }

        drop_if_empty(&mut entries, key);
        Ok(removed as i64)
    }

    async fn llen(&self, key: &str) -> StoreResult<i64> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(0),
            Some(Entry::List(list)) => Ok(list.len() as i64),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let entries = self.entries.lock();
        let list = match entries.get(key) {
            None => return Ok(Vec::new()),
            Some(Entry::List(list)) => list,
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };

        let len = list.len() as i64;
        let normalize = |index: i64| -> i64 {
            if index < 0 {
                (len + index).max(0)
            } else {
                index
            }
        };
        let start = normalize(start);
        let stop = normalize(stop).min(len - 1);
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn del(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.entries.lock();
        drop_if_expired(&mut entries, key);
        Ok(if entries.remove(key).is_some() { 1 } else { 0 })
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        let set = set_mut(&mut entries, key)?;
        Ok(set.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        let removed = match entries.get_mut(key) {
            None => false,
            Some(Entry::Set(set)) => set.remove(member),
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<i64> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(0),
            Some(Entry::Set(set)) => Ok(set.len() as i64),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry::Value {
                data: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        drop_if_expired(&mut entries, key);
        Ok(entries.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.entries.lock();
        drop_if_expired(&mut entries, key);
        match entries.get(key) {
            None => Ok(-2),
            Some(Entry::Value {
                expires_at: Some(at),
                ..
            }) => Ok(at.saturating_duration_since(Instant::now()).as_secs() as i64),
            Some(_) => Ok(-1),
        }
    }

    async fn flush_all(&self) -> StoreResult<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
