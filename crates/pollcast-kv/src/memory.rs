use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{glob_match, KvError, KvStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
    Bits(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Keys plus an expiry-ordered index of the ones carrying a TTL.
///
/// Index entries are not removed when a key is overwritten or deleted; a
/// stale entry is skipped at purge time because its instant no longer
/// matches the key's current deadline.
#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    expiries: BTreeSet<(Instant, String)>,
}

impl Keyspace {
    fn insert(&mut self, key: &str, entry: Entry) {
        if let Some(at) = entry.expires_at {
            self.expiries.insert((at, key.to_string()));
        }
        self.entries.insert(key.to_string(), entry);
    }

    fn set_expiry(&mut self, key: &str, at: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(at);
                self.expiries.insert((at, key.to_string()));
                true
            }
            None => false,
        }
    }

    /// Drop keys whose deadline has passed. Only the due prefix of the index
    /// is visited.
    fn purge_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.expiries.first() {
            if *at > now {
                break;
            }
            let Some((at, key)) = self.expiries.pop_first() else {
                break;
            };
            if self
                .entries
                .get(&key)
                .is_some_and(|e| e.expires_at == Some(at))
            {
                self.entries.remove(&key);
            }
        }
    }
}

/// In-process backing store.
///
/// One mutex guards the whole keyspace so multi-key primitives
/// (`rpoplpush`, `lmove_value`) are indivisible. Expired keys are dropped on
/// the next operation through the expiry index.
pub struct MemoryKv {
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`KvError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        if self.available.swap(available, Ordering::SeqCst) != available {
            tracing::warn!(available, "memory kv availability changed");
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock_keyspace()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock_keyspace()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn lock_keyspace(&self) -> MutexGuard<'_, Keyspace> {
        match self.keyspace.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, Keyspace>, KvError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable);
        }
        let mut keyspace = self.lock_keyspace();
        keyspace.purge_expired(Instant::now());
        Ok(keyspace)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, KvError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(KvError::WrongType(key.to_string())),
    }
}

fn remove_first(list: &mut VecDeque<String>, value: &str) -> bool {
    match list.iter().position(|v| v == value) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key).map(|e| &e.value) {
        Some(Value::List(list)) => list.is_empty(),
        Some(Value::Set(set)) => set.is_empty(),
        Some(Value::Hash(hash)) => hash.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

fn bit_position(offset: u64) -> (usize, u8) {
    ((offset / 8) as usize, 7 - (offset % 8) as u8)
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let keyspace = self.guard()?;
        let entries = &keyspace.entries;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut keyspace = self.guard()?;
        keyspace.insert(
            key,
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        if keyspace.entries.contains_key(key) {
            return Ok(false);
        }
        keyspace.insert(
            key,
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count() as u64)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let matches = matches!(
            entries.get(key).map(|e| &e.value),
            Some(Value::Str(current)) if current == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let keyspace = self.guard()?;
        let entries = &keyspace.entries;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        Ok(keyspace.set_expiry(key, Instant::now() + ttl))
    }

    async fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<(), KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Bits(Vec::new())));
        let Value::Bits(bits) = &mut entry.value else {
            return Err(KvError::WrongType(key.to_string()));
        };
        for &offset in offsets {
            let (byte, shift) = bit_position(offset);
            if bits.len() <= byte {
                bits.resize(byte + 1, 0);
            }
            bits[byte] |= 1 << shift;
        }
        Ok(())
    }

    async fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, KvError> {
        let keyspace = self.guard()?;
        let entries = &keyspace.entries;
        let bits: &[u8] = match entries.get(key).map(|e| &e.value) {
            None => &[],
            Some(Value::Bits(bits)) => bits,
            Some(_) => return Err(KvError::WrongType(key.to_string())),
        };
        Ok(offsets
            .iter()
            .map(|&offset| {
                let (byte, shift) = bit_position(offset);
                bits.get(byte).is_some_and(|b| b & (1 << shift) != 0)
            })
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let removed = match entries.get_mut(key).map(|e| &mut e.value) {
            None => false,
            Some(Value::Set(set)) => set.remove(member),
            Some(_) => return Err(KvError::WrongType(key.to_string())),
        };
        drop_if_empty(entries, key);
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let keyspace = self.guard()?;
        let entries = &keyspace.entries;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let list = list_mut(entries, key)?;
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn rpoplpush(&self, src: &str, dst: &str) -> Result<Option<String>, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let popped = match entries.get_mut(src).map(|e| &mut e.value) {
            None => return Ok(None),
            Some(Value::List(list)) => list.pop_back(),
            Some(_) => return Err(KvError::WrongType(src.to_string())),
        };
        drop_if_empty(entries, src);
        let Some(value) = popped else {
            return Ok(None);
        };
        list_mut(entries, dst)?.push_front(value.clone());
        Ok(Some(value))
    }

    async fn lmove_value(&self, src: &str, dst: &str, value: &str) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let removed = match entries.get_mut(src).map(|e| &mut e.value) {
            None => false,
            Some(Value::List(list)) => remove_first(list, value),
            Some(_) => return Err(KvError::WrongType(src.to_string())),
        };
        if !removed {
            return Ok(false);
        }
        drop_if_empty(entries, src);
        list_mut(entries, dst)?.push_front(value.to_string());
        Ok(true)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let removed = match entries.get_mut(key).map(|e| &mut e.value) {
            None => false,
            Some(Value::List(list)) => remove_first(list, value),
            Some(_) => return Err(KvError::WrongType(key.to_string())),
        };
        drop_if_empty(entries, key);
        Ok(removed)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, KvError> {
        let keyspace = self.guard()?;
        let entries = &keyspace.entries;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let keyspace = self.guard()?;
        let entries = &keyspace.entries;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        let Value::Hash(hash) = &mut entry.value else {
            return Err(KvError::WrongType(key.to_string()));
        };
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| KvError::NotAnInteger(field.to_string()))?,
            None => 0,
        };
        let next = current.saturating_add(by);
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let keyspace = self.guard()?;
        let entries = &keyspace.entries;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut keyspace = self.guard()?;
        let entries = &mut keyspace.entries;
        let removed = match entries.get_mut(key).map(|e| &mut e.value) {
            None => false,
            Some(Value::Hash(hash)) => hash.remove(field).is_some(),
            Some(_) => return Err(KvError::WrongType(key.to_string())),
        };
        drop_if_empty(entries, key);
        Ok(removed)
    }
}
