use super::value::{self, wrong_kind, Value};
use super::{KeyValueStore, ListEnd, StorageKey};
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-process [`KeyValueStore`].
///
/// Nothing survives the process, so only tests and single-instance runs use
/// it. Keys live under a namespace prefix so several logical stores can share
/// one process. Expired values are dropped lazily, on the next access.
pub struct MemoryStore {
    namespace: String,
    entries: Mutex<HashMap<String, Entry>>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
        }
    }

    fn full_key(&self, key: &StorageKey) -> String {
        format!("{}{}", self.namespace, key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("whisper:")
    }
}

/// Live entry for `key`, evicting it first if it has expired
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .map(|at| at <= Instant::now())
        .unwrap_or(false);
    if expired {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a mut VecDeque<String>>> {
    match live_entry(entries, key) {
        None => Ok(None),
        Some(Entry {
            value: Value::List(list),
            ..
        }) => Ok(Some(list)),
        Some(other) => Err(wrong_kind(key, "list", &other.value)),
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_blob(&self, key: &StorageKey) -> Result<Option<Vec<u8>>> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, &key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Blob(blob),
                ..
            }) => Ok(Some(blob.clone())),
            Some(other) => Err(wrong_kind(&key, "blob", &other.value)),
        }
    }

    async fn set_blob(
        &self,
        key: &StorageKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = self.full_key(key);
        let entry = Entry {
            value: Value::Blob(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().await.insert(key, entry);
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<()> {
        let key = self.full_key(key);
        self.entries.lock().await.remove(&key);
        Ok(())
    }

    async fn set_expiration(&self, key: &StorageKey, ttl: Duration) -> Result<()> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live_entry(&mut entries, &key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn push_range(&self, key: &StorageKey, end: ListEnd, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let key = self.full_key(key);
        {
            let mut entries = self.entries.lock().await;
            if list_mut(&mut entries, &key)?.is_none() {
                entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::List(VecDeque::new()),
                        expires_at: None,
                    },
                );
            }
            if let Some(list) = list_mut(&mut entries, &key)? {
                value::push(list, end, members);
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn fetch_range(&self, key: &StorageKey, start: i64, end: i64) -> Result<Vec<String>> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        Ok(list_mut(&mut entries, &key)?
            .map(|list| value::range(list, start, end))
            .unwrap_or_default())
    }

    async fn rotate_blocking(
        &self,
        key: &StorageKey,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let key = self.full_key(key);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut entries = self.entries.lock().await;
                if let Some(item) = list_mut(&mut entries, &key)?.and_then(value::rotate) {
                    return Ok(Some(item));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove_element(&self, key: &StorageKey, count: usize, element: &str) -> Result<()> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        let Some(list) = list_mut(&mut entries, &key)? else {
            return Ok(());
        };

        value::remove(list, count, element);
        if list.is_empty() {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn add_members(&self, key: &StorageKey, members: &[String]) -> Result<()> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, &key) {
            None => {
                entries.insert(
                    key,
                    Entry {
                        value: Value::Set(members.iter().cloned().collect()),
                        expires_at: None,
                    },
                );
            }
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.extend(members.iter().cloned()),
            Some(other) => return Err(wrong_kind(&key, "set", &other.value)),
        }
        Ok(())
    }

    async fn is_member(&self, key: &StorageKey, member: &str) -> Result<bool> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, &key) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(other) => Err(wrong_kind(&key, "set", &other.value)),
        }
    }

    async fn get_fields(&self, key: &StorageKey) -> Result<HashMap<String, String>> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, &key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Fields(fields),
                ..
            }) => Ok(fields.clone()),
            Some(other) => Err(wrong_kind(&key, "fields", &other.value)),
        }
    }

    async fn set_fields(&self, key: &StorageKey, fields: &HashMap<String, String>) -> Result<()> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, &key) {
            None => {
                entries.insert(
                    key,
                    Entry {
                        value: Value::Fields(fields.clone()),
                        expires_at: None,
                    },
                );
            }
            Some(Entry {
                value: Value::Fields(existing),
                ..
            }) => existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone()))),
            Some(other) => return Err(wrong_kind(&key, "fields", &other.value)),
        }
        Ok(())
    }

    async fn set_field_nx(&self, key: &StorageKey, field: &str, value: &str) -> Result<bool> {
        let key = self.full_key(key);
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, &key) {
            None => {
                let fields = HashMap::from([(field.to_string(), value.to_string())]);
                entries.insert(
                    key,
                    Entry {
                        value: Value::Fields(fields),
                        expires_at: None,
                    },
                );
                Ok(true)
            }
            Some(Entry {
                value: Value::Fields(existing),
                ..
            }) => {
                if existing.contains_key(field) {
                    return Ok(false);
                }
                existing.insert(field.to_string(), value.to_string());
                Ok(true)
            }
            Some(other) => Err(wrong_kind(&key, "fields", &other.value)),
        }
    }
}
