use super::value::{self, encode_key, wrong_kind, Value};
use super::{KeyValueStore, ListEnd, StorageKey};
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::kv::{self, Operation};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Conditional writes lost to another writer before giving up
const MAX_WRITE_ATTEMPTS: usize = 16;

/// What the bucket holds for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Record {
    fn new(value: Value, ttl: Option<Duration>) -> Result<Self> {
        Ok(Self {
            value,
            expires_at: ttl.map(expiry).transpose()?,
        })
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

fn expiry(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).context("Expiration out of range")?;
    Ok(Utc::now() + ttl)
}

/// [`KeyValueStore`] kept in a JetStream key-value bucket.
///
/// Every server instance pointed at the same bucket sees the same suspended
/// sessions, snapshots and transcripts, and they outlive any one process.
/// Each key holds a JSON [`Record`]; updates other than plain overwrites are
/// compare-and-set on the key's last revision, retried when another writer
/// got there first. Expired records read as absent.
pub struct NatsStore {
    kv: kv::Store,
    namespace: String,
}

impl NatsStore {
    pub async fn connect(url: &str, bucket: &str, namespace: impl Into<String>) -> Result<Self> {
        info!("Connecting to NATS key-value bucket {} at {}", bucket, url);
        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;
        Self::open(client, bucket, namespace).await
    }

    /// Open the bucket on an existing connection, creating it if needed
    pub async fn open(
        client: async_nats::Client,
        bucket: &str,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let jetstream = async_nats::jetstream::new(client);
        let kv = match jetstream.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(e) => {
                debug!("Bucket {} not available ({}), creating it", bucket, e);
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .with_context(|| format!("Failed to create key-value bucket {}", bucket))?
            }
        };

        Ok(Self {
            kv,
            namespace: namespace.into(),
        })
    }

    fn bucket_key(&self, key: &StorageKey) -> String {
        encode_key(&format!("{}{}", self.namespace, key))
    }

    /// Live record under `key` and the revision to condition a write on
    async fn load(&self, key: &str) -> Result<(Option<Record>, u64)> {
        let entry = self
            .kv
            .entry(key)
            .await
            .with_context(|| format!("Failed to read {}", key))?;
        match entry {
            None => Ok((None, 0)),
            Some(entry) if entry.operation != Operation::Put => Ok((None, entry.revision)),
            Some(entry) => {
                let record: Record = serde_json::from_slice(&entry.value)
                    .with_context(|| format!("Malformed record under {}", key))?;
                let live = record.is_live(Utc::now()).then_some(record);
                Ok((live, entry.revision))
            }
        }
    }

    async fn live_value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.load(key).await?.0.map(|record| record.value))
    }

    /// Read-modify-write of one key.
    ///
    /// `change` sees the live record and returns the record to write (or
    /// `None` to leave the key alone) plus a result. It runs again whenever
    /// the write loses to a concurrent one.
    async fn modify<T, F>(&self, key: &str, mut change: F) -> Result<T>
    where
        F: FnMut(Option<Record>) -> Result<(Option<Record>, T)> + Send,
        T: Send,
    {
        let mut last_error = None;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let (current, revision) = self.load(key).await?;
            let (next, result) = change(current)?;
            let Some(next) = next else {
                return Ok(result);
            };

            let payload = serde_json::to_vec(&next)?;
            match self.kv.update(key, payload.into(), revision).await {
                Ok(_) => return Ok(result),
                Err(e) => {
                    debug!("Conditional write of {} lost, retrying: {}", key, e);
                    last_error = Some(e);
                }
            }
        }
        Err(anyhow!(
            "Failed to update {} after {} attempts: {}",
            key,
            MAX_WRITE_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for NatsStore {
    async fn get_blob(&self, key: &StorageKey) -> Result<Option<Vec<u8>>> {
        let key = self.bucket_key(key);
        match self.live_value(&key).await? {
            None => Ok(None),
            Some(Value::Blob(blob)) => Ok(Some(blob)),
            Some(other) => Err(wrong_kind(&key, "blob", &other)),
        }
    }

    async fn set_blob(
        &self,
        key: &StorageKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = self.bucket_key(key);
        let record = Record::new(Value::Blob(value), ttl)?;
        self.kv
            .put(&key, serde_json::to_vec(&record)?.into())
            .await
            .with_context(|| format!("Failed to write {}", key))?;
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<()> {
        let key = self.bucket_key(key);
        self.kv
            .delete(&key)
            .await
            .with_context(|| format!("Failed to delete {}", key))
    }

    async fn set_expiration(&self, key: &StorageKey, ttl: Duration) -> Result<()> {
        let key = self.bucket_key(key);
        let expires_at = expiry(ttl)?;
        self.modify(&key, |current| {
            Ok((
                current.map(|record| Record {
                    expires_at: Some(expires_at),
                    ..record
                }),
                (),
            ))
        })
        .await
    }

    async fn push_range(&self, key: &StorageKey, end: ListEnd, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let key = self.bucket_key(key);
        self.modify(&key, |current| {
            let mut record = current.unwrap_or(Record {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut record.value {
                Value::List(list) => value::push(list, end, members),
                other => return Err(wrong_kind(&key, "list", other)),
            }
            Ok((Some(record), ()))
        })
        .await
    }

    async fn fetch_range(&self, key: &StorageKey, start: i64, end: i64) -> Result<Vec<String>> {
        let key = self.bucket_key(key);
        match self.live_value(&key).await? {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(value::range(&list, start, end)),
            Some(other) => Err(wrong_kind(&key, "list", &other)),
        }
    }

    async fn rotate_blocking(
        &self,
        key: &StorageKey,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let key = self.bucket_key(key);
        let deadline = Instant::now() + timeout;
        // watch before the first look so a push in between still wakes us
        let mut changes = Box::pin(
            self.kv
                .watch(&key)
                .await
                .with_context(|| format!("Failed to watch {}", key))?,
        );

        loop {
            let rotated = self
                .modify(&key, |current| {
                    let Some(mut record) = current else {
                        return Ok((None, None));
                    };
                    let item = match &mut record.value {
                        Value::List(list) => value::rotate(list),
                        other => return Err(wrong_kind(&key, "list", other)),
                    };
                    Ok((item.is_some().then_some(record), item))
                })
                .await?;
            if rotated.is_some() {
                return Ok(rotated);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match tokio::time::timeout(deadline - now, changes.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(anyhow!("Watch of {} ended", key)),
                Ok(Some(change)) => {
                    change.with_context(|| format!("Failed to watch {}", key))?;
                }
            }
        }
    }

    async fn remove_element(&self, key: &StorageKey, count: usize, element: &str) -> Result<()> {
        let key = self.bucket_key(key);
        self.modify(&key, |current| {
            let Some(mut record) = current else {
                return Ok((None, ()));
            };
            match &mut record.value {
                Value::List(list) => {
                    let before = list.len();
                    value::remove(list, count, element);
                    if list.len() == before {
                        return Ok((None, ()));
                    }
                }
                other => return Err(wrong_kind(&key, "list", other)),
            }
            Ok((Some(record), ()))
        })
        .await
    }

    async fn add_members(&self, key: &StorageKey, members: &[String]) -> Result<()> {
        let key = self.bucket_key(key);
        self.modify(&key, |current| {
            let mut record = current.unwrap_or(Record {
                value: Value::Set(Default::default()),
                expires_at: None,
            });
            match &mut record.value {
                Value::Set(set) => set.extend(members.iter().cloned()),
                other => return Err(wrong_kind(&key, "set", other)),
            }
            Ok((Some(record), ()))
        })
        .await
    }

    async fn is_member(&self, key: &StorageKey, member: &str) -> Result<bool> {
        let key = self.bucket_key(key);
        match self.live_value(&key).await? {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(other) => Err(wrong_kind(&key, "set", &other)),
        }
    }

    async fn get_fields(&self, key: &StorageKey) -> Result<HashMap<String, String>> {
        let key = self.bucket_key(key);
        match self.live_value(&key).await? {
            None => Ok(HashMap::new()),
            Some(Value::Fields(fields)) => Ok(fields),
            Some(other) => Err(wrong_kind(&key, "fields", &other)),
        }
    }

    async fn set_fields(&self, key: &StorageKey, fields: &HashMap<String, String>) -> Result<()> {
        let key = self.bucket_key(key);
        self.modify(&key, |current| {
            let mut record = current.unwrap_or(Record {
                value: Value::Fields(HashMap::new()),
                expires_at: None,
            });
            match &mut record.value {
                Value::Fields(existing) => {
                    existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())))
                }
                other => return Err(wrong_kind(&key, "fields", other)),
            }
            Ok((Some(record), ()))
        })
        .await
    }

    async fn set_field_nx(&self, key: &StorageKey, field: &str, value: &str) -> Result<bool> {
        let key = self.bucket_key(key);
        self.modify(&key, |current| {
            let mut record = current.unwrap_or(Record {
                value: Value::Fields(HashMap::new()),
                expires_at: None,
            });
            match &mut record.value {
                Value::Fields(existing) => {
                    if existing.contains_key(field) {
                        return Ok((None, false));
                    }
                    existing.insert(field.to_string(), value.to_string());
                }
                other => return Err(wrong_kind(&key, "fields", other)),
            }
            Ok((Some(record), true))
        })
        .await
    }
}
