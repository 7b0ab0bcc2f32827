use super::ListEnd;
use anyhow::anyhow;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// A stored value of one of the four supported shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub(crate) enum Value {
    Blob(#[serde(with = "blob_base64")] Vec<u8>),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Fields(HashMap<String, String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Blob(_) => "blob",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Fields(_) => "fields",
        }
    }
}

pub(crate) fn wrong_kind(key: &str, wanted: &str, found: &Value) -> anyhow::Error {
    anyhow!("{} holds a {}, not a {}", key, found.kind(), wanted)
}

pub(crate) fn push(list: &mut VecDeque<String>, end: ListEnd, members: &[String]) {
    for member in members {
        match end {
            ListEnd::Left => list.push_front(member.clone()),
            ListEnd::Right => list.push_back(member.clone()),
        }
    }
}

/// Inclusive range; negative indexes count from the end
pub(crate) fn range(list: &VecDeque<String>, start: i64, end: i64) -> Vec<String> {
    let len = list.len() as i64;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let end = if end < 0 { end + len } else { end.min(len - 1) };
    if start > end || start >= len {
        return Vec::new();
    }

    list.iter()
        .skip(start as usize)
        .take((end - start + 1) as usize)
        .cloned()
        .collect()
}

/// Move the rightmost element to the left end and return it
pub(crate) fn rotate(list: &mut VecDeque<String>) -> Option<String> {
    let item = list.pop_back()?;
    list.push_front(item.clone());
    Some(item)
}

/// Remove up to `count` occurrences of `element` (0 removes all)
pub(crate) fn remove(list: &mut VecDeque<String>, count: usize, element: &str) {
    let limit = if count == 0 { usize::MAX } else { count };
    let mut removed = 0;
    list.retain(|item| {
        if removed < limit && item == element {
            removed += 1;
            false
        } else {
            true
        }
    });
}

mod blob_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(blob: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(blob))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Bucket-safe form of a namespaced key
pub(crate) fn encode_key(key: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key)
}
