use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use ciborium::Value;

use crate::types::{DeltaSet, ItemDeltas};
use crate::Error;

/// SHA-256 hash used for content addressing
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// zero hash (useful as sentinel)
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// parse from hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidHashHex(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidHashHex(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// first 12 hex chars, for display
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

const REVISION_DOMAIN: &[u8] = b"revtree/revision/v1";
const FINGERPRINT_DOMAIN: &[u8] = b"revtree/fingerprint/v1";

/// compute a revision id over (parent, deltas, message)
///
/// format:
///   domain tag
///   parent: 1 byte presence flag, then 32 bytes when present
///   message: 4 bytes LE length, bytes
///   item_count: 4 bytes LE
///   for each item (sorted by id):
///     id_len: 4 bytes LE, id bytes
///     delta_count: 4 bytes LE
///     for each delta (sorted by kind):
///       kind_len: 4 bytes LE, kind bytes
///       payload: tagged value encoding (see `hash_value`)
pub fn compute_revision_id(parent: Option<&Hash>, deltas: &ItemDeltas, message: &str) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(REVISION_DOMAIN);

    match parent {
        Some(parent) => {
            hasher.update([1u8]);
            hasher.update(parent.as_bytes());
        }
        None => hasher.update([0u8]),
    }

    update_bytes(&mut hasher, message.as_bytes());

    hasher.update((deltas.len() as u32).to_le_bytes());
    for (item, set) in deltas {
        update_bytes(&mut hasher, item.as_str().as_bytes());
        hash_delta_set(&mut hasher, set);
    }

    Hash(hasher.finalize().into())
}

/// digest over a set of revision ids, order independent
pub fn compute_fingerprint<'a>(ids: impl IntoIterator<Item = &'a Hash>) -> Hash {
    let mut sorted: Vec<&Hash> = ids.into_iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update((sorted.len() as u32).to_le_bytes());
    for id in sorted {
        hasher.update(id.as_bytes());
    }
    Hash(hasher.finalize().into())
}

fn hash_delta_set(hasher: &mut Sha256, set: &DeltaSet) {
    hasher.update((set.len() as u32).to_le_bytes());
    for (kind, payload) in set.iter() {
        update_bytes(hasher, kind.as_bytes());
        hash_value(hasher, payload);
    }
}

/// feed a payload value as tag byte + body
///
/// map entries are sorted by the digest of their key first, so the same
/// logical map hashes the same whatever order it was built in.
fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, *b as u8]),
        Value::Integer(i) => {
            hasher.update([2u8]);
            hasher.update(i128::from(*i).to_le_bytes());
        }
        Value::Float(f) => {
            hasher.update([3u8]);
            hasher.update(f.to_bits().to_le_bytes());
        }
        Value::Text(s) => {
            hasher.update([4u8]);
            update_bytes(hasher, s.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update([5u8]);
            update_bytes(hasher, b);
        }
        Value::Array(items) => {
            hasher.update([6u8]);
            hasher.update((items.len() as u32).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Map(entries) => {
            hasher.update([7u8]);
            hasher.update((entries.len() as u32).to_le_bytes());
            let mut keyed: Vec<([u8; 32], &Value)> = entries
                .iter()
                .map(|(k, v)| {
                    let mut key_hasher = Sha256::new();
                    hash_value(&mut key_hasher, k);
                    (key_hasher.finalize().into(), v)
                })
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            for (key_digest, v) in keyed {
                hasher.update(key_digest);
                hash_value(hasher, v);
            }
        }
        Value::Tag(tag, inner) => {
            hasher.update([8u8]);
            hasher.update(tag.to_le_bytes());
            hash_value(hasher, inner);
        }
        other => {
            // Value is non_exhaustive; fall back to its debug rendering
            hasher.update([0xffu8]);
            update_bytes(hasher, format!("{:?}", other).as_bytes());
        }
    }
}

fn update_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}
