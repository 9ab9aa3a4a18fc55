use std::path::PathBuf;

use crate::hash::Hash;
use crate::types::ItemId;

/// error type for revtree operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store not found at {0}")]
    NoStore(PathBuf),

    #[error("store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("nothing to commit: selected items have no changes")]
    NoChanges,

    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("ambiguous revision prefix: {0}")]
    AmbiguousRevision(String),

    #[error("stash not found: {0}")]
    StashNotFound(String),

    #[error("stash already exists: {0}")]
    StashExists(String),

    #[error("no quick stash to apply")]
    NoQuickStash,

    #[error("tracked item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("item {item} rejected change-set: {message}")]
    ItemApply { item: ItemId, message: String },

    #[error(
        "merge would overwrite uncommitted changes to: {}",
        .0.iter().map(ItemId::as_str).collect::<Vec<_>>().join(", ")
    )]
    UncommittedChanges(Vec<ItemId>),

    #[error("cannot amend the root revision")]
    CannotAmendRoot,

    #[error("corrupt revision: id mismatch for {0}")]
    CorruptRevision(Hash),

    #[error("corrupt history: {0}")]
    CorruptHistory(String),

    #[error("pack encryption failed: {0}")]
    Encryption(String),

    #[error("pack decryption failed: {0}")]
    Decryption(String),

    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    #[error("histories share no root (local {local}, remote {remote})")]
    UnrelatedHistories { local: Hash, remote: Hash },

    #[error("operation cancelled")]
    Cancelled,

    #[error("lock contention on store")]
    LockContention,

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("remote already exists: {0}")]
    RemoteExists(String),

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("invalid conflict policy: {0}")]
    InvalidConflictPolicy(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("value conversion error: {0}")]
    Value(#[from] ciborium::value::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
