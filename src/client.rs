//! push/pull of encrypted packs through a relay
//!
//! a relay holds at most one pack per store public id. peers sharing a key
//! read and overwrite the same slot: pull, merge locally, push the result.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::fs::write_atomic;
use crate::key::Key;
use crate::pack::Pack;

/// the wire contract a relay has to offer
pub trait Transport: Send + Sync {
    /// current pack for `public_id`, if any
    fn fetch(&self, public_id: &str) -> Result<Option<Vec<u8>>>;

    /// replace the pack for `public_id`
    fn publish(&self, public_id: &str, bytes: &[u8]) -> Result<()>;
}

/// in-process relay, cheap to clone and share between peers
#[derive(Clone, Default)]
pub struct MemoryTransport {
    slots: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// make every call fail until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(Error::Transport {
                message: "relay unreachable".to_string(),
            });
        }
        Ok(())
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.slots.lock().map_err(|_| Error::Transport {
            message: "relay state poisoned".to_string(),
        })
    }
}

impl Transport for MemoryTransport {
    fn fetch(&self, public_id: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.slots()?.get(public_id).cloned())
    }

    fn publish(&self, public_id: &str, bytes: &[u8]) -> Result<()> {
        self.check_online()?;
        self.slots()?.insert(public_id.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// a directory acting as relay: `<dir>/<public_id>.pack`
#[derive(Clone, Debug)]
pub struct DirTransport {
    dir: PathBuf,
}

impl DirTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, public_id: &str) -> Result<PathBuf> {
        let valid = !public_id.is_empty()
            && public_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Transport {
                message: format!("invalid public id: {:?}", public_id),
            });
        }
        Ok(self.dir.join(format!("{}.pack", public_id)))
    }
}

impl Transport for DirTransport {
    fn fetch(&self, public_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.slot_path(public_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Transport {
                message: format!("{}: {}", path.display(), e),
            }),
        }
    }

    fn publish(&self, public_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.slot_path(public_id)?;
        if !self.dir.is_dir() {
            return Err(Error::Transport {
                message: format!("relay directory missing: {}", self.dir.display()),
            });
        }
        write_atomic(&self.dir.join(".tmp"), &path, bytes).map_err(|e| Error::Transport {
            message: e.to_string(),
        })
    }
}

/// shared cancellation flag for in-flight network work
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Cancelled` once cancel has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// drives push and pull over a transport
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
}

impl Client {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// raw pack bytes for `public_id`; transport errors pass through unchanged
    pub fn fetch(&self, public_id: &str) -> Result<Option<Vec<u8>>> {
        let bytes = self.transport.fetch(public_id)?;
        tracing::debug!(
            public_id,
            bytes = bytes.as_ref().map_or(0, Vec::len),
            "fetched pack"
        );
        Ok(bytes)
    }

    /// fetch and decode the pack addressed to this key
    pub fn pull(&self, key: &Key) -> Result<Option<Pack>> {
        match self.fetch(key.public_id())? {
            Some(bytes) => Ok(Some(Pack::decode(&bytes, key)?)),
            None => Ok(None),
        }
    }

    /// publish encoded pack bytes under this key's public id
    pub fn push(&self, key: &Key, bytes: &[u8]) -> Result<()> {
        self.transport.publish(key.public_id(), bytes)?;
        tracing::info!(public_id = key.public_id(), bytes = bytes.len(), "pushed pack");
        Ok(())
    }

    /// pull on a worker thread
    pub fn spawn_pull(&self, key: &Key) -> PendingPull {
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel();

        let client = self.clone();
        let key = key.clone();
        let token = cancel.clone();
        let join = thread::spawn(move || {
            let result = token.check().and_then(|()| client.pull(&key));
            // receiver may be gone if the caller gave up
            let _ = tx.send(result);
        });

        PendingPull { cancel, rx, join }
    }
}

/// a pull running in the background
pub struct PendingPull {
    cancel: CancelToken,
    rx: mpsc::Receiver<Result<Option<Pack>>>,
    join: JoinHandle<()>,
}

impl PendingPull {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// block until the worker finishes
    ///
    /// a cancelled pull yields `Cancelled` even if the fetch completed.
    pub fn wait(self) -> Result<Option<Pack>> {
        let result = self.rx.recv().map_err(|_| Error::Transport {
            message: "pull worker exited without a result".to_string(),
        });
        let _ = self.join.join();
        self.cancel.check()?;
        result?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RevisionGraph;
    use tempfile::tempdir;

    fn encoded(key: &Key) -> Vec<u8> {
        Pack::from_graph(&RevisionGraph::new(), key.public_id(), 0)
            .encode(key, key.public_id())
            .unwrap()
    }

    #[test]
    fn test_memory_roundtrip() {
        let key = Key::generate();
        let client = Client::new(MemoryTransport::new());

        assert!(client.pull(&key).unwrap().is_none());
        client.push(&key, &encoded(&key)).unwrap();

        let pack = client.pull(&key).unwrap().unwrap();
        assert_eq!(pack.origin, key.public_id());
    }

    #[test]
    fn test_memory_shared_between_clients() {
        let key = Key::generate();
        let relay = MemoryTransport::new();
        let a = Client::new(relay.clone());
        let b = Client::new(relay);

        a.push(&key, &encoded(&key)).unwrap();
        assert!(b.pull(&key).unwrap().is_some());
    }

    #[test]
    fn test_offline_is_transport_error() {
        let key = Key::generate();
        let relay = MemoryTransport::new();
        relay.set_offline(true);
        let client = Client::new(relay);

        assert!(matches!(client.pull(&key), Err(Error::Transport { .. })));
        assert!(matches!(
            client.push(&key, b"x"),
            Err(Error::Transport { .. })
        ));
    }

    #[test]
    fn test_dir_transport() {
        let dir = tempdir().unwrap();
        let key = Key::generate();
        let client = Client::new(DirTransport::new(dir.path()));

        assert!(client.pull(&key).unwrap().is_none());
        client.push(&key, &encoded(&key)).unwrap();
        assert!(dir.path().join(format!("{}.pack", key.public_id())).is_file());
        assert!(client.pull(&key).unwrap().is_some());
    }

    #[test]
    fn test_dir_transport_rejects_path_ids() {
        let dir = tempdir().unwrap();
        let transport = DirTransport::new(dir.path());
        assert!(matches!(
            transport.fetch("../escape"),
            Err(Error::Transport { .. })
        ));
    }

    #[test]
    fn test_dir_transport_missing_dir() {
        let dir = tempdir().unwrap();
        let transport = DirTransport::new(dir.path().join("nope"));
        assert!(matches!(
            transport.publish("abc", b"x"),
            Err(Error::Transport { .. })
        ));
    }

    #[test]
    fn test_wrong_key_pull() {
        let key = Key::generate();
        let other = Key::from_bytes(key.public_id(), [3u8; 32]);
        let client = Client::new(MemoryTransport::new());
        client.push(&key, &encoded(&key)).unwrap();

        assert!(matches!(client.pull(&other), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_spawn_pull() {
        let key = Key::generate();
        let client = Client::new(MemoryTransport::new());
        client.push(&key, &encoded(&key)).unwrap();

        let pending = client.spawn_pull(&key);
        assert!(pending.wait().unwrap().is_some());
    }

    #[test]
    fn test_spawn_pull_cancelled() {
        let key = Key::generate();
        let client = Client::new(MemoryTransport::new());

        let pending = client.spawn_pull(&key);
        pending.cancel();
        assert!(matches!(pending.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let shared = token.clone();
        assert!(token.check().is_ok());
        shared.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
