//! on-disk home of one version-controlled history
//!
//! layout:
//!   config.toml   merge policy and relays
//!   history       zstd(CBOR) of the serialized state, replaced atomically
//!   tmp/          staging for atomic writes
//!   .lock         flock guarding writers

use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::client::Client;
use crate::config::Config;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::write_atomic;
use crate::key::Key;
use crate::vcs::VersionControl;

const ZSTD_LEVEL: i32 = 3;

pub struct Store {
    path: PathBuf,
    config: Config,
}

impl Store {
    /// create a store with a fresh key and an empty history
    pub fn init(path: &Path) -> Result<Self> {
        Self::init_with_key(path, Key::generate())
    }

    /// create a store that joins an existing identity
    ///
    /// peers syncing through one relay slot must all be created from the
    /// same public id and secret.
    pub fn init_with_key(path: &Path, key: Key) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::StoreExists(path.to_path_buf()));
        }

        std::fs::create_dir_all(path.join("tmp")).with_path(path)?;

        let config = Config::default();
        config.save(&config_path)?;

        let store = Self {
            path: path.to_path_buf(),
            config,
        };
        let vc = VersionControl::with_key(key);
        store.save(&vc)?;

        tracing::info!(path = %path.display(), public_id = vc.key().public_id(), "initialized store");
        Ok(store)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoStore(path.to_path_buf()));
        }

        let config = Config::load(&config_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    pub fn history_path(&self) -> PathBuf {
        self.path.join("history")
    }

    /// staging directory for atomic writes
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    /// read the history, configured with this store's merge policy
    pub fn load(&self) -> Result<VersionControl> {
        let path = self.history_path();
        let compressed = std::fs::read(&path).with_path(&path)?;
        let bytes = zstd::decode_all(&compressed[..])
            .map_err(|e| Error::CorruptHistory(format!("{}: {}", path.display(), e)))?;

        let mut vc = VersionControl::deserialize(&bytes)?;
        vc.set_policy(self.config.merge.policy.into_policy());

        tracing::debug!(
            revisions = vc.graph().len(),
            head = %vc.head().short(),
            "loaded history"
        );
        Ok(vc)
    }

    /// replace the stored history
    pub fn save(&self, vc: &VersionControl) -> Result<()> {
        let path = self.history_path();
        let bytes = vc.serialize()?;
        let compressed = zstd::encode_all(&bytes[..], ZSTD_LEVEL).with_path(&path)?;
        write_atomic(&self.tmp_path(), &path, &compressed)?;

        tracing::debug!(bytes = compressed.len(), "saved history");
        Ok(())
    }

    /// client for the named relay, or the only configured one
    pub fn client(&self, remote: Option<&str>) -> Result<Client> {
        Ok(self.config.pick_remote(remote)?.client())
    }

    /// take the exclusive writer lock
    pub fn lock(&self) -> Result<StoreLock> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::LockContention)?;

        Ok(StoreLock { flock })
    }

    /// like `lock`, but `None` when another writer holds it
    pub fn try_lock(&self) -> Result<Option<StoreLock>> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(StoreLock { flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }
}

/// held writer lock, released on drop
pub struct StoreLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}
