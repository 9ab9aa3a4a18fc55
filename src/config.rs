use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::client::{Client, DirTransport};
use crate::error::{Error, IoResultExt, Result};
use crate::merge::PolicyKind;

/// store configuration kept in config.toml
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub merge: MergeConfig,
    /// configured relays
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remotes: Vec<Remote>,
}

/// merge behaviour
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// how conflicting item edits are resolved
    #[serde(default)]
    pub policy: PolicyKind,
    /// push the merged history back after every pull
    #[serde(default = "default_push_after_merge")]
    pub push_after_merge: bool,
}

fn default_push_after_merge() -> bool {
    true
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            push_after_merge: default_push_after_merge(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn add_remote(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Result<()> {
        let name = name.into();
        if self.remotes.iter().any(|r| r.name == name) {
            return Err(Error::RemoteExists(name));
        }
        self.remotes.push(Remote {
            name,
            path: path.into(),
        });
        Ok(())
    }

    pub fn remove_remote(&mut self, name: &str) -> Result<()> {
        let pos = self
            .remotes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::RemoteNotFound(name.to_string()))?;
        self.remotes.remove(pos);
        Ok(())
    }

    pub fn get_remote(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// named remote, or the only one when `name` is absent
    pub fn pick_remote(&self, name: Option<&str>) -> Result<&Remote> {
        match name {
            Some(name) => self
                .get_remote(name)
                .ok_or_else(|| Error::RemoteNotFound(name.to_string())),
            None => match self.remotes.as_slice() {
                [only] => Ok(only),
                [] => Err(Error::RemoteNotFound("no remotes configured".to_string())),
                _ => Err(Error::RemoteNotFound(
                    "several remotes configured, name one".to_string(),
                )),
            },
        }
    }
}

/// a relay directory shared with other peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub path: PathBuf,
}

impl Remote {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn client(&self) -> Client {
        Client::new(DirTransport::new(&self.path))
    }
}
