//! durable file writes

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{Error, IoResultExt, Result};

/// write `content` to `path` atomically
///
/// the bytes go to a uuid-named file in `tmp_dir` first, which is fsynced
/// and renamed over the target. `tmp_dir` must be on the same filesystem.
pub fn write_atomic(tmp_dir: &Path, path: &Path, content: &[u8]) -> Result<()> {
    fs::create_dir_all(tmp_dir).with_path(tmp_dir)?;
    let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());

    {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        tmp_file.write_all(content).with_path(&tmp_path)?;
        tmp_file.sync_all().with_path(&tmp_path)?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        });
    }

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// fsync a directory
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}
