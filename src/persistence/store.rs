//! Per-authority intermediate models between pipeline stages, kept as
//! bincode files in a run-unique directory.

use crate::error::{Error, Result};
use crate::io_err;
use crate::model::Model;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

pub struct IntermediateStore {
    run_dir: PathBuf,
    keep: bool,
}

impl IntermediateStore {
    /// Opens a fresh run directory under `base`. Unless `keep` is set the
    /// directory is removed when the store is dropped.
    pub fn new(base: &Path, keep: bool) -> Result<Self> {
        let run_dir = base.join("intermediate").join(Uuid::new_v4().to_string());
        fs::create_dir_all(&run_dir).map_err(|e| io_err!(run_dir, e))?;
        debug!(dir = %run_dir.display(), "Intermediate storage initialized");
        Ok(Self { run_dir, keep })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.run_dir.join(format!("{key}.bin"))
    }

    pub fn store(&self, key: &str, model: &Model) -> Result<PathBuf> {
        let path = self.path(key);
        let file = File::create(&path).map_err(|e| io_err!(path, e))?;
        let mut writer = BufWriter::new(file);
        let config = bincode::config::legacy();
        bincode::serde::encode_into_std_write(model, &mut writer, config)
            .map_err(|e| Error::format(&path, e))?;
        Ok(path)
    }

    pub fn load(&self, key: &str) -> Result<Model> {
        let path = self.path(key);
        let file = File::open(&path).map_err(|e| io_err!(path, e))?;
        let mut reader = BufReader::new(file);
        let config = bincode::config::legacy();
        bincode::serde::decode_from_std_read(&mut reader, config).map_err(|e| Error::format(&path, e))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path(key).exists()
    }
}

impl Drop for IntermediateStore {
    fn drop(&mut self) {
        if !self.keep {
            debug!(dir = %self.run_dir.display(), "Cleaning up intermediate storage");
            let _ = fs::remove_dir_all(&self.run_dir);
        }
    }
}
