//! On-disk base directory layout.
//!
//! A single directory holds everything the agent persists:
//!
//! ```text
//! <basedir>/
//!   config/     JSON configs, one <service>.conf per service
//!   bin/        installed binaries
//!   data/       spooled reports awaiting shipment
//!   log/        local log files
//!   start       shell script written in response to a Restart command
//!   start-lock  present while a restart hand-off is in flight
//! ```
//!
//! Tests construct a [`Basedir`] over a temp directory; nothing in the
//! core reaches for a global path.

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "config";
const BIN_DIR: &str = "bin";
const DATA_DIR: &str = "data";
const LOG_DIR: &str = "log";
const START_SCRIPT: &str = "start";
const START_LOCK: &str = "start-lock";

/// Handle to the agent's base directory.
#[derive(Debug, Clone)]
pub struct Basedir {
    path: PathBuf,
}

impl Basedir {
    /// Opens (creating if needed) the basedir and its subdirectories.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        for sub in [CONFIG_DIR, BIN_DIR, DATA_DIR, LOG_DIR] {
            fs::create_dir_all(path.join(sub))?;
        }
        Ok(Basedir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_dir(&self) -> PathBuf {
        self.path.join(CONFIG_DIR)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.path.join(BIN_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join(LOG_DIR)
    }

    pub fn start_script(&self) -> PathBuf {
        self.path.join(START_SCRIPT)
    }

    fn config_file(&self, service: &str) -> PathBuf {
        self.config_dir().join(format!("{service}.conf"))
    }

    /// Whether a config exists for `service`.
    pub fn has_config(&self, service: &str) -> bool {
        self.config_file(service).exists()
    }

    /// Reads and deserializes `config/<service>.conf`.
    ///
    /// The io::ErrorKind::NotFound case is meaningful to callers: a service
    /// with no config file is simply not enabled.
    pub fn read_config<T: DeserializeOwned>(&self, service: &str) -> Result<T, Error> {
        let bytes = fs::read(self.config_file(service))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Serializes and writes `config/<service>.conf`.
    pub fn write_config<T: Serialize>(&self, service: &str, config: &T) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(config)?;
        fs::write(self.config_file(service), bytes)?;
        Ok(())
    }

    /// Removes `config/<service>.conf`. Missing file is not an error.
    pub fn remove_config(&self, service: &str) -> Result<(), Error> {
        match fs::remove_file(self.config_file(service)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the start-lock file. Fails if a restart is already in
    /// flight (lock present).
    pub fn make_start_lock(&self) -> Result<(), Error> {
        let lock = self.path.join(START_LOCK);
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock)?;
        Ok(())
    }

    /// Removes the start-lock. Missing lock is not an error.
    pub fn remove_start_lock(&self) -> Result<(), Error> {
        match fs::remove_file(self.path.join(START_LOCK)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
