//! Instance repository: connection metadata for the database instances
//! this host monitors, keyed by `(service, instance_id)` and persisted as
//! basedir configs (`config/<service>-<id>.conf`).

use crate::basedir::Basedir;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Connection metadata for one MySQL instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MysqlInstance {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub dsn: String,
}

/// Repository over the basedir with a read-through cache.
pub struct Repo {
    basedir: Basedir,
    cache: RwLock<HashMap<(String, u32), MysqlInstance>>,
}

impl Repo {
    pub fn new(basedir: Basedir) -> Self {
        Repo {
            basedir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn key_name(service: &str, id: u32) -> String {
        format!("{service}-{id}")
    }

    /// Resolves an instance, reading through to disk on first access.
    pub fn get(&self, service: &str, id: u32) -> Result<MysqlInstance, Error> {
        let key = (service.to_string(), id);
        if let Some(hit) = self.cache.read().expect("repo lock").get(&key) {
            return Ok(hit.clone());
        }
        let instance: MysqlInstance = self.basedir.read_config(&Self::key_name(service, id))?;
        self.cache
            .write()
            .expect("repo lock")
            .insert(key, instance.clone());
        Ok(instance)
    }

    /// Persists an instance record and refreshes the cache.
    pub fn update(&self, service: &str, instance: &MysqlInstance) -> Result<(), Error> {
        self.basedir
            .write_config(&Self::key_name(service, instance.id), instance)?;
        self.cache
            .write()
            .expect("repo lock")
            .insert((service.to_string(), instance.id), instance.clone());
        Ok(())
    }

    /// Removes an instance record from disk and cache.
    pub fn remove(&self, service: &str, id: u32) -> Result<(), Error> {
        self.basedir.remove_config(&Self::key_name(service, id))?;
        self.cache
            .write()
            .expect("repo lock")
            .remove(&(service.to_string(), id));
        Ok(())
    }
}
