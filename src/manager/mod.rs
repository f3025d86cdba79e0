//! The entry point: a durable index of sandboxes and the drivers behind them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sandbox_manager::driver::{LocalDriver, LocalDriverConfig};
//! use sandbox_manager::manager::{Manager, MemoryStore};
//! use sandbox_manager::sandbox::{SandboxConfig, WriteOptions};
//!
//! # async fn demo() -> miette::Result<()> {
//! let manager = Manager::new(Arc::new(MemoryStore::new()))
//!     .with_driver(Arc::new(LocalDriver::new(LocalDriverConfig::new("/tmp/sbx/sandboxes"))))
//!     .with_default_driver("local");
//!
//! let sandbox = manager.create_sandbox(SandboxConfig::new("main")).await?;
//! sandbox.write_file("hello.txt", "hi", WriteOptions::default()).await?;
//!
//! let fork = manager.fork_sandbox("main", Some("experiment".to_string())).await?;
//! assert!(fork.read_file("hello.txt", Default::default()).await?.is_some());
//! # Ok(())
//! # }
//! ```

mod store;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::driver::{CreateOptions, Driver, LoadOptions};
use crate::error::{ManagerError, ManagerResult, SandboxError, StoreError};
use crate::sandbox::{Sandbox, SandboxConfig};

pub use store::{FileStore, MemoryStore, SandboxStore};

/// Longest accepted sandbox id, in bytes.
pub const MAX_ID_LEN: usize = 128;

/// Manager settings.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Driver used when a record names none.
    pub default_driver: Option<String>,
}

impl ManagerConfig {
    #[must_use]
    pub fn with_default_driver(mut self, name: impl Into<String>) -> Self {
        self.default_driver = Some(name.into());
        self
    }
}

/// Checks that `id` can be used as an index key and backend resource name.
///
/// # Errors
///
/// Returns `ManagerError::InvalidId` describing the first violation.
pub fn validate_id(id: &str) -> ManagerResult<()> {
    let invalid = |reason: &str| {
        Err(ManagerError::InvalidId {
            id: id.to_string(),
            reason: reason.to_string(),
        })
    };

    if id.is_empty() {
        return invalid("id must not be empty");
    }
    if id.len() > MAX_ID_LEN {
        return invalid("id must be at most 128 bytes");
    }
    if id.starts_with('.') {
        return invalid("id must not start with '.'");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return invalid("id may only contain ASCII letters, digits, '.', '_' and '-'");
    }
    Ok(())
}

/// Resolves sandbox ids to drivers and keeps the index of records.
///
/// Create, delete and recreate on the same id are serialized through a
/// per-id lock owned by this instance.
pub struct Manager {
    store: Arc<dyn SandboxStore>,
    drivers: HashMap<String, Arc<dyn Driver>>,
    config: ManagerConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut drivers: Vec<_> = self.drivers.keys().collect();
        drivers.sort();
        f.debug_struct("Manager")
            .field("drivers", &drivers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Creates a manager over `store` with no drivers registered.
    #[must_use]
    pub fn new(store: Arc<dyn SandboxStore>) -> Self {
        Self {
            store,
            drivers: HashMap::new(),
            config: ManagerConfig::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a driver under its own name.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(driver.name().to_string(), driver);
        self
    }

    /// Sets the driver used when a record names none.
    #[must_use]
    pub fn with_default_driver(mut self, name: impl Into<String>) -> Self {
        self.config.default_driver = Some(name.into());
        self
    }

    /// Replaces the manager settings.
    #[must_use]
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Names of the registered drivers, sorted.
    #[must_use]
    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Creates a sandbox, persists its record and returns it loaded.
    ///
    /// # Errors
    ///
    /// - `ManagerError::InvalidId` if the id is unusable
    /// - `ManagerError::AlreadyExists` if a record with the id exists
    /// - `ManagerError::UnknownDriver` / `NoDriver` if no driver resolves
    /// - `ManagerError::Driver` if the driver fails; no record is kept
    #[instrument(skip(self, config), fields(sandbox_id = %config.id, driver = ?config.driver_name))]
    pub async fn create_sandbox(&self, config: SandboxConfig) -> ManagerResult<Arc<dyn Sandbox>> {
        validate_id(&config.id)?;
        let (driver_name, driver) = self.resolve_driver(config.driver_name.as_deref())?;
        let _guard = self.lock_id(&config.id).await;

        let mut record = SandboxConfig {
            driver_name: Some(driver_name),
            driver_config: None,
            ..config
        };

        if !self.store.insert_new(&record.id, &encode(&record)?).await? {
            return Err(ManagerError::AlreadyExists { id: record.id });
        }

        let driver_config = match driver.create_sandbox(&record, CreateOptions::default()).await {
            Ok(value) => value,
            Err(source) => {
                if let Err(e) = self.store.delete(&record.id).await {
                    warn!(error = %e, "failed to drop reservation after create failure");
                }
                return Err(ManagerError::Driver {
                    id: record.id,
                    source,
                });
            }
        };

        record.driver_config = Some(driver_config);
        self.store.set(&record.id, &encode(&record)?).await?;
        debug!("sandbox created");

        self.load_record(driver.as_ref(), &record).await
    }

    /// Loads a previously created sandbox.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotFound` if no record exists.
    #[instrument(skip(self))]
    pub async fn load_sandbox(&self, id: &str) -> ManagerResult<Arc<dyn Sandbox>> {
        let record = self.get_config(id).await?;
        let (_, driver) = self.resolve_driver(record.driver_name.as_deref())?;
        self.load_record(driver.as_ref(), &record).await
    }

    /// Deletes a sandbox's backend resources and its record. Missing
    /// sandboxes are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Driver` if the driver fails, in which case the
    /// record is kept so the delete can be retried.
    #[instrument(skip(self))]
    pub async fn delete_sandbox(&self, id: &str) -> ManagerResult<()> {
        let _guard = self.lock_id(id).await;

        let Some(record) = self.find_config(id).await? else {
            debug!("sandbox not on record, nothing to delete");
            return Ok(());
        };

        let (_, driver) = self.resolve_driver(record.driver_name.as_deref())?;
        driver
            .delete_sandbox(&record)
            .await
            .map_err(|source| ManagerError::Driver {
                id: id.to_string(),
                source,
            })?;

        self.store.delete(id).await?;
        debug!("sandbox deleted");
        Ok(())
    }

    /// Creates a new sandbox whose initial state copies `parent_id`.
    ///
    /// The child inherits the parent's driver and metadata. Without
    /// `new_id` a fresh `fork-<uuid>` id is generated.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotFound` if the parent has no record, or any
    /// error of [`Manager::create_sandbox`].
    #[instrument(skip(self))]
    pub async fn fork_sandbox(
        &self,
        parent_id: &str,
        new_id: Option<String>,
    ) -> ManagerResult<Arc<dyn Sandbox>> {
        let parent = self.get_config(parent_id).await?;
        let id = new_id.unwrap_or_else(|| format!("fork-{}", Uuid::new_v4().simple()));

        let mut child = SandboxConfig::new(id)
            .with_parent_id(parent_id)
            .with_metadata(parent.meta);
        child.driver_name = parent.driver_name;

        self.create_sandbox(child).await
    }

    /// Discards a sandbox's backend state and provisions it again from
    /// scratch, without copying any parent. The record is kept.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotFound` if no record exists, or
    /// `ManagerError::Driver` if the driver fails.
    #[instrument(skip(self))]
    pub async fn recreate_sandbox(&self, id: &str) -> ManagerResult<Arc<dyn Sandbox>> {
        let _guard = self.lock_id(id).await;

        let mut record = self.get_config(id).await?;
        let (_, driver) = self.resolve_driver(record.driver_name.as_deref())?;
        let driver_error = |source: SandboxError| ManagerError::Driver {
            id: id.to_string(),
            source,
        };

        driver.delete_sandbox(&record).await.map_err(driver_error)?;
        let driver_config = driver
            .create_sandbox(&record, CreateOptions { recreate: true })
            .await
            .map_err(driver_error)?;

        record.driver_config = Some(driver_config);
        self.store.set(id, &encode(&record)?).await?;
        debug!("sandbox recreated");

        self.load_record(driver.as_ref(), &record).await
    }

    /// Returns the persisted record for `id`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotFound` if no record exists.
    pub async fn get_config(&self, id: &str) -> ManagerResult<SandboxConfig> {
        self.find_config(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })
    }

    /// Returns every persisted record, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the index cannot be read.
    pub async fn list_sandboxes(&self) -> ManagerResult<Vec<SandboxConfig>> {
        let mut records = Vec::new();
        for key in self.store.list_keys().await? {
            if let Some(bytes) = self.store.get(&key).await? {
                records.push(decode(&key, &bytes)?);
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn find_config(&self, id: &str) -> ManagerResult<Option<SandboxConfig>> {
        if validate_id(id).is_err() {
            return Ok(None);
        }
        match self.store.get(id).await? {
            Some(bytes) => Ok(Some(decode(id, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_record(
        &self,
        driver: &dyn Driver,
        record: &SandboxConfig,
    ) -> ManagerResult<Arc<dyn Sandbox>> {
        driver
            .load_sandbox(record, LoadOptions::default())
            .await
            .map_err(|source| ManagerError::Driver {
                id: record.id.clone(),
                source,
            })
    }

    fn resolve_driver(&self, name: Option<&str>) -> ManagerResult<(String, Arc<dyn Driver>)> {
        let name = name
            .or(self.config.default_driver.as_deref())
            .ok_or(ManagerError::NoDriver)?;
        let driver = self
            .drivers
            .get(name)
            .ok_or_else(|| ManagerError::UnknownDriver {
                name: name.to_string(),
            })?;
        Ok((name.to_string(), Arc::clone(driver)))
    }

    async fn lock_id(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

fn encode(record: &SandboxConfig) -> ManagerResult<Vec<u8>> {
    serde_json::to_vec_pretty(record).map_err(|e| {
        ManagerError::Store(StoreError::Corrupt {
            key: record.id.clone(),
            reason: e.to_string(),
        })
    })
}

fn decode(key: &str, bytes: &[u8]) -> ManagerResult<SandboxConfig> {
    serde_json::from_slice(bytes).map_err(|e| {
        ManagerError::Store(StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
}
