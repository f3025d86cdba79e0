//! Backend lifecycle: create, load and delete sandboxes.
//!
//! A driver turns a [`SandboxConfig`] into backend resources and hands back
//! an opaque configuration blob. Only the same driver ever reads that blob
//! again, when it rehydrates a [`Sandbox`] from it.

pub mod container;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::{Sandbox, SandboxConfig};

pub use container::{
    CONTAINER_DRIVER_NAME, ContainerDriver, ContainerDriverConfig, ContainerSandbox,
};
pub use local::{LOCAL_DRIVER_NAME, LocalDriver, LocalDriverConfig, LocalSandbox};

/// Options for [`Driver::create_sandbox`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Provision fresh resources without copying the parent.
    pub recreate: bool,
}

/// Options for [`Driver::load_sandbox`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Provision the sandbox if it has no driver configuration yet.
    pub create: bool,
}

/// Backend-specific sandbox lifecycle.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name the manager registers this driver under.
    fn name(&self) -> &str;

    /// Provisions backend resources and returns the driver configuration.
    ///
    /// With `parent_id` set and `recreate` false the new sandbox starts as a
    /// full copy of the parent. A missing parent yields a fresh sandbox.
    async fn create_sandbox(
        &self,
        config: &SandboxConfig,
        options: CreateOptions,
    ) -> SandboxResult<Value>;

    /// Removes backend resources. Already-removed resources are not an error.
    async fn delete_sandbox(&self, config: &SandboxConfig) -> SandboxResult<()>;

    /// Rehydrates a sandbox from its driver configuration.
    async fn load_sandbox(
        &self,
        config: &SandboxConfig,
        options: LoadOptions,
    ) -> SandboxResult<Arc<dyn Sandbox>>;
}

/// Returns the driver configuration on record, provisioning it first when
/// `options.create` allows.
///
/// # Errors
///
/// Returns `SandboxError::SandboxNotCreated` if there is no configuration
/// and creation was not requested.
pub async fn ensure_driver_config<D>(
    driver: &D,
    config: &SandboxConfig,
    options: LoadOptions,
) -> SandboxResult<Value>
where
    D: Driver + ?Sized,
{
    match &config.driver_config {
        Some(value) => Ok(value.clone()),
        None if options.create => driver.create_sandbox(config, CreateOptions::default()).await,
        None => Err(SandboxError::SandboxNotCreated {
            id: config.id.clone(),
        }),
    }
}

/// Decodes a driver configuration blob into the driver's own type.
///
/// # Errors
///
/// Returns `SandboxError::InvalidDriverConfig` if the blob does not match.
pub fn decode_driver_config<T: DeserializeOwned>(id: &str, value: Value) -> SandboxResult<T> {
    serde_json::from_value(value).map_err(|e| SandboxError::InvalidDriverConfig {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Encodes a driver's own configuration type into a blob.
///
/// # Errors
///
/// Returns `SandboxError::InvalidDriverConfig` if serialization fails.
pub fn encode_driver_config<T: Serialize>(id: &str, config: &T) -> SandboxResult<Value> {
    serde_json::to_value(config).map_err(|e| SandboxError::InvalidDriverConfig {
        id: id.to_string(),
        reason: e.to_string(),
    })
}
