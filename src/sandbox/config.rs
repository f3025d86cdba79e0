//! The persisted record that identifies a sandbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-defined key/value bag, round-tripped unchanged.
pub type SandboxMetadata = serde_json::Map<String, Value>;

/// Persisted record identifying a sandbox instance.
///
/// `driver_config` is produced by the owning driver's `create_sandbox` and
/// handed back to the same driver on every load. Nothing else inspects it.
///
/// # Example
///
/// ```
/// use sandbox_manager::sandbox::SandboxConfig;
///
/// let config = SandboxConfig::new("feature-branch")
///     .with_parent_id("main")
///     .with_driver_name("local")
///     .with_meta("owner", "ci");
///
/// assert_eq!(config.parent_id.as_deref(), Some("main"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Unique identifier, immutable once created.
    pub id: String,

    /// Sandbox whose durable state is copied at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Driver owning this sandbox; the manager's default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,

    /// Opaque blob returned by the driver at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_config: Option<Value>,

    /// Caller-defined metadata.
    #[serde(default)]
    pub meta: SandboxMetadata,
}

impl SandboxConfig {
    /// Creates a record for the given id with everything else unset.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the parent to fork from.
    #[must_use]
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the owning driver.
    #[must_use]
    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = Some(name.into());
        self
    }

    /// Sets the driver blob. Normally only the manager does this.
    #[must_use]
    pub fn with_driver_config(mut self, driver_config: Value) -> Self {
        self.driver_config = Some(driver_config);
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole metadata bag.
    #[must_use]
    pub fn with_metadata(mut self, meta: SandboxMetadata) -> Self {
        self.meta = meta;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::new("sb-1");
        assert_eq!(config.id, "sb-1");
        assert!(config.parent_id.is_none());
        assert!(config.driver_name.is_none());
        assert!(config.driver_config.is_none());
        assert!(config.meta.is_empty());
    }

    #[test]
    fn test_builder_chain() {
        let config = SandboxConfig::new("child")
            .with_parent_id("parent")
            .with_driver_name("docker")
            .with_driver_config(json!({"container": "sandbox-child"}))
            .with_meta("owner", "alice")
            .with_meta("ttl", 30);

        assert_eq!(config.parent_id.as_deref(), Some("parent"));
        assert_eq!(config.driver_name.as_deref(), Some("docker"));
        assert_eq!(config.meta.get("owner"), Some(&json!("alice")));
        assert_eq!(config.meta.get("ttl"), Some(&json!(30)));
    }

    #[test]
    fn test_serde_uses_camel_case_and_skips_unset() {
        let config = SandboxConfig::new("sb").with_driver_name("local");
        let value = serde_json::to_value(&config).expect("failed to serialize");

        assert_eq!(value["driverName"], json!("local"));
        assert!(value.get("parentId").is_none());
        assert!(value.get("driverConfig").is_none());

        let back: SandboxConfig = serde_json::from_value(value).expect("failed to deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn test_meta_round_trips_unchanged() {
        let raw = json!({
            "id": "sb",
            "meta": {"nested": {"list": [1, 2, 3]}, "flag": true}
        });
        let config: SandboxConfig = serde_json::from_value(raw.clone()).expect("failed to parse");
        let again = serde_json::to_value(&config).expect("failed to serialize");
        assert_eq!(again["meta"], raw["meta"]);
    }
}
