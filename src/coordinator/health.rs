//! Inter-module health checkers.
//!
//! A checker runs before and after every module on a shard. Failures never
//! stop the shard: the coordinator captures a bugreport and moves on.
//!
//! | Name | Checks |
//! |------|--------|
//! | `boot-completed` | `sys.boot_completed` is `1` before and after the module |
//! | `property-drift` | configured properties are unchanged across the module |

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::config::CoordinatorConfig;
use crate::device::{BOOT_COMPLETED, Device, DeviceError};

/// Result type for health checks.
pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("{checker}: {message}")]
    Failed { checker: String, message: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A check run around every module.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Canonical name, as used in the allow and deny lists.
    fn name(&self) -> &str;

    async fn pre_module(&self, device: &dyn Device) -> HealthResult<()>;

    async fn post_module(&self, device: &dyn Device) -> HealthResult<()>;
}

/// Builds the checkers enabled by `config`. Unknown names are skipped.
pub fn checkers_for(config: &CoordinatorConfig) -> Vec<Box<dyn HealthChecker>> {
    let mut checkers: Vec<Box<dyn HealthChecker>> = Vec::new();
    for name in config.enabled_health_checkers() {
        match name {
            BootCompletedChecker::NAME => checkers.push(Box::new(BootCompletedChecker)),
            PropertyDriftChecker::NAME => checkers.push(Box::new(PropertyDriftChecker::new(
                config.drift_properties.clone(),
            ))),
            other => warn!("Unknown health checker '{}', skipping", other),
        }
    }
    checkers
}

/// Requires the device to report a finished boot.
#[derive(Debug, Default)]
pub struct BootCompletedChecker;

impl BootCompletedChecker {
    pub const NAME: &'static str = "boot-completed";

    async fn check(&self, device: &dyn Device) -> HealthResult<()> {
        let value = device.get_property(BOOT_COMPLETED).await?;
        if value.trim() == "1" {
            Ok(())
        } else {
            Err(HealthError::Failed {
                checker: Self::NAME.to_string(),
                message: format!("{} is '{}'", BOOT_COMPLETED, value.trim()),
            })
        }
    }
}

#[async_trait]
impl HealthChecker for BootCompletedChecker {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn pre_module(&self, device: &dyn Device) -> HealthResult<()> {
        self.check(device).await
    }

    async fn post_module(&self, device: &dyn Device) -> HealthResult<()> {
        self.check(device).await
    }
}

/// Snapshots properties before a module and compares them after it.
#[derive(Debug, Default)]
pub struct PropertyDriftChecker {
    properties: Vec<String>,
    snapshot: Mutex<BTreeMap<String, String>>,
}

impl PropertyDriftChecker {
    pub const NAME: &'static str = "property-drift";

    pub fn new(properties: Vec<String>) -> Self {
        Self {
            properties,
            snapshot: Mutex::default(),
        }
    }

    async fn read(&self, device: &dyn Device) -> HealthResult<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for key in &self.properties {
            values.insert(key.clone(), device.get_property(key).await?);
        }
        Ok(values)
    }
}

#[async_trait]
impl HealthChecker for PropertyDriftChecker {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn pre_module(&self, device: &dyn Device) -> HealthResult<()> {
        let values = self.read(device).await?;
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = values;
        }
        Ok(())
    }

    async fn post_module(&self, device: &dyn Device) -> HealthResult<()> {
        let after = self.read(device).await?;
        let before = match self.snapshot.lock() {
            Ok(mut snapshot) => std::mem::take(&mut *snapshot),
            Err(_) => return Ok(()),
        };

        let drifted: Vec<String> = before
            .iter()
            .filter(|(key, value)| after.get(*key) != Some(*value))
            .map(|(key, value)| {
                format!(
                    "{} changed from '{}' to '{}'",
                    key,
                    value,
                    after.get(key).map(String::as_str).unwrap_or("")
                )
            })
            .collect();

        if drifted.is_empty() {
            Ok(())
        } else {
            Err(HealthError::Failed {
                checker: Self::NAME.to_string(),
                message: drifted.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::FakeDevice;

    #[tokio::test]
    async fn test_boot_completed() {
        let device = FakeDevice::new("dev-1");
        let checker = BootCompletedChecker;
        checker.pre_module(&device).await.unwrap();

        device.set_property(BOOT_COMPLETED, "0");
        let err = checker.post_module(&device).await.unwrap_err();
        assert!(err.to_string().starts_with("boot-completed"), "{err}");
    }

    #[tokio::test]
    async fn test_property_drift_detected() {
        let device = FakeDevice::new("dev-1");
        device.set_property("persist.sys.locale", "en-US");
        let checker = PropertyDriftChecker::new(vec!["persist.sys.locale".into()]);

        checker.pre_module(&device).await.unwrap();
        checker.post_module(&device).await.unwrap();

        checker.pre_module(&device).await.unwrap();
        device.set_property("persist.sys.locale", "fr-FR");
        let err = checker.post_module(&device).await.unwrap_err();
        assert!(err.to_string().contains("from 'en-US' to 'fr-FR'"), "{err}");
    }

    #[test]
    fn test_checkers_follow_deny_list() {
        let config = CoordinatorConfig {
            health_checkers: vec!["boot-completed".into(), "property-drift".into(), "bogus".into()],
            health_checker_deny_list: vec!["boot-completed".into()],
            ..Default::default()
        };
        let names: Vec<String> = checkers_for(&config)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["property-drift"]);
    }
}
