//! When a shard reboots its device.
//!
//! Emulators are never rebooted, and `disable_reboot` turns every reboot
//! off. Otherwise a shard reboots once before its first module when it was
//! assigned enough distinct modules, and between two modules when any of
//! these hold:
//!
//! - the reboot interval elapsed since the last reboot;
//! - the finished module is known to leave the device dirty;
//! - the next module is known to need a clean device.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::device::Device;
use crate::module::ModuleDescriptor;

/// Why a reboot between modules was triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootReason {
    Interval(Duration),
    After(String),
    Before(String),
}

impl fmt::Display for RebootReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootReason::Interval(elapsed) => {
                write!(f, "{}s since last reboot", elapsed.as_secs())
            }
            RebootReason::After(module) => write!(f, "{} leaves the device dirty", module),
            RebootReason::Before(module) => write!(f, "{} needs a clean device", module),
        }
    }
}

/// Reboot decisions for one shard.
#[derive(Debug, Clone)]
pub struct RebootPolicy {
    disabled: bool,
    min_pre_reboot_modules: usize,
    interval: Duration,
    wait: Duration,
    after: HashSet<String>,
    before: HashSet<String>,
}

impl RebootPolicy {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            disabled: config.disable_reboot,
            min_pre_reboot_modules: config.min_pre_reboot_modules,
            interval: config.reboot_interval(),
            wait: config.reboot_wait(),
            after: config.reboot_after.iter().cloned().collect(),
            before: config.reboot_before.iter().cloned().collect(),
        }
    }

    /// Settle time after a reboot.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    fn allowed(&self, device: &dyn Device) -> bool {
        !self.disabled && !device.is_emulator()
    }

    /// Returns `true` if the shard should reboot before its first module.
    pub fn before_run(&self, device: &dyn Device, modules: &[ModuleDescriptor]) -> bool {
        let distinct: BTreeSet<&str> = modules.iter().map(|m| m.name.as_str()).collect();
        self.allowed(device) && distinct.len() >= self.min_pre_reboot_modules
    }

    /// Decides whether to reboot between `finished` and `next`.
    pub fn between(
        &self,
        device: &dyn Device,
        finished: &str,
        next: &str,
        since_last_reboot: Duration,
    ) -> Option<RebootReason> {
        if !self.allowed(device) {
            return None;
        }
        if since_last_reboot >= self.interval {
            Some(RebootReason::Interval(since_last_reboot))
        } else if self.after.contains(finished) {
            Some(RebootReason::After(finished.to_string()))
        } else if self.before.contains(next) {
            Some(RebootReason::Before(next.to_string()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::FakeDevice;

    fn policy() -> RebootPolicy {
        RebootPolicy::from_config(&CoordinatorConfig::default())
    }

    #[test]
    fn test_between_reasons() {
        let device = FakeDevice::new("dev-1");
        let policy = policy();
        let short = Duration::from_secs(60);

        assert_eq!(policy.between(&device, "A", "B", short), None);
        assert_eq!(
            policy.between(&device, "CtsMediaTestCases", "B", short),
            Some(RebootReason::After("CtsMediaTestCases".into()))
        );
        assert_eq!(
            policy.between(&device, "A", "CtsViewTestCases", short),
            Some(RebootReason::Before("CtsViewTestCases".into()))
        );
        assert!(matches!(
            policy.between(&device, "A", "B", Duration::from_secs(31 * 60)),
            Some(RebootReason::Interval(_))
        ));
    }

    #[test]
    fn test_emulator_and_disabled_never_reboot() {
        let emulator = FakeDevice::new("emulator-5554");
        assert_eq!(
            policy().between(&emulator, "CtsMediaTestCases", "B", Duration::ZERO),
            None
        );

        let device = FakeDevice::new("dev-1");
        let disabled = RebootPolicy::from_config(&CoordinatorConfig {
            disable_reboot: true,
            ..Default::default()
        });
        assert_eq!(
            disabled.between(&device, "CtsMediaTestCases", "B", Duration::ZERO),
            None
        );
        assert!(!disabled.before_run(&device, &[]));
    }
}
