//! Configuration schema definitions for modshard.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section is optional; an empty file is a
//! valid configuration that discovers modules under `./modules` and expects
//! devices on the command line.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── HarnessConfig          - Shard count, module source, variants, results
//! ├── DeviceConfig[]         - Connected devices, per-device tokens/commands
//! ├── DeviceCommandsConfig   - Shell templates used to talk to devices
//! ├── CoordinatorConfig      - Reboot policy, step lists, health checks
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::module::loader::TomlModuleLoader;

/// Root configuration structure for modshard.
///
/// # TOML Structure
///
/// ```toml
/// [harness]
/// shard_count = 2
/// source_dir = "~/cts/modules"
///
/// [[devices]]
/// serial = "R58M12345"
/// tokens = ["sim-card"]
///
/// [[devices]]
/// serial = "emulator-5554"
///
/// [coordinator]
/// reboot_interval_mins = 45
///
/// [report]
/// output_dir = "test-results"
/// ```
///
/// # Example
///
/// ```
/// use modshard::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [harness]
///     shard_count = 2
///
///     [[devices]]
///     serial = "emulator-5554"
/// "#).unwrap();
/// assert_eq!(config.harness.shard_count, Some(2));
/// assert_eq!(config.devices[0].serial, "emulator-5554");
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core scheduling settings.
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Devices available to the run.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Shell templates used to talk to devices.
    #[serde(default)]
    pub device_commands: DeviceCommandsConfig,

    /// Per-shard driver settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core scheduling settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `shard_count` | number of devices |
/// | `source_dir` | `"modules"` |
/// | `architectures` | union of connected device ABIs |
/// | `results_dir` | `"results"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Number of shards. When unset, one shard per configured device.
    pub shard_count: Option<usize>,

    /// Directory holding module declaration files. `~` and `$VARS` are
    /// expanded.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Architecture variants to run. Empty means every variant supported by
    /// at least one connected device.
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Directory where invocation records are persisted for retries.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Default timeout in seconds for module step commands that set none.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            shard_count: None,
            source_dir: default_source_dir(),
            architectures: Vec::new(),
            results_dir: default_results_dir(),
            step_timeout_secs: default_step_timeout(),
        }
    }
}

impl HarnessConfig {
    /// Returns `source_dir` with `~` and environment variables expanded.
    pub fn expanded_source_dir(&self) -> PathBuf {
        expand_path(&self.source_dir)
    }

    /// Returns `results_dir` with `~` and environment variables expanded.
    pub fn expanded_results_dir(&self) -> PathBuf {
        expand_path(&self.results_dir)
    }

    /// Returns a module loader using the configured step timeout.
    pub fn module_loader(&self) -> TomlModuleLoader {
        TomlModuleLoader::new().with_step_timeout(Duration::from_secs(self.step_timeout_secs))
    }
}

fn expand_path(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_step_timeout() -> u64 {
    300
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// One connected device.
///
/// # Example
///
/// ```toml
/// [[devices]]
/// serial = "R58M12345"
/// tokens = ["sim-card", "nfc"]
///
/// [devices.commands]
/// reboot = "fastboot-helper reboot {serial}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Unique serial of the device.
    pub serial: String,

    /// Capability tokens this device holds. Merged with `--token` arguments.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Per-device overrides of the shared command templates.
    #[serde(default)]
    pub commands: DeviceCommandOverrides,
}

/// Shell templates used by command-backed devices.
///
/// Placeholders: `{serial}` in every template, `{key}` in `property`.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `property` | `adb -s {serial} shell getprop {key}` |
/// | `reboot` | `adb -s {serial} reboot && adb -s {serial} wait-for-device` |
/// | `bugreport` | `adb -s {serial} bugreport` |
/// | `logcat` | `adb -s {serial} logcat -d` |
/// | `screenshot` | `adb -s {serial} exec-out screencap -p` |
/// | `timeout_secs` | 300 |
/// | `reboot_timeout_secs` | 600 |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceCommandsConfig {
    #[serde(default = "default_property_command")]
    pub property: String,

    #[serde(default = "default_reboot_command")]
    pub reboot: String,

    #[serde(default = "default_bugreport_command")]
    pub bugreport: String,

    #[serde(default = "default_logcat_command")]
    pub logcat: String,

    #[serde(default = "default_screenshot_command")]
    pub screenshot: String,

    /// Timeout for property reads and captures, in seconds.
    #[serde(default = "default_device_timeout")]
    pub timeout_secs: u64,

    /// Timeout for a reboot to complete, in seconds.
    #[serde(default = "default_reboot_timeout")]
    pub reboot_timeout_secs: u64,
}

impl Default for DeviceCommandsConfig {
    fn default() -> Self {
        Self {
            property: default_property_command(),
            reboot: default_reboot_command(),
            bugreport: default_bugreport_command(),
            logcat: default_logcat_command(),
            screenshot: default_screenshot_command(),
            timeout_secs: default_device_timeout(),
            reboot_timeout_secs: default_reboot_timeout(),
        }
    }
}

impl DeviceCommandsConfig {
    /// Returns a copy with the given per-device overrides applied.
    pub fn merged(&self, overrides: &DeviceCommandOverrides) -> Self {
        let pick = |o: &Option<String>, base: &String| o.clone().unwrap_or_else(|| base.clone());
        Self {
            property: pick(&overrides.property, &self.property),
            reboot: pick(&overrides.reboot, &self.reboot),
            bugreport: pick(&overrides.bugreport, &self.bugreport),
            logcat: pick(&overrides.logcat, &self.logcat),
            screenshot: pick(&overrides.screenshot, &self.screenshot),
            timeout_secs: self.timeout_secs,
            reboot_timeout_secs: self.reboot_timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_secs)
    }
}

fn default_property_command() -> String {
    "adb -s {serial} shell getprop {key}".to_string()
}

fn default_reboot_command() -> String {
    "adb -s {serial} reboot && adb -s {serial} wait-for-device".to_string()
}

fn default_bugreport_command() -> String {
    "adb -s {serial} bugreport".to_string()
}

fn default_logcat_command() -> String {
    "adb -s {serial} logcat -d".to_string()
}

fn default_screenshot_command() -> String {
    "adb -s {serial} exec-out screencap -p".to_string()
}

fn default_device_timeout() -> u64 {
    300
}

fn default_reboot_timeout() -> u64 {
    600
}

/// Optional per-device command template overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceCommandOverrides {
    pub property: Option<String>,
    pub reboot: Option<String>,
    pub bugreport: Option<String>,
    pub logcat: Option<String>,
    pub screenshot: Option<String>,
}

/// Settings for the per-shard driver.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `disable_reboot` | false |
/// | `min_pre_reboot_modules` | 2 |
/// | `reboot_interval_mins` | 30 |
/// | `reboot_wait_secs` | 120 |
/// | `skip_preconditions` | false |
/// | `health_checkers` | `["boot-completed"]` |
/// | `bugreport_on_failure` | false |
/// | `logcat_on_failure` | false |
/// | `screenshot_on_failure` | false |
///
/// # Example
///
/// ```toml
/// [coordinator]
/// disable_reboot = false
/// reboot_after = ["CtsMediaTestCases"]
/// step_deny_list = ["install-apk"]
/// health_checkers = ["boot-completed", "property-drift"]
/// drift_properties = ["persist.sys.locale"]
/// logcat_on_failure = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Never reboot devices between or before modules.
    #[serde(default)]
    pub disable_reboot: bool,

    /// A shard reboots before its first module only when it was assigned at
    /// least this many distinct module names.
    #[serde(default = "default_min_pre_reboot_modules")]
    pub min_pre_reboot_modules: usize,

    /// Reboot between modules once this much time passed since the last reboot.
    #[serde(default = "default_reboot_interval")]
    pub reboot_interval_mins: u64,

    /// Extra settle time after a reboot, in seconds.
    #[serde(default = "default_reboot_wait")]
    pub reboot_wait_secs: u64,

    /// Modules known to leave the device in a bad state.
    #[serde(default = "default_reboot_after")]
    pub reboot_after: Vec<String>,

    /// Modules sensitive to a dirty device.
    #[serde(default = "default_reboot_before")]
    pub reboot_before: Vec<String>,

    /// Skip every precondition step.
    #[serde(default)]
    pub skip_preconditions: bool,

    /// When non-empty, only steps named here run.
    #[serde(default)]
    pub step_allow_list: Vec<String>,

    /// Steps named here never run.
    #[serde(default)]
    pub step_deny_list: Vec<String>,

    /// Health checkers to run around every module, by canonical name.
    #[serde(default = "default_health_checkers")]
    pub health_checkers: Vec<String>,

    /// Health checkers to leave out even if listed above.
    #[serde(default)]
    pub health_checker_deny_list: Vec<String>,

    /// Properties that must not change across a module (`property-drift`).
    #[serde(default)]
    pub drift_properties: Vec<String>,

    /// Capture a bugreport for every failed test.
    #[serde(default)]
    pub bugreport_on_failure: bool,

    /// Capture the log buffer for every failed test.
    #[serde(default)]
    pub logcat_on_failure: bool,

    /// Capture a screenshot for every failed test.
    #[serde(default)]
    pub screenshot_on_failure: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            disable_reboot: false,
            min_pre_reboot_modules: default_min_pre_reboot_modules(),
            reboot_interval_mins: default_reboot_interval(),
            reboot_wait_secs: default_reboot_wait(),
            reboot_after: default_reboot_after(),
            reboot_before: default_reboot_before(),
            skip_preconditions: false,
            step_allow_list: Vec::new(),
            step_deny_list: Vec::new(),
            health_checkers: default_health_checkers(),
            health_checker_deny_list: Vec::new(),
            drift_properties: Vec::new(),
            bugreport_on_failure: false,
            logcat_on_failure: false,
            screenshot_on_failure: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn reboot_interval(&self) -> Duration {
        Duration::from_secs(self.reboot_interval_mins * 60)
    }

    pub fn reboot_wait(&self) -> Duration {
        Duration::from_secs(self.reboot_wait_secs)
    }

    /// Returns `true` if the named step may run under the allow/deny lists.
    pub fn step_allowed(&self, name: &str) -> bool {
        let allowed = self.step_allow_list.is_empty()
            || self.step_allow_list.iter().any(|s| s == name);
        allowed && !self.step_deny_list.iter().any(|s| s == name)
    }

    /// Returns the health checker names left after the deny list.
    pub fn enabled_health_checkers(&self) -> Vec<&str> {
        self.health_checkers
            .iter()
            .filter(|name| !self.health_checker_deny_list.contains(name))
            .map(String::as_str)
            .collect()
    }

    /// Returns `true` if any per-failure capture is enabled.
    pub fn captures_on_failure(&self) -> bool {
        self.bugreport_on_failure || self.logcat_on_failure || self.screenshot_on_failure
    }
}

fn default_min_pre_reboot_modules() -> usize {
    2
}

fn default_reboot_interval() -> u64 {
    30
}

fn default_reboot_wait() -> u64 {
    120
}

fn default_reboot_after() -> Vec<String> {
    [
        "CtsMediaTestCases",
        "CtsAccessibilityTestCases",
        "CtsAccountManagerTestCases",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_reboot_before() -> Vec<String> {
    [
        "CtsAnimationTestCases",
        "CtsGraphicsTestCases",
        "CtsViewTestCases",
        "CtsWidgetTestCases",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_health_checkers() -> Vec<String> {
    vec!["boot-completed".to_string()]
}

/// Configuration for test result reporting.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files and failure artifacts are written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to generate a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report, relative to `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
