//! Command-backed executors and setup steps.
//!
//! A module declared with `type = "command"` runs a host shell command per
//! module instance. The command usually drives a device-side runner (for
//! example `adb shell am instrument ...`) and may leave a JUnit XML file
//! behind for per-test results.
//!
//! # Placeholders
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{serial}` | device serial |
//! | `{module}` | module name |
//! | `{abi}` | architecture variant |
//! | `{shard_index}` | piece index, `0` when not split |
//! | `{shard_count}` | piece count, `1` when not split |
//! | `{work_dir}` | invocation scratch directory |
//! | `{include_filter_file}` | path of the include file, or empty |
//! | `{exclude_filter_file}` | path of the exclude file, or empty |
//! | `{include_filters}` | comma-separated include test names |
//! | `{exclude_filters}` | comma-separated exclude test names |
//!
//! # Result Parsing
//!
//! When `result_file` is set and the file exists after the run, every
//! `<testcase>` element becomes one [`TestResult`] with id
//! `classname#name`. Otherwise the exit code decides a single
//! `all_tests` result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    ExecutorError, ExecutorRecipe, ExecutorResult, InstantiateRequest, ModuleResult, Preparer,
    RemoteTestExecutor, SetupError, SetupResult, StepContext, TestOutcome, TestResult,
};
use crate::device::{BOOT_COMPLETED, Device};
use crate::filter::FilterFile;
use crate::options::ExecutorOptions;
use crate::shell::{ShellError, ShellRunner, render, substitute};

/// Time allowed for the post-timeout responsiveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a command executor ingests test filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Test names are written to scratch files.
    #[default]
    File,
    /// Test names are passed inline through placeholders.
    Args,
    /// The command cannot be filtered.
    None,
}

/// Declared settings of a command-backed module.
///
/// # Example
///
/// ```toml
/// [executor]
/// type = "command"
/// command = "run-suite --serial {serial} --abi {abi} --include-file {include_filter_file}"
/// result_file = "{work_dir}/{module}-{abi}-{shard_index}.xml"
/// timeout_secs = 1800
/// shardable = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandRecipeConfig {
    /// Shell command template.
    pub command: String,

    /// JUnit XML file template, read after the command exits.
    pub result_file: Option<String>,

    /// Maximum time one run may take, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub filter_mode: FilterMode,

    /// Whether the module may be split across shards.
    #[serde(default)]
    pub shardable: bool,

    /// Extra arguments appended to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Host directory the command runs in.
    pub working_dir: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    3600
}

/// Builds [`CommandExecutor`]s.
#[derive(Debug, Clone)]
pub struct CommandRecipe {
    config: CommandRecipeConfig,
}

impl CommandRecipe {
    pub fn new(config: CommandRecipeConfig) -> Self {
        Self { config }
    }
}

impl ExecutorRecipe for CommandRecipe {
    fn kind(&self) -> &str {
        "command"
    }

    fn base_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            runtime_hint: None,
            timeout: Some(Duration::from_secs(self.config.timeout_secs)),
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            shardable: Some(self.config.shardable),
        }
    }

    fn instantiate(&self, request: &InstantiateRequest<'_>) -> ModuleResult<Box<dyn RemoteTestExecutor>> {
        let options = request.options;
        Ok(Box::new(CommandExecutor {
            module: request.module.to_string(),
            variant: request.variant.to_string(),
            command: self.config.command.clone(),
            result_file: self.config.result_file.clone(),
            working_dir: self.config.working_dir.clone(),
            work_dir: request.context.work_dir.clone(),
            filter_mode: self.config.filter_mode,
            timeout: options
                .timeout
                .unwrap_or(Duration::from_secs(self.config.timeout_secs)),
            args: options.args.clone(),
            env: options.env.clone(),
            shardable: options.shardable.unwrap_or(self.config.shardable),
            piece: None,
            include_file: None,
            exclude_file: None,
            include_tests: Vec::new(),
            exclude_tests: Vec::new(),
        }))
    }
}

/// Runs one module instance as a host shell command.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    module: String,
    variant: String,
    command: String,
    result_file: Option<String>,
    working_dir: Option<PathBuf>,
    work_dir: PathBuf,
    filter_mode: FilterMode,
    timeout: Duration,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    shardable: bool,
    piece: Option<(usize, usize)>,
    include_file: Option<Arc<FilterFile>>,
    exclude_file: Option<Arc<FilterFile>>,
    include_tests: Vec<String>,
    exclude_tests: Vec<String>,
}

impl CommandExecutor {
    fn placeholders(&self, serial: &str) -> Vec<(&'static str, String)> {
        let (index, count) = self.piece.unwrap_or((0, 1));
        let file = |f: &Option<Arc<FilterFile>>| {
            f.as_ref()
                .map(|f| f.path().display().to_string())
                .unwrap_or_default()
        };
        vec![
            ("serial", serial.to_string()),
            ("module", self.module.clone()),
            ("abi", self.variant.clone()),
            ("shard_index", index.to_string()),
            ("shard_count", count.to_string()),
            ("work_dir", self.work_dir.display().to_string()),
            ("include_filter_file", file(&self.include_file)),
            ("exclude_filter_file", file(&self.exclude_file)),
            ("include_filters", self.include_tests.join(",")),
            ("exclude_filters", self.exclude_tests.join(",")),
        ]
    }

    fn render(&self, template: &str, values: &[(&'static str, String)]) -> String {
        let borrowed: Vec<(&str, &str)> = values.iter().map(|(k, v)| (*k, v.as_str())).collect();
        render(template, &borrowed)
    }

    fn result_path(&self, template: &str, values: &[(&'static str, String)]) -> PathBuf {
        let borrowed: Vec<(&str, &str)> = values.iter().map(|(k, v)| (*k, v.as_str())).collect();
        PathBuf::from(substitute(template, &borrowed))
    }

    fn failed(&self, message: impl Into<String>) -> ExecutorError {
        ExecutorError::Failed {
            module: self.module.clone(),
            message: message.into(),
        }
    }

    /// Distinguishes a hung command from a lost device.
    async fn probe_after_timeout(&self, device: &dyn Device) -> ExecutorError {
        let serial = device.serial().to_string();
        match tokio::time::timeout(PROBE_TIMEOUT, device.get_property(BOOT_COMPLETED)).await {
            Ok(Ok(_)) => ExecutorError::Unresponsive {
                serial,
                module: self.module.clone(),
            },
            Ok(Err(e)) => {
                warn!(serial = %serial, "Device probe failed after timeout: {}", e);
                ExecutorError::DeviceNotAvailable(serial)
            }
            Err(_) => ExecutorError::DeviceNotAvailable(serial),
        }
    }

    fn read_result_file(&self, path: &Path) -> Option<Vec<TestResult>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!("No result file at {}: {}", path.display(), e);
                return None;
            }
        };
        match parse_junit_xml(&content) {
            Ok(results) if !results.is_empty() => Some(results),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl RemoteTestExecutor for CommandExecutor {
    fn kind(&self) -> &str {
        "command"
    }

    fn supports_filter_file(&self) -> bool {
        self.filter_mode == FilterMode::File
    }

    fn supports_test_filters(&self) -> bool {
        self.filter_mode == FilterMode::Args
    }

    fn set_include_filter_file(&mut self, file: Arc<FilterFile>) {
        self.include_file = Some(file);
    }

    fn set_exclude_filter_file(&mut self, file: Arc<FilterFile>) {
        self.exclude_file = Some(file);
    }

    fn add_include_filter(&mut self, test: &str) {
        self.include_tests.push(test.to_string());
    }

    fn add_exclude_filter(&mut self, test: &str) {
        self.exclude_tests.push(test.to_string());
    }

    fn split(&self, count: usize) -> Option<Vec<Box<dyn RemoteTestExecutor>>> {
        if !self.shardable || count < 2 {
            return None;
        }
        Some(
            (0..count)
                .map(|index| {
                    let mut piece = self.clone();
                    piece.piece = Some((index, count));
                    Box::new(piece) as Box<dyn RemoteTestExecutor>
                })
                .collect(),
        )
    }

    async fn run(&self, device: &dyn Device) -> ExecutorResult<Vec<TestResult>> {
        let values = self.placeholders(device.serial());
        let mut command = self.render(&self.command, &values);
        if !self.args.is_empty() {
            command.push(' ');
            command.push_str(&shell_words::join(&self.args));
        }

        let mut runner = ShellRunner::new()
            .with_env(&self.env)
            .with_timeout(self.timeout);
        if let Some(dir) = &self.working_dir {
            runner = runner.with_working_dir(dir);
        }

        let output = match runner.run(&command).await {
            Ok(output) => output,
            Err(ShellError::Timeout(after)) => {
                warn!(
                    module = %self.module,
                    serial = %device.serial(),
                    "Module timed out after {:?}",
                    after
                );
                return Err(self.probe_after_timeout(device).await);
            }
            Err(e) => return Err(self.failed(e.to_string())),
        };

        if let Some(template) = &self.result_file {
            let path = self.result_path(template, &values);
            if let Some(results) = self.read_result_file(&path) {
                return Ok(results);
            }
        }

        let result = TestResult::new("all_tests", TestOutcome::Passed).with_duration(output.duration);
        if output.success() {
            Ok(vec![result])
        } else {
            let mut failed = TestResult {
                outcome: TestOutcome::Failed,
                ..result
            }
            .with_error(format!("Exit code: {}", output.exit_code));
            if !output.stderr.trim().is_empty() {
                failed = failed.with_stack_trace(output.stderr.trim());
            }
            Ok(vec![failed])
        }
    }
}

/// Runs setup and cleanup shell command templates for a step.
///
/// Placeholders: `{serial}`, `{module}` and `{abi}`.
#[derive(Debug, Clone)]
pub struct CommandPreparer {
    setup: Option<String>,
    cleanup: Option<String>,
    timeout: Duration,
    recoverable: bool,
}

impl CommandPreparer {
    /// Failures are [`SetupError::Build`] when `recoverable`, otherwise
    /// [`SetupError::Target`].
    pub fn new(setup: Option<String>, cleanup: Option<String>, timeout: Duration, recoverable: bool) -> Self {
        Self {
            setup,
            cleanup,
            timeout,
            recoverable,
        }
    }

    pub fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }

    async fn run(&self, template: Option<&str>, device: &dyn Device, step: &str, ctx: StepContext<'_>) -> SetupResult<()> {
        let Some(template) = template else {
            return Ok(());
        };
        let command = render(
            template,
            &[
                ("serial", device.serial()),
                ("module", ctx.module),
                ("abi", ctx.variant),
            ],
        );

        let message = match ShellRunner::new().with_timeout(self.timeout).run(&command).await {
            Ok(output) if output.success() => return Ok(()),
            Ok(output) => format!(
                "exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
            Err(e) => e.to_string(),
        };

        let step = step.to_string();
        Err(if self.recoverable {
            SetupError::Build { step, message }
        } else {
            SetupError::Target { step, message }
        })
    }
}

#[async_trait]
impl Preparer for CommandPreparer {
    async fn set_up(&self, device: &dyn Device, step: &str, ctx: StepContext<'_>) -> SetupResult<()> {
        self.run(self.setup.as_deref(), device, step, ctx).await
    }

    async fn tear_down(&self, device: &dyn Device, step: &str, ctx: StepContext<'_>) -> SetupResult<()> {
        self.run(self.cleanup.as_deref(), device, step, ctx).await
    }
}

/// Parses JUnit XML content into per-test results.
///
/// Regex-based; tolerant of attribute order and of unknown elements.
pub fn parse_junit_xml(content: &str) -> Result<Vec<TestResult>, regex::Error> {
    let testcase_re = Regex::new(r#"<testcase\b([^>]*?)(?:/>|>([\s\S]*?)</testcase>)"#)?;
    let attr_re = Regex::new(r#"([\w:.-]+)\s*=\s*"([^"]*)""#)?;
    let problem_re =
        Regex::new(r#"<(failure|error)\b([^>]*?)(?:/>|>([\s\S]*?)</(?:failure|error)>)"#)?;

    let attrs = |raw: &str| -> BTreeMap<String, String> {
        attr_re
            .captures_iter(raw)
            .map(|c| (c[1].to_string(), unescape(&c[2])))
            .collect()
    };

    let mut results = Vec::new();
    for cap in testcase_re.captures_iter(content) {
        let attributes = attrs(&cap[1]);
        let Some(name) = attributes.get("name") else {
            continue;
        };
        let test_id = match attributes.get("classname") {
            Some(class) if !class.is_empty() => format!("{}#{}", class, name),
            _ => name.clone(),
        };
        let seconds = attributes
            .get("time")
            .and_then(|t| t.parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t >= 0.0)
            .unwrap_or(0.0);
        let inner = cap.get(2).map(|m| m.as_str()).unwrap_or("");

        let mut result = TestResult::new(test_id, TestOutcome::Passed)
            .with_duration(Duration::from_secs_f64(seconds));

        if let Some(problem) = problem_re.captures(inner) {
            result.outcome = if &problem[1] == "failure" {
                TestOutcome::Failed
            } else {
                TestOutcome::Error
            };
            if let Some(message) = attrs(&problem[2]).remove("message") {
                result = result.with_error(message);
            }
            if let Some(body) = problem.get(3).map(|m| m.as_str().trim()).filter(|b| !b.is_empty()) {
                result = result.with_stack_trace(unescape(body));
            }
        } else if inner.contains("<skipped") {
            result.outcome = TestOutcome::Skipped;
        }

        results.push(result);
    }

    Ok(results)
}

fn unescape(raw: &str) -> String {
    quick_xml::escape::unescape(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
