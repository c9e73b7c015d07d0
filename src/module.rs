//! Test modules: declarations, executors and the schedulable descriptor.
//!
//! A [`ModuleDeclaration`] is what the loader found on disk. The repository
//! turns each declaration into one [`ModuleDescriptor`] per architecture
//! variant (and per self-split piece), each carrying a ready-to-run
//! [`RemoteTestExecutor`].
//!
//! ```text
//! ModuleDeclaration ── × variant ──► ExecutorRecipe::instantiate
//!                                          │
//!                         filters + option overrides installed
//!                                          │
//!                             optional split(shard_count)
//!                                          │
//!                                          ▼
//!                              ModuleDescriptor (one per piece)
//! ```
//!
//! # Buckets
//!
//! | Bucket | Rule |
//! |--------|------|
//! | Token | declares at least one required capability token |
//! | Small | runtime hint < 2 min |
//! | Medium | runtime hint < 10 min |
//! | Large | everything else |

pub mod command;
pub mod loader;

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceError};
use crate::filter::{FilterError, FilterFile, module_id};
use crate::options::{ExecutorOptions, OptionsError};

/// Runtime assumed for modules that declare none.
pub const DEFAULT_RUNTIME_HINT: Duration = Duration::from_secs(60);

/// Modules shorter than this are small.
pub const SMALL_MODULE_LIMIT: Duration = Duration::from_secs(2 * 60);

/// Modules shorter than this (and not small) are medium.
pub const MEDIUM_MODULE_LIMIT: Duration = Duration::from_secs(10 * 60);

/// Modules that must run after everything else on their device, by rank.
///
/// These leave the device in a degraded state.
pub const RUN_LAST: &[(&str, u32)] = &[("CtsIncidentHostTestCases", 1)];

/// Returns the run-last rank of a module name; 0 when it is not listed.
pub fn run_last_rank(name: &str) -> u32 {
    RUN_LAST
        .iter()
        .find(|(listed, _)| *listed == name)
        .map(|(_, rank)| *rank)
        .unwrap_or(0)
}

/// Result type for module construction.
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Errors raised while loading or instantiating modules.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A declaration file could not be parsed.
    #[error("Failed to load module declaration {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// The executor accepts neither filter files nor per-test filters.
    #[error("Executor of module {module} supports neither filter files nor test filters")]
    UnsupportedFilters { module: String },

    /// The recipe could not build an executor.
    #[error("Failed to instantiate module {module}: {message}")]
    Instantiate { module: String, message: String },

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for executor runs.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors raised while a module runs on a device.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The device stopped responding during the run but was recovered.
    #[error("Device {serial} became unresponsive while running {module}; recovery succeeded")]
    Unresponsive { serial: String, module: String },

    /// The device is gone and could not be recovered.
    #[error("Device {0} not available")]
    DeviceNotAvailable(String),

    /// The executor itself could not run.
    #[error("Failed to run {module}: {message}")]
    Failed { module: String, message: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl ExecutorError {
    /// Returns `true` if the shard may proceed to its next module.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExecutorError::Unresponsive { .. })
    }
}

/// Result type for setup steps.
pub type SetupResult<T> = Result<T, SetupError>;

/// Errors raised by setup and teardown steps.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Secondary failure; logged and the module still runs.
    #[error("Step '{step}' failed: {message}")]
    Build { step: String, message: String },

    /// Required preparation failed; fatal to the shard.
    #[error("Required step '{step}' failed: {message}")]
    Target { step: String, message: String },
}

impl SetupError {
    /// Returns `true` for failures that do not stop the shard.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SetupError::Build { .. })
    }
}

/// The outcome status of a single test.
///
/// | Outcome | Description | Fails the run? |
/// |---------|-------------|----------------|
/// | Passed | Test assertions succeeded | No |
/// | Failed | Test assertions failed | Yes |
/// | Skipped | Test was not run | No |
/// | Error | Test crashed or could not complete | Yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestOutcome {
    /// Returns `true` for outcomes that do not fail the run.
    ///
    /// ```
    /// use modshard::module::TestOutcome;
    ///
    /// assert!(TestOutcome::Passed.is_success());
    /// assert!(TestOutcome::Skipped.is_success());
    /// assert!(!TestOutcome::Error.is_success());
    /// ```
    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed | TestOutcome::Skipped)
    }
}

/// Result of one test inside a module run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name inside the module, e.g. `android.foo.FooTest#testBar`.
    pub test_id: String,

    pub outcome: TestOutcome,

    /// Wall-clock time the test took.
    #[serde(default)]
    pub duration: Duration,

    /// Assertion message or exception description for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Stack trace or captured output for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl TestResult {
    pub fn new(test_id: impl Into<String>, outcome: TestOutcome) -> Self {
        Self {
            test_id: test_id.into(),
            outcome,
            duration: Duration::ZERO,
            error_message: None,
            stack_trace: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Executes the tests of one module instance against a device.
///
/// Filters are installed once, right after construction; afterwards the
/// executor is shared immutably and only [`run`](Self::run) is called.
/// An executor must accept filters through at least one of the two
/// ingestion paths.
#[async_trait]
pub trait RemoteTestExecutor: Send + Sync + fmt::Debug {
    /// Executor kind, used as the target of `--test-arg` overrides.
    fn kind(&self) -> &str;

    /// Whether the executor reads test names from filter files.
    fn supports_filter_file(&self) -> bool {
        false
    }

    /// Whether the executor accepts test names one at a time.
    fn supports_test_filters(&self) -> bool {
        false
    }

    fn set_include_filter_file(&mut self, _file: Arc<FilterFile>) {}

    fn set_exclude_filter_file(&mut self, _file: Arc<FilterFile>) {}

    fn add_include_filter(&mut self, _test: &str) {}

    fn add_exclude_filter(&mut self, _test: &str) {}

    /// Splits the executor into `count` independent pieces.
    ///
    /// Returns `None` when the executor cannot split itself.
    fn split(&self, _count: usize) -> Option<Vec<Box<dyn RemoteTestExecutor>>> {
        None
    }

    /// Runs the module and returns one result per executed test.
    async fn run(&self, device: &dyn Device) -> ExecutorResult<Vec<TestResult>>;
}

/// Identity of the invocation modules are instantiated for.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub invocation_id: String,

    /// Fingerprint of the build under test, when known.
    pub build_fingerprint: Option<String>,

    /// Scratch directory executors may write result files into.
    pub work_dir: PathBuf,
}

/// Everything a recipe needs to build one executor.
#[derive(Debug)]
pub struct InstantiateRequest<'a> {
    pub module: &'a str,
    pub variant: &'a str,
    pub options: &'a ExecutorOptions,
    pub context: &'a InvocationContext,
}

/// Builds executors for one declared module.
pub trait ExecutorRecipe: Send + Sync + fmt::Debug {
    /// Executor kind, used as the target of `--test-arg` overrides.
    fn kind(&self) -> &str;

    /// Options declared by the module itself, before overrides.
    fn base_options(&self) -> ExecutorOptions {
        ExecutorOptions::default()
    }

    fn instantiate(&self, request: &InstantiateRequest<'_>) -> ModuleResult<Box<dyn RemoteTestExecutor>>;
}

/// The module instance a setup step is run for.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub module: &'a str,
    pub variant: &'a str,
}

/// Prepares a device before a module and cleans up after it.
#[async_trait]
pub trait Preparer: Send + Sync + fmt::Debug {
    async fn set_up(&self, device: &dyn Device, step: &str, ctx: StepContext<'_>) -> SetupResult<()>;

    async fn tear_down(&self, device: &dyn Device, step: &str, ctx: StepContext<'_>) -> SetupResult<()>;
}

/// What a setup step is, decided once when the declaration is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Checks or prepares device state; failures are usually secondary.
    Precondition,
    /// Declares capability tokens the device must hold.
    TokenRequirement(BTreeSet<String>),
    /// Regular preparation.
    Ordinary,
}

/// One declared setup step.
#[derive(Debug, Clone)]
pub struct SetupStep {
    /// Canonical name, matched against the step allow/deny lists.
    pub name: String,
    pub kind: StepKind,
    /// Whether the step also tears down after the module.
    pub cleanup: bool,
    pub preparer: Option<Arc<dyn Preparer>>,
}

impl SetupStep {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            cleanup: false,
            preparer: None,
        }
    }

    pub fn with_preparer(mut self, preparer: Arc<dyn Preparer>, cleanup: bool) -> Self {
        self.preparer = Some(preparer);
        self.cleanup = cleanup;
        self
    }

    pub fn is_precondition(&self) -> bool {
        self.kind == StepKind::Precondition
    }
}

/// A module as declared in the source directory.
#[derive(Debug, Clone)]
pub struct ModuleDeclaration {
    pub name: String,

    /// Variants the module may run on; empty means all active variants.
    pub variants: Vec<String>,

    pub runtime_hint: Option<Duration>,

    pub steps: Vec<SetupStep>,

    pub recipe: Arc<dyn ExecutorRecipe>,
}

impl ModuleDeclaration {
    pub fn new(name: impl Into<String>, recipe: Arc<dyn ExecutorRecipe>) -> Self {
        Self {
            name: name.into(),
            variants: Vec::new(),
            runtime_hint: None,
            steps: Vec::new(),
            recipe,
        }
    }

    pub fn with_runtime_hint(mut self, hint: Duration) -> Self {
        self.runtime_hint = Some(hint);
        self
    }

    pub fn with_variants(mut self, variants: Vec<String>) -> Self {
        self.variants = variants;
        self
    }

    pub fn with_step(mut self, step: SetupStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Union of the tokens named by every token-requirement step.
    pub fn required_tokens(&self) -> BTreeSet<String> {
        required_tokens(&self.steps)
    }

    /// Returns `true` if the module may run on `variant`.
    pub fn supports_variant(&self, variant: &str) -> bool {
        self.variants.is_empty() || self.variants.iter().any(|v| v == variant)
    }
}

fn required_tokens(steps: &[SetupStep]) -> BTreeSet<String> {
    steps
        .iter()
        .filter_map(|step| match &step.kind {
            StepKind::TokenRequirement(tokens) => Some(tokens.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Size bucket of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Token,
    Small,
    Medium,
    Large,
}

impl Bucket {
    /// Token-gated descriptors never land in a size bucket.
    pub fn classify(required_tokens: &BTreeSet<String>, runtime_hint: Duration) -> Self {
        if !required_tokens.is_empty() {
            Bucket::Token
        } else if runtime_hint < SMALL_MODULE_LIMIT {
            Bucket::Small
        } else if runtime_hint < MEDIUM_MODULE_LIMIT {
            Bucket::Medium
        } else {
            Bucket::Large
        }
    }
}

/// The schedulable view of one module instance.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    /// `"<variant> <name>"`; shared by every piece of a split module.
    pub id: String,
    pub name: String,
    pub variant: String,
    /// `(index, count)` when the executor was split.
    pub piece: Option<(usize, usize)>,
    pub runtime_hint: Duration,
    pub required_tokens: BTreeSet<String>,
    pub steps: Arc<[SetupStep]>,
    pub executor: Arc<dyn RemoteTestExecutor>,
    run_last_rank: u32,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        variant: impl Into<String>,
        runtime_hint: Duration,
        steps: Arc<[SetupStep]>,
        executor: Arc<dyn RemoteTestExecutor>,
    ) -> Self {
        let name = name.into();
        let variant = variant.into();
        let required_tokens = required_tokens(&steps);
        Self {
            id: module_id(&variant, &name),
            run_last_rank: run_last_rank(&name),
            name,
            variant,
            piece: None,
            runtime_hint,
            required_tokens,
            steps,
            executor,
        }
    }

    pub fn with_piece(mut self, index: usize, count: usize) -> Self {
        self.piece = Some((index, count));
        self
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::classify(&self.required_tokens, self.runtime_hint)
    }

    /// Ascending sort key: run-last rank, then longest runtime first.
    pub fn order_key(&self) -> (u32, Reverse<Duration>) {
        (self.run_last_rank, Reverse(self.runtime_hint))
    }

    /// Id plus piece number, for logs.
    pub fn display_name(&self) -> String {
        match self.piece {
            Some((index, count)) => format!("{} [{}/{}]", self.id, index + 1, count),
            None => self.id.clone(),
        }
    }

    pub fn precondition_steps(&self) -> impl Iterator<Item = &SetupStep> {
        self.steps.iter().filter(|s| s.is_precondition())
    }

    /// Non-precondition steps with a preparer, in declaration order.
    pub fn setup_steps(&self) -> impl Iterator<Item = &SetupStep> {
        self.steps
            .iter()
            .filter(|s| !s.is_precondition() && s.preparer.is_some())
    }

    /// Cleanup-capable steps, in reverse declaration order.
    pub fn teardown_steps(&self) -> impl Iterator<Item = &SetupStep> {
        self.steps.iter().rev().filter(|s| s.cleanup && s.preparer.is_some())
    }

    pub fn step_context(&self) -> StepContext<'_> {
        StepContext {
            module: &self.name,
            variant: &self.variant,
        }
    }
}

/// Orders descriptors for execution on one device.
pub fn sort_for_execution(modules: &mut [ModuleDescriptor]) {
    modules.sort_by_key(ModuleDescriptor::order_key);
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executors, recipes, preparers and devices for unit tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::device::DeviceResult;

    /// What a fake executor does when run.
    #[derive(Debug, Clone)]
    pub enum Script {
        Results(Vec<TestResult>),
        Unresponsive,
        DeviceLost,
    }

    #[derive(Debug, Clone)]
    pub struct FakeExecutor {
        pub module: String,
        pub script: Script,
        pub file_filters: bool,
        pub test_filters: bool,
        pub splittable: bool,
        pub includes: Vec<String>,
        pub excludes: Vec<String>,
        pub include_file: Option<Arc<FilterFile>>,
        pub exclude_file: Option<Arc<FilterFile>>,
    }

    #[async_trait]
    impl RemoteTestExecutor for FakeExecutor {
        fn kind(&self) -> &str {
            "fake"
        }

        fn supports_filter_file(&self) -> bool {
            self.file_filters
        }

        fn supports_test_filters(&self) -> bool {
            self.test_filters
        }

        fn set_include_filter_file(&mut self, file: Arc<FilterFile>) {
            self.include_file = Some(file);
        }

        fn set_exclude_filter_file(&mut self, file: Arc<FilterFile>) {
            self.exclude_file = Some(file);
        }

        fn add_include_filter(&mut self, test: &str) {
            self.includes.push(test.to_string());
        }

        fn add_exclude_filter(&mut self, test: &str) {
            self.excludes.push(test.to_string());
        }

        fn split(&self, count: usize) -> Option<Vec<Box<dyn RemoteTestExecutor>>> {
            if !self.splittable || count < 2 {
                return None;
            }
            Some(
                (0..count)
                    .map(|_| Box::new(self.clone()) as Box<dyn RemoteTestExecutor>)
                    .collect(),
            )
        }

        async fn run(&self, device: &dyn Device) -> ExecutorResult<Vec<TestResult>> {
            match &self.script {
                Script::Results(results) => Ok(results.clone()),
                Script::Unresponsive => Err(ExecutorError::Unresponsive {
                    serial: device.serial().to_string(),
                    module: self.module.clone(),
                }),
                Script::DeviceLost => Err(ExecutorError::DeviceNotAvailable(
                    device.serial().to_string(),
                )),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct FakeRecipe {
        pub script: Script,
        pub file_filters: bool,
        pub test_filters: bool,
        pub splittable: bool,
    }

    impl FakeRecipe {
        pub fn passing(tests: &[&str]) -> Self {
            Self {
                script: Script::Results(
                    tests
                        .iter()
                        .map(|t| TestResult::new(*t, TestOutcome::Passed))
                        .collect(),
                ),
                file_filters: true,
                test_filters: false,
                splittable: false,
            }
        }

        pub fn with_script(mut self, script: Script) -> Self {
            self.script = script;
            self
        }
    }

    impl ExecutorRecipe for FakeRecipe {
        fn kind(&self) -> &str {
            "fake"
        }

        fn instantiate(&self, request: &InstantiateRequest<'_>) -> ModuleResult<Box<dyn RemoteTestExecutor>> {
            Ok(Box::new(FakeExecutor {
                module: request.module.to_string(),
                script: self.script.clone(),
                file_filters: self.file_filters,
                test_filters: self.test_filters,
                splittable: self.splittable,
                includes: Vec::new(),
                excludes: Vec::new(),
                include_file: None,
                exclude_file: None,
            }))
        }
    }

    /// Declaration with the given hint, running `tests` that all pass.
    pub fn declaration(name: &str, hint_secs: u64) -> ModuleDeclaration {
        ModuleDeclaration::new(name, Arc::new(FakeRecipe::passing(&["T#a"])))
            .with_runtime_hint(Duration::from_secs(hint_secs))
    }

    pub fn token_step(tokens: &[&str]) -> SetupStep {
        SetupStep::new(
            "token-requirement",
            StepKind::TokenRequirement(tokens.iter().map(|t| t.to_string()).collect()),
        )
    }

    /// Records every step it runs; fails with the configured error.
    #[derive(Debug, Default)]
    pub struct RecordingPreparer {
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_with: Option<fn(String) -> SetupError>,
    }

    #[async_trait]
    impl Preparer for RecordingPreparer {
        async fn set_up(&self, _device: &dyn Device, step: &str, _ctx: StepContext<'_>) -> SetupResult<()> {
            self.log.lock().unwrap().push(format!("setup:{step}"));
            match self.fail_with {
                Some(make) => Err(make(step.to_string())),
                None => Ok(()),
            }
        }

        async fn tear_down(&self, _device: &dyn Device, step: &str, _ctx: StepContext<'_>) -> SetupResult<()> {
            self.log.lock().unwrap().push(format!("teardown:{step}"));
            Ok(())
        }
    }

    /// In-memory device with settable properties.
    #[derive(Debug, Default)]
    pub struct FakeDevice {
        pub serial: String,
        pub properties: Mutex<HashMap<String, String>>,
        pub reboots: Mutex<usize>,
        pub captures: Mutex<Vec<&'static str>>,
    }

    impl FakeDevice {
        pub fn new(serial: &str) -> Self {
            let device = Self {
                serial: serial.to_string(),
                ..Default::default()
            };
            device.set_property(crate::device::BOOT_COMPLETED, "1");
            device.set_property(crate::device::BUILD_FINGERPRINT, "fake/build:1");
            device.set_property(crate::device::ABI_LIST, "arm64-v8a,armeabi-v7a");
            device
        }

        pub fn set_property(&self, key: &str, value: &str) {
            self.properties
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        pub fn reboot_count(&self) -> usize {
            *self.reboots.lock().unwrap()
        }
    }

    #[async_trait]
    impl Device for FakeDevice {
        fn serial(&self) -> &str {
            &self.serial
        }

        async fn get_property(&self, key: &str) -> DeviceResult<String> {
            Ok(self
                .properties
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or_default())
        }

        async fn reboot(&self) -> DeviceResult<()> {
            *self.reboots.lock().unwrap() += 1;
            Ok(())
        }

        async fn bugreport(&self) -> DeviceResult<Vec<u8>> {
            self.captures.lock().unwrap().push("bugreport");
            Ok(b"bugreport".to_vec())
        }

        async fn logcat(&self) -> DeviceResult<Vec<u8>> {
            self.captures.lock().unwrap().push("logcat");
            Ok(b"logcat".to_vec())
        }

        async fn screenshot(&self) -> DeviceResult<Vec<u8>> {
            self.captures.lock().unwrap().push("screenshot");
            Ok(b"png".to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn descriptor(name: &str, hint_secs: u64) -> ModuleDescriptor {
        let executor = FakeRecipe::passing(&[])
            .instantiate(&InstantiateRequest {
                module: name,
                variant: "arm64-v8a",
                options: &ExecutorOptions::default(),
                context: &InvocationContext::default(),
            })
            .unwrap();
        ModuleDescriptor::new(
            name,
            "arm64-v8a",
            Duration::from_secs(hint_secs),
            Arc::from(Vec::new()),
            Arc::from(executor),
        )
    }

    #[test]
    fn test_bucket_boundaries() {
        let none = BTreeSet::new();
        assert_eq!(Bucket::classify(&none, Duration::from_secs(60)), Bucket::Small);
        assert_eq!(Bucket::classify(&none, Duration::from_secs(120)), Bucket::Medium);
        assert_eq!(Bucket::classify(&none, Duration::from_secs(599)), Bucket::Medium);
        assert_eq!(Bucket::classify(&none, Duration::from_secs(600)), Bucket::Large);

        let sim: BTreeSet<String> = ["sim".to_string()].into();
        assert_eq!(Bucket::classify(&sim, Duration::from_secs(1)), Bucket::Token);
    }

    #[test]
    fn test_longer_runtime_sorts_first() {
        let mut modules = vec![
            descriptor("Short", 30),
            descriptor("Long", 900),
            descriptor("Mid", 300),
        ];
        sort_for_execution(&mut modules);
        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Long", "Mid", "Short"]);
    }

    #[test]
    fn test_run_last_modules_sort_after_everything() {
        let mut modules = vec![
            descriptor("CtsIncidentHostTestCases", 5000),
            descriptor("Quick", 1),
        ];
        sort_for_execution(&mut modules);
        assert_eq!(modules[0].name, "Quick");
        assert_eq!(modules[1].name, "CtsIncidentHostTestCases");
    }

    #[test]
    fn test_required_tokens_union() {
        let declaration = declaration("CtsFoo", 60)
            .with_step(token_step(&["sim"]))
            .with_step(SetupStep::new("push", StepKind::Ordinary))
            .with_step(token_step(&["nfc", "sim"]));
        let tokens: Vec<_> = declaration.required_tokens().into_iter().collect();
        assert_eq!(tokens, vec!["nfc", "sim"]);
    }

    #[test]
    fn test_teardown_steps_are_reversed() {
        let preparer: Arc<dyn Preparer> = Arc::new(RecordingPreparer::default());
        let steps: Arc<[SetupStep]> = Arc::from(vec![
            SetupStep::new("first", StepKind::Ordinary).with_preparer(preparer.clone(), true),
            SetupStep::new("check", StepKind::Precondition).with_preparer(preparer.clone(), false),
            SetupStep::new("second", StepKind::Ordinary).with_preparer(preparer.clone(), true),
            SetupStep::new("third", StepKind::Ordinary).with_preparer(preparer, false),
        ]);
        let mut module = descriptor("CtsFoo", 60);
        module.steps = steps;

        let setup: Vec<_> = module.setup_steps().map(|s| s.name.as_str()).collect();
        let teardown: Vec<_> = module.teardown_steps().map(|s| s.name.as_str()).collect();
        let preconditions: Vec<_> = module.precondition_steps().map(|s| s.name.as_str()).collect();
        assert_eq!(setup, vec!["first", "second", "third"]);
        assert_eq!(teardown, vec!["second", "first"]);
        assert_eq!(preconditions, vec!["check"]);
    }

    #[test]
    fn test_display_name_includes_piece() {
        let module = descriptor("CtsFoo", 60).with_piece(1, 3);
        assert_eq!(module.display_name(), "arm64-v8a CtsFoo [2/3]");
        assert_eq!(module.id, "arm64-v8a CtsFoo");
    }
}
