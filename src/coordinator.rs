//! Per-device shard driver.
//!
//! One [`ShardCoordinator`] runs per device. It pulls the device's modules
//! from the shared [`ModuleRepository`] and runs them one at a time, in
//! the order the repository returned them.
//!
//! ```text
//!   initialize (once) ─► get_modules(serial)
//!                               │
//!                     pre-run reboot?
//!                               │
//!        ┌──────────── for each module ────────────┐
//!        │ health pre ─► preconditions ─► setup    │
//!        │      ─► run ─► teardown (reverse)       │
//!        │      ─► runtime check ─► health post    │
//!        │      ─► reboot between modules?         │
//!        └─────────────────────────────────────────┘
//!                               │
//!                          ShardReport
//! ```
//!
//! # Failure handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Health checker | bugreport captured, shard continues |
//! | Secondary setup step ([`SetupError::Build`]) | logged, module still runs |
//! | Required setup step ([`SetupError::Target`]) | fatal to the shard |
//! | Device unresponsive, recovered | logged, next module runs |
//! | Any other executor error | fatal to the shard |
//! | Reboot | fatal to the shard |

pub mod health;
pub mod reboot;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::CoordinatorConfig;
use crate::device::{Device, DeviceError};
use crate::module::loader::ModuleLoader;
use crate::module::{ExecutorError, ModuleDescriptor, SetupError, SetupStep, TestResult};
use crate::repository::{InitRequest, ModuleRepository, RepositoryError};
use health::{HealthChecker, checkers_for};
use reboot::RebootPolicy;

/// Allowed divergence between a module's runtime hint and its actual runtime.
const RUNTIME_TOLERANCE_PERCENT: u32 = 10;

/// Result type for shard runs.
pub type ShardResult<T> = Result<T, ShardError>;

/// Errors that end a shard early.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Setup of {module} failed: {source}")]
    Setup { module: String, source: SetupError },

    #[error("{module} failed: {source}")]
    Executor { module: String, source: ExecutorError },

    #[error("Reboot failed: {0}")]
    Reboot(#[from] DeviceError),
}

/// What happened to one module on a shard.
#[derive(Debug, Clone)]
pub struct ModuleRun {
    pub module_id: String,
    pub display_name: String,
    pub results: Vec<TestResult>,
    pub duration: Duration,
    /// Set when the module could not run to completion.
    pub error: Option<String>,
}

impl ModuleRun {
    fn new(module: &ModuleDescriptor) -> Self {
        Self {
            module_id: module.id.clone(),
            display_name: module.display_name(),
            results: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.results.iter().all(|r| r.outcome.is_success())
    }
}

/// Outcome of one shard.
#[derive(Debug, Clone)]
pub struct ShardReport {
    pub serial: String,
    pub runs: Vec<ModuleRun>,
    /// Set when the shard stopped on a fatal error.
    pub error: Option<String>,
}

impl ShardReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.runs.iter().all(ModuleRun::is_success)
    }
}

/// Drives the modules of one device.
pub struct ShardCoordinator<'a> {
    repository: Arc<ModuleRepository>,
    request: &'a InitRequest,
    loader: &'a dyn ModuleLoader,
    config: &'a CoordinatorConfig,
    artifact_dir: PathBuf,
}

impl<'a> ShardCoordinator<'a> {
    pub fn new(
        repository: Arc<ModuleRepository>,
        request: &'a InitRequest,
        loader: &'a dyn ModuleLoader,
        config: &'a CoordinatorConfig,
    ) -> Self {
        Self {
            repository,
            request,
            loader,
            config,
            artifact_dir: PathBuf::from("artifacts"),
        }
    }

    /// Sets the root directory for diagnostic captures.
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    /// Runs the shard to completion on `device`.
    pub async fn run(&self, device: &dyn Device) -> ShardReport {
        let mut report = ShardReport {
            serial: device.serial().to_string(),
            runs: Vec::new(),
            error: None,
        };
        if let Err(e) = self.run_modules(device, &mut report.runs).await {
            error!("Shard {} aborted: {}", report.serial, e);
            report.error = Some(e.to_string());
        }
        report
    }

    async fn run_modules(&self, device: &dyn Device, runs: &mut Vec<ModuleRun>) -> ShardResult<()> {
        self.repository.initialize(self.request, self.loader)?;
        let modules = self.repository.get_modules(device.serial())?;
        info!("Shard {} assigned {} modules", device.serial(), modules.len());

        let policy = RebootPolicy::from_config(self.config);
        let mut last_reboot = Instant::now();
        if policy.before_run(device, &modules) {
            self.reboot(device, &policy, "before first module").await?;
            last_reboot = Instant::now();
        }

        let checkers = checkers_for(self.config);
        let artifacts = Artifacts::new(&self.artifact_dir, device.serial());

        for (index, module) in modules.iter().enumerate() {
            self.health_check(device, &checkers, &artifacts, module, Phase::Pre).await;

            let mut run = ModuleRun::new(module);
            let started = Instant::now();
            let outcome = self.run_module(device, module, &mut run).await;
            run.duration = started.elapsed();
            check_runtime(module, run.duration);

            self.capture_failures(device, &artifacts, &run).await;
            runs.push(run);
            outcome?;

            self.health_check(device, &checkers, &artifacts, module, Phase::Post).await;

            if let Some(next) = modules.get(index + 1)
                && let Some(reason) =
                    policy.between(device, &module.name, &next.name, last_reboot.elapsed())
            {
                self.reboot(device, &policy, &reason.to_string()).await?;
                last_reboot = Instant::now();
            }
        }
        Ok(())
    }

    async fn reboot(&self, device: &dyn Device, policy: &RebootPolicy, reason: &str) -> ShardResult<()> {
        info!("Rebooting {} ({})", device.serial(), reason);
        device.reboot().await?;
        if !policy.wait().is_zero() {
            tokio::time::sleep(policy.wait()).await;
        }
        Ok(())
    }

    /// Runs one module; steps that were set up are always torn down.
    async fn run_module(
        &self,
        device: &dyn Device,
        module: &ModuleDescriptor,
        run: &mut ModuleRun,
    ) -> ShardResult<()> {
        info!("Running {} on {}", module.display_name(), device.serial());
        let mut prepared: Vec<&str> = Vec::new();

        let outcome = self.prepare_and_execute(device, module, run, &mut prepared).await;
        if let Err(e) = &outcome
            && run.error.is_none()
        {
            run.error = Some(e.to_string());
        }

        for step in module
            .teardown_steps()
            .filter(|s| prepared.contains(&s.name.as_str()))
        {
            if let Some(preparer) = &step.preparer
                && let Err(e) = preparer
                    .tear_down(device, &step.name, module.step_context())
                    .await
            {
                warn!(module = %module.id, step = %step.name, "Teardown failed: {}", e);
            }
        }

        outcome
    }

    async fn prepare_and_execute<'m>(
        &self,
        device: &dyn Device,
        module: &'m ModuleDescriptor,
        run: &mut ModuleRun,
        prepared: &mut Vec<&'m str>,
    ) -> ShardResult<()> {
        let preconditions = module
            .precondition_steps()
            .filter(|_| !self.config.skip_preconditions);
        for step in preconditions.chain(module.setup_steps()) {
            if self.set_up(device, module, step, run).await? {
                prepared.push(step.name.as_str());
            }
        }

        match module.executor.run(device).await {
            Ok(results) => {
                run.results = results;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!(module = %module.id, serial = %device.serial(), "{}", e);
                run.error = Some(e.to_string());
                Ok(())
            }
            Err(e) => Err(ShardError::Executor {
                module: module.display_name(),
                source: e,
            }),
        }
    }

    /// Returns `true` if the step ran and succeeded.
    async fn set_up(
        &self,
        device: &dyn Device,
        module: &ModuleDescriptor,
        step: &SetupStep,
        run: &mut ModuleRun,
    ) -> ShardResult<bool> {
        let Some(preparer) = &step.preparer else {
            return Ok(false);
        };
        if !self.config.step_allowed(&step.name) {
            info!("Skipping step {} for {}", step.name, module.display_name());
            return Ok(false);
        }

        match preparer.set_up(device, &step.name, module.step_context()).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_recoverable() => {
                warn!(module = %module.id, step = %step.name, "Setup failed: {}", e);
                Ok(false)
            }
            Err(e) => {
                run.error = Some(e.to_string());
                Err(ShardError::Setup {
                    module: module.display_name(),
                    source: e,
                })
            }
        }
    }

    async fn health_check(
        &self,
        device: &dyn Device,
        checkers: &[Box<dyn HealthChecker>],
        artifacts: &Artifacts,
        module: &ModuleDescriptor,
        phase: Phase,
    ) {
        for checker in checkers {
            let result = match phase {
                Phase::Pre => checker.pre_module(device).await,
                Phase::Post => checker.post_module(device).await,
            };
            if let Err(e) = result {
                warn!(
                    module = %module.id,
                    serial = %device.serial(),
                    checker = checker.name(),
                    "Health check {} module failed: {}",
                    phase.as_str(),
                    e
                );
                let label = format!("{}-{}", phase.as_str(), checker.name());
                match device.bugreport().await {
                    Ok(bytes) => artifacts.write(&module.id, &label, "bugreport.txt", &bytes),
                    Err(e) => warn!("Bugreport capture failed: {}", e),
                }
            }
        }
    }

    async fn capture_failures(&self, device: &dyn Device, artifacts: &Artifacts, run: &ModuleRun) {
        if !self.config.captures_on_failure() {
            return;
        }
        for result in run.results.iter().filter(|r| !r.outcome.is_success()) {
            let test = &result.test_id;
            if self.config.bugreport_on_failure {
                match device.bugreport().await {
                    Ok(bytes) => artifacts.write(&run.module_id, test, "bugreport.txt", &bytes),
                    Err(e) => warn!("Bugreport capture for {} failed: {}", test, e),
                }
            }
            if self.config.logcat_on_failure {
                match device.logcat().await {
                    Ok(bytes) => artifacts.write(&run.module_id, test, "logcat.txt", &bytes),
                    Err(e) => warn!("Logcat capture for {} failed: {}", test, e),
                }
            }
            if self.config.screenshot_on_failure {
                match device.screenshot().await {
                    Ok(bytes) => artifacts.write(&run.module_id, test, "screenshot.png", &bytes),
                    Err(e) => warn!("Screenshot capture for {} failed: {}", test, e),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Pre,
    Post,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "before",
            Phase::Post => "after",
        }
    }
}

fn check_runtime(module: &ModuleDescriptor, actual: Duration) {
    let hint = module.runtime_hint;
    if hint.is_zero() {
        return;
    }
    if actual.abs_diff(hint) * 100 > hint * RUNTIME_TOLERANCE_PERCENT {
        warn!(
            module = %module.id,
            "{} took {:.1}s, estimated {:.1}s",
            module.display_name(),
            actual.as_secs_f64(),
            hint.as_secs_f64()
        );
    }
}

/// Diagnostic capture files under `<root>/<serial>/<module>/`.
struct Artifacts {
    dir: PathBuf,
}

impl Artifacts {
    fn new(root: &Path, serial: &str) -> Self {
        Self {
            dir: root.join(sanitize(serial)),
        }
    }

    fn write(&self, module_id: &str, label: &str, suffix: &str, bytes: &[u8]) {
        let dir = self.dir.join(sanitize(module_id));
        let path = dir.join(format!("{}.{}", sanitize(label), suffix));
        let written = std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(&path, bytes));
        match written {
            Ok(()) => info!("Saved {}", path.display()),
            Err(e) => warn!("Failed to write {}: {}", path.display(), e),
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-#".contains(c) { c } else { '_' })
        .collect()
}
