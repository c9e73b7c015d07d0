//! One end-to-end run across every connected device.
//!
//! # Execution Flow
//!
//! 1. **Retry**: with `--retry`, rebuild the options from the stored record
//! 2. **Validation**: reject ambiguous selections and impossible shard counts
//! 3. **Variants**: resolve the architecture variants the devices can run
//! 4. **Sharding**: initialize one [`ModuleRepository`] (any failure here
//!    ends the run), then one [`ShardCoordinator`] per device, all running
//!    concurrently
//! 5. **Persistence**: merge shard reports into an [`InvocationRecord`],
//!    carry forward prior passes, save it and write JUnit XML

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use futures::future::try_join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::{ShardCoordinator, ShardReport};
use crate::device::Device;
use crate::device::command::CommandDevice;
use crate::module::InvocationContext;
use crate::module::loader::ModuleLoader;
use crate::options::{OptionsError, SchedulingOptions};
use crate::report::{JUnitReporter, exit_code};
use crate::repository::{InitRequest, ModuleRepository};
use crate::retry::RetryReconciler;
use crate::retry::store::{InvocationRecord, JsonResultStore, ResultStore};

/// Result of a finished invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub record: InvocationRecord,
    pub shards: Vec<ShardReport>,
}

impl InvocationOutcome {
    pub fn exit_code(&self) -> i32 {
        exit_code(&self.record, &self.shards)
    }
}

/// Builds a device handle for every configured device.
pub fn devices_from_config(config: &Config) -> Vec<Arc<dyn Device>> {
    config
        .devices
        .iter()
        .map(|device| {
            let commands = config.device_commands.merged(&device.commands);
            Arc::new(CommandDevice::new(device.serial.clone(), commands)) as Arc<dyn Device>
        })
        .collect()
}

/// Resolves the variants to run.
///
/// Requested variants must each be supported by at least one device; with
/// none requested, every variant any device supports runs.
pub async fn resolve_variants(requested: &[String], devices: &[Arc<dyn Device>]) -> Result<Vec<String>> {
    let per_device = try_join_all(devices.iter().map(|device| async move {
        device
            .abis()
            .await
            .with_context(|| format!("Failed to read ABIs of {}", device.serial()))
    }))
    .await?;

    let mut supported: Vec<String> = Vec::new();
    for abi in per_device.into_iter().flatten() {
        if !supported.contains(&abi) {
            supported.push(abi);
        }
    }

    if requested.is_empty() {
        if supported.is_empty() {
            bail!("No device reports a supported architecture");
        }
        return Ok(supported);
    }

    for variant in requested {
        if !supported.contains(variant) {
            bail!(
                "Architecture '{}' is not supported by any device (supported: {})",
                variant,
                supported.join(", ")
            );
        }
    }
    Ok(requested.to_vec())
}

/// A configured run, ready to execute.
pub struct Invocation {
    config: Config,
    options: SchedulingOptions,
    devices: Vec<Arc<dyn Device>>,
    loader: Arc<dyn ModuleLoader>,
    store: Arc<dyn ResultStore>,
}

impl Invocation {
    /// Creates an invocation over the configured devices and module files.
    pub fn new(config: Config, options: SchedulingOptions) -> Self {
        let devices = devices_from_config(&config);
        let loader: Arc<dyn ModuleLoader> = Arc::new(config.harness.module_loader());
        let store = Arc::new(JsonResultStore::new(config.harness.expanded_results_dir()));
        Self {
            config,
            options,
            devices,
            loader,
            store,
        }
    }

    /// Replaces the configured devices.
    pub fn with_devices(mut self, devices: Vec<Arc<dyn Device>>) -> Self {
        self.devices = devices;
        self
    }

    /// Replaces the module loader.
    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Runs every shard and persists the result.
    pub async fn run(&self) -> Result<InvocationOutcome> {
        self.options.validate()?;
        if self.devices.is_empty() {
            bail!("No devices configured");
        }

        let primary = &self.devices[0];
        let fingerprint = primary
            .build_fingerprint()
            .await
            .with_context(|| format!("Failed to read build fingerprint of {}", primary.serial()))?;

        let (options, prior) = match &self.options.retry {
            Some(id) => {
                let session = RetryReconciler::new(self.store.as_ref()).reconcile(id, &self.options, &fingerprint)?;
                (session.effective_options(), Some(session))
            }
            None => (self.options.clone(), None),
        };
        options.validate()?;

        let shard_count = options
            .shards
            .or(self.config.harness.shard_count)
            .unwrap_or(self.devices.len());
        if shard_count < 1 {
            return Err(OptionsError::ShardCount(shard_count).into());
        }
        if shard_count > self.devices.len() {
            bail!(
                "{} shards requested but only {} devices are connected",
                shard_count,
                self.devices.len()
            );
        }
        let devices = &self.devices[..shard_count];

        let requested_variants = if options.abis.is_empty() {
            &self.config.harness.architectures
        } else {
            &options.abis
        };
        let variants = resolve_variants(requested_variants, devices).await?;

        let started_at = Local::now();
        let id = self.store.allocate_id(&started_at)?;
        let run_dir = self.config.harness.expanded_results_dir().join(&id);
        info!(
            "Invocation {} on {} devices, variants {}",
            id,
            shard_count,
            variants.join(",")
        );

        let request = InitRequest {
            shard_count,
            source_dir: self.config.harness.expanded_source_dir(),
            variants,
            token_assignments: self.token_assignments(&options),
            test_args: options.test_args.clone(),
            module_args: options.module_args.clone(),
            include_filters: options.effective_include_filters(),
            exclude_filters: options.exclude_filters.clone(),
            context: InvocationContext {
                invocation_id: id.clone(),
                build_fingerprint: Some(fingerprint.clone()),
                work_dir: run_dir.join("work"),
            },
        };
        std::fs::create_dir_all(&request.context.work_dir)
            .with_context(|| format!("Failed to create {}", request.context.work_dir.display()))?;

        let repository = ModuleRepository::shared();
        repository
            .initialize(&request, self.loader.as_ref())
            .with_context(|| format!("Failed to load modules from {}", request.source_dir.display()))?;

        let shards = self
            .run_shards(repository, &request, devices, run_dir.join("artifacts"))
            .await;

        let command_line = match &prior {
            Some(session) => session.options.to_command_line(),
            None => options.to_command_line(),
        };
        let mut record = InvocationRecord::new(&id, &fingerprint, command_line, started_at.with_timezone(&Utc));
        for shard in &shards {
            for run in &shard.runs {
                record.record_results(&run.module_id, &run.results);
                record.add_runtime(&run.module_id, run.duration.as_millis() as u64);
                if let Some(error) = &run.error {
                    record.record_error(&run.module_id, error.as_str());
                }
            }
        }
        if let Some(session) = &prior {
            record.carry_forward_passed(&session.prior);
        }
        record.finished_at = Some(Utc::now());

        self.store.save(&record)?;
        if self.config.report.junit {
            let path = self.config.report.output_dir.join(&id).join(&self.config.report.junit_file);
            JUnitReporter::new(path).write(&record)?;
        }

        Ok(InvocationOutcome { record, shards })
    }

    /// Configured device tokens followed by `--token` assignments.
    fn token_assignments(&self, options: &SchedulingOptions) -> Vec<String> {
        self.config
            .devices
            .iter()
            .flat_map(|device| {
                device
                    .tokens
                    .iter()
                    .map(move |token| format!("{}:{}", device.serial, token))
            })
            .chain(options.tokens.iter().cloned())
            .collect()
    }

    async fn run_shards(
        &self,
        repository: Arc<ModuleRepository>,
        request: &InitRequest,
        devices: &[Arc<dyn Device>],
        artifact_dir: PathBuf,
    ) -> Vec<ShardReport> {
        let reports: Mutex<Vec<ShardReport>> = Mutex::new(Vec::with_capacity(devices.len()));

        tokio_scoped::scope(|scope| {
            for device in devices {
                let coordinator = ShardCoordinator::new(
                    repository.clone(),
                    request,
                    self.loader.as_ref(),
                    &self.config.coordinator,
                )
                .with_artifact_dir(artifact_dir.clone());
                let reports = &reports;

                scope.spawn(async move {
                    let report = coordinator.run(device.as_ref()).await;
                    if let Some(error) = &report.error {
                        warn!("Shard {} failed: {}", report.serial, error);
                    }
                    reports.lock().await.push(report);
                });
            }
        });

        let mut reports = reports.into_inner();
        reports.sort_by(|a, b| a.serial.cmp(&b.serial));
        reports
    }
}
