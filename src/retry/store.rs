//! Persisted invocation records.
//!
//! Every run leaves one [`InvocationRecord`] behind, keyed by its
//! invocation id. A retry session loads the record of the run it retries.
//!
//! [`JsonResultStore`] keeps records under
//! `{results_dir}/{invocation_id}/result.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::module::{TestOutcome, TestResult};

/// Format of generated invocation ids.
pub const INVOCATION_ID_FORMAT: &str = "%Y.%m.%d_%H.%M.%S";

const RECORD_FILE: &str = "result.json";

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by result stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid record {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Generates an invocation id from a start time.
///
/// ```
/// use chrono::TimeZone;
/// use modshard::retry::store::invocation_id;
///
/// let start = chrono::Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();
/// assert_eq!(invocation_id(&start), "2024.03.07_09.05.00");
/// ```
pub fn invocation_id(started_at: &DateTime<Local>) -> String {
    started_at.format(INVOCATION_ID_FORMAT).to_string()
}

/// Per-module results of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Results keyed by test name.
    #[serde(default)]
    pub tests: BTreeMap<String, TestResult>,

    /// Module-level failure that stopped the module early, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Total wall-clock time spent running the module.
    #[serde(default)]
    pub runtime_ms: u64,
}

impl ModuleRecord {
    /// Returns `true` when every test succeeded and the module finished.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.tests.values().all(|t| t.outcome.is_success())
    }

    /// Names of the tests that passed.
    pub fn passed_tests(&self) -> impl Iterator<Item = &str> {
        self.tests
            .iter()
            .filter(|(_, result)| result.outcome == TestOutcome::Passed)
            .map(|(name, _)| name.as_str())
    }
}

/// Everything persisted about one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub invocation_id: String,

    pub build_fingerprint: String,

    /// Scheduling options as given, re-parseable by a retry.
    pub command_line: String,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Invocation this one retried, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,

    /// Results keyed by module id (`"<variant> <name>"`).
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleRecord>,
}

impl InvocationRecord {
    pub fn new(
        invocation_id: impl Into<String>,
        build_fingerprint: impl Into<String>,
        command_line: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            build_fingerprint: build_fingerprint.into(),
            command_line: command_line.into(),
            started_at,
            finished_at: None,
            retry_of: None,
            modules: BTreeMap::new(),
        }
    }

    /// Merges results of one module run; later results replace earlier ones.
    pub fn record_results(&mut self, module_id: &str, results: &[TestResult]) {
        let record = self.modules.entry(module_id.to_string()).or_default();
        for result in results {
            record.tests.insert(result.test_id.clone(), result.clone());
        }
    }

    /// Records a module-level failure.
    pub fn record_error(&mut self, module_id: &str, error: impl Into<String>) {
        self.modules.entry(module_id.to_string()).or_default().error = Some(error.into());
    }

    pub fn add_runtime(&mut self, module_id: &str, runtime_ms: u64) {
        self.modules.entry(module_id.to_string()).or_default().runtime_ms += runtime_ms;
    }

    /// Copies passed tests of `prior` that this record has no result for.
    ///
    /// A retry only re-runs outstanding tests; carrying the earlier passes
    /// forward keeps them excluded when the retry is itself retried.
    pub fn carry_forward_passed(&mut self, prior: &InvocationRecord) {
        for (id, module) in &prior.modules {
            for (name, result) in &module.tests {
                if result.outcome != TestOutcome::Passed {
                    continue;
                }
                self.modules
                    .entry(id.clone())
                    .or_default()
                    .tests
                    .entry(name.clone())
                    .or_insert_with(|| result.clone());
            }
        }
        self.retry_of = Some(prior.invocation_id.clone());
    }

    /// Every `(module id, test name)` recorded as passed.
    pub fn passed_tests(&self) -> impl Iterator<Item = (&str, &str)> {
        self.modules
            .iter()
            .flat_map(|(id, module)| module.passed_tests().map(move |test| (id.as_str(), test)))
    }

    /// Counts of `(passed, failed, skipped)` tests, errors counted as failed.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for result in self.modules.values().flat_map(|m| m.tests.values()) {
            match result.outcome {
                TestOutcome::Passed => counts.0 += 1,
                TestOutcome::Failed | TestOutcome::Error => counts.1 += 1,
                TestOutcome::Skipped => counts.2 += 1,
            }
        }
        counts
    }

    /// Returns `true` when every module succeeded.
    pub fn is_success(&self) -> bool {
        self.modules.values().all(ModuleRecord::is_success)
    }
}

/// Persists and retrieves invocation records.
pub trait ResultStore: Send + Sync {
    /// Loads a record; `None` if no record has that id.
    fn load(&self, invocation_id: &str) -> StoreResult<Option<InvocationRecord>>;

    fn save(&self, record: &InvocationRecord) -> StoreResult<()>;

    /// Ids of every stored record, oldest first.
    fn list(&self) -> StoreResult<Vec<String>>;

    /// Claims an unused id for a run started at `started_at`.
    ///
    /// The id is [`invocation_id`] of the start time, suffixed `_1`, `_2`
    /// and so on while an earlier run started in the same second holds it.
    fn allocate_id(&self, started_at: &DateTime<Local>) -> StoreResult<String>;
}

/// Stores records as pretty-printed JSON files.
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    root: PathBuf,
}

impl JsonResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, invocation_id: &str) -> PathBuf {
        self.root.join(invocation_id).join(RECORD_FILE)
    }
}

impl ResultStore for JsonResultStore {
    fn load(&self, invocation_id: &str) -> StoreResult<Option<InvocationRecord>> {
        let path = self.record_path(invocation_id);
        tracing::debug!("Loading invocation record from: {}", path.display());

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Format { path, source })
    }

    fn save(&self, record: &InvocationRecord) -> StoreResult<()> {
        let path = self.record_path(&record.invocation_id);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        let contents = serde_json::to_string_pretty(record).map_err(|source| StoreError::Format {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, contents).map_err(io_err(&path))?;

        tracing::debug!(
            "Saved invocation record {} ({} modules)",
            record.invocation_id,
            record.modules.len()
        );
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(RECORD_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn allocate_id(&self, started_at: &DateTime<Local>) -> StoreResult<String> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let base = invocation_id(started_at);
        let mut attempt = 0u32;
        loop {
            let id = match attempt {
                0 => base.clone(),
                n => format!("{base}_{n}"),
            };
            // create_dir is the claim: it fails on an existing directory.
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(source) => return Err(StoreError::Io { path: dir, source }),
            }
        }
    }
}
