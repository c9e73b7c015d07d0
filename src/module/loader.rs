//! Module declaration loading.
//!
//! [`TomlModuleLoader`] reads one module per `*.toml` file in the source
//! directory, in path order:
//!
//! ```toml
//! name = "CtsFooTestCases"          # defaults to the file stem
//! variants = ["arm64-v8a"]          # optional restriction
//! runtime_hint_secs = 420
//! tokens = ["sim-card"]
//!
//! [executor]
//! type = "command"
//! command = "run-suite --serial {serial} --module {module} --abi {abi}"
//!
//! [[steps]]
//! name = "install-apk"
//! setup = "adb -s {serial} install -r CtsFoo.apk"
//! cleanup = "adb -s {serial} uninstall android.foo.cts"
//!
//! [[steps]]
//! name = "wifi-check"
//! kind = "precondition"
//! setup = "adb -s {serial} shell cmd wifi status | grep -q enabled"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::command::{CommandPreparer, CommandRecipe, CommandRecipeConfig};
use super::{ModuleDeclaration, ModuleError, ModuleResult, SetupStep, StepKind};

/// Provides module declarations for a source directory.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, source_dir: &Path) -> ModuleResult<Vec<ModuleDeclaration>>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleFile {
    name: Option<String>,
    #[serde(default)]
    variants: Vec<String>,
    runtime_hint_secs: Option<u64>,
    #[serde(default)]
    tokens: Vec<String>,
    executor: ExecutorEntry,
    #[serde(default)]
    steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ExecutorEntry {
    Command(CommandRecipeConfig),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum StepKindEntry {
    Precondition,
    TokenRequirement,
    #[default]
    Ordinary,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepEntry {
    name: String,
    #[serde(default)]
    kind: StepKindEntry,
    #[serde(default)]
    tokens: Vec<String>,
    setup: Option<String>,
    cleanup: Option<String>,
    /// Overrides whether a failure is secondary; defaults to `true` for
    /// preconditions only.
    recoverable: Option<bool>,
    timeout_secs: Option<u64>,
}

/// Loads `*.toml` module declarations.
#[derive(Debug, Clone)]
pub struct TomlModuleLoader {
    step_timeout: Duration,
}

impl Default for TomlModuleLoader {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
        }
    }
}

impl TomlModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default timeout of step commands.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    fn parse(&self, path: &Path, content: &str) -> ModuleResult<ModuleDeclaration> {
        let load_err = |message: String| ModuleError::Load {
            path: path.to_path_buf(),
            message,
        };

        let file: ModuleFile = toml::from_str(content).map_err(|e| load_err(e.to_string()))?;
        let name = match file.name {
            Some(name) => name,
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| load_err("cannot derive module name".to_string()))?,
        };
        if name.trim().is_empty() || name.contains(char::is_whitespace) {
            return Err(load_err(format!("invalid module name '{}'", name)));
        }

        let recipe = match file.executor {
            ExecutorEntry::Command(config) => Arc::new(CommandRecipe::new(config)),
        };

        let mut declaration = ModuleDeclaration::new(name, recipe).with_variants(file.variants);
        if let Some(secs) = file.runtime_hint_secs {
            declaration = declaration.with_runtime_hint(Duration::from_secs(secs));
        }
        if !file.tokens.is_empty() {
            declaration = declaration.with_step(SetupStep::new(
                "token-requirement",
                StepKind::TokenRequirement(file.tokens.into_iter().collect()),
            ));
        }

        for entry in file.steps {
            let kind = match entry.kind {
                StepKindEntry::Precondition => StepKind::Precondition,
                StepKindEntry::Ordinary => StepKind::Ordinary,
                StepKindEntry::TokenRequirement if entry.tokens.is_empty() => {
                    return Err(load_err(format!("step '{}' requires no tokens", entry.name)));
                }
                StepKindEntry::TokenRequirement => {
                    StepKind::TokenRequirement(entry.tokens.into_iter().collect())
                }
            };

            let mut step = SetupStep::new(entry.name, kind);
            if entry.setup.is_some() || entry.cleanup.is_some() {
                let recoverable = entry.recoverable.unwrap_or(step.is_precondition());
                let timeout = entry
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.step_timeout);
                let preparer = CommandPreparer::new(entry.setup, entry.cleanup, timeout, recoverable);
                let cleanup = preparer.has_cleanup();
                step = step.with_preparer(Arc::new(preparer), cleanup);
            }
            declaration = declaration.with_step(step);
        }

        Ok(declaration)
    }
}

impl ModuleLoader for TomlModuleLoader {
    fn load(&self, source_dir: &Path) -> ModuleResult<Vec<ModuleDeclaration>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(source_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut declarations = Vec::with_capacity(paths.len());
        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let declaration = self.parse(&path, &content)?;
            debug!("Loaded module {} from {}", declaration.name, path.display());
            declarations.push(declaration);
        }
        Ok(declarations)
    }
}
