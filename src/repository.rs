//! The module repository: discovery, bucketing and per-device assignment.
//!
//! One [`ModuleRepository`] is shared by every shard coordinator of a run.
//! The first coordinator to call [`initialize`](ModuleRepository::initialize)
//! loads and classifies every module; the others block on the same lock and
//! then find the repository ready. Each coordinator then asks for its
//! device's modules exactly once with [`get_modules`](ModuleRepository::get_modules).
//!
//! # Assignment
//!
//! ```text
//!  token pool ──► every entry whose tokens the device holds
//!  small pool ──► small quota minus what tokens already gave
//! medium pool ──► medium quota
//!  large pool ──► large quota
//!   top-up    ──► one at a time, small → medium → large, until
//!                 modules_per_shard is met or the pools are empty
//!  last shard ──► drains every pool
//! ```
//!
//! Bucket quotas round down while `modules_per_shard` rounds up; the top-up
//! phase absorbs the difference and the last registering shard drains the
//! rest, so nothing is dropped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::filter::{FilterFile, FilterSet, TestFilter, is_included, module_id};
use crate::module::loader::ModuleLoader;
use crate::module::{
    Bucket, DEFAULT_RUNTIME_HINT, InstantiateRequest, InvocationContext, ModuleDescriptor,
    ModuleError, ModuleResult, RemoteTestExecutor, SetupStep, sort_for_execution,
};
use crate::options::{OptionOverrides, OptionsError};
use crate::token::{CapabilityTokenTable, TokenError};

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Errors raised by the module repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The source directory declared no modules.
    #[error("No modules declared in {0}")]
    NoModules(PathBuf),

    /// Modules were requested before initialization.
    #[error("Module repository is not initialized")]
    NotInitialized,

    /// Another shard's initialization attempt failed.
    #[error("Module repository initialization failed: {0}")]
    InitializationFailed(String),

    /// A thread panicked while holding the repository lock.
    #[error("Module repository lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// Inputs of the one-time repository initialization.
#[derive(Debug, Clone, Default)]
pub struct InitRequest {
    pub shard_count: usize,
    pub source_dir: PathBuf,
    /// Active architecture variants.
    pub variants: Vec<String>,
    /// `serial:token` assignments.
    pub token_assignments: Vec<String>,
    /// `kind:key:value` executor overrides.
    pub test_args: Vec<String>,
    /// `module:key:value` module overrides.
    pub module_args: Vec<String>,
    pub include_filters: Vec<TestFilter>,
    pub exclude_filters: Vec<TestFilter>,
    pub context: InvocationContext,
}

/// Per-shard quotas, frozen after initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quotas {
    /// `ceil(total / shard_count)`.
    pub modules_per_shard: usize,
    /// `floor(small / shard_count)`.
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

#[derive(Debug, Default)]
struct Pools {
    token: Vec<ModuleDescriptor>,
    small: Vec<ModuleDescriptor>,
    medium: Vec<ModuleDescriptor>,
    large: Vec<ModuleDescriptor>,
}

impl Pools {
    fn push(&mut self, module: ModuleDescriptor) {
        match module.bucket() {
            Bucket::Token => self.token.push(module),
            Bucket::Small => self.small.push(module),
            Bucket::Medium => self.medium.push(module),
            Bucket::Large => self.large.push(module),
        }
    }

    fn len(&self) -> usize {
        self.token.len() + self.small.len() + self.medium.len() + self.large.len()
    }

    fn pop_any_sized(&mut self) -> Option<ModuleDescriptor> {
        self.small
            .pop()
            .or_else(|| self.medium.pop())
            .or_else(|| self.large.pop())
    }
}

/// Removes up to `count` entries from the tail of `pool`.
fn take_tail(pool: &mut Vec<ModuleDescriptor>, count: usize) -> Vec<ModuleDescriptor> {
    let at = pool.len().saturating_sub(count);
    pool.split_off(at)
}

#[derive(Debug)]
struct ShardState {
    shard_count: usize,
    tokens: CapabilityTokenTable,
    pools: Pools,
    quotas: Quotas,
    claimed: HashSet<String>,
    total: usize,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Uninitialized,
    Ready(ShardState),
    Failed(String),
}

/// Shared scheduler state for one run.
#[derive(Debug, Default)]
pub struct ModuleRepository {
    state: Mutex<State>,
}

impl ModuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository ready to be shared between coordinators.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> RepositoryResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| RepositoryError::Poisoned)
    }

    /// Loads and classifies every module, once per repository.
    ///
    /// Returns `true` for the call that performed initialization and
    /// `false` for every later call. A failed initialization is remembered:
    /// later callers get [`RepositoryError::InitializationFailed`].
    pub fn initialize(&self, request: &InitRequest, loader: &dyn ModuleLoader) -> RepositoryResult<bool> {
        let mut state = self.lock()?;
        match &*state {
            State::Ready(_) => return Ok(false),
            State::Failed(cause) => return Err(RepositoryError::InitializationFailed(cause.clone())),
            State::Uninitialized => {}
        }

        match build(request, loader) {
            Ok(shard_state) => {
                *state = State::Ready(shard_state);
                Ok(true)
            }
            Err(e) => {
                *state = State::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn with_ready<T>(&self, f: impl FnOnce(&mut ShardState) -> T) -> RepositoryResult<T> {
        let mut state = self.lock()?;
        match &mut *state {
            State::Ready(shard_state) => Ok(f(shard_state)),
            State::Failed(cause) => Err(RepositoryError::InitializationFailed(cause.clone())),
            State::Uninitialized => Err(RepositoryError::NotInitialized),
        }
    }

    /// Assigns modules to the device with the given serial.
    ///
    /// The returned list is sorted in execution order. Every module is
    /// handed out exactly once across all callers.
    pub fn get_modules(&self, serial: &str) -> RepositoryResult<Vec<ModuleDescriptor>> {
        self.with_ready(|state| assign(state, serial))
    }

    /// Returns the frozen per-shard quotas.
    pub fn quotas(&self) -> RepositoryResult<Quotas> {
        self.with_ready(|state| state.quotas)
    }

    /// Returns the number of descriptors created at initialization.
    pub fn total_modules(&self) -> RepositoryResult<usize> {
        self.with_ready(|state| state.total)
    }

    /// Returns clones of every descriptor not yet assigned, in execution order.
    pub fn pending_modules(&self) -> RepositoryResult<Vec<ModuleDescriptor>> {
        self.with_ready(|state| {
            let pools = &state.pools;
            let mut pending: Vec<ModuleDescriptor> = pools
                .token
                .iter()
                .chain(&pools.small)
                .chain(&pools.medium)
                .chain(&pools.large)
                .cloned()
                .collect();
            sort_for_execution(&mut pending);
            pending
        })
    }
}

fn build(request: &InitRequest, loader: &dyn ModuleLoader) -> RepositoryResult<ShardState> {
    if request.shard_count < 1 {
        return Err(OptionsError::ShardCount(request.shard_count).into());
    }

    let tokens = CapabilityTokenTable::parse(&request.token_assignments)?;
    let test_overrides = OptionOverrides::parse(&request.test_args)?;
    let module_overrides = OptionOverrides::parse(&request.module_args)?;

    let include_all = request.include_filters.is_empty();
    let includes = FilterSet::build(&request.include_filters, &request.variants);
    let excludes = FilterSet::build(&request.exclude_filters, &request.variants);

    let declarations = loader.load(&request.source_dir)?;
    if declarations.is_empty() {
        return Err(RepositoryError::NoModules(request.source_dir.clone()));
    }

    let mut pools = Pools::default();
    for declaration in &declarations {
        let steps: Arc<[SetupStep]> = Arc::from(declaration.steps.clone());
        let recipe = &declaration.recipe;

        for variant in &request.variants {
            if !declaration.supports_variant(variant) {
                continue;
            }
            let id = module_id(variant, &declaration.name);
            if !is_included(&id, include_all, &includes, &excludes) {
                debug!("Skipping excluded module {}", id);
                continue;
            }

            let mut options = recipe.base_options();
            test_overrides.apply(recipe.kind(), &mut options)?;
            module_overrides.apply(&declaration.name, &mut options)?;

            let mut executor = recipe.instantiate(&InstantiateRequest {
                module: &declaration.name,
                variant,
                options: &options,
                context: &request.context,
            })?;
            install_filters(&mut *executor, &id, includes.get(&id), excludes.get(&id))?;

            let runtime_hint = options
                .runtime_hint
                .or(declaration.runtime_hint)
                .unwrap_or(DEFAULT_RUNTIME_HINT);

            match executor.split(request.shard_count) {
                Some(pieces) if !pieces.is_empty() => {
                    let count = pieces.len();
                    let piece_hint = runtime_hint / count as u32;
                    debug!("Split {} into {} pieces", id, count);
                    for (index, piece) in pieces.into_iter().enumerate() {
                        pools.push(
                            ModuleDescriptor::new(
                                &declaration.name,
                                variant,
                                piece_hint,
                                steps.clone(),
                                Arc::from(piece),
                            )
                            .with_piece(index, count),
                        );
                    }
                }
                _ => pools.push(ModuleDescriptor::new(
                    &declaration.name,
                    variant,
                    runtime_hint,
                    steps.clone(),
                    Arc::from(executor),
                )),
            }
        }
    }

    let total = pools.len();
    let shards = request.shard_count;
    let quotas = Quotas {
        modules_per_shard: total.div_ceil(shards),
        small: pools.small.len() / shards,
        medium: pools.medium.len() / shards,
        large: pools.large.len() / shards,
    };

    info!(
        "Initialized {} module instances from {} declarations across {} shard(s): token={} small={} medium={} large={}",
        total,
        declarations.len(),
        shards,
        pools.token.len(),
        pools.small.len(),
        pools.medium.len(),
        pools.large.len()
    );

    Ok(ShardState {
        shard_count: shards,
        tokens,
        pools,
        quotas,
        claimed: HashSet::new(),
        total,
    })
}

/// Hands the module's test filters to its executor.
fn install_filters(
    executor: &mut dyn RemoteTestExecutor,
    id: &str,
    includes: &[TestFilter],
    excludes: &[TestFilter],
) -> ModuleResult<()> {
    if executor.supports_filter_file() {
        if let Some(file) = FilterFile::write(includes)? {
            executor.set_include_filter_file(Arc::new(file));
        }
        if let Some(file) = FilterFile::write(excludes)? {
            executor.set_exclude_filter_file(Arc::new(file));
        }
    } else if executor.supports_test_filters() {
        for test in includes.iter().filter_map(|f| f.test.as_deref()) {
            executor.add_include_filter(test);
        }
        for test in excludes.iter().filter_map(|f| f.test.as_deref()) {
            executor.add_exclude_filter(test);
        }
    } else {
        return Err(ModuleError::UnsupportedFilters {
            module: id.to_string(),
        });
    }
    Ok(())
}

fn assign(state: &mut ShardState, serial: &str) -> Vec<ModuleDescriptor> {
    let tokens = &state.tokens;
    let pools = &mut state.pools;
    let quotas = state.quotas;

    let (mut result, remaining): (Vec<_>, Vec<_>) = pools
        .token
        .drain(..)
        .partition(|m| tokens.satisfies(serial, &m.required_tokens));
    pools.token = remaining;

    let small = quotas.small.saturating_sub(result.len());
    result.extend(take_tail(&mut pools.small, small));
    result.extend(take_tail(&mut pools.medium, quotas.medium));
    result.extend(take_tail(&mut pools.large, quotas.large));

    while result.len() < quotas.modules_per_shard {
        match pools.pop_any_sized() {
            Some(module) => result.push(module),
            None => break,
        }
    }

    let newly_claimed = state.claimed.insert(serial.to_string());
    if newly_claimed && state.claimed.len() == state.shard_count {
        for module in pools.token.drain(..) {
            warn!(
                module = %module.id,
                serial,
                tokens = ?module.required_tokens,
                held = ?tokens.tokens_for(serial),
                "No device offered the required tokens; running on the last shard"
            );
            result.push(module);
        }
        result.append(&mut pools.small);
        result.append(&mut pools.medium);
        result.append(&mut pools.large);
    }

    sort_for_execution(&mut result);
    info!(
        serial,
        assigned = result.len(),
        remaining = pools.len(),
        "Assigned modules to device"
    );
    result
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;
    use crate::module::testing::*;
    use crate::module::{ModuleDeclaration, ModuleResult};

    /// Fields of every `WARN` event seen while installed.
    #[derive(Clone, Default)]
    struct WarnLog(Arc<Mutex<Vec<BTreeMap<String, String>>>>);

    impl<S: tracing::Subscriber> Layer<S> for WarnLog {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() != tracing::Level::WARN {
                return;
            }
            let mut fields = Fields::default();
            event.record(&mut fields);
            self.0.lock().unwrap().push(fields.0);
        }
    }

    #[derive(Default)]
    struct Fields(BTreeMap<String, String>);

    impl tracing::field::Visit for Fields {
        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    #[derive(Default)]
    struct StaticLoader {
        declarations: Vec<ModuleDeclaration>,
        calls: AtomicUsize,
    }

    impl StaticLoader {
        fn new(declarations: Vec<ModuleDeclaration>) -> Self {
            Self {
                declarations,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ModuleLoader for StaticLoader {
        fn load(&self, _source_dir: &Path) -> ModuleResult<Vec<ModuleDeclaration>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.declarations.clone())
        }
    }

    fn request(shards: usize) -> InitRequest {
        InitRequest {
            shard_count: shards,
            variants: vec!["arm64-v8a".to_string()],
            ..Default::default()
        }
    }

    fn modules(count: usize, hint_secs: u64) -> Vec<ModuleDeclaration> {
        (0..count)
            .map(|i| declaration(&format!("Module{i:02}"), hint_secs))
            .collect()
    }

    fn ids(modules: &[ModuleDescriptor]) -> Vec<String> {
        modules.iter().map(|m| m.display_name()).collect()
    }

    /// Calls `get_modules` for each serial and checks the union invariants.
    fn assign_all(repo: &ModuleRepository, serials: &[&str]) -> BTreeMap<String, Vec<ModuleDescriptor>> {
        let total = repo.total_modules().unwrap();
        let assigned: BTreeMap<String, Vec<ModuleDescriptor>> = serials
            .iter()
            .map(|s| (s.to_string(), repo.get_modules(s).unwrap()))
            .collect();

        let all: Vec<String> = assigned.values().flat_map(|m| ids(m)).collect();
        let unique: BTreeSet<&String> = all.iter().collect();
        assert_eq!(all.len(), unique.len(), "a module was assigned twice");
        assert_eq!(all.len(), total, "a module was lost");
        assert!(repo.pending_modules().unwrap().is_empty());
        assigned
    }

    #[test]
    fn test_even_split_of_small_modules() {
        let repo = ModuleRepository::new();
        let loader = StaticLoader::new(modules(10, 60));
        assert!(repo.initialize(&request(2), &loader).unwrap());

        let assigned = assign_all(&repo, &["A", "B"]);
        assert_eq!(assigned["A"].len(), 5);
        assert_eq!(assigned["B"].len(), 5);
    }

    #[test]
    fn test_token_gated_module_goes_to_holder() {
        for order in [["A", "B"], ["B", "A"]] {
            let repo = ModuleRepository::new();
            let loader = StaticLoader::new(vec![
                declaration("CtsTelephony", 60).with_step(token_step(&["sim"])),
            ]);
            let mut req = request(2);
            req.token_assignments = vec!["A:sim".to_string()];
            repo.initialize(&req, &loader).unwrap();

            let assigned = assign_all(&repo, &order);
            assert_eq!(ids(&assigned["A"]), vec!["arm64-v8a CtsTelephony"]);
            assert!(assigned["B"].is_empty());
        }
    }

    #[test]
    fn test_unclaimed_token_module_drains_to_last_shard() {
        let repo = ModuleRepository::new();
        let loader = StaticLoader::new(vec![
            declaration("CtsNfc", 60).with_step(token_step(&["nfc"])),
        ]);
        repo.initialize(&request(2), &loader).unwrap();

        assert!(repo.get_modules("A").unwrap().is_empty());
        assert_eq!(ids(&repo.get_modules("B").unwrap()), vec!["arm64-v8a CtsNfc"]);
    }

    #[test]
    fn test_each_drained_token_module_is_warned_once() {
        let log = WarnLog::default();
        let subscriber = tracing_subscriber::registry().with(log.clone());
        let repo = ModuleRepository::new();
        let loader = StaticLoader::new(vec![
            declaration("CtsNfc", 60).with_step(token_step(&["nfc"])),
            declaration("CtsSim", 60).with_step(token_step(&["sim"])),
            declaration("CtsPlain", 60),
        ]);
        let request = InitRequest {
            token_assignments: vec!["A:sim".to_string()],
            ..request(2)
        };

        let (first, last) = tracing::subscriber::with_default(subscriber, || {
            repo.initialize(&request, &loader).unwrap();
            (repo.get_modules("A").unwrap(), repo.get_modules("B").unwrap())
        });
        assert_eq!(ids(&first), vec!["arm64-v8a CtsSim", "arm64-v8a CtsPlain"]);
        assert_eq!(ids(&last), vec!["arm64-v8a CtsNfc"]);

        let warnings = log.0.lock().unwrap();
        let drained: Vec<&BTreeMap<String, String>> = warnings
            .iter()
            .filter(|fields| fields.contains_key("tokens"))
            .collect();
        assert_eq!(drained.len(), 1, "{warnings:?}");
        assert_eq!(drained[0]["module"], "arm64-v8a CtsNfc");
        assert_eq!(drained[0]["serial"], "B");
        assert!(drained[0]["tokens"].contains("nfc"));
    }

    #[test]
    fn test_four_small_modules_over_three_shards() {
        let repo = ModuleRepository::new();
        let loader = StaticLoader::new(modules(4, 60));
        repo.initialize(&request(3), &loader).unwrap();
        assert_eq!(
            repo.quotas().unwrap(),
            Quotas {
                modules_per_shard: 2,
                small: 1,
                medium: 0,
                large: 0,
            }
        );

        let counts: Vec<usize> = ["A", "B", "C"]
            .iter()
            .map(|s| repo.get_modules(s).unwrap().len())
            .collect();
        assert_eq!(counts, vec![2, 2, 0]);
        assert!(repo.pending_modules().unwrap().is_empty());
    }

    #[test]
    fn test_uneven_buckets_lose_nothing() {
        let mut declarations = modules(7, 30);
        declarations.extend((0..5).map(|i| declaration(&format!("Medium{i}"), 300)));
        declarations.extend((0..3).map(|i| declaration(&format!("Large{i}"), 1200)));
        declarations.push(declaration("Gated", 60).with_step(token_step(&["sim"])));

        for shards in 1..=5 {
            let repo = ModuleRepository::new();
            let mut req = request(shards);
            req.token_assignments = vec!["S1:sim".to_string()];
            repo.initialize(&req, &StaticLoader::new(declarations.clone())).unwrap();

            let serials: Vec<String> = (0..shards).map(|i| format!("S{i}")).collect();
            let serial_refs: Vec<&str> = serials.iter().map(String::as_str).collect();
            let assigned = assign_all(&repo, &serial_refs);

            let counts: Vec<usize> = serial_refs[..shards - 1]
                .iter()
                .map(|s| assigned[*s].len())
                .collect();
            if let (Some(min), Some(max)) = (counts.iter().min(), counts.iter().max()) {
                assert!(max - min <= 1, "unfair split {counts:?} with {shards} shards");
            }
        }
    }

    #[test]
    fn test_assignment_is_in_execution_order() {
        let repo = ModuleRepository::new();
        let loader = StaticLoader::new(vec![
            declaration("Short", 30),
            declaration("CtsIncidentHostTestCases", 3000),
            declaration("Long", 1200),
            declaration("Mid", 300),
        ]);
        repo.initialize(&request(1), &loader).unwrap();

        let names: Vec<String> = repo
            .get_modules("A")
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Long", "Mid", "Short", "CtsIncidentHostTestCases"]);
    }

    #[test]
    fn test_zero_declarations_is_fatal() {
        let repo = ModuleRepository::new();
        let err = repo
            .initialize(&request(1), &StaticLoader::new(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NoModules(_)));
        assert!(matches!(
            repo.get_modules("A"),
            Err(RepositoryError::InitializationFailed(_))
        ));
        assert!(matches!(
            repo.initialize(&request(1), &StaticLoader::new(modules(1, 60))),
            Err(RepositoryError::InitializationFailed(_))
        ));
    }

    #[test]
    fn test_get_modules_before_initialize() {
        assert!(matches!(
            ModuleRepository::new().get_modules("A"),
            Err(RepositoryError::NotInitialized)
        ));
    }

    #[test]
    fn test_zero_shards_is_fatal() {
        let err = ModuleRepository::new()
            .initialize(&request(0), &StaticLoader::new(modules(1, 60)))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Options(OptionsError::ShardCount(0))));
    }

    #[test]
    fn test_concurrent_initialize_runs_once() {
        let repo = ModuleRepository::shared();
        let loader = StaticLoader::new(modules(12, 60));

        let initialized: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| repo.initialize(&request(4), &loader).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(initialized.iter().filter(|done| **done).count(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        let assigned: Vec<Vec<ModuleDescriptor>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ["A", "B", "C", "D"]
                .into_iter()
                .map(|serial| {
                    let repo = &repo;
                    scope.spawn(move || repo.get_modules(serial).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let total: usize = assigned.iter().map(Vec::len).sum();
        assert_eq!(total, 12);
        assert!(repo.pending_modules().unwrap().is_empty());
    }

    #[test]
    fn test_filters_decide_instantiation() {
        let repo = ModuleRepository::new();
        let loader = StaticLoader::new(modules(3, 60));
        let mut req = request(1);
        req.variants = vec!["arm64-v8a".to_string(), "x86".to_string()];
        req.include_filters = vec![
            TestFilter::for_module("Module00"),
            TestFilter::for_test("Module01", "T#a"),
        ];
        req.exclude_filters = vec![TestFilter::for_module("Module00").with_variant("x86")];
        repo.initialize(&req, &loader).unwrap();

        let mut names = ids(&repo.get_modules("A").unwrap());
        names.sort();
        assert_eq!(
            names,
            vec![
                "arm64-v8a Module00",
                "arm64-v8a Module01",
                "x86 Module01",
            ]
        );
    }

    #[test]
    fn test_test_filters_reach_executor() {
        let repo = ModuleRepository::new();
        let mut recipe = FakeRecipe::passing(&["T#a"]);
        recipe.file_filters = false;
        recipe.test_filters = true;
        let loader = StaticLoader::new(vec![ModuleDeclaration::new("CtsFoo", Arc::new(recipe))]);
        let mut req = request(1);
        req.exclude_filters = vec![TestFilter::for_test("CtsFoo", "T#b")];
        repo.initialize(&req, &loader).unwrap();

        let modules = repo.get_modules("A").unwrap();
        let debug = format!("{:?}", modules[0].executor);
        assert!(debug.contains("excludes: [\"T#b\"]"), "{debug}");
    }

    #[test]
    fn test_executor_without_filter_support_is_fatal() {
        let mut recipe = FakeRecipe::passing(&[]);
        recipe.file_filters = false;
        recipe.test_filters = false;
        let loader = StaticLoader::new(vec![ModuleDeclaration::new("CtsFoo", Arc::new(recipe))]);
        let err = ModuleRepository::new()
            .initialize(&request(1), &loader)
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Module(ModuleError::UnsupportedFilters { .. })
        ));
    }

    #[test]
    fn test_splittable_module_becomes_pieces() {
        let mut recipe = FakeRecipe::passing(&["T#a"]);
        recipe.splittable = true;
        let loader = StaticLoader::new(vec![
            ModuleDeclaration::new("CtsBig", Arc::new(recipe))
                .with_runtime_hint(std::time::Duration::from_secs(1500)),
        ]);
        let repo = ModuleRepository::new();
        repo.initialize(&request(3), &loader).unwrap();
        assert_eq!(repo.total_modules().unwrap(), 3);

        let assigned = assign_all(&repo, &["A", "B", "C"]);
        for modules in assigned.values() {
            assert_eq!(modules.len(), 1);
            assert_eq!(modules[0].runtime_hint, std::time::Duration::from_secs(500));
            assert_eq!(modules[0].id, "arm64-v8a CtsBig");
        }
    }

    #[test]
    fn test_module_args_override_runtime_hint() {
        let repo = ModuleRepository::new();
        let loader = StaticLoader::new(modules(2, 60));
        let mut req = request(1);
        req.module_args = vec!["Module01:runtime-hint:900000".to_string()];
        repo.initialize(&req, &loader).unwrap();

        let modules = repo.get_modules("A").unwrap();
        assert_eq!(modules[0].name, "Module01");
        assert_eq!(modules[0].bucket(), Bucket::Large);
    }

    #[test]
    fn test_unknown_override_key_is_fatal() {
        let mut req = request(1);
        req.test_args = vec!["fake:colour:blue".to_string()];
        let err = ModuleRepository::new()
            .initialize(&req, &StaticLoader::new(modules(1, 60)))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Options(OptionsError::UnknownKey { .. })));
    }

    #[test]
    fn test_repeat_caller_does_not_trigger_drain() {
        let repo = ModuleRepository::new();
        repo.initialize(&request(2), &StaticLoader::new(modules(4, 60)))
            .unwrap();
        assert_eq!(repo.get_modules("A").unwrap().len(), 2);
        assert_eq!(repo.get_modules("A").unwrap().len(), 2);
        assert!(repo.get_modules("B").unwrap().is_empty());
    }
}
