//! Retry sessions: rebuilding a run's scope from a persisted invocation.
//!
//! A retry re-runs whatever a prior invocation left outstanding. The
//! reconciler loads the prior record, refuses to continue on a different
//! build, replays the prior command line as the baseline options and adds
//! one exclude filter per previously passed test.
//!
//! ```text
//! --retry <id> ──► ResultStore::load ──► fingerprint check
//!                                             │
//!                 prior command line ◄────────┤
//!                         │                   ▼
//!                 baseline options     passed tests ──► exclude filters
//!                         │                   │  (pruned to the narrowed scope)
//!                         └──────► RetrySession ◄┘
//! ```

pub mod store;

use tracing::info;

use crate::filter::{TestFilter, split_module_id};
use crate::options::{OptionsError, SchedulingOptions};
use store::{InvocationRecord, ResultStore, StoreError};

/// Result type for retry reconciliation.
pub type RetryResult<T> = Result<T, RetryError>;

/// Errors that abort a retry session.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("Retry session '{0}' not found")]
    NotFound(String),

    #[error(
        "Build fingerprint mismatch for session '{id}': recorded '{recorded}', device reports '{current}'"
    )]
    FingerprintMismatch {
        id: String,
        recorded: String,
        current: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to replay command line of the prior session: {0}")]
    Options(#[from] OptionsError),
}

/// A reconciled retry, consumed once to seed repository initialization.
#[derive(Debug, Clone)]
pub struct RetrySession {
    pub invocation_id: String,
    pub build_fingerprint: String,
    /// Prior options with the caller's narrowing applied.
    pub options: SchedulingOptions,
    /// One exclude filter per previously passed test.
    pub passed_excludes: Vec<TestFilter>,
    pub prior: InvocationRecord,
}

impl RetrySession {
    /// Options with the passed-test excludes folded in.
    pub fn effective_options(&self) -> SchedulingOptions {
        let mut options = self.options.clone();
        for filter in &self.passed_excludes {
            if !options.exclude_filters.contains(filter) {
                options.exclude_filters.push(filter.clone());
            }
        }
        options
    }
}

/// Rebuilds scheduling inputs from a persisted invocation.
pub struct RetryReconciler<'a> {
    store: &'a dyn ResultStore,
}

impl<'a> RetryReconciler<'a> {
    pub fn new(store: &'a dyn ResultStore) -> Self {
        Self { store }
    }

    /// Reconciles the session `invocation_id` against the current build.
    ///
    /// `requested` holds the options given alongside `--retry`. `--module`
    /// (with `--test`) or `--include-filter` replace the replayed scope, and
    /// only passed tests inside that scope stay excluded. Explicitly given
    /// shard counts, tokens, variants and overrides replace the prior ones.
    pub fn reconcile(
        &self,
        invocation_id: &str,
        requested: &SchedulingOptions,
        current_fingerprint: &str,
    ) -> RetryResult<RetrySession> {
        let prior = self
            .store
            .load(invocation_id)?
            .ok_or_else(|| RetryError::NotFound(invocation_id.to_string()))?;

        if prior.build_fingerprint != current_fingerprint {
            return Err(RetryError::FingerprintMismatch {
                id: invocation_id.to_string(),
                recorded: prior.build_fingerprint.clone(),
                current: current_fingerprint.to_string(),
            });
        }

        let baseline = SchedulingOptions::from_command_line(&prior.command_line)?;
        let options = narrow(baseline, requested, invocation_id);

        let mut passed_excludes = passed_test_excludes(&prior);
        let scope = requested.effective_include_filters();
        if !scope.is_empty() {
            passed_excludes.retain(|exclude| scope.iter().any(|include| covers(include, exclude)));
        }

        info!(
            "Retrying session {}: {} passed tests excluded",
            invocation_id,
            passed_excludes.len()
        );

        Ok(RetrySession {
            invocation_id: invocation_id.to_string(),
            build_fingerprint: prior.build_fingerprint.clone(),
            options,
            passed_excludes,
            prior,
        })
    }
}

/// One exclude filter per passed test, in record order.
pub fn passed_test_excludes(record: &InvocationRecord) -> Vec<TestFilter> {
    record
        .passed_tests()
        .filter_map(|(id, test)| {
            split_module_id(id)
                .map(|(variant, name)| TestFilter::for_test(name, test).with_variant(variant))
        })
        .collect()
}

/// Returns `true` if `exclude` names a test of the module `include` selects.
fn covers(include: &TestFilter, exclude: &TestFilter) -> bool {
    include.module == exclude.module
        && include
            .variant
            .as_ref()
            .is_none_or(|variant| exclude.variant.as_ref() == Some(variant))
}

fn narrow(mut options: SchedulingOptions, requested: &SchedulingOptions, id: &str) -> SchedulingOptions {
    if requested.module.is_some() {
        options.module = requested.module.clone();
        options.test = requested.test.clone();
        options.include_filters.clear();
    } else if !requested.include_filters.is_empty() {
        options.module = None;
        options.test = None;
        options.include_filters = requested.include_filters.clone();
    }
    if requested.shards.is_some() {
        options.shards = requested.shards;
    }
    for (target, given) in [
        (&mut options.tokens, &requested.tokens),
        (&mut options.abis, &requested.abis),
        (&mut options.module_args, &requested.module_args),
        (&mut options.test_args, &requested.test_args),
    ] {
        if !given.is_empty() {
            *target = given.clone();
        }
    }
    for filter in &requested.exclude_filters {
        if !options.exclude_filters.contains(filter) {
            options.exclude_filters.push(filter.clone());
        }
    }
    options.retry = Some(id.to_string());
    options
}
