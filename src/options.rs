//! Scheduling options and typed executor option overrides.
//!
//! [`SchedulingOptions`] is the set of command-line inputs that decide
//! which modules run and how they are sharded. It is a clap [`Args`]
//! group so the binary can flatten it into `modshard run`, and so a
//! persisted invocation can be re-parsed for a retry session.
//!
//! [`OptionOverrides`] turns `target:key:value` triples into typed
//! [`ExecutorOptions`]. Every key is checked against a fixed table of
//! setters when the triple is parsed, so an unknown key fails before any
//! module is instantiated.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Args, Parser};

use crate::filter::TestFilter;

/// Result type for option handling.
pub type OptionsResult<T> = Result<T, OptionsError>;

/// Errors produced while validating scheduling inputs.
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    /// Shard count below one.
    #[error("Shard count must be at least 1, got {0}")]
    ShardCount(usize),

    /// `--test` was given without `--module`.
    #[error("Test '{0}' was given without a module; use --module with --test")]
    TestWithoutModule(String),

    /// `--module` was combined with free-form include filters.
    #[error("--module {module} cannot be combined with --include-filter ({filters} given)")]
    AmbiguousSelection { module: String, filters: usize },

    /// An override was not of the form `target:key:value`.
    #[error("Malformed option override '{0}': expected 'target:key:value'")]
    MalformedOverride(String),

    /// An override named a key no executor understands.
    #[error("Unknown option '{key}' for target '{target}'")]
    UnknownKey { target: String, key: String },

    /// An override value could not be converted to the key's type.
    #[error("Invalid value '{value}' for option '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// A stored command line could not be re-parsed.
    #[error("Failed to parse command line: {0}")]
    CommandLine(String),
}

/// Inputs that decide which modules run and how they are sharded.
#[derive(Debug, Clone, Default, PartialEq, Args)]
pub struct SchedulingOptions {
    /// Number of shards; defaults to the configured value.
    #[arg(long)]
    pub shards: Option<usize>,

    /// Run a single module.
    #[arg(short, long)]
    pub module: Option<String>,

    /// Run a single test of the selected module.
    #[arg(short, long, requires = "module")]
    pub test: Option<String>,

    /// Include filter: "[variant] module [test]".
    #[arg(long = "include-filter", value_name = "FILTER")]
    pub include_filters: Vec<TestFilter>,

    /// Exclude filter: "[variant] module [test]".
    #[arg(long = "exclude-filter", value_name = "FILTER")]
    pub exclude_filters: Vec<TestFilter>,

    /// Module option override: "module:key:value".
    #[arg(long = "module-arg", value_name = "TARGET:KEY:VALUE")]
    pub module_args: Vec<String>,

    /// Executor option override: "kind:key:value".
    #[arg(long = "test-arg", value_name = "TARGET:KEY:VALUE")]
    pub test_args: Vec<String>,

    /// Capability token assignment: "serial:token".
    #[arg(long = "token", value_name = "SERIAL:TOKEN")]
    pub tokens: Vec<String>,

    /// Architecture variant to run; repeatable.
    #[arg(long = "abi", value_name = "VARIANT")]
    pub abis: Vec<String>,

    /// Retry the invocation with the given id.
    #[arg(long, value_name = "INVOCATION_ID")]
    pub retry: Option<String>,
}

/// Parser wrapper used to re-read a stored command line.
#[derive(Debug, Parser)]
#[command(no_binary_name = true)]
struct StoredCommandLine {
    #[command(flatten)]
    options: SchedulingOptions,
}

impl SchedulingOptions {
    /// Checks the combinations that make the scheduling intent ambiguous.
    pub fn validate(&self) -> OptionsResult<()> {
        if let Some(shards) = self.shards
            && shards < 1
        {
            return Err(OptionsError::ShardCount(shards));
        }

        match (&self.module, &self.test) {
            (None, Some(test)) => Err(OptionsError::TestWithoutModule(test.clone())),
            (Some(module), _) if !self.include_filters.is_empty() => {
                Err(OptionsError::AmbiguousSelection {
                    module: module.clone(),
                    filters: self.include_filters.len(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Returns the include filters, with `--module`/`--test` folded in.
    pub fn effective_include_filters(&self) -> Vec<TestFilter> {
        match &self.module {
            Some(module) => vec![TestFilter {
                variant: None,
                module: module.clone(),
                test: self.test.clone(),
            }],
            None => self.include_filters.clone(),
        }
    }

    /// Renders the options back into command-line form.
    ///
    /// The retry id is left out: a stored command line describes what the
    /// user asked for, not which session it was derived from.
    pub fn to_command_line(&self) -> String {
        let mut args: Vec<String> = Vec::new();
        if let Some(shards) = self.shards {
            args.push("--shards".into());
            args.push(shards.to_string());
        }
        if let Some(module) = &self.module {
            args.push("--module".into());
            args.push(module.clone());
        }
        if let Some(test) = &self.test {
            args.push("--test".into());
            args.push(test.clone());
        }
        for filter in &self.include_filters {
            args.push("--include-filter".into());
            args.push(filter.to_string());
        }
        for filter in &self.exclude_filters {
            args.push("--exclude-filter".into());
            args.push(filter.to_string());
        }
        for (flag, values) in [
            ("--module-arg", &self.module_args),
            ("--test-arg", &self.test_args),
            ("--token", &self.tokens),
            ("--abi", &self.abis),
        ] {
            for value in values {
                args.push(flag.into());
                args.push(value.clone());
            }
        }
        shell_words::join(args)
    }

    /// Parses a command line produced by [`to_command_line`](Self::to_command_line).
    pub fn from_command_line(line: &str) -> OptionsResult<Self> {
        let words =
            shell_words::split(line).map_err(|e| OptionsError::CommandLine(e.to_string()))?;
        let parsed = StoredCommandLine::try_parse_from(words)
            .map_err(|e| OptionsError::CommandLine(e.to_string()))?;
        Ok(parsed.options)
    }
}

/// Typed options applied to a test executor when it is instantiated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorOptions {
    /// Overrides the module's estimated runtime.
    pub runtime_hint: Option<Duration>,

    /// Maximum time a single module run may take.
    pub timeout: Option<Duration>,

    /// Extra arguments appended to the executor's command.
    pub args: Vec<String>,

    /// Extra environment for the executor's command.
    pub env: BTreeMap<String, String>,

    /// Forces self-splitting on or off.
    pub shardable: Option<bool>,
}

type Setter = fn(&mut ExecutorOptions, &str) -> Result<(), String>;

/// Every key an override may name, with the setter that applies it.
const SETTERS: &[(&str, Setter)] = &[
    ("runtime-hint", set_runtime_hint),
    ("timeout", set_timeout),
    ("arg", set_arg),
    ("env", set_env),
    ("shardable", set_shardable),
];

fn set_runtime_hint(options: &mut ExecutorOptions, value: &str) -> Result<(), String> {
    let millis: u64 = value.parse().map_err(|e| format!("{}", e))?;
    options.runtime_hint = Some(Duration::from_millis(millis));
    Ok(())
}

fn set_timeout(options: &mut ExecutorOptions, value: &str) -> Result<(), String> {
    let secs: u64 = value.parse().map_err(|e| format!("{}", e))?;
    options.timeout = Some(Duration::from_secs(secs));
    Ok(())
}

fn set_arg(options: &mut ExecutorOptions, value: &str) -> Result<(), String> {
    options.args.push(value.to_string());
    Ok(())
}

fn set_env(options: &mut ExecutorOptions, value: &str) -> Result<(), String> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| "expected KEY=VALUE".to_string())?;
    options.env.insert(key.to_string(), val.to_string());
    Ok(())
}

fn set_shardable(options: &mut ExecutorOptions, value: &str) -> Result<(), String> {
    let flag: bool = value.parse().map_err(|e| format!("{}", e))?;
    options.shardable = Some(flag);
    Ok(())
}

fn lookup_setter(target: &str, key: &str) -> OptionsResult<Setter> {
    SETTERS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, setter)| *setter)
        .ok_or_else(|| OptionsError::UnknownKey {
            target: target.to_string(),
            key: key.to_string(),
        })
}

/// Parsed `target:key:value` overrides, grouped by target.
#[derive(Debug, Clone, Default)]
pub struct OptionOverrides {
    by_target: BTreeMap<String, Vec<(String, Setter, String)>>,
}

impl OptionOverrides {
    /// Parses and validates override triples.
    ///
    /// The value may itself contain `:`; only the first two separators
    /// split the triple.
    ///
    /// # Example
    ///
    /// ```
    /// use modshard::options::{ExecutorOptions, OptionOverrides};
    ///
    /// let overrides = OptionOverrides::parse(&["CtsFoo:timeout:60".to_string()])?;
    /// let mut options = ExecutorOptions::default();
    /// overrides.apply("CtsFoo", &mut options)?;
    /// assert_eq!(options.timeout, Some(std::time::Duration::from_secs(60)));
    ///
    /// assert!(OptionOverrides::parse(&["CtsFoo:bogus:1".to_string()]).is_err());
    /// # Ok::<(), modshard::options::OptionsError>(())
    /// ```
    pub fn parse(triples: &[String]) -> OptionsResult<Self> {
        let mut overrides = Self::default();
        for triple in triples {
            let mut parts = triple.splitn(3, ':');
            let (Some(target), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(OptionsError::MalformedOverride(triple.clone()));
            };
            if target.is_empty() || key.is_empty() {
                return Err(OptionsError::MalformedOverride(triple.clone()));
            }

            let setter = lookup_setter(target, key)?;
            setter(&mut ExecutorOptions::default(), value).map_err(|reason| {
                OptionsError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason,
                }
            })?;

            overrides
                .by_target
                .entry(target.to_string())
                .or_default()
                .push((key.to_string(), setter, value.to_string()));
        }
        Ok(overrides)
    }

    /// Applies every override for `target`, in the order given.
    pub fn apply(&self, target: &str, options: &mut ExecutorOptions) -> OptionsResult<()> {
        for (key, setter, value) in self.by_target.get(target).into_iter().flatten() {
            setter(options, value).map_err(|reason| OptionsError::InvalidValue {
                key: key.clone(),
                value: value.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_without_module_is_rejected() {
        let options = SchedulingOptions {
            test: Some("FooTest#bar".into()),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(OptionsError::TestWithoutModule(_))
        ));
    }

    #[test]
    fn test_module_with_include_filters_is_ambiguous() {
        let options = SchedulingOptions {
            module: Some("Foo".into()),
            test: Some("bar".into()),
            include_filters: vec![TestFilter::for_module("Baz")],
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(OptionsError::AmbiguousSelection { .. })
        ));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let options = SchedulingOptions {
            shards: Some(0),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(OptionsError::ShardCount(0))));
    }

    #[test]
    fn test_module_and_test_become_include_filter() {
        let options = SchedulingOptions {
            module: Some("Foo".into()),
            test: Some("bar".into()),
            ..Default::default()
        };
        assert_eq!(
            options.effective_include_filters(),
            vec![TestFilter::for_test("Foo", "bar")]
        );
    }

    #[test]
    fn test_command_line_is_reparsed() {
        let options = SchedulingOptions {
            shards: Some(3),
            include_filters: vec![TestFilter::for_module("CtsFoo").with_variant("arm64-v8a")],
            exclude_filters: vec![TestFilter::for_test("CtsBar", "T#a")],
            module_args: vec!["CtsFoo:timeout:30".into()],
            tokens: vec!["A:sim".into()],
            retry: Some("ignored".into()),
            ..Default::default()
        };
        let line = options.to_command_line();
        let parsed = SchedulingOptions::from_command_line(&line).unwrap();
        assert_eq!(parsed.retry, None);
        assert_eq!(
            parsed,
            SchedulingOptions {
                retry: None,
                ..options
            }
        );
    }

    #[test]
    fn test_overrides_apply_in_order() {
        let overrides = OptionOverrides::parse(&[
            "command:arg:--verbose".to_string(),
            "command:arg:--log=a:b".to_string(),
            "command:env:FOO=1".to_string(),
            "command:shardable:false".to_string(),
        ])
        .unwrap();
        let mut options = ExecutorOptions::default();
        overrides.apply("command", &mut options).unwrap();
        assert_eq!(options.args, vec!["--verbose", "--log=a:b"]);
        assert_eq!(options.env.get("FOO").map(String::as_str), Some("1"));
        assert_eq!(options.shardable, Some(false));
        let mut untouched = ExecutorOptions::default();
        overrides.apply("other", &mut untouched).unwrap();
        assert_eq!(untouched, ExecutorOptions::default());
    }

    #[test]
    fn test_override_errors_at_parse_time() {
        assert!(matches!(
            OptionOverrides::parse(&["command:nope:1".to_string()]),
            Err(OptionsError::UnknownKey { .. })
        ));
        assert!(matches!(
            OptionOverrides::parse(&["command:timeout:soon".to_string()]),
            Err(OptionsError::InvalidValue { .. })
        ));
        assert!(matches!(
            OptionOverrides::parse(&["command:timeout".to_string()]),
            Err(OptionsError::MalformedOverride(_))
        ));
    }
}
