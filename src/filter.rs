//! Include/exclude test filters.
//!
//! A filter names a module, optionally pinned to one architecture variant,
//! and optionally a single test inside that module. Filters are written as
//! whitespace-separated tokens:
//!
//! ```text
//! CtsFooTestCases
//! arm64-v8a CtsFooTestCases
//! CtsFooTestCases android.foo.FooTest#testBar
//! arm64-v8a CtsFooTestCases android.foo.FooTest#testBar
//! ```
//!
//! The leading token is only treated as a variant when it is one of
//! [`KNOWN_VARIANTS`]. Filters that do not name a variant are expanded to
//! one filter per active variant before they are grouped by module id.
//!
//! # Example
//!
//! ```
//! use modshard::filter::TestFilter;
//!
//! let filter: TestFilter = "arm64-v8a CtsFooTestCases FooTest#testBar".parse()?;
//! assert_eq!(filter.variant.as_deref(), Some("arm64-v8a"));
//! assert_eq!(filter.module, "CtsFooTestCases");
//! assert_eq!(filter.test.as_deref(), Some("FooTest#testBar"));
//! # Ok::<(), modshard::filter::FilterError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tempfile::TempPath;

/// Architecture variants recognised as the leading token of a filter.
pub const KNOWN_VARIANTS: &[&str] = &[
    "armeabi",
    "armeabi-v7a",
    "arm64-v8a",
    "x86",
    "x86_64",
    "mips",
    "mips64",
    "riscv64",
];

/// Result type for filter operations.
pub type FilterResult<T> = Result<T, FilterError>;

/// Errors produced while parsing filters or writing filter files.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The filter string could not be split into variant/module/test.
    #[error("Malformed filter '{0}': expected '[variant] module [test]'")]
    Malformed(String),

    /// Writing a scratch filter file failed.
    #[error("Failed to write filter file: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the identifier of one module instance.
///
/// Ids are unique within a run: `"<variant> <name>"`.
pub fn module_id(variant: &str, name: &str) -> String {
    format!("{} {}", variant, name)
}

/// Splits a module id back into `(variant, name)`.
pub fn split_module_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(' ')
}

/// A parsed `(variant?, module, test?)` predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestFilter {
    /// Architecture variant this filter is pinned to, if any.
    pub variant: Option<String>,

    /// Module name.
    pub module: String,

    /// Test name inside the module. `None` applies to the whole module.
    pub test: Option<String>,
}

impl TestFilter {
    /// Creates a whole-module filter for every variant.
    pub fn for_module(module: impl Into<String>) -> Self {
        Self {
            variant: None,
            module: module.into(),
            test: None,
        }
    }

    /// Creates a filter for a single test inside a module.
    pub fn for_test(module: impl Into<String>, test: impl Into<String>) -> Self {
        Self {
            variant: None,
            module: module.into(),
            test: Some(test.into()),
        }
    }

    /// Pins the filter to one architecture variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Returns `true` when the filter applies to the whole module.
    pub fn is_whole_module(&self) -> bool {
        self.test.is_none()
    }

    /// Returns the module id this filter names, if it is pinned to a variant.
    pub fn module_id(&self) -> Option<String> {
        self.variant
            .as_deref()
            .map(|variant| module_id(variant, &self.module))
    }

    /// Expands a variant-less filter into one filter per active variant.
    ///
    /// Filters that already name a variant are returned unchanged.
    pub fn expand(&self, variants: &[String]) -> Vec<TestFilter> {
        if self.variant.is_some() {
            return vec![self.clone()];
        }
        variants
            .iter()
            .map(|variant| self.clone().with_variant(variant.as_str()))
            .collect()
    }
}

impl FromStr for TestFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> FilterResult<Self> {
        let mut parts = s.split_whitespace();
        let first = parts
            .next()
            .ok_or_else(|| FilterError::Malformed(s.to_string()))?;

        let (variant, module) = if KNOWN_VARIANTS.contains(&first) {
            let module = parts
                .next()
                .ok_or_else(|| FilterError::Malformed(s.to_string()))?;
            (Some(first.to_string()), module.to_string())
        } else {
            (None, first.to_string())
        };

        let test = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(FilterError::Malformed(s.to_string()));
        }

        Ok(Self {
            variant,
            module,
            test,
        })
    }
}

impl fmt::Display for TestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(variant) = &self.variant {
            write!(f, "{} ", variant)?;
        }
        write!(f, "{}", self.module)?;
        if let Some(test) = &self.test {
            write!(f, " {}", test)?;
        }
        Ok(())
    }
}

/// Filters grouped by the module id they apply to.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    by_module: BTreeMap<String, Vec<TestFilter>>,
}

impl FilterSet {
    /// Expands every filter across `variants` and groups the result by id.
    pub fn build(filters: &[TestFilter], variants: &[String]) -> Self {
        let mut by_module: BTreeMap<String, Vec<TestFilter>> = BTreeMap::new();
        for filter in filters.iter().flat_map(|f| f.expand(variants)) {
            if let Some(id) = filter.module_id() {
                let entry = by_module.entry(id).or_default();
                if !entry.contains(&filter) {
                    entry.push(filter);
                }
            }
        }
        Self { by_module }
    }

    /// Returns `true` if no filter was supplied.
    pub fn is_empty(&self) -> bool {
        self.by_module.is_empty()
    }

    /// Returns the filters that apply to the given module id.
    pub fn get(&self, id: &str) -> &[TestFilter] {
        self.by_module.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns `true` if any filter names the given module id.
    pub fn names(&self, id: &str) -> bool {
        self.by_module.contains_key(id)
    }

    /// Returns `true` if a whole-module filter names the given module id.
    pub fn names_whole_module(&self, id: &str) -> bool {
        self.get(id).iter().any(TestFilter::is_whole_module)
    }
}

/// Decides whether a module instance should be instantiated at all.
///
/// A module is included when every module is included or an include
/// filter names it, and no whole-module exclude names it. A whole-module
/// exclude always wins.
pub fn is_included(id: &str, include_all: bool, includes: &FilterSet, excludes: &FilterSet) -> bool {
    (include_all || includes.names(id)) && !excludes.names_whole_module(id)
}

/// A scratch file holding one test name per line.
///
/// The file is removed when the last owner drops it.
#[derive(Debug)]
pub struct FilterFile {
    path: TempPath,
    entries: usize,
}

impl FilterFile {
    /// Writes the test names of `filters` to a new scratch file.
    ///
    /// Whole-module filters carry no test name and are skipped. Returns
    /// `None` when no filter names a specific test.
    pub fn write(filters: &[TestFilter]) -> FilterResult<Option<Self>> {
        let names: Vec<&str> = filters.iter().filter_map(|f| f.test.as_deref()).collect();
        if names.is_empty() {
            return Ok(None);
        }

        let mut file = tempfile::Builder::new()
            .prefix("modshard-filter-")
            .suffix(".txt")
            .tempfile()?;
        for name in &names {
            writeln!(file, "{}", name)?;
        }
        file.flush()?;

        Ok(Some(Self {
            path: file.into_temp_path(),
            entries: names.len(),
        }))
    }

    /// Returns the path of the scratch file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of test names written.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Returns `true` if the file holds no test names.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variants() -> Vec<String> {
        vec!["arm64-v8a".to_string(), "armeabi-v7a".to_string()]
    }

    #[test]
    fn test_parse_module_only() {
        let filter: TestFilter = "CtsFooTestCases".parse().unwrap();
        assert_eq!(filter, TestFilter::for_module("CtsFooTestCases"));
        assert!(filter.is_whole_module());
    }

    #[test]
    fn test_parse_variant_module_test() {
        let filter: TestFilter = "x86 CtsFooTestCases FooTest#testBar".parse().unwrap();
        assert_eq!(
            filter,
            TestFilter::for_test("CtsFooTestCases", "FooTest#testBar").with_variant("x86")
        );
        assert_eq!(filter.module_id().as_deref(), Some("x86 CtsFooTestCases"));
    }

    #[test]
    fn test_parse_module_and_test_without_variant() {
        let filter: TestFilter = "CtsFooTestCases FooTest#testBar".parse().unwrap();
        assert_eq!(filter.variant, None);
        assert_eq!(filter.test.as_deref(), Some("FooTest#testBar"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<TestFilter>().is_err());
        assert!("arm64-v8a".parse::<TestFilter>().is_err());
        assert!("a b c d".parse::<TestFilter>().is_err());
    }

    #[test]
    fn test_display_matches_input() {
        for input in ["CtsFoo", "arm64-v8a CtsFoo", "arm64-v8a CtsFoo T#m"] {
            let filter: TestFilter = input.parse().unwrap();
            assert_eq!(filter.to_string(), input);
        }
    }

    #[test]
    fn test_filter_set_expands_variants() {
        let set = FilterSet::build(&[TestFilter::for_module("CtsFoo")], &variants());
        assert!(set.names("arm64-v8a CtsFoo"));
        assert!(set.names("armeabi-v7a CtsFoo"));
        assert!(!set.names("x86 CtsFoo"));
    }

    #[test]
    fn test_filter_set_keeps_pinned_variant() {
        let set = FilterSet::build(
            &[TestFilter::for_module("CtsFoo").with_variant("arm64-v8a")],
            &variants(),
        );
        assert!(set.names("arm64-v8a CtsFoo"));
        assert!(!set.names("armeabi-v7a CtsFoo"));
    }

    #[test]
    fn test_whole_module_exclude_wins() {
        let includes = FilterSet::build(&[TestFilter::for_module("CtsFoo")], &variants());
        let excludes = FilterSet::build(&[TestFilter::for_module("CtsFoo")], &variants());
        assert!(!is_included("arm64-v8a CtsFoo", false, &includes, &excludes));
    }

    #[test]
    fn test_test_level_exclude_keeps_module() {
        let includes = FilterSet::default();
        let excludes = FilterSet::build(&[TestFilter::for_test("CtsFoo", "T#a")], &variants());
        assert!(is_included("arm64-v8a CtsFoo", true, &includes, &excludes));
    }

    #[test]
    fn test_include_filter_limits_modules() {
        let includes = FilterSet::build(&[TestFilter::for_module("CtsFoo")], &variants());
        let excludes = FilterSet::default();
        assert!(is_included("arm64-v8a CtsFoo", false, &includes, &excludes));
        assert!(!is_included("arm64-v8a CtsBar", false, &includes, &excludes));
    }

    #[test]
    fn test_filter_file_skips_whole_module_entries() {
        let filters = vec![
            TestFilter::for_module("CtsFoo"),
            TestFilter::for_test("CtsFoo", "T#a"),
            TestFilter::for_test("CtsFoo", "T#b"),
        ];
        let file = FilterFile::write(&filters).unwrap().unwrap();
        assert_eq!(file.len(), 2);
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "T#a\nT#b\n");
    }

    #[test]
    fn test_filter_file_none_without_test_names() {
        let filters = vec![TestFilter::for_module("CtsFoo")];
        assert!(FilterFile::write(&filters).unwrap().is_none());
    }

    #[test]
    fn test_split_module_id() {
        assert_eq!(
            split_module_id("arm64-v8a CtsFoo"),
            Some(("arm64-v8a", "CtsFoo"))
        );
    }
}
