//! JUnit XML report generation.
//!
//! One `testsuite` is written per module id, so the pieces of a split
//! module report together:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="2024.05.01_10.00.00" tests="3" failures="1" errors="0" skipped="0" time="12.500">
//!   <testsuite name="arm64-v8a CtsFooTestCases" tests="2" failures="1" errors="0" skipped="0" time="10.000">
//!     <testcase classname="android.foo.FooTest" name="testA" time="0.100"/>
//!     <testcase classname="android.foo.FooTest" name="testB" time="0.150">
//!       <failure message="expected 1" type="AssertionError">stack</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! A module that could not run to completion carries an extra errored
//! `testcase` named after the module, so CI dashboards surface it.

use std::path::{Path, PathBuf};

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::info;

use crate::module::{TestOutcome, TestResult};
use crate::retry::store::{InvocationRecord, ModuleRecord};

/// Writes JUnit XML for an invocation record.
#[derive(Debug, Clone)]
pub struct JUnitReporter {
    output_path: PathBuf,
}

impl JUnitReporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Generates the XML and writes it, creating parent directories.
    pub fn write(&self, record: &InvocationRecord) -> anyhow::Result<()> {
        let xml = generate_xml(record)?;
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        info!("JUnit XML written to: {}", self.output_path.display());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    tests: usize,
    failures: usize,
    errors: usize,
    skipped: usize,
}

impl Totals {
    fn of(module: &ModuleRecord) -> Self {
        let mut totals = Self::default();
        for result in module.tests.values() {
            totals.tests += 1;
            match result.outcome {
                TestOutcome::Passed => {}
                TestOutcome::Failed => totals.failures += 1,
                TestOutcome::Error => totals.errors += 1,
                TestOutcome::Skipped => totals.skipped += 1,
            }
        }
        if module.error.is_some() {
            totals.tests += 1;
            totals.errors += 1;
        }
        totals
    }

    fn add(mut self, other: Totals) -> Self {
        self.tests += other.tests;
        self.failures += other.failures;
        self.errors += other.errors;
        self.skipped += other.skipped;
        self
    }

    fn push_attributes(&self, element: &mut BytesStart<'_>, time_secs: f64) {
        element.push_attribute(("tests", self.tests.to_string().as_str()));
        element.push_attribute(("failures", self.failures.to_string().as_str()));
        element.push_attribute(("errors", self.errors.to_string().as_str()));
        element.push_attribute(("skipped", self.skipped.to_string().as_str()));
        element.push_attribute(("time", format!("{:.3}", time_secs).as_str()));
    }
}

/// Renders `record` as a JUnit XML document.
pub fn generate_xml(record: &InvocationRecord) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let totals = record
        .modules
        .values()
        .map(Totals::of)
        .fold(Totals::default(), Totals::add);
    let total_ms: u64 = record.modules.values().map(|m| m.runtime_ms).sum();

    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", record.invocation_id.as_str()));
    totals.push_attributes(&mut testsuites, total_ms as f64 / 1000.0);
    writer.write_event(Event::Start(testsuites))?;

    for (module_id, module) in &record.modules {
        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", module_id.as_str()));
        Totals::of(module).push_attributes(&mut testsuite, module.runtime_ms as f64 / 1000.0);
        writer.write_event(Event::Start(testsuite))?;

        for result in module.tests.values() {
            write_testcase(&mut writer, result)?;
        }
        if let Some(error) = &module.error {
            let result = TestResult::new(module_id.as_str(), TestOutcome::Error).with_error(error.as_str());
            write_testcase(&mut writer, &result)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, result: &TestResult) -> anyhow::Result<()> {
    let (classname, name) = split_test_id(&result.test_id);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", name));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration.as_secs_f64()).as_str(),
    ));

    let (tag, kind) = match result.outcome {
        TestOutcome::Passed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        TestOutcome::Skipped => {
            writer.write_event(Event::Start(testcase))?;
            writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            return Ok(());
        }
        TestOutcome::Failed => ("failure", "AssertionError"),
        TestOutcome::Error => ("error", "Error"),
    };

    writer.write_event(Event::Start(testcase))?;
    let mut element = BytesStart::new(tag);
    if let Some(message) = &result.error_message {
        element.push_attribute(("message", strip_invalid(message).as_str()));
    }
    element.push_attribute(("type", kind));
    writer.write_event(Event::Start(element))?;
    if let Some(trace) = &result.stack_trace {
        writer.write_event(Event::Text(BytesText::new(&strip_invalid(trace))))?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Splits `class#method` test ids; other ids become the name alone.
fn split_test_id(id: &str) -> (&str, &str) {
    match id.rsplit_once('#') {
        Some((classname, name)) => (classname, name),
        None => ("", id),
    }
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to quick-xml.
fn strip_invalid(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::module::command::parse_junit_xml;

    fn record() -> InvocationRecord {
        let mut record = InvocationRecord::new("inv", "fp", "", Utc::now());
        record.record_results(
            "arm64-v8a CtsFoo",
            &[
                TestResult::new("a.FooTest#testA", TestOutcome::Passed),
                TestResult::new("a.FooTest#testB", TestOutcome::Failed)
                    .with_error("expected <1>")
                    .with_stack_trace("at a.FooTest.testB"),
                TestResult::new("a.FooTest#testC", TestOutcome::Skipped),
            ],
        );
        record.record_error("x86 CtsBar", "Device dev-1 not available");
        record
    }

    #[test]
    fn test_one_suite_per_module() {
        let xml = generate_xml(&record()).unwrap();
        assert!(xml.contains(r#"<testsuite name="arm64-v8a CtsFoo" tests="3" failures="1" errors="0" skipped="1""#));
        assert!(xml.contains(r#"<testsuite name="x86 CtsBar" tests="1" failures="0" errors="1""#));
        assert!(xml.contains(r#"<testsuites name="inv" tests="4" failures="1" errors="1" skipped="1""#));
        assert!(xml.contains("expected &lt;1&gt;"));
    }

    #[test]
    fn test_output_is_readable_junit() {
        let xml = generate_xml(&record()).unwrap();
        let parsed = parse_junit_xml(&xml).unwrap();
        let outcomes: Vec<(&str, TestOutcome)> = parsed
            .iter()
            .map(|r| (r.test_id.as_str(), r.outcome))
            .collect();
        assert!(outcomes.contains(&("a.FooTest#testA", TestOutcome::Passed)));
        assert!(outcomes.contains(&("a.FooTest#testB", TestOutcome::Failed)));
        assert!(outcomes.contains(&("a.FooTest#testC", TestOutcome::Skipped)));
    }

    #[test]
    fn test_write_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/junit.xml");
        JUnitReporter::new(&path).write(&record()).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().starts_with("<?xml"));
    }

    #[test]
    fn test_split_test_id() {
        assert_eq!(split_test_id("a.FooTest#testA"), ("a.FooTest", "testA"));
        assert_eq!(split_test_id("all_tests"), ("", "all_tests"));
    }
}
