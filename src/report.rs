//! Test reporting and output generation.
//!
//! This module provides JUnit XML generation for an invocation record and
//! the console summary printed at the end of a run.

pub mod junit;

pub use junit::{JUnitReporter, generate_xml};

use crate::coordinator::ShardReport;
use crate::retry::store::InvocationRecord;

/// Returns the process exit code for a finished invocation.
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed and every shard finished |
/// | 1 | A test failed, a module errored or a shard aborted |
pub fn exit_code(record: &InvocationRecord, shards: &[ShardReport]) -> i32 {
    if record.is_success() && shards.iter().all(|s| s.error.is_none()) {
        0
    } else {
        1
    }
}

/// Prints a summary of the invocation to the console.
pub fn print_summary(record: &InvocationRecord, shards: &[ShardReport]) {
    let (passed, failed, skipped) = record.counts();

    println!();
    println!("Invocation {}:", console::style(&record.invocation_id).bold());
    if let Some(prior) = &record.retry_of {
        println!("  Retry of: {}", prior);
    }
    println!("  Modules: {}", record.modules.len());
    println!("  Passed:  {}", console::style(passed).green());
    println!("  Failed:  {}", console::style(failed).red());
    println!("  Skipped: {}", console::style(skipped).yellow());

    let errored: Vec<(&String, &String)> = record
        .modules
        .iter()
        .filter_map(|(id, module)| module.error.as_ref().map(|e| (id, e)))
        .collect();
    if !errored.is_empty() {
        println!("  Module errors:");
        for (id, error) in errored {
            println!("    {}: {}", id, console::style(error).red());
        }
    }

    for shard in shards {
        if let Some(error) = &shard.error {
            println!(
                "  Shard {} aborted: {}",
                shard.serial,
                console::style(error).red().bold()
            );
        }
    }

    println!();
    if exit_code(record, shards) == 0 {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
        println!(
            "{}",
            console::style(format!(
                "Re-run outstanding tests with: modshard run --retry {}",
                record.invocation_id
            ))
            .dim()
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::module::{TestOutcome, TestResult};

    #[test]
    fn test_exit_code() {
        let mut record = InvocationRecord::new("inv", "fp", "", Utc::now());
        record.record_results("arm64-v8a A", &[TestResult::new("T#a", TestOutcome::Passed)]);
        assert_eq!(exit_code(&record, &[]), 0);

        let aborted = ShardReport {
            serial: "dev-1".into(),
            runs: Vec::new(),
            error: Some("lost".into()),
        };
        assert_eq!(exit_code(&record, &[aborted]), 1);

        record.record_results("arm64-v8a B", &[TestResult::new("T#b", TestOutcome::Failed)]);
        assert_eq!(exit_code(&record, &[]), 1);
    }
}
