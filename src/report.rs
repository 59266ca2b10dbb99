//! Run summary and console progress reporting.
//!
//! A progress bar plus a colored status line per finished test, and an
//! aggregate exit code computed as a bitmask over every status seen in the
//! run rather than a single pass/fail flag.

use std::collections::BTreeMap;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::model::{TestId, TestStatus};

/// Exit-code bits, ORed together across every test in the run.
pub mod exit_bits {
    pub const DIFF: i32 = 2;
    pub const FAIL: i32 = 4;
    pub const TIMEOUT: i32 = 8;
    pub const NOTDONE: i32 = 16;
    pub const NOTRUN: i32 = 32;
}

/// Aggregate counts and the computed process exit code for a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub counts: BTreeMap<&'static str, usize>,
    pub total: usize,
    pub duration: std::time::Duration,
}

impl RunSummary {
    pub fn from_counts(counts: BTreeMap<&'static str, usize>, duration: std::time::Duration) -> Self {
        let total = counts.values().sum();
        Self {
            counts,
            total,
            duration,
        }
    }

    /// Bitwise-OR every status present in the run onto the exit code; `0`
    /// means every test passed (or was skipped).
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;
        if self.counts.get("diff").copied().unwrap_or(0) > 0 {
            code |= exit_bits::DIFF;
        }
        if self.counts.get("fail").copied().unwrap_or(0) > 0 {
            code |= exit_bits::FAIL;
        }
        if self.counts.get("timeout").copied().unwrap_or(0) > 0 {
            code |= exit_bits::TIMEOUT;
        }
        if self.counts.get("notdone").copied().unwrap_or(0) > 0 {
            code |= exit_bits::NOTDONE;
        }
        if self.counts.get("notrun-by-dep").copied().unwrap_or(0) > 0 || self.counts.get("notrun").copied().unwrap_or(0) > 0 {
            code |= exit_bits::NOTRUN;
        }
        code
    }

    pub fn success(&self) -> bool {
        self.exit_code() == 0
    }
}

/// Drives a terminal progress bar and prints a colored status line per test
/// as it finishes.
pub struct ConsoleProgress {
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl ConsoleProgress {
    pub fn new(total: u64, quiet: bool, show_progress: bool) -> Self {
        let bar = if show_progress && !quiet {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap()
                .progress_chars("=>-"),
            );
            Some(bar)
        } else {
            None
        };
        Self { bar, quiet }
    }

    pub fn on_test_complete(&self, id: &TestId, status: TestStatus) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        if self.quiet {
            return;
        }
        let (label, styled) = match status {
            TestStatus::Pass => ("pass", style("PASS").green().bold()),
            TestStatus::Diff => ("diff", style("DIFF").yellow().bold()),
            TestStatus::Fail => ("fail", style("FAIL").red().bold()),
            TestStatus::Timeout => ("timeout", style("TIMEOUT").red().bold()),
            TestStatus::NotDone => ("notdone", style("NOTDONE").red().bold()),
            TestStatus::Skip => ("skip", style("SKIP").dim()),
            TestStatus::NotRunByDep => ("notrun-by-dep", style("NOTRUN").dim()),
            TestStatus::NotRun | TestStatus::Running => ("?", style("?").dim()),
        };
        let line = format!("{styled} {id}");
        let _ = label;
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    pub fn finish(&self, summary: &RunSummary) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
        if self.quiet {
            return;
        }
        println!(
            "{} tests in {:.1}s: {}",
            summary.total,
            summary.duration.as_secs_f64(),
            summary
                .counts
                .iter()
                .map(|(k, v)| format!("{v} {k}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_pass_is_zero_exit_code() {
        let mut counts = BTreeMap::new();
        counts.insert("pass", 5);
        let summary = RunSummary::from_counts(counts, std::time::Duration::ZERO);
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.success());
    }

    #[test]
    fn fail_and_timeout_bits_combine() {
        let mut counts = BTreeMap::new();
        counts.insert("fail", 1);
        counts.insert("timeout", 1);
        let summary = RunSummary::from_counts(counts, std::time::Duration::ZERO);
        assert_eq!(summary.exit_code(), exit_bits::FAIL | exit_bits::TIMEOUT);
    }

    #[test]
    fn notrun_by_dep_sets_notrun_bit() {
        let mut counts = BTreeMap::new();
        counts.insert("notrun-by-dep", 2);
        let summary = RunSummary::from_counts(counts, std::time::Duration::ZERO);
        assert_eq!(summary.exit_code(), exit_bits::NOTRUN);
    }
}
