//! Console reporting of test events

use colored::Colorize;

use crate::events::{OutputStream, RunOutcome, TestEvent, TestObserver};
use crate::model::{FailureSite, TestResult};

/// Prints load progress, case outcomes and the run summary
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    verbose: bool,
}

impl ConsoleObserver {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Text printed for `event`, if any
    pub fn render(&self, event: &TestEvent) -> Option<String> {
        match event {
            TestEvent::TestLoaded { name, test } => Some(format!(
                "{} {} ({} test cases)",
                "Loaded".cyan(),
                name,
                test.test_case_count()
            )),
            TestEvent::TestReloaded { name, test } => Some(format!(
                "\n{} {} ({} test cases)",
                "Reloaded".cyan(),
                name,
                test.test_case_count()
            )),
            TestEvent::TestLoadFailed { name, error } | TestEvent::TestReloadFailed { name, error } => {
                Some(format!("{} Failed to load {}: {}", "✗".red(), name, error))
            }
            TestEvent::TestUnloadFailed { name, error } => {
                Some(format!("{} Failed to unload {}: {}", "✗".red(), name, error))
            }
            TestEvent::RunStarting { name, test_count } => Some(format!(
                "\n{} {} ({} test cases)",
                "Running".cyan(),
                name,
                test_count
            )),
            TestEvent::TestFinished { result } => self.render_case(result),
            TestEvent::SuiteFinished { result: TestResult::Suite(suite) } => {
                // Only the suite's own failures; children report themselves
                match (&suite.failure_site, &suite.message) {
                    (Some(site), Some(message)) if *site != FailureSite::Child => Some(format!(
                        "  {} {} ({:?}): {}",
                        "✗".red(),
                        suite.name.full_name.red(),
                        site,
                        message
                    )),
                    _ => None,
                }
            }
            TestEvent::UnhandledException { error } => {
                Some(format!("  {} {}", "Unhandled:".red().bold(), error))
            }
            TestEvent::TestOutput { output } if self.verbose => {
                let text = output.text.trim_end();
                Some(match output.stream {
                    OutputStream::Stderr => format!("    {}", text.yellow()),
                    _ => format!("    {}", text.dimmed()),
                })
            }
            TestEvent::RunFinished { outcome } => Some(render_outcome(outcome)),
            _ => None,
        }
    }

    fn render_case(&self, result: &TestResult) -> Option<String> {
        let TestResult::Case(case) = result else {
            return None;
        };

        if !case.executed {
            if !self.verbose {
                return None;
            }
            let reason = case.message.as_deref().unwrap_or("not run");
            return Some(format!("  {} {} {}", "-".yellow(), case.name.full_name, reason.dimmed()));
        }

        let elapsed = format!("({} ms)", case.time.as_millis());
        if case.success {
            return Some(format!("  {} {} {}", "✓".green(), case.name.full_name, elapsed.dimmed()));
        }

        let mut text = format!("  {} {} {}", "✗".red(), case.name.full_name.red(), elapsed.dimmed());
        if let Some(message) = &case.message {
            for line in message.lines() {
                text.push_str(&format!("\n      {}", line));
            }
        }
        if self.verbose {
            if let Some(trace) = &case.stack_trace {
                for line in trace.lines() {
                    text.push_str(&format!("\n      {}", line.dimmed()));
                }
            }
        }
        Some(text)
    }
}

fn render_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed(result) => {
            let summary = result.summary();
            let counts = format!(
                "{} passed, {} failed, {} not run",
                summary.passed, summary.failed, summary.not_run
            );
            let elapsed = format!("{:.2}s", summary.time.as_secs_f64());
            if result.is_failure() {
                format!("\n{} {} {}\n", "✗".red().bold(), counts.red().bold(), elapsed.dimmed())
            } else {
                format!("\n{} {} {}\n", "✓".green().bold(), counts.green().bold(), elapsed.dimmed())
            }
        }
        RunOutcome::Failed(error) => format!("\n{} {}\n", "✗ Run failed:".red().bold(), error),
    }
}

impl TestObserver for ConsoleObserver {
    fn on_event(&self, event: &TestEvent) {
        if let Some(text) = self.render(event) {
            println!("{}", text);
        }
    }
}
