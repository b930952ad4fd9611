//! Framework for Rust test executables built with the libtest harness
//!
//! Discovery uses `--list --format terse`; each case runs in its own child
//! process with `--exact`, so a crashing test cannot take the context down.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::common::{Error, Result};
use crate::events::{OutputStream, TestOutput};
use crate::model::Test;

use super::framework::{AssemblyContext, CaseContext, CaseOutcome, LoadedAssembly, TestCaseInfo, TestFramework};

/// Category given to `#[ignore]` tests
pub const IGNORED_CATEGORY: &str = "Ignored";

/// Environment variable pointing tests at the package configuration file
pub const CONFIG_FILE_ENV: &str = "TESTRIG_CONFIG_FILE";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct LibtestFramework;

impl LibtestFramework {
    pub fn new() -> Self {
        Self
    }
}

impl TestFramework for LibtestFramework {
    fn name(&self) -> &str {
        "libtest"
    }

    fn can_load(&self, assembly: &Path) -> bool {
        is_executable(assembly)
    }

    fn load(&self, assembly: &Path, context: &AssemblyContext) -> Result<Box<dyn LoadedAssembly>> {
        if !assembly.exists() {
            return Err(Error::AssemblyNotFound(assembly.display().to_string()));
        }

        let executable = LibtestExecutable {
            path: assembly.to_path_buf(),
            context: context.clone(),
        };

        let all = executable.list(false)?;
        // Older harnesses reject `--ignored` together with `--list`
        let ignored: BTreeSet<String> = executable.list(true).unwrap_or_default().into_iter().collect();

        let cases = all
            .into_iter()
            .map(|name| {
                let case = TestCaseInfo::new(name.clone());
                if ignored.contains(&name) {
                    case.with_category(IGNORED_CATEGORY)
                } else {
                    case
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            assembly = %assembly.display(),
            cases = cases.len(),
            ignored = ignored.len(),
            "Listed libtest cases"
        );

        Ok(Box::new(LoadedLibtest { executable, cases }))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("exe"))
            .unwrap_or(false)
}

struct LibtestExecutable {
    path: PathBuf,
    context: AssemblyContext,
}

impl LibtestExecutable {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        if self.context.application_base.is_dir() {
            cmd.current_dir(&self.context.application_base);
        }

        if !self.context.private_bin_path.is_empty() {
            let mut dirs = self.context.private_bin_path.clone();
            if let Some(existing) = std::env::var_os("PATH") {
                dirs.extend(std::env::split_paths(&existing));
            }
            if let Ok(joined) = std::env::join_paths(dirs) {
                cmd.env("PATH", joined);
            }
        }

        if let Some(config_file) = &self.context.config_file {
            cmd.env(CONFIG_FILE_ENV, config_file);
        }

        cmd.stdin(Stdio::null());
        cmd
    }

    fn list(&self, ignored_only: bool) -> Result<Vec<String>> {
        let mut cmd = self.command();
        cmd.args(["--list", "--format", "terse"]);
        if ignored_only {
            cmd.arg("--ignored");
        }

        let output = cmd.output().map_err(|e| {
            Error::framework("libtest", format!("Failed to list '{}': {}", self.path.display(), e))
        })?;

        if !output.status.success() {
            return Err(Error::framework(
                "libtest",
                format!(
                    "'{}' exited with {} while listing tests",
                    self.path.display(),
                    output.status
                ),
            ));
        }

        Ok(parse_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `name: test` lines from terse list output
fn parse_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_suffix(": test"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

struct LoadedLibtest {
    executable: LibtestExecutable,
    cases: Vec<TestCaseInfo>,
}

impl LoadedAssembly for LoadedLibtest {
    fn cases(&self) -> &[TestCaseInfo] {
        &self.cases
    }

    fn execute(
        &mut self,
        case: &Test,
        context: &CaseContext<'_>,
        output: &mut dyn FnMut(TestOutput),
    ) -> CaseOutcome {
        let name = &case.name.full_name;
        if case.categories.contains(IGNORED_CATEGORY) {
            return CaseOutcome::NotRun {
                reason: "Ignored".to_string(),
            };
        }

        let mut cmd = self.executable.command();
        cmd.args([name.as_str(), "--exact", "--nocapture", "--test-threads", "1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CaseOutcome::Failed {
                    message: format!("Failed to start test process: {}", e),
                    stack_trace: None,
                }
            }
        };

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let ending = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ending::Exited(status),
                Ok(None) => {}
                Err(e) => break Ending::WaitFailed(e.to_string()),
            }
            if context.cancel.load(Ordering::SeqCst) {
                break Ending::Cancelled;
            }
            if started.elapsed() >= context.timeout {
                break Ending::TimedOut;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !matches!(ending, Ending::Exited(_)) {
            let _ = child.kill();
            let _ = child.wait();
        }

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        let own_output = strip_harness_lines(&stdout, name);
        if !own_output.is_empty() {
            output(TestOutput {
                stream: OutputStream::Stdout,
                text: own_output,
                test_name: Some(name.clone()),
            });
        }
        if !stderr.is_empty() {
            output(TestOutput {
                stream: OutputStream::Stderr,
                text: stderr.clone(),
                test_name: Some(name.clone()),
            });
        }

        match ending {
            Ending::Exited(status) if status.success() => {
                if stdout.contains("running 0 tests") {
                    CaseOutcome::NotRun {
                        reason: format!("'{}' no longer exists in the assembly", name),
                    }
                } else {
                    CaseOutcome::Passed { assert_count: 0 }
                }
            }
            Ending::Exited(status) => CaseOutcome::Failed {
                message: panic_message(&stderr).unwrap_or_else(|| format!("Test process exited with {}", status)),
                stack_trace: (!stderr.is_empty()).then_some(stderr),
            },
            Ending::TimedOut => CaseOutcome::Failed {
                message: format!("Test exceeded timeout of {} ms", context.timeout.as_millis()),
                stack_trace: None,
            },
            Ending::Cancelled => CaseOutcome::NotRun {
                reason: "Run cancelled".to_string(),
            },
            Ending::WaitFailed(e) => CaseOutcome::Failed {
                message: format!("Lost track of test process: {}", e),
                stack_trace: None,
            },
        }
    }
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Remove the harness's own progress and summary lines
fn strip_harness_lines(stdout: &str, name: &str) -> String {
    let status_prefix = format!("test {} ...", name);
    stdout
        .lines()
        .filter(|line| {
            !(line.starts_with("running ")
                || line.starts_with("test result:")
                || line.starts_with(&status_prefix)
                || line.trim().is_empty())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the panic location and message from stderr
fn panic_message(stderr: &str) -> Option<String> {
    let mut lines = stderr.lines();
    let location = lines.find(|line| line.contains("panicked at"))?;
    let detail = lines.next().unwrap_or("").trim();
    if detail.is_empty() || detail.starts_with("note:") {
        Some(location.trim().to_string())
    } else {
        Some(format!("{}\n{}", location.trim(), detail))
    }
}
