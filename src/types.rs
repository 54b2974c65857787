use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};

/// Exit code recorded for a step killed by the per-step timeout (same as coreutils `timeout`).
pub const TIMED_OUT_EXIT_CODE: i32 = 124;

/// Exit code recorded when the child produced no code (killed by a signal, failed to start).
pub const NO_EXIT_CODE: i32 = -1;

/// How a step is launched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepCommand {
    /// Program plus ordered argument list, spawned directly.
    Exec { program: String, args: Vec<String> },
    /// Opaque shell line, run via `sh -c`.
    Shell(String),
}

impl StepCommand {
    pub fn exec<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StepCommand::Exec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shell(line: impl Into<String>) -> Self {
        StepCommand::Shell(line.into())
    }

    /// Program name used in "not found" errors.
    pub fn program(&self) -> &str {
        match self {
            StepCommand::Exec { program, .. } => program,
            StepCommand::Shell(_) => shell_program(),
        }
    }
}

#[cfg(not(windows))]
pub(crate) fn shell_program() -> &'static str {
    "sh"
}

#[cfg(windows)]
pub(crate) fn shell_program() -> &'static str {
    "cmd"
}

impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepCommand::Exec { program, args } => {
                f.write_str(program)?;
                for a in args {
                    if a.is_empty() || a.contains(char::is_whitespace) {
                        write!(f, " {a:?}")?;
                    } else {
                        write!(f, " {a}")?;
                    }
                }
                Ok(())
            }
            StepCommand::Shell(line) => f.write_str(line),
        }
    }
}

/// One scanner invocation. Immutable once built; the run's step list is fixed at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanStep {
    pub name: String,
    pub command: StepCommand,
    /// Artifact the tool is expected to write under the reports directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PathBuf>,
    /// `--name` of the container the step runs, so a timed out step can be stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl ScanStep {
    pub fn new(name: impl Into<String>, command: StepCommand) -> Self {
        Self {
            name: name.into(),
            command,
            report: None,
            container: None,
        }
    }

    pub fn with_container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    pub fn with_report(mut self, report: impl Into<PathBuf>) -> Self {
        self.report = Some(report.into());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Final state of one attempted step. Created once when the step finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub step: ScanStep,
    pub exit_code: i32,
    pub outcome: StepOutcome,
    pub duration: Duration,
}

impl StepResult {
    /// Classify by exit code: 0 is success, anything else (including no code) is failure.
    pub fn from_exit_code(step: ScanStep, code: Option<i32>, duration: Duration) -> Self {
        let exit_code = code.unwrap_or(NO_EXIT_CODE);
        let outcome = if exit_code == 0 {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed
        };
        Self {
            step,
            exit_code,
            outcome,
            duration,
        }
    }

    pub fn timed_out(step: ScanStep, duration: Duration) -> Self {
        Self {
            step,
            exit_code: TIMED_OUT_EXIT_CODE,
            outcome: StepOutcome::TimedOut,
            duration,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == StepOutcome::Succeeded
    }
}

/// Serialized per-step line of the run summary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,
    pub exit_code: i32,
    pub succeeded: bool,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PathBuf>,
}

impl From<&StepResult> for StepRecord {
    fn from(r: &StepResult) -> Self {
        Self {
            name: r.step.name.clone(),
            exit_code: r.exit_code,
            succeeded: r.succeeded(),
            outcome: r.outcome,
            duration_ms: r.duration.as_millis() as u64,
            report: r.step.report.clone(),
        }
    }
}

/// Step outcomes of one run. Says nothing about what the tools found.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: String,
    pub target_url: String,
    pub reports_dir: PathBuf,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<StepRecord>,
}

impl RunSummary {
    pub fn new(
        started_at: String,
        target_url: String,
        reports_dir: PathBuf,
        results: &[StepResult],
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        Self {
            started_at,
            finished_at: now_rfc3339(),
            target_url,
            reports_dir,
            succeeded,
            failed: results.len() - succeeded,
            results: results.iter().map(StepRecord::from).collect(),
        }
    }
}

pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
