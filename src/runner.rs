//! Sequential step runner.
//!
//! Every step is attempted exactly once, in order. A step that exits non-zero, cannot be
//! spawned or overruns the per-step timeout becomes a failed [`StepResult`]; the runner moves on
//! to the next step either way. Only losing the reports directory or the console is fatal.
use std::io::{self, BufRead, BufReader, PipeReader, Write};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::error::RunnerError;
use crate::runtime::ContainerRuntime;
use crate::types::{shell_program, ScanStep, StepCommand, StepOutcome, StepResult};

/// Lines buffered between the pipe reader thread and the console writer.
const LINE_BUFFER: usize = 256;

const RULE_WIDTH: usize = 60;

/// Upper bound for `<runtime> kill` when stopping a timed out container step.
const CONTAINER_KILL_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs steps one after another, mirroring their combined output to `out`.
#[derive(Debug)]
pub struct StepRunner<W: Write> {
    out: W,
    step_timeout: Option<Duration>,
}

/// A spawned step: the child plus the merged stdout/stderr line stream.
struct RunningStep {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl<W: Write> StepRunner<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            step_timeout: None,
        }
    }

    /// Kill steps running longer than `timeout`. `None` leaves steps unbounded.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Create `reports_dir`, run every step, print the final banner.
    ///
    /// Returns one result per step, in step order, whatever the individual outcomes.
    pub async fn run_all(
        &mut self,
        steps: &[ScanStep],
        reports_dir: &Path,
    ) -> Result<Vec<StepResult>, RunnerError> {
        ensure_reports_dir(reports_dir).await?;

        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            results.push(self.run_step(step).await?);
        }

        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let failed = results.len() - succeeded;
        self.line("")?;
        self.line(&format!(
            "All security scan steps finished: {succeeded} succeeded, {failed} failed"
        ))?;
        self.line(&format!("Reports written to {}", reports_dir.display()))?;
        info!(succeeded, failed, "run complete");
        Ok(results)
    }

    /// Run a single step to completion and classify it.
    pub async fn run_step(&mut self, step: &ScanStep) -> Result<StepResult, RunnerError> {
        self.line("")?;
        self.line(&format!(">>> Running: {}", step.name))?;
        self.line(&"=".repeat(RULE_WIDTH))?;
        info!(step = %step.name, command = %step.command, "starting step");

        let started = Instant::now();
        let mut running = match spawn_merged(&step.command) {
            Ok(r) => r,
            Err(e) => {
                error!(
                    step = %step.name,
                    program = step.command.program(),
                    error = %e,
                    "step could not start"
                );
                self.line(&format!("failed to start {}: {e}", step.command.program()))?;
                let result = StepResult::from_exit_code(step.clone(), None, started.elapsed());
                self.report(&result)?;
                return Ok(result);
            }
        };

        let result = match self.step_timeout {
            None => {
                let code = self.stream(&mut running).await?;
                StepResult::from_exit_code(step.clone(), code, started.elapsed())
            }
            Some(limit) => {
                let streamed = time::timeout(limit, self.stream(&mut running)).await;
                match streamed {
                    Ok(code) => StepResult::from_exit_code(step.clone(), code?, started.elapsed()),
                    Err(_) => {
                        warn!(
                            step = %step.name,
                            limit_secs = limit.as_secs(),
                            "step timed out, killing it"
                        );
                        stop_step(step, &mut running).await;
                        // whatever the reader already has, but do not wait for more
                        while let Ok(line) = running.lines.try_recv() {
                            self.line(&line)?;
                        }
                        StepResult::timed_out(step.clone(), started.elapsed())
                    }
                }
            }
        };

        self.report(&result)?;
        Ok(result)
    }

    /// Forward lines until the pipe closes, then reap the child.
    async fn stream(&mut self, running: &mut RunningStep) -> Result<Option<i32>, RunnerError> {
        while let Some(line) = running.lines.recv().await {
            self.line(&line)?;
        }
        match running.child.wait().await {
            Ok(status) => Ok(status.code()),
            Err(e) => {
                warn!(error = %e, "failed to wait for step process");
                Ok(None)
            }
        }
    }

    fn report(&mut self, result: &StepResult) -> Result<(), RunnerError> {
        let name = &result.step.name;
        let secs = result.duration.as_secs_f64();
        self.line("")?;
        match result.outcome {
            StepOutcome::Succeeded => {
                info!(step = %name, secs, "step succeeded");
                self.line(&format!("[ok] {name} completed successfully"))
            }
            StepOutcome::Failed => {
                warn!(step = %name, exit_code = result.exit_code, secs, "step failed");
                self.line(&format!(
                    "[FAIL] {name} finished with errors (exit code {})",
                    result.exit_code
                ))
            }
            StepOutcome::TimedOut => {
                warn!(step = %name, secs, "step timed out");
                self.line(&format!(
                    "[FAIL] {name} timed out after {}s and was killed",
                    self.step_timeout.unwrap_or_default().as_secs()
                ))
            }
        }
    }

    fn line(&mut self, s: &str) -> Result<(), RunnerError> {
        writeln!(self.out, "{s}")
            .and_then(|_| self.out.flush())
            .map_err(RunnerError::Console)
    }
}

/// Create the reports directory if needed. Existing contents are left alone.
pub async fn ensure_reports_dir(dir: &Path) -> Result<(), RunnerError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| RunnerError::ReportsDir {
            path: dir.to_path_buf(),
            source,
        })?;
    debug!(dir = %dir.display(), "reports directory ready");
    Ok(())
}

/// Stop everything a timed out step started: its container (when it runs one) and its
/// whole process group, so no descendant keeps writing after the step is recorded.
async fn stop_step(step: &ScanStep, running: &mut RunningStep) {
    if let (Some(name), StepCommand::Exec { program, .. }) = (&step.container, &step.command) {
        let runtime = ContainerRuntime::new(program.as_str());
        match time::timeout(CONTAINER_KILL_TIMEOUT, runtime.kill_container(name)).await {
            Ok(Ok(())) => debug!(step = %step.name, container = %name, "container stopped"),
            Ok(Err(e)) => warn!(
                step = %step.name,
                container = %name,
                error = %e,
                "failed to kill container"
            ),
            Err(_) => warn!(step = %step.name, container = %name, "container kill did not finish"),
        }
    }

    if let Err(e) = kill_process_group(&mut running.child).await {
        warn!(step = %step.name, error = %e, "failed to kill timed out step");
    }
}

#[cfg(unix)]
async fn kill_process_group(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // already reaped
        return Ok(());
    };
    let pgid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;
    // SAFETY: plain syscall; a negative pid addresses the group the child leads.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    child.wait().await.map(|_| ())
}

#[cfg(not(unix))]
async fn kill_process_group(child: &mut Child) -> io::Result<()> {
    child.kill().await
}

/// Spawn with stdout and stderr sharing one pipe, so lines arrive in the order they were
/// written. A dedicated thread reads the pipe; it is not tied to the runtime so a descendant
/// holding the pipe open cannot stall shutdown.
fn spawn_merged(command: &StepCommand) -> io::Result<RunningStep> {
    let (reader, writer) = io::pipe()?;
    let child = {
        let mut cmd = build_command(command);
        cmd.stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);
        // own group, so a timeout can take down grandchildren too
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()?
        // `cmd` drops here, closing our copies of the write end
    };

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    std::thread::Builder::new()
        .name("step-output".into())
        .spawn(move || pump_lines(reader, tx))?;

    Ok(RunningStep { child, lines: rx })
}

fn build_command(command: &StepCommand) -> Command {
    match command {
        StepCommand::Exec { program, args } => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
        StepCommand::Shell(line) => {
            let mut cmd = Command::new(shell_program());
            cmd.arg(if cfg!(windows) { "/C" } else { "-c" }).arg(line);
            cmd
        }
    }
}

fn pump_lines(reader: PipeReader, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if tx.blocking_send(decode_line(&buf)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "reading step output failed");
                break;
            }
        }
    }
}

/// Strip the line terminator and decode, replacing invalid UTF-8 with U+FFFD.
pub fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
