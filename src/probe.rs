//! Readiness prober.
//!
//! Polls the target on a fixed interval until one check gets an answer or the deadline passes.
//! "Ready" means a server answers on the port: any HTTP status counts, only a failed connection
//! attempt (refused, unresolved, timed out, closed without a byte) keeps the prober waiting.
use std::future::Future;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ProbeMode, RunContext};
use crate::error::ProbeError;
use crate::runtime::{ContainerRuntime, ContainerTool};
use crate::target::{ProbeTarget, Scheme};
use crate::types::StepCommand;

/// Extra time allowed for an in-network check to start its container.
const CONTAINER_STARTUP_GRACE: Duration = Duration::from_secs(10);

/// Bytes read from the HTTP response. The status line is all we look at.
const RESPONSE_PEEK: usize = 256;

/// curl exit codes meaning "no connection was made": resolve failure, connect failure, timeout.
const CURL_NOT_CONNECTED: &[i32] = &[5, 6, 7, 28];

/// Result of a single readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Reachable(String),
    NotReady(String),
}

/// One isolated connectivity check. Implementations must not hold connections between calls.
pub trait ReadinessCheck {
    fn check(&self, target: &ProbeTarget) -> impl Future<Output = CheckOutcome> + Send;
}

/// Plain TCP connect.
#[derive(Debug, Clone, Default)]
pub struct TcpCheck;

impl ReadinessCheck for TcpCheck {
    async fn check(&self, target: &ProbeTarget) -> CheckOutcome {
        match connect(target).await {
            Ok(_stream) => CheckOutcome::Reachable("tcp connect succeeded".into()),
            Err(reason) => CheckOutcome::NotReady(reason),
        }
    }
}

/// `GET /` over HTTP or HTTPS. Any response bytes count, so 301/401/500 are all "ready".
///
/// Stricter than [`TcpCheck`] where a port proxy accepts connections before the application
/// listens: such connections close without a response and stay "not ready".
#[derive(Clone)]
pub struct HttpCheck {
    tls: Option<tokio_native_tls::TlsConnector>,
}

impl std::fmt::Debug for HttpCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCheck")
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl HttpCheck {
    /// CI targets are commonly self-signed, so certificate and hostname errors are ignored.
    pub fn new(scheme: Scheme) -> Result<Self, ProbeError> {
        let tls = match scheme {
            Scheme::Http => None,
            Scheme::Https => {
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()?;
                Some(tokio_native_tls::TlsConnector::from(connector))
            }
        };
        Ok(Self { tls })
    }

    async fn attempt(&self, target: &ProbeTarget) -> Result<String, String> {
        let stream = connect(target).await?;
        match &self.tls {
            None => {
                let mut stream = stream;
                exchange(&mut stream, target).await
            }
            Some(tls) => {
                let mut stream = tls
                    .connect(&target.host, stream)
                    .await
                    .map_err(|e| format!("tls handshake failed: {e}"))?;
                exchange(&mut stream, target).await
            }
        }
    }
}

impl ReadinessCheck for HttpCheck {
    async fn check(&self, target: &ProbeTarget) -> CheckOutcome {
        match time::timeout(target.timeout, self.attempt(target)).await {
            Ok(Ok(detail)) => CheckOutcome::Reachable(detail),
            Ok(Err(reason)) => CheckOutcome::NotReady(reason),
            Err(_) => CheckOutcome::NotReady(format!(
                "no response within {}ms",
                target.timeout.as_millis()
            )),
        }
    }
}

/// Check from inside a container network, so hostnames that only exist there resolve.
/// Runs a short-lived `curl` container per attempt.
#[derive(Debug, Clone)]
pub struct ContainerCheck {
    runtime: ContainerRuntime,
    network: String,
    image: String,
    mode: ProbeMode,
}

impl ContainerCheck {
    pub fn new(
        runtime: ContainerRuntime,
        network: impl Into<String>,
        image: impl Into<String>,
        mode: ProbeMode,
    ) -> Self {
        Self {
            runtime,
            network: network.into(),
            image: image.into(),
            mode,
        }
    }

    /// curl without `-f`: exit 0 for any HTTP response.
    pub fn command(&self, target: &ProbeTarget) -> StepCommand {
        let secs = target.timeout.as_secs().max(1).to_string();
        let mut args = vec![
            "-s".to_string(),
            "-o".to_string(),
            "/dev/null".to_string(),
            "--max-time".to_string(),
            secs.clone(),
            "--connect-timeout".to_string(),
            secs,
        ];
        if target.scheme == Scheme::Https {
            args.push("-k".to_string());
        }
        args.push(target.root_url());

        let tool = ContainerTool {
            args,
            network: true,
            entrypoint: Some("curl".into()),
            ..ContainerTool::new(self.image.clone())
        };
        self.runtime.command_for(&tool, Some(&self.network), None)
    }

    fn classify(&self, code: Option<i32>, stderr: &str) -> CheckOutcome {
        match (self.mode, code) {
            (_, Some(0)) => CheckOutcome::Reachable("in-network request answered".into()),
            (ProbeMode::Tcp, Some(c)) if !CURL_NOT_CONNECTED.contains(&c) && c < 125 => {
                CheckOutcome::Reachable(format!("in-network connect succeeded (curl exit {c})"))
            }
            (_, Some(c)) => CheckOutcome::NotReady(format!(
                "in-network check exited with code {c}{}",
                if stderr.is_empty() {
                    String::new()
                } else {
                    format!(": {stderr}")
                }
            )),
            (_, None) => CheckOutcome::NotReady("in-network check was killed".into()),
        }
    }
}

impl ReadinessCheck for ContainerCheck {
    async fn check(&self, target: &ProbeTarget) -> CheckOutcome {
        let StepCommand::Exec { program, args } = self.command(target) else {
            return CheckOutcome::NotReady("in-network check is not a container run".into());
        };
        let mut cmd = Command::new(&program);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        let run = cmd.output();
        match time::timeout(target.timeout + CONTAINER_STARTUP_GRACE, run).await {
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                self.classify(output.status.code(), &stderr)
            }
            Ok(Err(e)) => CheckOutcome::NotReady(format!("failed to run {program}: {e}")),
            Err(_) => CheckOutcome::NotReady("in-network check did not finish".into()),
        }
    }
}

/// The check chosen for a run.
#[derive(Debug, Clone)]
pub enum AnyCheck {
    Tcp(TcpCheck),
    Http(HttpCheck),
    Container(ContainerCheck),
}

impl AnyCheck {
    /// In-network when a network is configured, otherwise a direct check per probe mode.
    pub fn for_context(ctx: &RunContext, runtime: &ContainerRuntime) -> Result<Self, ProbeError> {
        Ok(match (&ctx.network, ctx.probe_mode) {
            (Some(net), mode) => AnyCheck::Container(ContainerCheck::new(
                runtime.clone(),
                net.clone(),
                ctx.probe_image.clone(),
                mode,
            )),
            (None, ProbeMode::Tcp) => AnyCheck::Tcp(TcpCheck),
            (None, ProbeMode::Http) => AnyCheck::Http(HttpCheck::new(ctx.target.scheme)?),
        })
    }
}

impl ReadinessCheck for AnyCheck {
    async fn check(&self, target: &ProbeTarget) -> CheckOutcome {
        match self {
            AnyCheck::Tcp(c) => c.check(target).await,
            AnyCheck::Http(c) => c.check(target).await,
            AnyCheck::Container(c) => c.check(target).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Waiting,
    Ready,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub attempts: u32,
    pub elapsed: Duration,
    pub detail: String,
}

/// Fixed-interval poller with a hard deadline.
#[derive(Debug, Clone, Copy)]
pub struct Prober {
    interval: Duration,
    max_wait: Duration,
}

impl Prober {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }

    pub fn from_context(ctx: &RunContext) -> Self {
        Self::new(ctx.probe_interval, ctx.readiness_timeout)
    }

    /// Attempts start at `t0`, `t0 + interval`, ... while before the deadline. Each check is cut
    /// off at the deadline, so a timeout is raised no earlier than `max_wait` and before
    /// `max_wait + interval`. A zero `max_wait` times out without probing.
    pub async fn wait_until_ready<C: ReadinessCheck>(
        &self,
        check: &C,
        target: &ProbeTarget,
    ) -> Result<ProbeReport, ProbeError> {
        let start = Instant::now();
        let deadline = start + self.max_wait;
        let mut attempts = 0u32;
        let mut detail = String::new();
        let mut state = ProbeState::Waiting;

        while state == ProbeState::Waiting {
            let attempt_start = Instant::now();
            if attempt_start >= deadline {
                state = ProbeState::TimedOut;
                continue;
            }

            attempts += 1;
            let outcome = match time::timeout(deadline - attempt_start, check.check(target)).await
            {
                Ok(outcome) => outcome,
                Err(_) => CheckOutcome::NotReady("check cut off at the readiness deadline".into()),
            };

            match outcome {
                CheckOutcome::Reachable(d) => {
                    detail = d;
                    state = ProbeState::Ready;
                }
                CheckOutcome::NotReady(reason) => {
                    warn!(
                        attempt = attempts,
                        endpoint = %target.endpoint(),
                        reason = %reason,
                        "target not ready"
                    );
                    let next = attempt_start + self.interval;
                    if next >= deadline {
                        time::sleep_until(deadline).await;
                        state = ProbeState::TimedOut;
                    } else {
                        time::sleep_until(next).await;
                    }
                }
            }
        }

        let elapsed = start.elapsed();
        match state {
            ProbeState::Ready => {
                info!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    detail = %detail,
                    "target is ready"
                );
                Ok(ProbeReport {
                    attempts,
                    elapsed,
                    detail,
                })
            }
            _ => Err(ProbeError::TimedOut {
                endpoint: target.endpoint(),
                attempts,
                waited: elapsed,
            }),
        }
    }
}

/// Block until the configured target answers.
///
/// On timeout, the target service's recent logs are printed to `out` before the error is
/// returned. Showing the logs is best effort: neither a failed `logs` call nor a console error
/// while printing them replaces the timeout error.
pub async fn wait_for_target<W: Write>(
    ctx: &RunContext,
    runtime: &ContainerRuntime,
    out: &mut W,
) -> Result<ProbeReport, ProbeError> {
    if let Some(net) = &ctx.network {
        match runtime.network_exists(net).await {
            Ok(true) => debug!(network = %net, "network found"),
            Ok(false) => error!(
                network = %net,
                "network does not exist; every readiness check will fail until the deadline"
            ),
            Err(e) => warn!(network = %net, error = %e, "could not inspect network"),
        }
    }

    let check = AnyCheck::for_context(ctx, runtime)?;
    info!(
        endpoint = %ctx.target,
        mode = ?ctx.probe_mode,
        network = ctx.network.as_deref().unwrap_or("<host>"),
        timeout_secs = ctx.readiness_timeout.as_secs(),
        "waiting for target"
    );
    console(
        out,
        &format!(
            "Waiting up to {}s for {} ...",
            ctx.readiness_timeout.as_secs(),
            ctx.target
        ),
    )?;

    match Prober::from_context(ctx).wait_until_ready(&check, &ctx.target).await {
        Ok(report) => {
            console(
                out,
                &format!(
                    "Target {} is up after {} attempt(s)",
                    ctx.target, report.attempts
                ),
            )?;
            Ok(report)
        }
        Err(err) => {
            error!(error = %err, "target never became ready");
            if let Err(e) = dump_diagnostics(ctx, runtime, out).await {
                error!(error = %e, "could not print diagnostic logs");
            }
            Err(err)
        }
    }
}

async fn dump_diagnostics<W: Write>(
    ctx: &RunContext,
    runtime: &ContainerRuntime,
    out: &mut W,
) -> Result<(), ProbeError> {
    let Some(service) = ctx.diagnostics_service() else {
        warn!("no target service configured; skipping diagnostic logs");
        return Ok(());
    };
    let logs = match runtime.fetch_logs(service, ctx.log_tail).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!(service, error = %e, "could not fetch diagnostic logs");
            return Ok(());
        }
    };

    console(
        out,
        &format!("\n--- last {} log lines of {service} ---", ctx.log_tail),
    )?;
    console(out, logs.strip_suffix('\n').unwrap_or(&logs))?;
    console(out, &format!("--- end of {service} logs ---"))
}

fn console<W: Write>(out: &mut W, s: &str) -> Result<(), ProbeError> {
    writeln!(out, "{s}")
        .and_then(|_| out.flush())
        .map_err(ProbeError::Console)
}

async fn connect(target: &ProbeTarget) -> Result<TcpStream, String> {
    match time::timeout(
        target.timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(format!("connect to {} failed: {e}", target.endpoint())),
        Err(_) => Err(format!(
            "connect to {} timed out after {}ms",
            target.endpoint(),
            target.timeout.as_millis()
        )),
    }
}

/// Send `GET /` and wait for the first response bytes.
async fn exchange<S>(stream: &mut S, target: &ProbeTarget) -> Result<String, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: ci-scan-rs\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        target.host_header()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("request write failed: {e}"))?;

    let mut buf = vec![0u8; RESPONSE_PEEK];
    match stream.read(&mut buf).await {
        Ok(0) => Err("connection closed without a response".into()),
        Ok(n) => {
            buf.truncate(n);
            Ok(status_line(&buf).unwrap_or_else(|| format!("{n} response bytes")))
        }
        Err(e) => Err(format!("response read failed: {e}")),
    }
}

/// First line of an HTTP response, if it looks like one.
pub fn status_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.lines().next()?.trim();
    line.starts_with("HTTP/").then(|| line.to_string())
}
