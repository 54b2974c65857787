//! Settings parsing and the immutable per-run context.
//!
//! Every option is a long flag and an environment variable, so CI jobs can configure the
//! orchestrator through `env:` blocks alone. [`RunContext`] is built from [`Settings`] once in
//! `main` and passed by reference from then on; nothing reads the environment afterwards.
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::target::ProbeTarget;

/// ci-scan-rs: wait for the target, then run every security scanner and keep going on failure.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ci-scan-rs",
    version,
    about = "Wait for the target application, then run every security scanner and collect the reports.",
    long_about = None
)]
pub struct Settings {
    /// Target URL for the readiness probe and the dynamic scanners.
    #[arg(long, env = "TARGET_URL", default_value = "http://localhost:8000")]
    pub target_url: String,

    /// Source tree mounted read-only into the static-analysis step.
    /// Defaults to the working directory.
    #[arg(long, env = "REPO_DIR")]
    pub source_dir: Option<PathBuf>,

    /// Directory every step writes its report into. Defaults to `./reports`.
    #[arg(long, env = "REPORTS_DIR")]
    pub reports_dir: Option<PathBuf>,

    /// Container network used by the probe and by steps that reach the target by hostname.
    #[arg(long, env = "SCAN_NETWORK")]
    pub network: Option<String>,

    /// Maximum wait for the target before giving up.
    #[arg(long = "readiness-timeout-secs", env = "READINESS_TIMEOUT_SECS", default_value_t = 120)]
    pub readiness_timeout_secs: u64,

    /// Interval between readiness checks.
    #[arg(
        long = "probe-interval-secs",
        env = "PROBE_INTERVAL_SECS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub probe_interval_secs: u64,

    /// Upper bound for one readiness check, in milliseconds.
    #[arg(long = "check-timeout-ms", env = "PROBE_CHECK_TIMEOUT_MS", default_value_t = 2000)]
    pub check_timeout_ms: u64,

    /// What counts as a readiness check.
    #[arg(long = "probe-mode", env = "PROBE_MODE", value_enum, default_value_t = ProbeMode::Http)]
    pub probe_mode: ProbeMode,

    /// Image used to probe from inside `--network`.
    #[arg(long = "probe-image", env = "PROBE_IMAGE", default_value = "curlimages/curl:latest")]
    pub probe_image: String,

    /// Do not wait for the target (static-only pipelines).
    #[arg(long = "skip-probe", env = "SKIP_PROBE", default_value_t = false)]
    pub skip_probe: bool,

    /// Container whose logs are printed when the target never comes up.
    #[arg(long = "target-service", env = "TARGET_SERVICE")]
    pub target_service: Option<String>,

    /// Number of diagnostic log lines to fetch.
    #[arg(long = "log-tail", env = "LOG_TAIL_LINES", default_value_t = 200)]
    pub log_tail: u32,

    /// Kill a step that runs longer than this. Unbounded when omitted.
    #[arg(long = "step-timeout-secs", env = "STEP_TIMEOUT_SECS")]
    pub step_timeout_secs: Option<u64>,

    /// Container runtime binary.
    #[arg(long, env = "CONTAINER_RUNTIME", default_value = "docker")]
    pub runtime: String,

    /// JSON file replacing the built-in step list.
    #[arg(long = "steps-file", env = "SCAN_STEPS_FILE")]
    pub steps_file: Option<PathBuf>,

    /// Write the run summary as pretty JSON to this path.
    #[arg(long, env = "SCAN_SUMMARY_PATH")]
    pub summary: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeMode {
    /// TCP connect only.
    Tcp,
    /// `GET /`; any HTTP response counts, including 3xx/4xx/5xx.
    Http,
}

/// Resolved configuration for one run. Read-only after construction.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub target_url: String,
    pub target: ProbeTarget,
    pub source_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub network: Option<String>,
    pub readiness_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_mode: ProbeMode,
    pub probe_image: String,
    pub skip_probe: bool,
    pub target_service: Option<String>,
    pub log_tail: u32,
    pub step_timeout: Option<Duration>,
    pub runtime: String,
    pub steps_file: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

impl RunContext {
    /// Resolve settings against the process working directory.
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Directory {
            path: PathBuf::from("."),
            source,
        })?;
        Self::from_settings_in(settings, &cwd)
    }

    /// Resolve settings with relative paths taken from `cwd`.
    pub fn from_settings_in(settings: Settings, cwd: &Path) -> Result<Self, ConfigError> {
        let target = ProbeTarget::from_url(
            &settings.target_url,
            Duration::from_millis(settings.check_timeout_ms.max(1)),
        )?;

        let source_dir = absolutize(cwd, settings.source_dir.as_deref().unwrap_or(Path::new(".")));
        let reports_dir = absolutize(
            cwd,
            settings.reports_dir.as_deref().unwrap_or(Path::new("reports")),
        );

        Ok(Self {
            target_url: settings.target_url.trim().to_string(),
            target,
            source_dir,
            reports_dir,
            network: settings.network.filter(|n| !n.trim().is_empty()),
            readiness_timeout: Duration::from_secs(settings.readiness_timeout_secs),
            probe_interval: Duration::from_secs(settings.probe_interval_secs),
            probe_mode: settings.probe_mode,
            probe_image: settings.probe_image,
            skip_probe: settings.skip_probe,
            target_service: settings.target_service.filter(|s| !s.trim().is_empty()),
            log_tail: settings.log_tail,
            step_timeout: settings.step_timeout_secs.map(Duration::from_secs),
            runtime: settings.runtime,
            steps_file: settings.steps_file.map(|p| absolutize(cwd, &p)),
            summary_path: settings.summary.map(|p| absolutize(cwd, &p)),
        })
    }

    /// Container whose logs explain a readiness timeout.
    ///
    /// Inside a network the target host is normally the service's container name, so it is
    /// used when no service is configured explicitly.
    pub fn diagnostics_service(&self) -> Option<&str> {
        match (&self.target_service, &self.network) {
            (Some(s), _) => Some(s.as_str()),
            (None, Some(_)) => Some(self.target.host.as_str()),
            (None, None) => None,
        }
    }

    /// Human-readable configuration dump printed at startup.
    pub fn describe(&self) -> Vec<String> {
        let opt = |v: Option<&str>| v.unwrap_or("<none>").to_string();
        vec![
            format!("  target_url        : {}", self.target_url),
            format!("  source_dir        : {}", self.source_dir.display()),
            format!("  reports_dir       : {}", self.reports_dir.display()),
            format!("  network           : {}", opt(self.network.as_deref())),
            format!("  readiness_timeout : {}s", self.readiness_timeout.as_secs()),
            format!("  probe_interval    : {}s", self.probe_interval.as_secs()),
            format!("  probe_mode        : {:?}", self.probe_mode),
            format!(
                "  step_timeout      : {}",
                self.step_timeout
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "<unbounded>".to_string())
            ),
            format!("  runtime           : {}", self.runtime),
        ]
    }
}

fn absolutize(cwd: &Path, p: &Path) -> PathBuf {
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    };
    joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
