//! Container runtime capability.
//!
//! Scanners are opaque container images; which scanner a step runs is data ([`ContainerTool`]),
//! not a type. [`ContainerRuntime`] turns that data into a process invocation and provides the
//! few runtime queries the orchestrator needs (availability, networks, service logs).
use std::path::PathBuf;
use std::process::{Output, Stdio};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::RuntimeError;
use crate::types::StepCommand;

/// Host path bound into the container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn volume_arg(&self) -> String {
        let mut v = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            v.push_str(":ro");
        }
        v
    }
}

/// One scanner image invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerTool {
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Join the configured network so the target resolves by hostname.
    #[serde(default)]
    pub network: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

impl ContainerTool {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            args: Vec::new(),
            mounts: Vec::new(),
            network: false,
            entrypoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    binary: String,
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `<runtime> run --rm [--name N] [--network NET] [--entrypoint E] -v SRC:DST[:ro]...`
    /// followed by the image and its arguments.
    ///
    /// `network` is only applied when the tool asks for it.
    pub fn command_for(
        &self,
        tool: &ContainerTool,
        network: Option<&str>,
        name: Option<&str>,
    ) -> StepCommand {
        let mut args: Vec<String> = vec!["run".into(), "--rm".into()];
        if let Some(name) = name {
            args.push("--name".into());
            args.push(name.to_string());
        }
        if let (true, Some(net)) = (tool.network, network) {
            args.push("--network".into());
            args.push(net.to_string());
        }
        if let Some(ep) = &tool.entrypoint {
            args.push("--entrypoint".into());
            args.push(ep.clone());
        }
        for m in &tool.mounts {
            args.push("-v".into());
            args.push(m.volume_arg());
        }
        args.push(tool.image.clone());
        args.extend(tool.args.iter().cloned());
        StepCommand::Exec {
            program: self.binary.clone(),
            args,
        }
    }

    /// Fails when the binary is missing or cannot reach its daemon. Returns the first line of
    /// `<runtime> version`.
    #[instrument(skip(self), fields(runtime = %self.binary))]
    pub async fn ensure_available(&self) -> Result<String, RuntimeError> {
        let output = self
            .output(&["version"])
            .await
            .map_err(|e| RuntimeError::Unavailable {
                binary: self.binary.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(RuntimeError::Unavailable {
                binary: self.binary.clone(),
                reason: combined_text(&output).trim().to_string(),
            });
        }
        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        debug!(version = %version, "container runtime found");
        Ok(version)
    }

    pub async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let output = self.output(&["network", "inspect", name]).await?;
        Ok(output.status.success())
    }

    /// Last `tail` lines of a service's stdout and stderr.
    #[instrument(skip(self), fields(runtime = %self.binary))]
    pub async fn fetch_logs(&self, service: &str, tail: u32) -> Result<String, RuntimeError> {
        let tail = tail.to_string();
        let args = ["logs", "--tail", tail.as_str(), service];
        let output = self.output(&args).await?;
        if !output.status.success() {
            return Err(RuntimeError::Failed {
                command: self.render(&args),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(combined_text(&output))
    }

    /// Stop a container started with `--name`. `--rm` then removes it.
    #[instrument(skip(self), fields(runtime = %self.binary))]
    pub async fn kill_container(&self, name: &str) -> Result<(), RuntimeError> {
        let args = ["kill", name];
        let output = self.output(&args).await?;
        if !output.status.success() {
            return Err(RuntimeError::Failed {
                command: self.render(&args),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(container = name, "container killed");
        Ok(())
    }

    async fn output(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        debug!(command = %self.render(args), "runtime query");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Io {
                command: self.render(args),
                source,
            })
    }

    fn render(&self, args: &[&str]) -> String {
        let mut s = self.binary.clone();
        for a in args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// Container name for the step at 1-based `index`, unique per orchestrator process.
pub fn container_name(index: usize) -> String {
    format!("ci-scan-{}-{index}", std::process::id())
}

pub(crate) fn combined_text(output: &Output) -> String {
    let mut s = String::from_utf8_lossy(&output.stdout).into_owned();
    let err = String::from_utf8_lossy(&output.stderr);
    if !err.is_empty() {
        if !s.is_empty() && !s.ends_with('\n') {
            s.push('\n');
        }
        s.push_str(&err);
    }
    s
}
