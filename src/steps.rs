use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RunContext;
use crate::error::ConfigError;
use crate::runtime::{container_name, ContainerRuntime, ContainerTool, Mount};
use crate::types::{ScanStep, StepCommand};

/// Step definition as written in a steps file, before placeholders are rendered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepDef {
    pub name: String,
    /// Report file name, relative to the reports directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Container(ContainerTool),
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Shell(String),
}

/// Semgrep, OWASP ZAP baseline and Nuclei, in that order.
pub fn default_step_defs() -> Vec<StepDef> {
    let semgrep = ContainerTool {
        mounts: vec![
            Mount::new("{source_dir}", "/src").read_only(),
            Mount::new("{reports_dir}", "/reports"),
        ],
        args: strings(&[
            "semgrep",
            "--config=auto",
            "/src",
            "--json",
            "-o",
            "/reports/semgrep_report.json",
        ]),
        ..ContainerTool::new("semgrep/semgrep")
    };

    let zap = ContainerTool {
        mounts: vec![Mount::new("{reports_dir}", "/zap/wrk")],
        args: strings(&["zap-baseline.py", "-t", "{target_url}", "-r", "zap_report.html"]),
        network: true,
        ..ContainerTool::new("zaproxy/zap-stable")
    };

    let nuclei = ContainerTool {
        mounts: vec![Mount::new("{reports_dir}", "/reports")],
        args: strings(&[
            "-u",
            "{target_url}",
            "-severity",
            "low,medium,high,critical",
            "-o",
            "/reports/nuclei_report.txt",
        ]),
        network: true,
        ..ContainerTool::new("projectdiscovery/nuclei")
    };

    vec![
        StepDef {
            name: "Semgrep (SAST) Scan".into(),
            report: Some("semgrep_report.json".into()),
            kind: StepKind::Container(semgrep),
        },
        StepDef {
            name: "OWASP ZAP (DAST) Scan".into(),
            report: Some("zap_report.html".into()),
            kind: StepKind::Container(zap),
        },
        StepDef {
            name: "Nuclei Scan".into(),
            report: Some("nuclei_report.txt".into()),
            kind: StepKind::Container(nuclei),
        },
    ]
}

/// Parse a JSON array of step definitions.
pub fn parse_step_defs_str(s: &str, origin: &Path) -> Result<Vec<StepDef>, ConfigError> {
    serde_json::from_str(s).map_err(|source| ConfigError::StepsFileParse {
        path: origin.to_path_buf(),
        source,
    })
}

pub fn load_step_defs(path: impl AsRef<Path>) -> Result<Vec<StepDef>, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::StepsFileRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_step_defs_str(&content, path)
}

/// The run's fixed step list: the steps file when configured, the built-ins otherwise.
pub fn resolve_steps(
    ctx: &RunContext,
    runtime: &ContainerRuntime,
) -> Result<Vec<ScanStep>, ConfigError> {
    let defs = match &ctx.steps_file {
        Some(path) => load_step_defs(path)?,
        None => default_step_defs(),
    };
    build_steps(&defs, ctx, runtime)
}

/// Validate definitions and render every placeholder against the run context.
///
/// Rejects empty names, empty commands and two steps claiming the same report file.
pub fn build_steps(
    defs: &[StepDef],
    ctx: &RunContext,
    runtime: &ContainerRuntime,
) -> Result<Vec<ScanStep>, ConfigError> {
    let mut reports = HashSet::new();
    let mut out = Vec::with_capacity(defs.len());

    for (idx, def) in defs.iter().enumerate() {
        let index = idx + 1;
        let invalid = |reason: &str| ConfigError::InvalidStep {
            index,
            name: def.name.clone(),
            reason: reason.to_string(),
        };

        if def.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }

        let mut container = None;
        let command = match &def.kind {
            StepKind::Container(tool) => {
                if tool.image.trim().is_empty() {
                    return Err(invalid("container image is empty"));
                }
                let rendered = render_tool(tool, ctx)?;
                let name = container_name(index);
                let command = runtime.command_for(&rendered, ctx.network.as_deref(), Some(&name));
                container = Some(name);
                command
            }
            StepKind::Exec { program, args } => {
                if program.trim().is_empty() {
                    return Err(invalid("program is empty"));
                }
                StepCommand::Exec {
                    program: render(program, ctx)?,
                    args: render_all(args, ctx)?,
                }
            }
            StepKind::Shell(line) => {
                if line.trim().is_empty() {
                    return Err(invalid("shell line is empty"));
                }
                StepCommand::Shell(render(line, ctx)?)
            }
        };

        let mut step = ScanStep::new(def.name.trim(), command);
        if let Some(name) = container {
            step = step.with_container(name);
        }
        if let Some(report) = &def.report {
            let report = render(report, ctx)?;
            if !reports.insert(report.clone()) {
                return Err(invalid(&format!("report {report:?} already claimed by another step")));
            }
            step = step.with_report(ctx.reports_dir.join(report));
        }
        out.push(step);
    }

    Ok(out)
}

fn render_tool(tool: &ContainerTool, ctx: &RunContext) -> Result<ContainerTool, ConfigError> {
    let mounts = tool
        .mounts
        .iter()
        .map(|m| -> Result<Mount, ConfigError> {
            Ok(Mount {
                source: PathBuf::from(render(&m.source.to_string_lossy(), ctx)?),
                target: render(&m.target, ctx)?,
                read_only: m.read_only,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ContainerTool {
        image: render(&tool.image, ctx)?,
        args: render_all(&tool.args, ctx)?,
        mounts,
        network: tool.network,
        entrypoint: tool
            .entrypoint
            .as_deref()
            .map(|e| render(e, ctx))
            .transpose()?,
    })
}

fn render_all(items: &[String], ctx: &RunContext) -> Result<Vec<String>, ConfigError> {
    items.iter().map(|s| render(s, ctx)).collect()
}

/// Substitute `{target_url}`, `{source_dir}`, `{reports_dir}`, `{network}`, `{target_host}`
/// and `{target_port}`. `{{` and `}}` produce literal braces; any other name is an error.
pub fn render(template: &str, ctx: &RunContext) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
        } else {
            let end = tail
                .find('}')
                .ok_or_else(|| ConfigError::UnterminatedPlaceholder(template.to_string()))?;
            let name = &tail[1..end];
            let value = placeholder(name, ctx).ok_or_else(|| ConfigError::UnknownPlaceholder {
                name: name.to_string(),
                template: template.to_string(),
            })?;
            out.push_str(&value);
            rest = &tail[end + 1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn placeholder(name: &str, ctx: &RunContext) -> Option<String> {
    let v = match name {
        "target_url" => ctx.target_url.clone(),
        "source_dir" => ctx.source_dir.display().to_string(),
        "reports_dir" => ctx.reports_dir.display().to_string(),
        "network" => ctx.network.clone().unwrap_or_default(),
        "target_host" => ctx.target.host.clone(),
        "target_port" => ctx.target.port.to_string(),
        _ => return None,
    };
    Some(v)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
