use std::fs;
use std::path::Path;

use ci_scan_rs::config::{RunContext, Settings};
use ci_scan_rs::error::ConfigError;
use ci_scan_rs::runtime::{container_name, ContainerRuntime};
use ci_scan_rs::steps::{build_steps, load_step_defs, resolve_steps, StepKind};
use ci_scan_rs::types::StepCommand;
use clap::Parser;

fn ctx_with(args: &[&str]) -> RunContext {
    let mut argv = vec!["ci-scan-rs", "--target-url", "https://shop.internal:8443"];
    argv.extend_from_slice(args);
    RunContext::from_settings_in(Settings::try_parse_from(argv).unwrap(), Path::new("/ci")).unwrap()
}

const STEPS_JSON: &str = r#"[
  {
    "name": "Trivy filesystem",
    "report": "trivy_report.json",
    "container": {
      "image": "aquasec/trivy",
      "args": ["fs", "--format", "json", "-o", "/reports/trivy_report.json", "/src"],
      "mounts": [
        { "source": "{source_dir}", "target": "/src", "read_only": true },
        { "source": "{reports_dir}", "target": "/reports" }
      ]
    }
  },
  { "name": "curl headers", "exec": { "program": "curl", "args": ["-sI", "{target_url}"] } },
  { "name": "inline", "shell": "echo {target_host}:{target_port} > {reports_dir}/inline.txt" }
]"#;

#[test]
fn steps_file_round_trip_into_commands() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("steps.json");
    fs::write(&path, STEPS_JSON).unwrap();

    let defs = load_step_defs(&path).unwrap();
    assert_eq!(defs.len(), 3);
    assert!(matches!(defs[0].kind, StepKind::Container(_)));

    let ctx = ctx_with(&[]);
    let steps = build_steps(&defs, &ctx, &ContainerRuntime::new("podman")).unwrap();

    assert_eq!(
        steps[0].command.to_string(),
        format!(
            "podman run --rm --name {} -v /ci:/src:ro -v /ci/reports:/reports aquasec/trivy \
             fs --format json -o /reports/trivy_report.json /src",
            container_name(1)
        )
    );
    assert_eq!(steps[1].container, None);
    assert_eq!(
        steps[0].report.as_deref(),
        Some(Path::new("/ci/reports/trivy_report.json"))
    );
    assert_eq!(
        steps[1].command,
        StepCommand::exec("curl", ["-sI", "https://shop.internal:8443"])
    );
    assert_eq!(
        steps[2].command,
        StepCommand::shell("echo shop.internal:8443 > /ci/reports/inline.txt")
    );
}

#[test]
fn resolve_uses_steps_file_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("steps.json");
    fs::write(&path, r#"[{ "name": "only", "shell": "true" }]"#).unwrap();
    let ctx = ctx_with(&["--steps-file", path.to_str().unwrap()]);
    let steps = resolve_steps(&ctx, &ContainerRuntime::new("docker")).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "only");

    let builtin = resolve_steps(&ctx_with(&[]), &ContainerRuntime::new("docker")).unwrap();
    assert_eq!(builtin.len(), 3);
}

#[test]
fn unknown_placeholder_fails_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("steps.json");
    fs::write(&path, r#"[{ "name": "typo", "shell": "scan {targt_url}" }]"#).unwrap();
    let ctx = ctx_with(&["--steps-file", path.to_str().unwrap()]);
    let err = resolve_steps(&ctx, &ContainerRuntime::new("docker")).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownPlaceholder { ref name, .. } if name == "targt_url"));
}

#[test]
fn missing_or_malformed_steps_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_step_defs(dir.path().join("absent.json")),
        Err(ConfigError::StepsFileRead { .. })
    ));

    let path = dir.path().join("bad.json");
    fs::write(&path, r#"[{ "name": "no command" }]"#).unwrap();
    assert!(matches!(load_step_defs(&path), Err(ConfigError::StepsFileParse { .. })));
}

#[test]
fn empty_fields_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("steps.json");
    fs::write(&path, r#"[{ "name": "  ", "shell": "true" }]"#).unwrap();
    let defs = load_step_defs(&path).unwrap();
    let err = build_steps(&defs, &ctx_with(&[]), &ContainerRuntime::new("docker")).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidStep { index: 1, .. }));
}
