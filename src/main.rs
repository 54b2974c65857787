use std::fs::File;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ci_scan_rs::config::{RunContext, Settings};
use ci_scan_rs::probe;
use ci_scan_rs::runner::StepRunner;
use ci_scan_rs::runtime::ContainerRuntime;
use ci_scan_rs::steps;
use ci_scan_rs::types::{now_rfc3339, RunSummary, ScanStep, StepCommand};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();
    init_tracing();

    let ctx = RunContext::from_settings(settings).context("invalid configuration")?;
    let runtime = ContainerRuntime::new(&ctx.runtime);
    let steps = steps::resolve_steps(&ctx, &runtime).context("invalid scan steps")?;

    println!("ci-scan-rs configuration:");
    for line in ctx.describe() {
        println!("{line}");
    }
    println!(
        "  steps             : {}",
        steps
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    if needs_runtime(&ctx, &steps) {
        let version = runtime
            .ensure_available()
            .await
            .context("no step can run without the container runtime")?;
        println!("  runtime version   : {version}");
    }

    if ctx.skip_probe {
        println!("Readiness probe skipped");
    } else {
        probe::wait_for_target(&ctx, &runtime, &mut io::stdout())
            .await
            .context("target application never became reachable")?;
    }

    let started_at = now_rfc3339();
    let mut runner = StepRunner::new(io::stdout()).with_step_timeout(ctx.step_timeout);
    let results = runner.run_all(&steps, &ctx.reports_dir).await?;

    // Failed steps never change the exit code; the summary is the place to look.
    if let Some(path) = ctx.summary_path.as_deref() {
        let summary = RunSummary::new(
            started_at,
            ctx.target_url.clone(),
            ctx.reports_dir.clone(),
            &results,
        );
        match write_summary_json(path, &summary) {
            Ok(()) => info!(path = %path.display(), "wrote run summary"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to write run summary"),
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// The runtime is needed for in-network probing and for any step that invokes it.
fn needs_runtime(ctx: &RunContext, steps: &[ScanStep]) -> bool {
    let probes_in_network = !ctx.skip_probe && ctx.network.is_some();
    probes_in_network
        || steps.iter().any(|s| {
            matches!(&s.command, StepCommand::Exec { program, .. } if program == &ctx.runtime)
        })
}

fn write_summary_json(path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
