use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kiln_build::{ArtifactSource, BuildReport, Builder};
use kiln_cache::GcReport;
use kiln_config::{init_tracing, KilnConfig, CONFIG_FILE_NAME};
use kiln_scheduler::{JobOutcome, RunStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "kiln", version, about = "Kiln incremental build orchestrator")]
struct Cli {
    /// Path to the project config; its directory is the project root
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build configured targets, recompiling only what changed
    Build(BuildArgs),
    /// Evict old artifacts from the artifact cache
    Gc(OutputArgs),
    /// Manage the persistent caches
    Cache(CacheArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Build only this target (repeatable); defaults to every target
    #[arg(long = "target", value_name = "KEY")]
    targets: Vec<String>,
    /// Ignore all caches for this run
    #[arg(long)]
    no_cache: bool,
    /// Number of worker threads
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,
    /// Abort a target's compile run after this many seconds
    #[arg(long, value_name = "N")]
    timeout_secs: Option<u64>,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct OutputArgs {
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Forget every file fingerprint, build record and cached artifact
    Clean,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = KilnConfig::load_from_path(&cli.config)?;
    init_tracing(&config.logging);
    let project_root = project_root(&cli.config)?;

    match cli.command {
        Command::Build(args) => {
            if args.timeout_secs == Some(0) {
                anyhow::bail!("--timeout-secs must be positive");
            }
            let mut orchestrator = config.orchestrator_config();
            if let Some(jobs) = args.jobs {
                orchestrator = orchestrator.with_worker_count(jobs);
            }
            if let Some(secs) = args.timeout_secs {
                orchestrator = orchestrator.with_timeout(Duration::from_secs(secs));
            }

            let builder = builder(&config, &project_root)?
                .with_orchestrator_config(orchestrator)
                .with_disable_cache(args.no_cache || config.disable_cache());

            let requests = config.build_requests(&project_root, &args.targets)?;
            if requests.is_empty() {
                tracing::warn!(target: "kiln.build", config = %cli.config.display(), "no targets configured");
            }

            let mut status = RunStatus::Success;
            let mut targets = Vec::with_capacity(requests.len());
            for request in &requests {
                let report = builder
                    .build(request)
                    .with_context(|| format!("failed to build `{}`", request.build_key))?;
                status = status.worst(report.status);
                if !args.json {
                    print_build_report(&report);
                }
                targets.push(report);
            }

            let exit_code = status.exit_code();
            if args.json {
                print_output(
                    &BuildSummary {
                        status,
                        exit_code,
                        targets,
                    },
                    true,
                )?;
            }
            Ok(exit_code)
        }
        Command::Gc(args) => {
            let report = builder(&config, &project_root)?.collect_garbage(&config.gc_policy())?;
            print_output(&report, args.json)?;
            Ok(if report.failed.is_empty() { 0 } else { 1 })
        }
        Command::Cache(args) => {
            let builder = builder(&config, &project_root)?;
            let cache_dir = builder.cache_dir();
            match args.command {
                CacheCommand::Clean => {
                    builder.reset_caches()?;
                    if args.json {
                        print_output(
                            &serde_json::json!({ "ok": true, "cache_dir": cache_dir.root() }),
                            true,
                        )?;
                    } else {
                        println!("cache: cleaned {}", cache_dir.root().display());
                    }
                }
            }
            Ok(0)
        }
    }
}

fn builder(config: &KilnConfig, project_root: &Path) -> Result<Builder> {
    Ok(Builder::new(
        config.cache_dir(project_root)?,
        Arc::new(config.toolchain(project_root)),
    ))
}

/// Directory of the config file, made absolute so tools see stable paths.
fn project_root(config_path: &Path) -> Result<PathBuf> {
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::canonicalize(&dir)
        .with_context(|| format!("failed to resolve project root {}", dir.display()))
}

#[derive(Serialize)]
struct BuildSummary {
    status: RunStatus,
    exit_code: i32,
    targets: Vec<BuildReport>,
}

fn print_build_report(report: &BuildReport) {
    if report.skipped {
        println!("{}: up to date", report.build_key);
        return;
    }

    let status = match report.status {
        RunStatus::Success => "ok",
        RunStatus::Failure => "FAILED",
        RunStatus::WatchdogTimeout => "TIMED OUT",
    };
    println!(
        "{}: {status} in {}ms ({} compiled, {} up to date)",
        report.build_key,
        report.elapsed_ms,
        report.compiled(),
        report.up_to_date
    );
    if let Some(artifact) = &report.artifact {
        let source = match artifact.source {
            ArtifactSource::UpToDate => "up to date",
            ArtifactSource::Cache => "restored from cache",
            ArtifactSource::Linked => "linked",
        };
        println!("  artifact {source}: {}", artifact.path.display());
    }
    for job in report.failed_jobs() {
        let detail = match &job.outcome {
            JobOutcome::Done => continue,
            JobOutcome::Failed { reason } => format!("failed: {reason}"),
            JobOutcome::SkippedDueToDependency { prerequisite } => {
                format!("skipped (prerequisite {prerequisite} did not finish)")
            }
            JobOutcome::Abandoned { running_for } => {
                format!("abandoned after {}ms", running_for.as_millis())
            }
            JobOutcome::NotStarted => "not started".to_string(),
        };
        println!("  {}: {detail}", job.source.display());
    }
    if let Some(error) = &report.link_error {
        println!("  link failed: {error}");
    }
    if report.fingerprint_incomplete {
        println!("  warning: some inputs could not be read; this target will rebuild next time");
    }
}

fn print_output<T: Serialize + 'static>(value: &T, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(value)?;
        println!("{out}");
        return Ok(());
    }

    // Human output for key types. Everything else falls back to pretty JSON.
    let any = value as &dyn std::any::Any;
    if let Some(report) = any.downcast_ref::<GcReport>() {
        println!(
            "gc: evicted {} artifact(s), freed {} bytes ({} -> {})",
            report.evicted.len(),
            report.freed_bytes(),
            report.before_bytes,
            report.after_bytes
        );
        for evicted in &report.evicted {
            println!(
                "  {} {} ({:?}, {} bytes)",
                evicted.target_id,
                evicted.fingerprint.short(),
                evicted.reason,
                evicted.size_bytes
            );
        }
        for failure in &report.failed {
            println!(
                "  failed to remove {}: {}",
                failure.artifact_path.display(),
                failure.error
            );
        }
    } else {
        let out = serde_json::to_string_pretty(value)?;
        println!("{out}");
    }
    Ok(())
}
