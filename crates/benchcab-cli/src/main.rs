use anyhow::{Context, Result};
use benchcab_runner::config::BenchConfig;
use benchcab_runner::handlers::{CommandRunner, ModuleCmd, ProcessRunner};
use benchcab_runner::{
    build_comparisons, fluxsite_tasks, load_config, BatchReport, ExecMode, RunContext,
    UnitStatus,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "benchcab",
    version,
    about = "Fluxsite benchmarking for CABLE realisations"
)]
struct Cli {
    /// Benchmark configuration file.
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,
    /// Work directory holding `src/` and `runs/`; defaults to the current directory.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy, Debug)]
struct ExecArgs {
    /// Run units one at a time, ignoring `fluxsite.multiprocess`.
    #[arg(long)]
    sequential: bool,
    /// Worker count, overriding `fluxsite.pbs.ncpus`.
    #[arg(long, conflicts_with = "sequential")]
    pool_size: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the task matrix and comparisons the config produces.
    Describe {
        #[arg(long)]
        json: bool,
    },
    FluxsiteSetupWorkDir {
        #[arg(long)]
        json: bool,
    },
    FluxsiteRunTasks {
        #[command(flatten)]
        exec: ExecArgs,
        #[arg(long)]
        json: bool,
    },
    FluxsiteBitwiseCmp {
        #[command(flatten)]
        exec: ExecArgs,
        #[arg(long)]
        json: bool,
    },
    /// Setup, run and compare.
    Fluxsite {
        #[command(flatten)]
        exec: ExecArgs,
        #[arg(long)]
        json: bool,
    },
}

struct Outcome {
    payload: Option<Value>,
    failed: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(&cli) {
        Ok(outcome) => {
            if let Some(payload) = &outcome.payload {
                emit_json(payload);
            }
            if outcome.failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(cli: &Cli) -> Result<Outcome> {
    let config = load_config(&cli.config)?;
    // Task namelists hold paths that the model resolves from its task directory.
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let work_dir = match &cli.work_dir {
        Some(dir) => cwd.join(dir),
        None => cwd,
    };
    tracing::debug!(
        config = %cli.config.display(),
        work_dir = %work_dir.display(),
        realisations = config.realisations.len(),
        "loaded configuration"
    );
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let ctx = RunContext::from_config(&work_dir, &config, runner.clone());

    match &cli.command {
        Commands::Describe { json } => {
            let tasks = fluxsite_tasks(&config, &ctx)?;
            let pairs = build_comparisons(&tasks);
            if *json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": true,
                        "command": "describe",
                        "work_dir": work_dir.display().to_string(),
                        "mode": config.exec_mode().label(),
                        "realisations": config.realisations.iter().map(|r| json!({
                            "id": r.id,
                            "name": r.name,
                            "branch": r.source.branch_label(),
                        })).collect::<Vec<_>>(),
                        "science_configurations": config.science_configurations.len(),
                        "tasks": tasks.iter().map(|t| t.name()).collect::<Vec<_>>(),
                        "comparisons": pairs.iter().map(|p| p.name()).collect::<Vec<_>>(),
                    })),
                    failed: false,
                });
            }
            println!("work_dir: {}", work_dir.display());
            println!("mode: {}", config.exec_mode().label());
            for r in &config.realisations {
                println!("realisation R{}: {} ({})", r.id, r.name, r.source.branch_label());
            }
            println!("science_configurations: {}", config.science_configurations.len());
            println!("tasks: {}", tasks.len());
            println!("comparisons: {}", pairs.len());
            Ok(Outcome {
                payload: None,
                failed: false,
            })
        }
        Commands::FluxsiteSetupWorkDir { json } => {
            let tasks = fluxsite_tasks(&config, &ctx)?;
            let report = benchcab_runner::setup_work_dir(&ctx, &tasks)?;
            Ok(report_outcome("fluxsite-setup-work-dir", &[&report], *json, &ctx))
        }
        Commands::FluxsiteRunTasks { exec, json } => {
            let ctx = with_modules(ctx, &config, runner.as_ref())?;
            let tasks = fluxsite_tasks(&config, &ctx)?;
            let report = benchcab_runner::run_tasks(&ctx, &tasks, exec_mode(*exec, &config))?;
            Ok(report_outcome("fluxsite-run-tasks", &[&report], *json, &ctx))
        }
        Commands::FluxsiteBitwiseCmp { exec, json } => {
            let ctx = with_modules(ctx, &config, runner.as_ref())?;
            let tasks = fluxsite_tasks(&config, &ctx)?;
            let report =
                benchcab_runner::run_comparisons(&ctx, &tasks, exec_mode(*exec, &config))?;
            Ok(report_outcome("fluxsite-bitwise-cmp", &[&report], *json, &ctx))
        }
        Commands::Fluxsite { exec, json } => {
            let ctx = with_modules(ctx, &config, runner.as_ref())?;
            let report = benchcab_runner::fluxsite(&config, &ctx, exec_mode(*exec, &config))?;
            Ok(report_outcome(
                "fluxsite",
                &[&report.setup, &report.tasks, &report.comparisons],
                *json,
                &ctx,
            ))
        }
    }
}

fn with_modules(
    ctx: RunContext,
    config: &BenchConfig,
    runner: &dyn CommandRunner,
) -> Result<RunContext> {
    let handler = ModuleCmd {
        program: config.tools.modulecmd.clone(),
        runner,
    };
    Ok(ctx.load_modules(&handler, &config.modules)?)
}

fn exec_mode(exec: ExecArgs, config: &BenchConfig) -> ExecMode {
    if exec.sequential {
        ExecMode::Sequential
    } else if let Some(pool_size) = exec.pool_size {
        ExecMode::Parallel {
            pool_size: pool_size.max(1),
        }
    } else {
        config.exec_mode()
    }
}

/// Comparison mismatches are reported but only hard failures set the exit status.
fn report_outcome(command: &str, reports: &[&BatchReport], json: bool, ctx: &RunContext) -> Outcome {
    let failed = reports.iter().any(|r| r.has_failures());
    if json {
        return Outcome {
            payload: Some(json!({
                "ok": !failed,
                "command": command,
                "phases": reports.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
            })),
            failed,
        };
    }
    for report in reports {
        print_report(report, &ctx.layout.report_path(&report.phase));
    }
    Outcome {
        payload: None,
        failed,
    }
}

fn print_report(report: &BatchReport, path: &Path) {
    let counts = report.counts();
    println!("phase: {} ({})", report.phase, report.mode.label());
    println!(
        "  succeeded: {}  mismatched: {}  failed: {}",
        counts.succeeded, counts.mismatched, counts.failed
    );
    for r in &report.results {
        let label = match r.status {
            UnitStatus::Success => continue,
            UnitStatus::Mismatch => "DIFFER",
            UnitStatus::Failed => "FAILED",
        };
        println!(
            "  {} {}: {}",
            label,
            r.unit_id,
            r.message.as_deref().unwrap_or("")
        );
        if let Some(tail) = &r.log_tail {
            for line in tail.lines() {
                println!("      | {}", line);
            }
        }
    }
    println!("  report: {}", path.display());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json }
        | Commands::FluxsiteSetupWorkDir { json }
        | Commands::FluxsiteRunTasks { json, .. }
        | Commands::FluxsiteBitwiseCmp { json, .. }
        | Commands::Fluxsite { json, .. } => *json,
    }
}
