pub mod comparison;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
mod fs_util;
pub mod handlers;
pub mod matrix;
pub mod namelist;
pub mod task;
#[cfg(test)]
mod test_support;

pub use comparison::{build_comparisons, ComparisonPair};
pub use config::{load_config, parse_config, BenchConfig, Realisation, ScienceConfig};
pub use context::{RunContext, WorkLayout};
pub use coordinator::{
    run_batch, BatchReport, BatchStatus, Coordinator, ExecMode, RunResult, UnitStatus, WorkUnit,
};
pub use error::{BenchError, ErrorKind, Result};
pub use matrix::{build_tasks, resolve_forcing_files};
pub use task::{SetupStep, Task};

use serde_json::{json, Value};

pub const SETUP_PHASE: &str = "setup";
pub const RUN_PHASE: &str = "run";
pub const COMPARE_PHASE: &str = "bitwise_cmp";

pub fn fluxsite_tasks(config: &BenchConfig, ctx: &RunContext) -> Result<Vec<Task>> {
    let forcing = resolve_forcing_files(&config.fluxsite, &ctx.inputs.met_dir)?;
    build_tasks(
        &config.realisations,
        &config.science_configurations,
        &forcing,
    )
}

pub fn setup_work_dir(ctx: &RunContext, tasks: &[Task]) -> Result<BatchReport> {
    ctx.layout.create_dirs()?;
    let steps: Vec<SetupStep<'_>> = tasks.iter().map(SetupStep).collect();
    let report = Coordinator::new(ctx, ExecMode::Sequential).run(SETUP_PHASE, &steps);
    report.write_json(&ctx.layout.report_path(SETUP_PHASE))?;
    Ok(report)
}

pub fn run_tasks(ctx: &RunContext, tasks: &[Task], mode: ExecMode) -> Result<BatchReport> {
    ctx.layout.create_dirs()?;
    let report = Coordinator::new(ctx, mode).run(RUN_PHASE, tasks);
    report.write_json(&ctx.layout.report_path(RUN_PHASE))?;
    Ok(report)
}

pub fn run_comparisons(ctx: &RunContext, tasks: &[Task], mode: ExecMode) -> Result<BatchReport> {
    ctx.layout.create_dirs()?;
    let pairs = build_comparisons(tasks);
    let report = Coordinator::new(ctx, mode).run(COMPARE_PHASE, &pairs);
    report.write_json(&ctx.layout.report_path(COMPARE_PHASE))?;
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct FluxsiteReport {
    pub setup: BatchReport,
    pub tasks: BatchReport,
    pub comparisons: BatchReport,
}

impl FluxsiteReport {
    pub fn has_failures(&self) -> bool {
        self.setup.has_failures() || self.tasks.has_failures() || self.comparisons.has_failures()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "setup": self.setup.to_json(),
            "run": self.tasks.to_json(),
            "bitwise_cmp": self.comparisons.to_json(),
        })
    }
}

/// Setup, run and compare in one go. Units that fail in one phase fail
/// again in the next without stopping it.
pub fn fluxsite(config: &BenchConfig, ctx: &RunContext, mode: ExecMode) -> Result<FluxsiteReport> {
    let tasks = fluxsite_tasks(config, ctx)?;
    let setup = setup_work_dir(ctx, &tasks)?;
    let run = run_tasks(ctx, &tasks, mode)?;
    let comparisons = run_comparisons(ctx, &tasks, mode)?;
    Ok(FluxsiteReport {
        setup,
        tasks: run,
        comparisons,
    })
}
