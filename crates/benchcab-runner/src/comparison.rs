use crate::context::RunContext;
use crate::coordinator::WorkUnit;
use crate::error::{BenchError, Result};
use crate::fs_util::{atomic_write_bytes, remove_path};
use crate::handlers::{CommandOutput, CommandSpec};
use crate::task::{forcing_basename, Task};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub struct ComparisonPair<'a> {
    pub a: &'a Task,
    pub b: &'a Task,
}

impl<'a> ComparisonPair<'a> {
    pub fn new(x: &'a Task, y: &'a Task) -> Self {
        if x.realisation().id <= y.realisation().id {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    pub fn name(&self) -> String {
        format!(
            "{}_S{}_R{}_R{}",
            forcing_basename(self.a.met_forcing_file()),
            self.a.sci_conf_id(),
            self.a.realisation().id,
            self.b.realisation().id
        )
    }

    pub fn diff_path(&self, ctx: &RunContext) -> PathBuf {
        ctx.layout.bitwise_cmp_dir().join(format!("{}.txt", self.name()))
    }

    /// A clean comparison removes any diff file left by an earlier run; any
    /// other outcome overwrites it.
    pub fn run(&self, ctx: &RunContext) -> Result<()> {
        let out_a = self.a.output_path(&ctx.layout);
        let out_b = self.b.output_path(&ctx.layout);
        for out in [&out_a, &out_b] {
            if !out.is_file() {
                return Err(BenchError::missing("model output", out));
            }
        }
        let spec = CommandSpec::new(&ctx.tools.nccmp)
            .arg("-df")
            .arg(out_a.to_string_lossy())
            .arg(out_b.to_string_lossy());
        tracing::debug!(comparison = %self.name(), cmd = %spec.display(), "comparing outputs");
        let output = ctx.runner.run(&spec).map_err(|e| {
            BenchError::Environment(format!("failed to run {}: {}", ctx.tools.nccmp, e))
        })?;
        let diff_path = self.diff_path(ctx);
        match output.exit_code {
            Some(0) => {
                remove_path(&diff_path)?;
                Ok(())
            }
            // nccmp exits 1 when the files differ and >1 when it cannot compare them.
            Some(1) => {
                atomic_write_bytes(&diff_path, diff_text(&output).as_bytes())?;
                Err(BenchError::ComparisonMismatch { diff_path })
            }
            exit_code => {
                atomic_write_bytes(&diff_path, diff_text(&output).as_bytes())?;
                Err(BenchError::Execution {
                    program: ctx.tools.nccmp.clone(),
                    exit_code,
                    log_tail: output.stderr.trim().to_string(),
                    log_path: diff_path,
                })
            }
        }
    }
}

fn diff_text(output: &CommandOutput) -> String {
    let mut text = output.stdout.clone();
    text.push_str(&output.stderr);
    text
}

impl WorkUnit for ComparisonPair<'_> {
    fn unit_id(&self) -> String {
        self.name()
    }

    fn run_unit(&self, ctx: &RunContext) -> Result<()> {
        self.run(ctx)
    }
}

/// Every pair of tasks sharing a forcing file and science config. Groups
/// come in first-seen order; within a group pairs follow ascending
/// realisation id.
pub fn build_comparisons(tasks: &[Task]) -> Vec<ComparisonPair<'_>> {
    let mut groups: Vec<((&str, usize), Vec<&Task>)> = Vec::new();
    for task in tasks {
        let key = (task.met_forcing_file(), task.sci_conf_id());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(task),
            None => groups.push((key, vec![task])),
        }
    }
    let mut pairs = Vec::new();
    for (_, mut members) in groups {
        members.sort_by_key(|t| t.realisation().id);
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                if a.realisation().id != b.realisation().id {
                    pairs.push(ComparisonPair::new(a, b));
                }
            }
        }
    }
    pairs
}
