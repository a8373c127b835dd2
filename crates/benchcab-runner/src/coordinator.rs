use crate::context::RunContext;
use crate::error::{BenchError, ErrorKind, Result};
use crate::fs_util::atomic_write_json_pretty;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Sequential,
    Parallel { pool_size: usize },
}

impl ExecMode {
    pub fn label(&self) -> String {
        match self {
            ExecMode::Sequential => "sequential".to_string(),
            ExecMode::Parallel { pool_size } => format!("parallel({})", pool_size),
        }
    }
}

/// Units of one batch may run concurrently with each other.
pub trait WorkUnit: Sync {
    fn unit_id(&self) -> String;
    fn run_unit(&self, ctx: &RunContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Mismatch,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunResult {
    pub index: usize,
    pub unit_id: String,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
}

impl RunResult {
    fn from_outcome(index: usize, unit_id: String, outcome: Result<()>) -> Self {
        let mut result = RunResult {
            index,
            unit_id,
            status: UnitStatus::Success,
            error_kind: None,
            message: None,
            diagnostics: None,
            log_tail: None,
        };
        let err = match outcome {
            Ok(()) => return result,
            Err(err) => err,
        };
        result.status = UnitStatus::Failed;
        result.error_kind = Some(err.kind());
        result.message = Some(err.to_string());
        match err {
            BenchError::ComparisonMismatch { diff_path } => {
                result.status = UnitStatus::Mismatch;
                result.diagnostics = Some(diff_path);
            }
            BenchError::Execution {
                log_path, log_tail, ..
            } => {
                result.diagnostics = Some(log_path);
                result.log_tail = Some(log_tail).filter(|t| !t.is_empty());
            }
            BenchError::MissingInput { path, .. } | BenchError::MissingKey { path, .. } => {
                result.diagnostics = Some(path);
            }
            _ => {}
        }
        result
    }

    fn panicked(index: usize, unit_id: String, message: String) -> Self {
        RunResult {
            index,
            unit_id,
            status: UnitStatus::Failed,
            error_kind: Some(ErrorKind::Panic),
            message: Some(message),
            diagnostics: None,
            log_tail: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    AllSucceeded,
    SomeFailed,
    AllFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub total: usize,
    pub succeeded: usize,
    pub mismatched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub phase: String,
    pub mode: ExecMode,
    /// Sorted by input index.
    pub results: Vec<RunResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts {
            total: self.results.len(),
            ..BatchCounts::default()
        };
        for r in &self.results {
            match r.status {
                UnitStatus::Success => counts.succeeded += 1,
                UnitStatus::Mismatch => counts.mismatched += 1,
                UnitStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn status(&self) -> BatchStatus {
        let counts = self.counts();
        if counts.succeeded == counts.total {
            BatchStatus::AllSucceeded
        } else if counts.succeeded == 0 {
            BatchStatus::AllFailed
        } else {
            BatchStatus::SomeFailed
        }
    }

    pub fn has_failures(&self) -> bool {
        self.counts().failed > 0
    }

    pub fn to_json(&self) -> Value {
        json!({
            "phase": self.phase,
            "mode": self.mode.label(),
            "status": self.status(),
            "counts": self.counts(),
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "results": self.results,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.to_json())
    }
}

pub struct Coordinator<'a> {
    ctx: &'a RunContext,
    mode: ExecMode,
}

impl<'a> Coordinator<'a> {
    pub fn new(ctx: &'a RunContext, mode: ExecMode) -> Self {
        Self { ctx, mode }
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn run<U: WorkUnit>(&self, phase: &str, units: &[U]) -> BatchReport {
        let started_at = Utc::now();
        tracing::info!(phase, units = units.len(), mode = %self.mode.label(), "starting batch");
        let mut results = run_batch(units, self.mode, self.ctx);
        results.sort_by_key(|r| r.index);
        let report = BatchReport {
            phase: phase.to_string(),
            mode: self.mode,
            results,
            started_at,
            finished_at: Utc::now(),
        };
        let counts = report.counts();
        tracing::info!(
            phase,
            succeeded = counts.succeeded,
            mismatched = counts.mismatched,
            failed = counts.failed,
            "batch finished"
        );
        report
    }
}

/// Runs every unit exactly once. The returned results are in completion
/// order; each carries the index of its unit in `units`.
pub fn run_batch<U: WorkUnit>(units: &[U], mode: ExecMode, ctx: &RunContext) -> Vec<RunResult> {
    match mode {
        ExecMode::Sequential => units
            .iter()
            .enumerate()
            .map(|(index, unit)| run_one(index, unit, ctx))
            .collect(),
        ExecMode::Parallel { pool_size } => run_pool(units, pool_size, ctx),
    }
}

fn run_pool<U: WorkUnit>(units: &[U], pool_size: usize, ctx: &RunContext) -> Vec<RunResult> {
    let workers = pool_size.max(1).min(units.len());
    if workers == 0 {
        return Vec::new();
    }
    let (work_tx, work_rx) = mpsc::channel::<usize>();
    for index in 0..units.len() {
        // The receiver is alive until the scope below ends.
        let _ = work_tx.send(index);
    }
    drop(work_tx);
    let work_rx = Mutex::new(work_rx);
    let (result_tx, result_rx) = mpsc::channel::<RunResult>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let result_tx = result_tx.clone();
            let work_rx = &work_rx;
            scope.spawn(move || loop {
                let next = match work_rx.lock() {
                    Ok(rx) => rx.recv(),
                    Err(poisoned) => poisoned.into_inner().recv(),
                };
                let Ok(index) = next else { break };
                if result_tx.send(run_one(index, &units[index], ctx)).is_err() {
                    break;
                }
            });
        }
    });
    drop(result_tx);
    result_rx.into_iter().collect()
}

fn run_one<U: WorkUnit>(index: usize, unit: &U, ctx: &RunContext) -> RunResult {
    let unit_id = unit.unit_id();
    tracing::debug!(unit = %unit_id, "running");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit.run_unit(ctx)));
    let result = match outcome {
        Ok(outcome) => RunResult::from_outcome(index, unit_id, outcome),
        Err(payload) => RunResult::panicked(index, unit_id, panic_message(payload.as_ref())),
    };
    match result.status {
        UnitStatus::Success => tracing::info!(unit = %result.unit_id, "succeeded"),
        UnitStatus::Mismatch => tracing::warn!(
            unit = %result.unit_id,
            diff = ?result.diagnostics,
            "outputs differ"
        ),
        UnitStatus::Failed => tracing::error!(
            unit = %result.unit_id,
            error = result.message.as_deref().unwrap_or(""),
            "failed"
        ),
    }
    result
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
