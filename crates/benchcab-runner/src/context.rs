use crate::config::{BenchConfig, Inputs, Tools};
use crate::error::Result;
use crate::fs_util::ensure_dir;
use crate::handlers::{CommandRunner, EnvOverlay, ModulesHandler};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory layout under the benchmarking work directory:
///
/// ```text
/// <root>/src/<realisation>/offline/<exe>
/// <root>/runs/fluxsite/{tasks/<task>,outputs,logs,analysis/bitwise-comparisons}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn fluxsite_dir(&self) -> PathBuf {
        self.root.join("runs").join("fluxsite")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.fluxsite_dir().join("tasks")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.fluxsite_dir().join("outputs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.fluxsite_dir().join("logs")
    }

    pub fn bitwise_cmp_dir(&self) -> PathBuf {
        self.fluxsite_dir().join("analysis").join("bitwise-comparisons")
    }

    pub fn report_path(&self, phase: &str) -> PathBuf {
        self.fluxsite_dir().join(format!("{}_report.json", phase))
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            self.tasks_dir(),
            self.outputs_dir(),
            self.logs_dir(),
            self.bitwise_cmp_dir(),
        ] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RunContext {
    pub layout: WorkLayout,
    pub inputs: Inputs,
    pub tools: Tools,
    pub runner: Arc<dyn CommandRunner>,
    pub environment: EnvOverlay,
}

impl RunContext {
    pub fn new(
        layout: WorkLayout,
        inputs: Inputs,
        tools: Tools,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            layout,
            inputs,
            tools,
            runner,
            environment: Vec::new(),
        }
    }

    pub fn from_config(
        work_dir: &Path,
        config: &BenchConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::new(
            WorkLayout::new(work_dir),
            config.inputs.resolved(work_dir),
            config.tools.clone(),
            runner,
        )
    }

    pub fn load_modules(mut self, handler: &dyn ModulesHandler, modules: &[String]) -> Result<Self> {
        self.environment = handler.load(modules)?;
        Ok(self)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("layout", &self.layout)
            .field("inputs", &self.inputs)
            .field("tools", &self.tools)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}
