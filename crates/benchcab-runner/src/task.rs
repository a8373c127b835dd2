use crate::config::{Realisation, ScienceConfig};
use crate::context::{RunContext, WorkLayout};
use crate::coordinator::WorkUnit;
use crate::error::{BenchError, Result};
use crate::fs_util::{atomic_write_bytes, copy_dir, ensure_dir, read_tail, remove_path, sha256_file};
use crate::handlers::CommandSpec;
use crate::namelist::{self, NmlValue, Scalar, Tree};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub const NAMELIST_FILE: &str = "cable.nml";
pub const STDOUT_FILE: &str = "out.txt";
pub const ANNOTATE_LOG_FILE: &str = "annotate.txt";
pub const FIXED_CO2_PPM: f64 = 400.0;
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct Task {
    realisation: Arc<Realisation>,
    met_forcing_file: String,
    sci_config: Arc<ScienceConfig>,
    name: String,
}

impl Task {
    pub fn new(
        realisation: Arc<Realisation>,
        met_forcing_file: &str,
        sci_config: Arc<ScienceConfig>,
    ) -> Self {
        let name = format!(
            "{}_{}_{}",
            realisation.name,
            forcing_basename(met_forcing_file),
            sci_config.id
        );
        Self {
            realisation,
            met_forcing_file: met_forcing_file.to_string(),
            sci_config,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn realisation(&self) -> &Realisation {
        &self.realisation
    }

    pub fn met_forcing_file(&self) -> &str {
        &self.met_forcing_file
    }

    pub fn sci_conf_id(&self) -> usize {
        self.sci_config.id
    }

    pub fn sci_config(&self) -> &ScienceConfig {
        &self.sci_config
    }

    pub fn task_dir(&self, layout: &WorkLayout) -> PathBuf {
        layout.tasks_dir().join(&self.name)
    }

    pub fn namelist_path(&self, layout: &WorkLayout) -> PathBuf {
        self.task_dir(layout).join(NAMELIST_FILE)
    }

    pub fn stdout_path(&self, layout: &WorkLayout) -> PathBuf {
        self.task_dir(layout).join(STDOUT_FILE)
    }

    pub fn output_path(&self, layout: &WorkLayout) -> PathBuf {
        layout.outputs_dir().join(format!("{}_out.nc", self.name))
    }

    pub fn log_path(&self, layout: &WorkLayout) -> PathBuf {
        layout.logs_dir().join(format!("{}_log.txt", self.name))
    }

    pub fn clean(&self, ctx: &RunContext) -> Result<()> {
        remove_path(&self.task_dir(&ctx.layout))?;
        remove_path(&self.output_path(&ctx.layout))?;
        remove_path(&self.log_path(&ctx.layout))
    }

    pub fn fetch_inputs(&self, ctx: &RunContext) -> Result<()> {
        let templates = &ctx.inputs.namelist_dir;
        if !templates.is_dir() {
            return Err(BenchError::missing("namelist templates", templates));
        }
        let exe = self
            .realisation
            .exe_path(&ctx.layout.src_dir(), &ctx.tools.exe_name);
        if !exe.is_file() {
            return Err(BenchError::missing("model executable", exe));
        }
        let dir = self.task_dir(&ctx.layout);
        ensure_dir(&dir)?;
        copy_dir(templates, &dir)?;
        let dest = dir.join(&ctx.tools.exe_name);
        fs::copy(&exe, &dest).map_err(|e| BenchError::io(&dest, e))?;
        Ok(())
    }

    /// Template, then base settings, science config, realisation patch and
    /// realisation removals. Each call starts from a fresh template copy.
    pub fn configure(&self, ctx: &RunContext) -> Result<()> {
        let template = ctx.inputs.namelist_dir.join(NAMELIST_FILE);
        let template_bytes = match fs::read(&template) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BenchError::missing("namelist template", template));
            }
            Err(e) => return Err(BenchError::io(&template, e)),
        };
        let nml = self.namelist_path(&ctx.layout);
        ensure_dir(&self.task_dir(&ctx.layout))?;
        atomic_write_bytes(&nml, &template_bytes)?;

        namelist::patch(&nml, &self.base_settings(ctx))?;
        namelist::patch(&nml, &self.sci_config.overrides)?;
        namelist::patch(&nml, &self.realisation.patch)?;
        namelist::remove(&nml, &self.realisation.patch_remove)?;
        tracing::debug!(task = %self.name, path = %nml.display(), "namelist configured");
        Ok(())
    }

    pub fn setup(&self, ctx: &RunContext) -> Result<()> {
        self.clean(ctx)?;
        self.fetch_inputs(ctx)?;
        self.configure(ctx)
    }

    pub fn execute(&self, ctx: &RunContext) -> Result<()> {
        let dir = self.task_dir(&ctx.layout);
        let exe = dir.join(&ctx.tools.exe_name);
        if !exe.is_file() {
            return Err(BenchError::missing("model executable", exe));
        }
        let nml = self.namelist_path(&ctx.layout);
        if !nml.is_file() {
            return Err(BenchError::missing("task namelist", nml));
        }
        let stdout_path = self.stdout_path(&ctx.layout);
        let spec = CommandSpec::new(exe.to_string_lossy())
            .arg(NAMELIST_FILE)
            .cwd(&dir)
            .env(&ctx.environment)
            .output_file(&stdout_path);
        tracing::info!(task = %self.name, cmd = %spec.display(), "running model");
        let output = ctx.runner.run(&spec).map_err(|e| BenchError::io(&exe, e))?;
        if !output.success() {
            return Err(BenchError::Execution {
                program: ctx.tools.exe_name.clone(),
                exit_code: output.exit_code,
                log_tail: read_tail(&stdout_path, LOG_TAIL_LINES),
                log_path: stdout_path,
            });
        }
        Ok(())
    }

    pub fn annotate_output(&self, ctx: &RunContext) -> Result<()> {
        let output = self.output_path(&ctx.layout);
        if !output.is_file() {
            return Err(BenchError::missing("model output", output));
        }
        let mut spec = CommandSpec::new(&ctx.tools.ncatted).args(["-O", "-h"]);
        for (name, value) in self.provenance(ctx)? {
            spec = spec.arg("-a").arg(ncatted_attribute(&name, &value));
        }
        let log_path = self.task_dir(&ctx.layout).join(ANNOTATE_LOG_FILE);
        let spec = spec.arg(output.to_string_lossy()).output_file(&log_path);
        let result = ctx.runner.run(&spec).map_err(|e| {
            BenchError::Environment(format!("failed to run {}: {}", ctx.tools.ncatted, e))
        })?;
        if !result.success() {
            return Err(BenchError::Execution {
                program: ctx.tools.ncatted.clone(),
                exit_code: result.exit_code,
                log_tail: read_tail(&log_path, LOG_TAIL_LINES),
                log_path,
            });
        }
        Ok(())
    }

    pub fn run(&self, ctx: &RunContext) -> Result<()> {
        self.execute(ctx)?;
        self.annotate_output(ctx)
    }

    fn base_settings(&self, ctx: &RunContext) -> Tree {
        let layout = &ctx.layout;
        let inputs = &ctx.inputs;
        let path = |p: PathBuf| NmlValue::from(p.to_string_lossy().to_string());
        let filename = map([
            ("met", path(inputs.met_dir.join(&self.met_forcing_file))),
            ("out", path(self.output_path(layout))),
            ("log", path(self.log_path(layout))),
            ("restart_out", NmlValue::from(" ")),
            ("type", path(inputs.grid_file.clone())),
        ]);
        let casafile = map([
            ("phen", path(inputs.phen_file.clone())),
            ("cnpbiome", path(inputs.cnpbiome_file.clone())),
        ]);
        let cable = map([
            ("filename", filename),
            ("output", map([("restart", NmlValue::from(false))])),
            ("fixedco2", NmlValue::from(FIXED_CO2_PPM)),
            ("casafile", casafile),
            ("spinup", NmlValue::from(false)),
        ]);
        let mut tree = Tree::new();
        tree.insert("cable".to_string(), cable);
        tree
    }

    fn provenance(&self, ctx: &RunContext) -> Result<Vec<(String, String)>> {
        let doc = namelist::read(&self.namelist_path(&ctx.layout))?;
        let mut attrs: Vec<(String, String)> = namelist::flatten(&doc)
            .into_iter()
            .map(|(key, value)| (format!("nml.{}", key), attribute_text(&value)))
            .collect();
        attrs.push((
            "cable_branch".to_string(),
            self.realisation.source.branch_label(),
        ));
        attrs.push(("cable_revision".to_string(), self.revision(ctx)));
        attrs.push((
            "benchcab_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ));
        let exe = self.task_dir(&ctx.layout).join(&ctx.tools.exe_name);
        attrs.push(("executable_sha256".to_string(), sha256_file(&exe)?));
        Ok(attrs)
    }

    fn revision(&self, ctx: &RunContext) -> String {
        if let Some(rev) = self.realisation.source.configured_revision() {
            return rev;
        }
        let checkout = ctx.layout.src_dir().join(&self.realisation.name);
        if !checkout.join(".git").exists() {
            return "unknown".to_string();
        }
        let spec = CommandSpec::new(&ctx.tools.git)
            .arg("-C")
            .arg(checkout.to_string_lossy())
            .args(["rev-parse", "HEAD"]);
        match ctx.runner.run(&spec) {
            Ok(out) if out.success() => out.stdout.trim().to_string(),
            _ => "unknown".to_string(),
        }
    }
}

impl WorkUnit for Task {
    fn unit_id(&self) -> String {
        self.name.clone()
    }

    fn run_unit(&self, ctx: &RunContext) -> Result<()> {
        self.run(ctx)
    }
}

pub struct SetupStep<'a>(pub &'a Task);

impl WorkUnit for SetupStep<'_> {
    fn unit_id(&self) -> String {
        self.0.name.clone()
    }

    fn run_unit(&self, ctx: &RunContext) -> Result<()> {
        self.0.setup(ctx)
    }
}

/// File name up to the first `.`: `AU-Tum_2002-2017_OzFlux_Met.nc` gives
/// `AU-Tum_2002-2017_OzFlux_Met`.
pub fn forcing_basename(file: &str) -> &str {
    let name = file.rsplit('/').next().unwrap_or(file);
    name.split('.').next().unwrap_or(name)
}

fn map<const N: usize>(entries: [(&str, NmlValue); N]) -> NmlValue {
    NmlValue::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn attribute_text(value: &NmlValue) -> String {
    match value {
        NmlValue::Scalar(Scalar::Str(s)) => s.trim().to_string(),
        NmlValue::Scalar(s) => s.to_fortran(),
        NmlValue::List(items) => items
            .iter()
            .map(|s| match s {
                Scalar::Str(v) => v.trim().to_string(),
                other => other.to_fortran(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        NmlValue::Map(_) => String::new(),
    }
}

fn ncatted_attribute(name: &str, value: &str) -> String {
    format!("{},global,o,c,{}", name, value.replace(',', "\\,"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::handlers::CommandOutput;
    use crate::test_support::{ok_output, realisation, sci, workspace, FakeRunner};
    use serde_json::json;

    fn tree(value: serde_json::Value) -> Tree {
        serde_json::from_value(value).expect("tree")
    }

    #[test]
    fn names_follow_realisation_forcing_and_science_config() {
        let task = Task::new(
            realisation(0, "trunk"),
            "AU-Tum_2002-2017_OzFlux_Met.nc",
            sci(3, json!({})),
        );
        assert_eq!(task.name(), "trunk_AU-Tum_2002-2017_OzFlux_Met_3");
        let layout = WorkLayout::new("/w");
        assert_eq!(
            task.output_path(&layout),
            PathBuf::from("/w/runs/fluxsite/outputs/trunk_AU-Tum_2002-2017_OzFlux_Met_3_out.nc")
        );
        assert_eq!(
            task.log_path(&layout),
            PathBuf::from("/w/runs/fluxsite/logs/trunk_AU-Tum_2002-2017_OzFlux_Met_3_log.txt")
        );
    }

    #[test]
    fn clean_is_idempotent() {
        let ws = workspace("task_clean", &["trunk"], &[]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.setup(&ws.ctx).expect("setup");
        fs::write(task.output_path(&ws.ctx.layout), "old output").expect("output");
        fs::write(task.log_path(&ws.ctx.layout), "old log").expect("log");

        task.clean(&ws.ctx).expect("first clean");
        task.clean(&ws.ctx).expect("second clean");
        assert!(!task.task_dir(&ws.ctx.layout).exists());
        assert!(!task.output_path(&ws.ctx.layout).exists());
        assert!(!task.log_path(&ws.ctx.layout).exists());
    }

    #[test]
    fn fetch_inputs_copies_templates_and_executable() {
        let ws = workspace("task_fetch", &["trunk"], &[]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.fetch_inputs(&ws.ctx).expect("fetch");
        let dir = task.task_dir(&ws.ctx.layout);
        assert!(dir.join("cable.nml").is_file());
        assert!(dir.join("pft_params.nml").is_file());
        assert_eq!(
            fs::read_to_string(dir.join("cable")).expect("exe"),
            "#!fake trunk"
        );
    }

    #[test]
    fn missing_executable_is_a_missing_input() {
        let ws = workspace("task_noexe", &[], &[]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        let err = task.setup(&ws.ctx).expect_err("no build");
        assert_eq!(err.kind(), ErrorKind::MissingInput);
        assert!(err.to_string().contains("offline"), "{}", err);
    }

    #[test]
    fn configure_twice_gives_identical_bytes() {
        let ws = workspace("task_idem", &["trunk"], &[]);
        let mut r = Realisation::new(
            0,
            "trunk",
            realisation(0, "trunk").source.clone(),
        );
        r.patch = tree(json!({"cable": {"cable_user": {"gs_switch": "medlyn"}}}));
        let task = Task::new(Arc::new(r), "site1.nc", sci(1, json!({"cable": {"l_newroot": true}})));
        task.setup(&ws.ctx).expect("setup");
        let first = fs::read(task.namelist_path(&ws.ctx.layout)).expect("first");
        task.configure(&ws.ctx).expect("configure again");
        let second = fs::read(task.namelist_path(&ws.ctx.layout)).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn base_settings_point_at_task_files() {
        let ws = workspace("task_base", &["trunk"], &[]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.setup(&ws.ctx).expect("setup");
        let doc = namelist::read(&task.namelist_path(&ws.ctx.layout)).expect("read");
        let flat = namelist::flatten(&doc);
        let text = |k: &str| match flat.get(k) {
            Some(NmlValue::Scalar(Scalar::Str(s))) => s.clone(),
            other => panic!("{} = {:?}", k, other),
        };
        assert!(text("cable.filename.met").ends_with("met/site1.nc"));
        assert!(text("cable.filename.out").ends_with("outputs/trunk_site1_0_out.nc"));
        assert!(text("cable.filename.log").ends_with("logs/trunk_site1_0_log.txt"));
        assert_eq!(text("cable.filename.restart_out"), " ");
        assert_eq!(flat["cable.output.restart"], NmlValue::from(false));
        assert_eq!(flat["cable.spinup"], NmlValue::from(false));
        assert_eq!(flat["cable.fixedco2"], NmlValue::from(400.0));
        // template keys survive
        assert_eq!(flat["cable.soilparmnew"], NmlValue::from(true));
    }

    #[test]
    fn realisation_patch_wins_over_science_config() {
        let ws = workspace("task_order", &["trunk"], &[]);
        let source = realisation(0, "trunk").source.clone();
        let mut r = Realisation::new(0, "trunk", source);
        r.patch = tree(json!({"cable": {"k": 2}}));
        let task = Task::new(Arc::new(r.clone()), "site1.nc", sci(0, json!({"cable": {"k": 1}})));
        task.setup(&ws.ctx).expect("setup");
        let doc = namelist::read(&task.namelist_path(&ws.ctx.layout)).expect("read");
        assert_eq!(namelist::flatten(&doc)["cable.k"], NmlValue::from(2_i64));

        r.patch_remove = tree(json!({"cable": {"k": 1}}));
        let task = Task::new(Arc::new(r), "site1.nc", sci(0, json!({"cable": {"k": 1}})));
        task.setup(&ws.ctx).expect("setup with removal");
        let doc = namelist::read(&task.namelist_path(&ws.ctx.layout)).expect("read");
        assert!(!namelist::flatten(&doc).contains_key("cable.k"));
    }

    #[test]
    fn removing_an_absent_key_fails_the_task() {
        let ws = workspace("task_badremove", &["trunk"], &[]);
        let source = realisation(0, "trunk").source.clone();
        let mut r = Realisation::new(0, "trunk", source);
        r.patch_remove = tree(json!({"cable": {"not_there": true}}));
        let task = Task::new(Arc::new(r), "site1.nc", sci(0, json!({})));
        let err = task.setup(&ws.ctx).expect_err("absent key");
        assert_eq!(err.kind(), ErrorKind::MissingKey);
        assert!(err.to_string().contains("cable.not_there"), "{}", err);
    }

    #[test]
    fn failed_model_run_reports_log_tail_and_skips_annotation() {
        let ws = workspace("task_fail", &["trunk"], &["trunk_site1_0"]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.setup(&ws.ctx).expect("setup");
        let err = task.run(&ws.ctx).expect_err("model fails");
        match &err {
            BenchError::Execution {
                program,
                exit_code,
                log_path,
                log_tail,
            } => {
                assert_eq!(program, "cable");
                assert_eq!(*exit_code, Some(1));
                assert_eq!(log_path, &task.stdout_path(&ws.ctx.layout));
                assert!(log_tail.contains("SIGSEGV"), "{}", log_tail);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ws.runner.calls_to("ncatted").is_empty());
    }

    #[test]
    fn successful_run_annotates_output_with_provenance() {
        let ws = workspace("task_annotate", &["trunk"], &[]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.setup(&ws.ctx).expect("setup");
        task.run(&ws.ctx).expect("run");

        let model = ws.runner.calls_to("/cable");
        assert_eq!(model.len(), 1);
        assert_eq!(model[0].args, vec!["cable.nml".to_string()]);
        assert_eq!(model[0].cwd.as_deref(), Some(task.task_dir(&ws.ctx.layout).as_path()));

        let annotate = ws.runner.calls_to("ncatted");
        assert_eq!(annotate.len(), 1);
        let args = &annotate[0].args;
        assert!(args.contains(&"cable_branch,global,o,c,trunk".to_string()));
        assert!(args.contains(&"cable_revision,global,o,c,c0ffee0".to_string()));
        assert!(args.contains(&"nml.cable.spinup,global,o,c,.false.".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("executable_sha256,global,o,c,sha256:")));
        assert_eq!(
            args.last().map(PathBuf::from),
            Some(task.output_path(&ws.ctx.layout))
        );
    }

    #[test]
    fn annotating_without_output_is_a_missing_input() {
        let ws = workspace("task_annotate_noout", &["trunk"], &[]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.setup(&ws.ctx).expect("setup");
        let err = task.annotate_output(&ws.ctx).expect_err("no output");
        assert_eq!(err.kind(), ErrorKind::MissingInput);
        assert!(ws.runner.calls_to("ncatted").is_empty());
    }

    #[test]
    fn failed_annotation_names_ncatted_and_its_log() {
        let mut ws = workspace("task_annotate_fail", &["trunk"], &[]);
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.setup(&ws.ctx).expect("setup");
        fs::write(task.output_path(&ws.ctx.layout), "netcdf").expect("output");
        ws.ctx.runner = Arc::new(FakeRunner::new(|spec| {
            if spec.program.ends_with("ncatted") {
                CommandOutput {
                    exit_code: Some(1),
                    stdout: "ncatted: ERROR unable to open file".to_string(),
                    stderr: String::new(),
                }
            } else {
                ok_output("")
            }
        }));

        let err = task.annotate_output(&ws.ctx).expect_err("ncatted fails");
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().starts_with("ncatted exited"), "{}", err);
        match err {
            BenchError::Execution {
                log_path, log_tail, ..
            } => {
                assert_eq!(
                    log_path,
                    task.task_dir(&ws.ctx.layout).join(ANNOTATE_LOG_FILE)
                );
                assert!(log_tail.contains("unable to open"), "{}", log_tail);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn model_sees_the_loaded_environment() {
        let mut ws = workspace("task_env", &["trunk"], &[]);
        ws.ctx.environment = vec![("NETCDF_ROOT".to_string(), Some("/apps/netcdf".to_string()))];
        let task = Task::new(realisation(0, "trunk"), "site1.nc", sci(0, json!({})));
        task.setup(&ws.ctx).expect("setup");
        task.execute(&ws.ctx).expect("execute");
        let model = ws.runner.calls_to("/cable");
        assert_eq!(model[0].env, ws.ctx.environment);
    }

    #[test]
    fn ncatted_values_escape_commas() {
        assert_eq!(
            ncatted_attribute("nml.cable.x", "1, 2"),
            "nml.cable.x,global,o,c,1\\, 2"
        );
    }
}
