use crate::config::{Inputs, Realisation, ScienceConfig, SourceLocation, Tools};
use crate::context::{RunContext, WorkLayout};
use crate::handlers::{CommandOutput, CommandRunner, CommandSpec};
use crate::namelist::Tree;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn temp_root(label: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "benchcab_{}_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&root).expect("temp root");
    root
}

type Responder = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

/// Records every command and answers with a scripted response. When the
/// command redirects output to a file, the scripted stdout is written there.
pub(crate) struct FakeRunner {
    respond: Responder,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn calls_to(&self, program_suffix: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program.ends_with(program_suffix))
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        self.calls.lock().expect("calls lock").push(spec.clone());
        let out = (self.respond)(spec);
        if let Some(path) = &spec.output_file {
            fs::write(path, &out.stdout)?;
        }
        Ok(out)
    }
}

pub(crate) fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn simulated_tools(root: &Path, failing: &[&str]) -> FakeRunner {
    let outputs = WorkLayout::new(root).outputs_dir();
    let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
    FakeRunner::new(move |spec| {
        if spec.program.ends_with("/cable") {
            let task = spec
                .cwd
                .as_ref()
                .and_then(|d| d.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if failing.contains(&task) {
                return CommandOutput {
                    exit_code: Some(1),
                    stdout: "forrtl: severe (174): SIGSEGV, segmentation fault occurred"
                        .to_string(),
                    stderr: String::new(),
                };
            }
            let case = task.split_once('_').map(|(_, rest)| rest).unwrap_or("");
            let _ = fs::create_dir_all(&outputs);
            let _ = fs::write(outputs.join(format!("{}_out.nc", task)), case);
            ok_output("Finished. 17520 time steps")
        } else if spec.program == "nccmp" {
            let a = fs::read(&spec.args[1]).unwrap_or_default();
            let b = fs::read(&spec.args[2]).unwrap_or_default();
            if a == b {
                ok_output("")
            } else {
                CommandOutput {
                    exit_code: Some(1),
                    stdout: format!("DIFFER : FILE {} {}", spec.args[1], spec.args[2]),
                    stderr: String::new(),
                }
            }
        } else {
            ok_output("")
        }
    })
}

pub(crate) const TEMPLATE_NML: &str = "\
&cable
    filename%met = 'template_met.nc'
    soilparmnew = .true.
    cable_user%gs_switch = 'leuning'
    cable_user%fwsoil_switch = 'standard'
/
";

pub(crate) struct Workspace {
    pub(crate) root: PathBuf,
    pub(crate) ctx: RunContext,
    pub(crate) runner: Arc<FakeRunner>,
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

pub(crate) fn workspace(label: &str, built: &[&str], failing: &[&str]) -> Workspace {
    let root = temp_root(label);
    let namelists = root.join("namelists");
    fs::create_dir_all(&namelists).expect("namelists");
    fs::write(namelists.join("cable.nml"), TEMPLATE_NML).expect("template");
    fs::write(namelists.join("pft_params.nml"), "&cable_pftparm\n/\n").expect("pft");
    let met = root.join("met");
    fs::create_dir_all(&met).expect("met");
    for f in ["site1.nc", "site2.nc"] {
        fs::write(met.join(f), f).expect("met file");
    }
    let layout = WorkLayout::new(&root);
    for name in built {
        let dir = layout.src_dir().join(name).join("offline");
        fs::create_dir_all(&dir).expect("src");
        fs::write(dir.join("cable"), format!("#!fake {}", name)).expect("exe");
    }
    layout.create_dirs().expect("layout");
    let inputs = Inputs {
        met_dir: met,
        namelist_dir: namelists,
        grid_file: root.join("aux").join("gridinfo_CSIRO_1x1.nc"),
        phen_file: root.join("aux").join("modis_phenology_csiro.txt"),
        cnpbiome_file: root.join("aux").join("pftlookup_csiro_v16_17tiles.csv"),
    };
    let runner = Arc::new(simulated_tools(&root, failing));
    let ctx = RunContext::new(
        layout,
        inputs,
        Tools::default(),
        runner.clone() as Arc<dyn CommandRunner>,
    );
    Workspace { root, ctx, runner }
}

pub(crate) fn realisation(id: usize, name: &str) -> Arc<Realisation> {
    Arc::new(Realisation::new(
        id,
        name,
        SourceLocation::Git {
            branch: name.to_string(),
            url: None,
            commit: Some(format!("c0ffee{}", id)),
        },
    ))
}

pub(crate) fn sci(id: usize, overrides: serde_json::Value) -> Arc<ScienceConfig> {
    let overrides: Tree = serde_json::from_value(overrides).expect("sci tree");
    Arc::new(ScienceConfig { id, overrides })
}
