use crate::coordinator::ExecMode;
use crate::error::{BenchError, Result};
use crate::namelist::{normalize_keys, NmlValue, Tree};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_EXPERIMENT: &str = "forty-two-site-test";
pub const DEFAULT_POOL_SIZE: usize = 18;
const CABLE_AUX_DIR: &str = "/g/data/tm70/CABLE-AUX";

/// Where a realisation's source comes from. Checkout itself happens outside
/// the runner; this is kept for naming and provenance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLocation {
    Git {
        branch: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        commit: Option<String>,
    },
    Svn {
        branch_path: String,
        #[serde(default)]
        revision: Option<u64>,
    },
    Local {
        path: PathBuf,
    },
}

impl SourceLocation {
    pub fn branch_label(&self) -> String {
        match self {
            SourceLocation::Git { branch, .. } => branch.clone(),
            SourceLocation::Svn { branch_path, .. } => branch_path.clone(),
            SourceLocation::Local { path } => path.display().to_string(),
        }
    }

    pub fn configured_revision(&self) -> Option<String> {
        match self {
            SourceLocation::Git { commit, .. } => commit.clone(),
            SourceLocation::Svn { revision, .. } => revision.map(|r| r.to_string()),
            SourceLocation::Local { .. } => None,
        }
    }

    fn default_name(&self) -> Option<String> {
        let raw = match self {
            SourceLocation::Git { branch, .. } => branch.as_str(),
            SourceLocation::Svn { branch_path, .. } => branch_path.as_str(),
            SourceLocation::Local { path } => path.to_str()?,
        };
        raw.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Realisation {
    pub id: usize,
    pub name: String,
    pub source: SourceLocation,
    pub patch: Tree,
    pub patch_remove: Tree,
    pub build_script: Option<PathBuf>,
}

impl Realisation {
    pub fn new(id: usize, name: &str, source: SourceLocation) -> Self {
        Self {
            id,
            name: name.to_string(),
            source,
            patch: Tree::new(),
            patch_remove: Tree::new(),
            build_script: None,
        }
    }

    pub fn exe_path(&self, src_dir: &Path, exe_name: &str) -> PathBuf {
        src_dir.join(&self.name).join("offline").join(exe_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScienceConfig {
    pub id: usize,
    pub overrides: Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PbsConfig {
    #[serde(default = "default_pool_size")]
    pub ncpus: usize,
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self {
            ncpus: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FluxsiteConfig {
    #[serde(default = "default_experiment")]
    pub experiment: String,
    #[serde(default)]
    pub met_forcing_files: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub multiprocess: bool,
    #[serde(default)]
    pub pbs: PbsConfig,
}

impl Default for FluxsiteConfig {
    fn default() -> Self {
        Self {
            experiment: default_experiment(),
            met_forcing_files: None,
            multiprocess: true,
            pbs: PbsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inputs {
    #[serde(default = "default_met_dir")]
    pub met_dir: PathBuf,
    #[serde(default = "default_namelist_dir")]
    pub namelist_dir: PathBuf,
    #[serde(default = "default_grid_file")]
    pub grid_file: PathBuf,
    #[serde(default = "default_phen_file")]
    pub phen_file: PathBuf,
    #[serde(default = "default_cnpbiome_file")]
    pub cnpbiome_file: PathBuf,
}

impl Default for Inputs {
    fn default() -> Self {
        Self {
            met_dir: default_met_dir(),
            namelist_dir: default_namelist_dir(),
            grid_file: default_grid_file(),
            phen_file: default_phen_file(),
            cnpbiome_file: default_cnpbiome_file(),
        }
    }
}

impl Inputs {
    /// Resolves relative paths against the working directory.
    pub fn resolved(&self, work_dir: &Path) -> Inputs {
        let abs = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                work_dir.join(p)
            }
        };
        Inputs {
            met_dir: abs(&self.met_dir),
            namelist_dir: abs(&self.namelist_dir),
            grid_file: abs(&self.grid_file),
            phen_file: abs(&self.phen_file),
            cnpbiome_file: abs(&self.cnpbiome_file),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tools {
    #[serde(default = "default_exe_name")]
    pub exe_name: String,
    #[serde(default = "default_nccmp")]
    pub nccmp: String,
    #[serde(default = "default_ncatted")]
    pub ncatted: String,
    #[serde(default = "default_modulecmd")]
    pub modulecmd: String,
    #[serde(default = "default_git")]
    pub git: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            exe_name: default_exe_name(),
            nccmp: default_nccmp(),
            ncatted: default_ncatted(),
            modulecmd: default_modulecmd(),
            git: default_git(),
        }
    }
}

fn default_experiment() -> String {
    DEFAULT_EXPERIMENT.to_string()
}
fn default_true() -> bool {
    true
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_met_dir() -> PathBuf {
    PathBuf::from("/g/data/ks32/CLEX_Data/PLUMBER2/v1-0/Met")
}
fn default_namelist_dir() -> PathBuf {
    PathBuf::from("namelists")
}
fn default_grid_file() -> PathBuf {
    Path::new(CABLE_AUX_DIR).join("offline/gridinfo_CSIRO_1x1.nc")
}
fn default_phen_file() -> PathBuf {
    Path::new(CABLE_AUX_DIR).join("core/biogeochem/modis_phenology_csiro.txt")
}
fn default_cnpbiome_file() -> PathBuf {
    Path::new(CABLE_AUX_DIR).join("core/biogeochem/pftlookup_csiro_v16_17tiles.csv")
}
fn default_exe_name() -> String {
    "cable".to_string()
}
fn default_nccmp() -> String {
    "nccmp".to_string()
}
fn default_ncatted() -> String {
    "ncatted".to_string()
}
fn default_modulecmd() -> String {
    "modulecmd".to_string()
}
fn default_git() -> String {
    "git".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRealisation {
    #[serde(default)]
    name: Option<String>,
    repo: SourceLocation,
    #[serde(default)]
    patch: Tree,
    #[serde(default)]
    patch_remove: Tree,
    #[serde(default)]
    build_script: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    modules: Vec<String>,
    realisations: Vec<RawRealisation>,
    #[serde(default)]
    science_configurations: Option<Vec<Tree>>,
    #[serde(default)]
    fluxsite: FluxsiteConfig,
    #[serde(default)]
    inputs: Inputs,
    #[serde(default)]
    tools: Tools,
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub project: Option<String>,
    pub modules: Vec<String>,
    pub realisations: Vec<Arc<Realisation>>,
    pub science_configurations: Vec<Arc<ScienceConfig>>,
    pub fluxsite: FluxsiteConfig,
    pub inputs: Inputs,
    pub tools: Tools,
}

impl BenchConfig {
    pub fn exec_mode(&self) -> ExecMode {
        if self.fluxsite.multiprocess {
            ExecMode::Parallel {
                pool_size: self.fluxsite.pbs.ncpus.max(1),
            }
        } else {
            ExecMode::Sequential
        }
    }
}

pub fn load_config(path: &Path) -> Result<BenchConfig> {
    let raw = fs::read_to_string(path).map_err(|e| {
        BenchError::Config(format!("cannot read config {}: {}", path.display(), e))
    })?;
    parse_config(&raw).map_err(|e| match e {
        BenchError::Config(msg) => BenchError::Config(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

pub fn parse_config(raw_yaml: &str) -> Result<BenchConfig> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw_yaml)
        .map_err(|e| BenchError::Config(format!("invalid YAML: {}", e)))?;
    let json_value: Value = serde_json::to_value(yaml_value)
        .map_err(|e| BenchError::Config(format!("unsupported YAML content: {}", e)))?;
    validate_required_fields(&json_value)?;
    let raw: RawConfig = serde_json::from_value(json_value)
        .map_err(|e| BenchError::Config(e.to_string()))?;

    let mut realisations = Vec::with_capacity(raw.realisations.len());
    for (id, r) in raw.realisations.into_iter().enumerate() {
        let name = match r.name.or_else(|| r.repo.default_name()) {
            Some(n) => n,
            None => {
                return Err(BenchError::Config(format!(
                    "realisation {} has no name and none can be derived from its repo",
                    id
                )))
            }
        };
        validate_name(&name, id)?;
        realisations.push(Arc::new(Realisation {
            id,
            name,
            source: r.repo,
            patch: normalize_keys(&r.patch),
            patch_remove: normalize_keys(&r.patch_remove),
            build_script: r.build_script,
        }));
    }

    let science_configurations = raw
        .science_configurations
        .unwrap_or_else(default_science_configurations)
        .into_iter()
        .enumerate()
        .map(|(id, overrides)| {
            Arc::new(ScienceConfig {
                id,
                overrides: normalize_keys(&overrides),
            })
        })
        .collect();

    Ok(BenchConfig {
        project: raw.project,
        modules: raw.modules,
        realisations,
        science_configurations,
        fluxsite: raw.fluxsite,
        inputs: raw.inputs,
        tools: raw.tools,
    })
}

fn validate_name(name: &str, id: usize) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.+".contains(c));
    if ok {
        Ok(())
    } else {
        Err(BenchError::Config(format!(
            "realisation {} name '{}' is not usable in file names",
            id, name
        )))
    }
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let mut missing: Vec<String> = Vec::new();
    match json_value.pointer("/realisations") {
        Some(Value::Array(items)) if !items.is_empty() => {
            for (i, item) in items.iter().enumerate() {
                if item.pointer("/repo").map_or(true, Value::is_null) {
                    missing.push(format!("/realisations/{}/repo", i));
                }
            }
        }
        _ => missing.push("/realisations".to_string()),
    }
    if let Some(Value::Array(items)) = json_value.pointer("/science_configurations") {
        if items.is_empty() {
            missing.push("/science_configurations".to_string());
        }
        for (i, item) in items.iter().enumerate() {
            if !item.is_object() {
                missing.push(format!("/science_configurations/{} (must be a mapping)", i));
            }
        }
    }
    if let Some(Value::Array(files)) = json_value.pointer("/fluxsite/met_forcing_files") {
        if files.is_empty() {
            missing.push("/fluxsite/met_forcing_files".to_string());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BenchError::Config(format!(
            "config missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

/// Stomatal conductance scheme × soil moisture stress scheme.
pub fn default_science_configurations() -> Vec<Tree> {
    let combos = [
        ("medlyn", "Haverd2013"),
        ("leuning", "Haverd2013"),
        ("medlyn", "standard"),
        ("leuning", "standard"),
    ];
    combos
        .iter()
        .map(|(gs, fwsoil)| {
            let mut cable_user = Tree::new();
            cable_user.insert("gs_switch".to_string(), NmlValue::from(*gs));
            cable_user.insert("fwsoil_switch".to_string(), NmlValue::from(*fwsoil));
            let mut cable = Tree::new();
            cable.insert("cable_user".to_string(), NmlValue::Map(cable_user));
            let mut sci = Tree::new();
            sci.insert("cable".to_string(), NmlValue::Map(cable));
            sci
        })
        .collect()
}
