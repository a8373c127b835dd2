use crate::config::{FluxsiteConfig, Realisation, ScienceConfig};
use crate::error::{BenchError, Result};
use crate::task::Task;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const FORTY_TWO_SITE_TEST: &str = "forty-two-site-test";
pub const FIVE_SITE_TEST: &str = "five-site-test";
pub const FIVE_SITE_CODES: [&str; 5] = ["AU-Tum", "AU-How", "FI-Hyy", "US-Var", "US-Whs"];

pub fn build_tasks(
    realisations: &[Arc<Realisation>],
    science_configs: &[Arc<ScienceConfig>],
    forcing_files: &[String],
) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(realisations.len() * forcing_files.len() * science_configs.len());
    let mut seen = HashSet::new();
    for realisation in realisations {
        for file in forcing_files {
            for sci in science_configs {
                let task = Task::new(Arc::clone(realisation), file, Arc::clone(sci));
                if !seen.insert(task.name().to_string()) {
                    return Err(BenchError::Config(format!(
                        "duplicate task name '{}' (realisation names, forcing basenames and \
                         science config ids must be unique)",
                        task.name()
                    )));
                }
                tasks.push(task);
            }
        }
    }
    tracing::debug!(count = tasks.len(), "built task matrix");
    Ok(tasks)
}

/// The forcing files a fluxsite run uses. An explicit list wins; otherwise
/// the experiment name picks all files in `met_dir`, the five-site subset,
/// or a single site.
pub fn resolve_forcing_files(fluxsite: &FluxsiteConfig, met_dir: &Path) -> Result<Vec<String>> {
    if let Some(files) = &fluxsite.met_forcing_files {
        return Ok(files.clone());
    }
    let available = list_forcing_dir(met_dir)?;
    match fluxsite.experiment.as_str() {
        FORTY_TWO_SITE_TEST => Ok(available),
        FIVE_SITE_TEST => FIVE_SITE_CODES
            .iter()
            .map(|site| find_site(&available, site, met_dir))
            .collect(),
        site => Ok(vec![find_site(&available, site, met_dir)?]),
    }
}

fn list_forcing_dir(met_dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(met_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BenchError::missing("forcing directory", met_dir));
        }
        Err(e) => return Err(BenchError::io(met_dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BenchError::io(met_dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".nc") && entry.path().is_file() {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

fn find_site(available: &[String], site: &str, met_dir: &Path) -> Result<String> {
    let prefix = format!("{}_", site);
    available
        .iter()
        .find(|f| f.starts_with(&prefix) || f.split('.').next() == Some(site))
        .cloned()
        .ok_or_else(|| {
            BenchError::Config(format!(
                "no forcing file for site '{}' in {}",
                site,
                met_dir.display()
            ))
        })
}
