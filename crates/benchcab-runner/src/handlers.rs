use crate::error::{BenchError, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

pub type EnvOverlay = Vec<(String, Option<String>)>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: EnvOverlay,
    /// When set, stdout and stderr are both redirected into this file
    /// instead of being captured.
    pub output_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, overlay: &EnvOverlay) -> Self {
        self.env.extend(overlay.iter().cloned());
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            match value {
                Some(v) => cmd.env(key, v),
                None => cmd.env_remove(key),
            };
        }
        cmd.stdin(Stdio::null());
        match &spec.output_file {
            Some(path) => {
                let file = fs::File::create(path)?;
                cmd.stdout(file.try_clone()?);
                cmd.stderr(file);
                let status = cmd.status()?;
                Ok(CommandOutput {
                    exit_code: status.code(),
                    ..CommandOutput::default()
                })
            }
            None => {
                let output = cmd.output()?;
                Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
        }
    }
}

pub trait ModulesHandler: Send + Sync {
    fn load(&self, modules: &[String]) -> Result<EnvOverlay>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoModules;

impl ModulesHandler for NoModules {
    fn load(&self, _modules: &[String]) -> Result<EnvOverlay> {
        Ok(Vec::new())
    }
}

pub struct ModuleCmd<'a> {
    pub program: String,
    pub runner: &'a dyn CommandRunner,
}

impl ModulesHandler for ModuleCmd<'_> {
    fn load(&self, modules: &[String]) -> Result<EnvOverlay> {
        if modules.is_empty() {
            return Ok(Vec::new());
        }
        let spec = CommandSpec::new(&self.program)
            .args(["sh", "load"])
            .args(modules.iter().cloned());
        let output = self.runner.run(&spec).map_err(|e| {
            BenchError::Environment(format!("failed to run {}: {}", self.program, e))
        })?;
        // modulecmd reports failures on stderr, sometimes with exit status 0.
        let stderr = output.stderr.trim();
        if !output.success() || stderr.contains("ERROR") {
            return Err(BenchError::Environment(format!(
                "`{}` failed: {}",
                spec.display(),
                if stderr.is_empty() { "no diagnostics" } else { stderr }
            )));
        }
        tracing::debug!(modules = ?modules, "loaded environment modules");
        Ok(parse_module_shell(&output.stdout))
    }
}

/// Extracts `NAME=value` and `unset NAME` statements from `modulecmd sh`
/// output. Other statements (`export NAME`, aliases, functions) are ignored.
pub fn parse_module_shell(script: &str) -> EnvOverlay {
    let mut overlay = Vec::new();
    for stmt in split_statements(script) {
        let stmt = stmt.trim();
        if let Some(rest) = stmt.strip_prefix("unset ") {
            for name in rest.split_whitespace() {
                if is_env_name(name) {
                    overlay.push((name.to_string(), None));
                }
            }
        } else if let Some((name, value)) = stmt.split_once('=') {
            if is_env_name(name) {
                overlay.push((name.to_string(), Some(unquote(value))));
            }
        }
    }
    overlay
}

fn split_statements(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    for c in script.chars() {
        if escaped {
            cur.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => {
                cur.push(c);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                cur.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                cur.push(c);
            }
            ';' | '\n' if !in_single && !in_double => {
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    out.push(cur);
    out
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> String {
    let mut out = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            _ => out.push(c),
        }
    }
    out
}
