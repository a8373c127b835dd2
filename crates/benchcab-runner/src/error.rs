use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("missing input ({what}): {}", path.display())]
    MissingInput { what: String, path: PathBuf },
    #[error("namelist key not found: {key} (in {})", path.display())]
    MissingKey { key: String, path: PathBuf },
    #[error("{program} exited with {} (see {})", describe_exit(*exit_code), log_path.display())]
    Execution {
        program: String,
        exit_code: Option<i32>,
        log_path: PathBuf,
        log_tail: String,
    },
    #[error("outputs differ (see {})", diff_path.display())]
    ComparisonMismatch { diff_path: PathBuf },
    #[error("invalid namelist {}: {message}", path.display())]
    Namelist { path: PathBuf, message: String },
    #[error("environment modules: {0}")]
    Environment(String),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit status {}", c),
        None => "a signal".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    MissingInput,
    MissingKey,
    Execution,
    ComparisonMismatch,
    Namelist,
    Environment,
    Io,
    Panic,
}

impl BenchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BenchError::Config(_) => ErrorKind::Config,
            BenchError::MissingInput { .. } => ErrorKind::MissingInput,
            BenchError::MissingKey { .. } => ErrorKind::MissingKey,
            BenchError::Execution { .. } => ErrorKind::Execution,
            BenchError::ComparisonMismatch { .. } => ErrorKind::ComparisonMismatch,
            BenchError::Namelist { .. } => ErrorKind::Namelist,
            BenchError::Environment(_) => ErrorKind::Environment,
            BenchError::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BenchError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn missing(what: &str, path: impl Into<PathBuf>) -> Self {
        BenchError::MissingInput {
            what: what.to_string(),
            path: path.into(),
        }
    }
}

pub type Result<T, E = BenchError> = std::result::Result<T, E>;
