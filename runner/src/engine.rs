mod build;
mod command;

pub use build::BuildEngine;
pub use command::CommandEngine;

use crate::{
    config::EngineConfig,
    database::BenchmarkJob,
    exec::{ExecError, Invocation},
};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to prepare engine {engine}: {source}")]
    Prepare { engine: String, source: ExecError },
    #[error("Engine {engine} binary {path:?} does not exist")]
    MissingBinary { engine: String, path: PathBuf },
    #[error("Failed to create engine directory {path:?}: {source}")]
    WorkDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// All engine adapters, in the order they are compared
/// (kept as an enum, every adapter is known at compile time)
#[derive(Debug, Clone)]
pub enum Engines {
    Command(CommandEngine),
    Build(BuildEngine),
}

impl Engines {
    pub fn load(config: &EngineConfig, work: &Path) -> Self {
        match config {
            EngineConfig::Command { name, exec, params } => {
                Self::Command(CommandEngine::new(name, exec, params))
            }
            EngineConfig::Build {
                name,
                dir,
                exec,
                params,
                prepare,
            } => Self::Build(BuildEngine::new(name, work, dir, exec, params, prepare)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Command(engine) => engine.name(),
            Self::Build(engine) => engine.name(),
        }
    }

    /// make the engine runnable for the revision of `job`, repeated calls reuse earlier work
    pub fn init(&self, job: &BenchmarkJob) -> Result<EngineInstance, EngineError> {
        match self {
            Self::Command(engine) => Ok(engine.init()),
            Self::Build(engine) => engine.init(job),
        }
    }
}

/// An engine ready to turn queries into invocations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInstance {
    name: String,
    exec: PathBuf,
    params: Vec<String>,
}

impl EngineInstance {
    pub fn new(name: &str, exec: PathBuf, params: Vec<String>) -> Self {
        Self {
            name: name.to_owned(),
            exec,
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<exec> <params...> <dataset path> <query text>`
    pub fn run_cmd(&self, path: &Path, query: &str) -> Invocation {
        Invocation::new(&self.exec)
            .args(&self.params)
            .arg(path)
            .arg(query)
    }
}

/// replace the job placeholders in a configured template
pub fn render(template: &str, job: &BenchmarkJob) -> String {
    template
        .replace("{repo}", &job.repo)
        .replace("{branch}", &job.branch)
        .replace("{revision_short}", job.revision_short())
        .replace("{revision}", &job.revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_use_job_identity() {
        let job = BenchmarkJob::new("org/engine", "main", "0123456789abcdef", "tpc-h");

        assert_eq!(
            render("benchmark-{revision_short}/{branch}", &job),
            "benchmark-01234567/main"
        );
        assert_eq!(
            render("{repo}@{revision}", &job),
            "org/engine@0123456789abcdef"
        );
    }

    #[test]
    fn invocation_ends_with_path_and_query() {
        let instance = EngineInstance::new(
            "engine",
            PathBuf::from("bin/engine"),
            vec!["--quiet".to_owned(), "--output-mode".to_owned(), "list".to_owned()],
        );

        assert_eq!(
            instance
                .run_cmd(Path::new("TPC-H.db"), "select 1;")
                .to_string(),
            "bin/engine --quiet --output-mode list TPC-H.db select 1;"
        );
    }
}
