use super::{render, EngineError, EngineInstance};
use crate::{
    database::BenchmarkJob,
    exec::{self, Invocation},
};
use itertools::Itertools;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Engine under test, built once per revision inside the work directory
#[derive(Debug, Clone)]
pub struct BuildEngine {
    name: String,
    work: PathBuf,
    dir: String,
    exec: String,
    params: Vec<String>,
    prepare: Vec<String>,
}

impl BuildEngine {
    pub fn new(
        name: &str,
        work: &Path,
        dir: &str,
        exec: &str,
        params: &[String],
        prepare: &[String],
    ) -> Self {
        Self {
            name: name.to_owned(),
            work: work.to_path_buf(),
            dir: dir.to_owned(),
            exec: exec.to_owned(),
            params: params.to_vec(),
            prepare: prepare.to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init(&self, job: &BenchmarkJob) -> Result<EngineInstance, EngineError> {
        let dir = self.work.join(render(&self.dir, job));
        let binary = dir.join(render(&self.exec, job));
        let params = self
            .params
            .iter()
            .map(|param| render(param, job))
            .collect_vec();
        let instance = EngineInstance::new(&self.name, binary.clone(), params);

        if binary.is_file() {
            debug!(engine = %self.name, binary = ?binary, "Binary already exists");
            return Ok(instance);
        }

        let parts = self
            .prepare
            .iter()
            .map(|part| render(part, job))
            .collect_vec();
        let Some(invocation) = Invocation::from_parts(parts.as_slice()) else {
            return Err(EngineError::MissingBinary {
                engine: self.name.clone(),
                path: binary,
            });
        };

        fs::create_dir_all(&dir).map_err(|source| EngineError::WorkDir {
            path: dir.clone(),
            source,
        })?;

        let invocation = invocation.current_dir(&dir);
        info!(engine = %self.name, job = %job, command = %invocation, "Building engine");
        exec::execute(&invocation, None).map_err(|source| EngineError::Prepare {
            engine: self.name.clone(),
            source,
        })?;

        if binary.is_file() {
            Ok(instance)
        } else {
            Err(EngineError::MissingBinary {
                engine: self.name.clone(),
                path: binary,
            })
        }
    }
}
