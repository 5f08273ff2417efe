use super::EngineInstance;
use std::path::{Path, PathBuf};

/// Prebuilt engine binary, identical for every revision
#[derive(Debug, Clone)]
pub struct CommandEngine {
    name: String,
    exec: PathBuf,
    params: Vec<String>,
}

impl CommandEngine {
    pub fn new(name: &str, exec: &Path, params: &[String]) -> Self {
        Self {
            name: name.to_owned(),
            exec: exec.to_path_buf(),
            params: params.to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init(&self) -> EngineInstance {
        EngineInstance::new(&self.name, self.exec.clone(), self.params.clone())
    }
}
