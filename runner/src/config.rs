use crate::dataset::MatchPolicy;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// bare program names are resolved through PATH at spawn time, only explicit paths can be checked
fn is_explicit_path(path: &Path) -> bool {
    path.components().count() > 1
        || path.has_root()
        || matches!(
            path.components().next(),
            Some(Component::CurDir | Component::ParentDir)
        )
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}: {source}")]
    ReadConfig { path: PathBuf, source: Error },
    #[error("Failed to parse config: {0}")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Config failed the preflight checks")]
    Preflight,
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to pin runner to cores {cores:?}: {reason}")]
    Affinity { cores: Vec<usize>, reason: String },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // identity of this worker, written as owner tag into every results store it creates
    #[serde(default = "default_identity")]
    pub id: String,
    // working directory for dataset files, engine builds and profiler output
    #[serde(default = "default_work_path")]
    pub path: PathBuf,

    #[serde(alias = "db", default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,

    // engines in comparison order, the first one is the reference for output verification
    pub engines: Vec<EngineConfig>,
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    // directory shared by all workers holding the ledger and all result stores
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    // name of the ledger database inside `path`
    #[serde(default = "default_ledger")]
    pub ledger: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    // milliseconds to wait on a locked database before failing
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            ledger: default_ledger(),
            pool_size: default_pool_size(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    #[serde(default = "default_warmup")]
    pub warmup: usize,
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(default)]
    pub clear_caches: bool,
    // command replacing the platform specific cache drop
    pub cache_drop: Option<Vec<String>>,
    // seconds before a single engine invocation is killed
    pub timeout: Option<u64>,
    #[serde(default)]
    pub profiler: ProfilerConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            warmup: default_warmup(),
            attempts: default_attempts(),
            clear_caches: false,
            cache_drop: None,
            timeout: None,
            profiler: ProfilerConfig::default(),
        }
    }
}

impl BenchmarkConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProfilerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_profiler")]
    pub exec: PathBuf,
    // commands run before every profile, replacing the platform default
    pub prepare: Option<Vec<Vec<String>>>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exec: default_profiler(),
            prepare: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // seconds to wait before polling again when no benchmark is pending
    #[serde(default = "default_sleep_delay")]
    pub sleep_delay: u64,
    // seconds to wait before polling again after a failure
    #[serde(default = "default_error_delay")]
    pub error_delay: u64,
    // cores the runner (and with it every engine) is pinned to, empty means no pinning
    #[serde(default)]
    pub cores: Vec<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sleep_delay: default_sleep_delay(),
            error_delay: default_error_delay(),
            cores: Vec::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn sleep_delay(&self) -> Duration {
        Duration::from_secs(self.sleep_delay)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_secs(self.error_delay)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineConfig {
    /// prebuilt binary, e.g. the sqlite3 shell used as reference
    Command {
        name: String,
        exec: PathBuf,
        #[serde(default)]
        params: Vec<String>,
    },
    /// binary built once per revision, templates may use {repo}, {branch}, {revision}
    /// and {revision_short}
    Build {
        name: String,
        // build directory, relative to the work path
        dir: String,
        // binary, relative to `dir`
        exec: String,
        #[serde(default)]
        params: Vec<String>,
        // command run inside `dir` when the binary is missing
        #[serde(default)]
        prepare: Vec<String>,
    },
}

impl EngineConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Command { name, .. } | Self::Build { name, .. } => name,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub name: String,
    // queryable database file, defaults to `dataset-<name>.db` inside the work path
    pub file: Option<PathBuf>,
    // command creating the dataset file if it is missing, `{path}` is replaced by its location
    #[serde(default)]
    pub prepare: Vec<String>,
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
    // directory of `*.sql` files, loaded after the inline queries
    pub directory: Option<QueryDirectoryConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    pub name: String,
    #[serde(alias = "query")]
    pub text: String,
    #[serde(default)]
    pub policy: MatchPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueryDirectoryConfig {
    pub path: PathBuf,
    #[serde(default = "default_query_glob")]
    pub glob: String,
}

impl RunnerConfig {
    /// read, parse and check a config file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content)?;

        if config.preflight_checks() {
            Err(ConfigErrors::Preflight)
        } else {
            Ok(config)
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// returns true if the config contains at least one error, all errors are logged
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.id.trim().is_empty() {
            error!("id must not be empty, it identifies this runner in every results store");
            contains_error = true;
        }

        if self.engines.is_empty() {
            error!("No engine was defined, unable to compare anything");
            contains_error = true;
        } else if self.engines.len() == 1 {
            warn!("Only one engine is defined, outputs will not be verified against a reference");
        }

        for name in self.engines.iter().map(EngineConfig::name).duplicates() {
            error!("Engine {name} is defined more than once");
            contains_error = true;
        }

        for engine in self.engines.iter() {
            match engine {
                EngineConfig::Command { name, exec, .. } => {
                    if is_explicit_path(exec) {
                        match check_executable(exec) {
                            Ok(true) => {}
                            Ok(false) => {
                                error!(
                                    "Engine {name} target {} is not executable",
                                    exec.to_string_lossy()
                                );
                                contains_error = true;
                            }
                            Err(e) => {
                                error!(
                                    "Failed to find engines.{name}.exec ({}): {e}",
                                    exec.to_string_lossy()
                                );
                                contains_error = true;
                            }
                        }
                    }
                }
                EngineConfig::Build {
                    name,
                    dir,
                    exec,
                    prepare,
                    ..
                } => {
                    if dir.trim().is_empty() || exec.trim().is_empty() {
                        error!("Engine {name} needs both 'dir' and 'exec'");
                        contains_error = true;
                    }
                    if prepare.is_empty() {
                        warn!(
                            "Engine {name} has no prepare command, \
                             its binary must already exist for every revision"
                        );
                    }
                }
            }
        }

        if self.datasets.is_empty() {
            error!("No dataset was defined, there is nothing to benchmark");
            contains_error = true;
        }

        for name in self.datasets.iter().map(|dataset| &dataset.name).duplicates() {
            error!("Dataset {name} is defined more than once");
            contains_error = true;
        }

        for dataset in self.datasets.iter() {
            if dataset.queries.is_empty() && dataset.directory.is_none() {
                error!(
                    "Dataset {} contains neither 'queries' nor 'directory', \
                     a dataset can't be a NOP",
                    dataset.name
                );
                contains_error = true;
            }

            if let Some(ref directory) = dataset.directory {
                if !directory.path.is_dir() {
                    error!(
                        "Dataset {} query directory {} is not a directory",
                        dataset.name,
                        directory.path.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if self.benchmark.attempts == 0 {
            error!("benchmark.attempts cannot be 0, there would be nothing to measure");
            contains_error = true;
        }

        if self.benchmark.timeout == Some(0) {
            error!("benchmark.timeout cannot be 0, use no timeout instead");
            contains_error = true;
        }

        if let Some(ref command) = self.benchmark.cache_drop {
            if command.is_empty() {
                error!("benchmark.cache_drop must not be an empty command");
                contains_error = true;
            }
        } else if self.benchmark.clear_caches
            && !cfg!(any(target_os = "linux", target_os = "macos"))
        {
            error!(
                "benchmark.clear_caches is set but this platform has no cache drop, \
                 configure benchmark.cache_drop"
            );
            contains_error = true;
        }

        if let Some(ref commands) = self.benchmark.profiler.prepare {
            if commands.iter().any(Vec::is_empty) {
                error!("benchmark.profiler.prepare must not contain empty commands");
                contains_error = true;
            }
        }

        if self.executor.sleep_delay == 0 {
            warn!("executor.sleep_delay is 0, an idle runner will poll the ledger continuously");
        }

        let cores = affinity::get_core_num();
        for core in self.executor.cores.iter().filter(|core| **core >= cores) {
            error!("executor.cores contains {core} but only {cores} cores are available");
            contains_error = true;
        }

        contains_error
    }
}

fn default_identity() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|hostname| hostname.into_string().ok())
        .unwrap_or_else(|| "runner".to_owned())
}

fn default_work_path() -> PathBuf {
    PathBuf::from("work")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("store")
}

fn default_ledger() -> String {
    "meta".to_owned()
}

fn default_pool_size() -> u32 {
    2
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_warmup() -> usize {
    1
}

fn default_attempts() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_profiler() -> PathBuf {
    PathBuf::from("samply")
}

fn default_sleep_delay() -> u64 {
    60
}

fn default_error_delay() -> u64 {
    60
}

fn default_query_glob() -> String {
    "*.sql".to_owned()
}
