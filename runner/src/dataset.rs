use crate::{
    config::{DatasetConfig, QueryDirectoryConfig},
    exec::{self, ExecError, Invocation},
};
use globset::Glob;
use ignore::WalkBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

const SKIP_MARKER: &str = "-- SKIP:";
const COUNT_ONLY_MARKER: &str = "-- count-only";

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset {dataset} file {path:?} is missing and no prepare command is configured")]
    Missing { dataset: String, path: PathBuf },
    #[error("Failed to prepare dataset {dataset}: {source}")]
    Prepare { dataset: String, source: ExecError },
    #[error("Dataset {dataset} prepare command ran but {path:?} still does not exist")]
    NotPrepared { dataset: String, path: PathBuf },
    #[error("Failed to create directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid query glob: {0}")]
    Glob(#[from] globset::Error),
    #[error("Failed to search for queries: {0}")]
    Walk(#[from] ignore::Error),
    #[error("Failed to read query {path:?}: {source}")]
    ReadQuery {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Dataset {dataset} contains query {query} more than once")]
    DuplicateQuery { dataset: String, query: String },
    #[error("Dataset {0} contains no queries")]
    NoQueries(String),
}

/// How the outputs of two engines for the same query are compared
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// line by line equality
    #[default]
    Exact,
    /// only the number of lines has to agree, e.g. for floating point aggregates
    CountOnly,
}

impl Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => f.write_str("exact"),
            Self::CountOnly => f.write_str("count-only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub text: String,
    pub policy: MatchPolicy,
}

/// A dataset whose file exists, ready to be benchmarked
#[derive(Debug, Clone)]
pub struct Loaded {
    pub path: PathBuf,
    pub queries: Vec<Query>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    file: Option<PathBuf>,
    prepare: Vec<String>,
    queries: Vec<Query>,
    directory: Option<QueryDirectoryConfig>,
}

impl Dataset {
    pub fn from_config(config: &DatasetConfig) -> Self {
        Self {
            name: config.name.clone(),
            file: config.file.clone(),
            prepare: config.prepare.clone(),
            queries: config
                .queries
                .iter()
                .map(|query| Query {
                    name: query.name.clone(),
                    text: query.text.clone(),
                    policy: query.policy,
                })
                .collect(),
            directory: config.directory.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// location of the dataset file, relative files are resolved inside `work`
    pub fn path(&self, work: &Path) -> PathBuf {
        match self.file {
            Some(ref file) => work.join(file),
            None => work.join(format!("dataset-{}.db", self.name)),
        }
    }

    /// make sure the dataset file exists and collect its queries, calling it again is a no-op
    pub fn materialize(&self, work: &Path) -> Result<Loaded, DatasetError> {
        let path = self.path(work);

        self.prepare(&path)?;
        let queries = self.load(&path)?;

        info!(
            dataset = %self.name,
            path = ?path,
            "Loaded dataset with {} queries",
            queries.len()
        );

        Ok(Loaded { path, queries })
    }

    fn prepare(&self, path: &Path) -> Result<(), DatasetError> {
        if path.exists() {
            debug!(dataset = %self.name, path = ?path, "Dataset file already exists");
            return Ok(());
        }

        let missing = || DatasetError::Missing {
            dataset: self.name.clone(),
            path: path.to_path_buf(),
        };

        let location = path.to_string_lossy();
        let parts = self
            .prepare
            .iter()
            .map(|part| part.replace("{path}", &location))
            .collect_vec();
        let invocation = Invocation::from_parts(parts.as_slice()).ok_or_else(missing)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| DatasetError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        info!(dataset = %self.name, command = %invocation, "Preparing dataset");
        exec::execute(&invocation, None).map_err(|source| DatasetError::Prepare {
            dataset: self.name.clone(),
            source,
        })?;

        if path.exists() {
            Ok(())
        } else {
            Err(DatasetError::NotPrepared {
                dataset: self.name.clone(),
                path: path.to_path_buf(),
            })
        }
    }

    /// inline queries followed by the queries of the query directory
    pub fn load(&self, path: &Path) -> Result<Vec<Query>, DatasetError> {
        let mut queries = self.queries.clone();

        if let Some(ref directory) = self.directory {
            queries.extend(load_directory(directory)?);
        }

        if let Some(query) = queries.iter().map(|query| &query.name).duplicates().next() {
            return Err(DatasetError::DuplicateQuery {
                dataset: self.name.clone(),
                query: query.clone(),
            });
        }

        if queries.is_empty() {
            return Err(DatasetError::NoQueries(self.name.clone()));
        }

        debug!(
            dataset = %self.name,
            path = ?path,
            queries = ?queries.iter().map(|q| &q.name).collect_vec(),
            "Collected queries"
        );

        Ok(queries)
    }
}

// numeric file stems first in numeric order, everything else by name
fn sort_key(path: &Path) -> (bool, u64, String) {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    match stem.parse::<u64>() {
        Ok(number) => (false, number, stem),
        Err(_) => (true, 0, stem),
    }
}

fn load_directory(directory: &QueryDirectoryConfig) -> Result<Vec<Query>, DatasetError> {
    let matcher = Glob::new(&directory.glob)?.compile_matcher();

    let mut paths = Vec::new();
    for entry in WalkBuilder::new(&directory.path).max_depth(Some(1)).build() {
        let entry = entry?;

        if entry.file_type().map_or(false, |kind| kind.is_file())
            && matcher.is_match(entry.file_name())
        {
            paths.push(entry.into_path());
        }
    }
    paths.sort_by_key(|path| sort_key(path));

    let mut queries = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path).map_err(|source| DatasetError::ReadQuery {
            path: path.clone(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(reason) = text
            .lines()
            .next()
            .and_then(|line| line.trim().strip_prefix(SKIP_MARKER))
        {
            warn!(query = %name, reason = reason.trim(), "Skipping query");
            continue;
        }

        let policy = if text.lines().any(|line| line.trim() == COUNT_ONLY_MARKER) {
            MatchPolicy::CountOnly
        } else {
            MatchPolicy::Exact
        };

        queries.push(Query { name, text, policy });
    }

    Ok(queries)
}
