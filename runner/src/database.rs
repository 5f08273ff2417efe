pub mod ledger;
pub mod pool;
pub mod results;

use crate::config::DatabaseConfig;
use ledger::Ledger;
use pool::SqliteConnectionManager;
use results::{ProfileStore, ResultStore};
use rusqlite::{Connection, OpenFlags};
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Store {0} does not exist")]
    MissingStore(String),
    #[error("Store {0} already exists")]
    StoreExists(String),
    #[error("Failed to prepare store directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read profile artifact {path:?}: {source}")]
    Artifact {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A benchmark job as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BenchmarkJob {
    pub repo: String,
    pub branch: String,
    pub revision: String,
    pub dataset: String,
    /// handle of the results store, empty until claimed
    pub results: String,
    /// handle of the profiles store, empty until claimed
    pub profiles: String,
    pub finished: bool,
}

impl BenchmarkJob {
    pub fn new(repo: &str, branch: &str, revision: &str, dataset: &str) -> Self {
        Self {
            repo: repo.to_owned(),
            branch: branch.to_owned(),
            revision: revision.to_owned(),
            dataset: dataset.to_owned(),
            ..Default::default()
        }
    }

    pub fn is_claimed(&self) -> bool {
        !self.results.is_empty() || !self.profiles.is_empty()
    }

    pub fn revision_short(&self) -> &str {
        let end = self
            .revision
            .char_indices()
            .nth(8)
            .map_or(self.revision.len(), |(index, _)| index);

        &self.revision[..end]
    }
}

impl Display for BenchmarkJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.repo, self.branch, self.revision, self.dataset
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Metric {
    TotalTime,
    User,
    Sys,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalTime => "total_time",
            Self::User => "user",
            Self::Sys => "sys",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "total_time" => Some(Self::TotalTime),
            "user" => Some(Self::User),
            "sys" => Some(Self::Sys),
            _ => None,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timing fact, unique on (runner, dataset, query, metric)
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub runner: String,
    pub dataset: String,
    pub query: String,
    pub metric: Metric,
    pub iterations: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileArtifact {
    pub runner: String,
    pub dataset: String,
    pub query: String,
    pub filename: String,
    pub content: Vec<u8>,
}

impl ProfileArtifact {
    /// read a profiler output file from disk
    pub fn read(
        runner: &str,
        dataset: &str,
        query: &str,
        path: &Path,
    ) -> Result<Self, ConnectionError> {
        let content = fs::read(path).map_err(|source| ConnectionError::Artifact {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            runner: runner.to_owned(),
            dataset: dataset.to_owned(),
            query: query.to_owned(),
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content,
        })
    }
}

/// Directory holding the ledger and all per job stores, shared between workers
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
    ledger: String,
    pool_size: u32,
    busy_timeout: Duration,
}

impl Storage {
    pub fn load(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        fs::create_dir_all(&config.path).map_err(|source| ConnectionError::Directory {
            path: config.path.clone(),
            source,
        })?;

        Ok(Self {
            path: config.path.clone(),
            ledger: config.ledger.clone(),
            pool_size: config.pool_size,
            busy_timeout: Duration::from_millis(config.busy_timeout),
        })
    }

    pub fn db_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{name}.db"))
    }

    /// open the ledger, creating its schema if necessary
    pub fn ledger(&self) -> Result<Ledger, ConnectionError> {
        let manager = SqliteConnectionManager::new(
            self.db_path(&self.ledger),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            self.busy_timeout,
        );
        let pool = r2d2::Pool::builder()
            .max_size(self.pool_size)
            .connection_timeout(self.busy_timeout.max(Duration::from_secs(1)))
            .build_unchecked(manager);
        let ledger = Ledger::new(pool);

        ledger.init()?;

        Ok(ledger)
    }

    /// create a fresh results store, fails if the handle is already taken
    pub fn create_results(&self, name: &str) -> Result<ResultStore, ConnectionError> {
        Ok(ResultStore::new(name, self.create_database(name)?))
    }

    pub fn create_profiles(&self, name: &str) -> Result<ProfileStore, ConnectionError> {
        Ok(ProfileStore::new(name, self.create_database(name)?))
    }

    pub fn open_results(&self, name: &str) -> Result<ResultStore, ConnectionError> {
        Ok(ResultStore::new(name, self.connect(name)?))
    }

    pub fn open_profiles(&self, name: &str) -> Result<ProfileStore, ConnectionError> {
        Ok(ProfileStore::new(name, self.connect(name)?))
    }

    /// remove a store that never got linked into the ledger
    pub fn discard(&self, name: &str) {
        let path = self.db_path(name);

        match fs::remove_file(&path) {
            Ok(()) => debug!(path = ?path, "Discarded unlinked store"),
            Err(error) => debug!(path = ?path, error = %error, "Failed to discard unlinked store"),
        }
    }

    fn create_database(&self, name: &str) -> Result<Connection, ConnectionError> {
        let path = self.db_path(name);

        if path.exists() {
            return Err(ConnectionError::StoreExists(name.to_owned()));
        }

        let connection = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        connection.busy_timeout(self.busy_timeout)?;

        info!(name = name, path = ?path, "Created store");

        Ok(connection)
    }

    fn connect(&self, name: &str) -> Result<Connection, ConnectionError> {
        let path = self.db_path(name);

        if name.is_empty() || !path.is_file() {
            return Err(ConnectionError::MissingStore(name.to_owned()));
        }

        let connection = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        connection.busy_timeout(self.busy_timeout)?;

        Ok(connection)
    }
}
