use crate::{
    benchmark::{Benchmark, BenchmarkError},
    config::RunnerConfig,
    database::{
        ledger::Ledger,
        results::{ProfileStore, ResultStore, OWNER_PARAMETER},
        BenchmarkJob, ConnectionError, Measurement, ProfileArtifact, Storage,
    },
    dataset::{Dataset, DatasetError, Loaded, Query},
    engine::{EngineError, EngineInstance, Engines},
    host::HostInfo,
    sync::Cancellation,
    verify::{self, EngineOutput, VerifyError},
};
use itertools::Itertools;
use rand::Rng;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Format version of the results and profiles stores
pub const VERSION: &str = "v1";

/// Everything that can abort a single benchmark job, none of them stop the runner
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Store operation failed: {0}")]
    TransientInfra(#[from] ConnectionError),
    #[error("Benchmark {job} is owned by runner '{owner}', this runner is '{identity}'")]
    OwnershipConflict {
        job: String,
        owner: String,
        identity: String,
    },
    #[error("Engine {engine} failed on query {query}: {source}")]
    ExecutionFailure {
        engine: String,
        query: String,
        source: BenchmarkError,
    },
    #[error("Outputs disagree: {0}")]
    VerificationMismatch(#[from] VerifyError),
    #[error("Prerequisite for engine {engine} on query {query} failed: {source}")]
    PrerequisiteFailure {
        engine: String,
        query: String,
        source: BenchmarkError,
    },
    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),
    #[error("Failed to initialize engine: {0}")]
    EngineInit(#[from] EngineError),
}

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Failed to open storage: {0}")]
    Storage(#[from] ConnectionError),
    #[error("Failed to initialize dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("Failed to create work directory {path:?}: {source}")]
    WorkDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Outcome of one pass over the pending jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// this many jobs were finished
    Worked(usize),
    /// nothing this runner could make progress on
    Idle,
    /// the ledger or a job failed
    Failed,
}

/// Profiler outputs of one engine for one query
type EngineProfiles = (String, Vec<PathBuf>);

/// The coordinator, owns every collaborator of the control loop
#[derive(Debug)]
pub struct System<'a> {
    config: &'a RunnerConfig,
    storage: Storage,
    ledger: Ledger,
    engines: Vec<Engines>,
    datasets: BTreeMap<String, Loaded>,
    benchmark: Benchmark,
    host: HostInfo,
}

impl<'a> System<'a> {
    /// open the ledger and materialize every configured dataset
    pub fn load(config: &'a RunnerConfig) -> Result<Self, StartupError> {
        std::fs::create_dir_all(&config.path).map_err(|source| StartupError::WorkDir {
            path: config.path.clone(),
            source,
        })?;

        let storage = Storage::load(&config.database)?;
        let ledger = storage.ledger()?;

        let engines = config
            .engines
            .iter()
            .map(|engine| Engines::load(engine, &config.path))
            .collect_vec();
        info!(
            engines = ?engines.iter().map(Engines::name).collect_vec(),
            "Loaded engines"
        );

        let mut datasets = BTreeMap::new();
        for dataset in config.datasets.iter().map(Dataset::from_config) {
            info!(dataset = dataset.name(), "Initializing dataset");
            let loaded = dataset.materialize(&config.path)?;
            datasets.insert(dataset.name().to_owned(), loaded);
        }

        let host = HostInfo::collect();
        info!(host = ?host, "Collected host information");

        Ok(Self {
            config,
            storage,
            ledger,
            engines,
            datasets,
            benchmark: Benchmark::load(&config.benchmark, &config.path),
            host,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// poll the ledger until cancelled
    pub fn run(&self, cancellation: &Cancellation) {
        info!(runner = %self.config.id, "Starting benchmark runner");

        while !cancellation.is_cancelled() {
            match self.poll_once() {
                Poll::Worked(_) => {}
                Poll::Idle => {
                    cancellation.sleep(self.config.executor.sleep_delay());
                }
                Poll::Failed => {
                    cancellation.sleep(self.config.executor.error_delay());
                }
            }
        }

        info!("Benchmark runner stopped");
    }

    /// run every pending job once, stops at the first job failure
    pub fn poll_once(&self) -> Poll {
        let jobs = match self.ledger.fetch_pending() {
            Ok(jobs) => jobs,
            Err(error) => {
                error!(error = ?error, "Failed to load benchmarks to run: {error}");
                return Poll::Failed;
            }
        };

        info!("Loaded {} benchmarks to run", jobs.len());

        let mut finished = 0;
        for job in jobs.iter() {
            match self.run_benchmark(job) {
                Ok(()) => finished += 1,
                Err(error @ JobError::OwnershipConflict { .. }) => {
                    warn!(job = %job, "Skipping benchmark: {error}");
                }
                Err(error) => {
                    error!(job = %job, error = ?error, "Failed to execute benchmark: {error}");
                    return Poll::Failed;
                }
            }
        }

        if finished == 0 {
            Poll::Idle
        } else {
            Poll::Worked(finished)
        }
    }

    /// measure every query of the job that has no measurements yet and mark it finished
    #[instrument(skip_all, fields(job = %job), level = "info")]
    pub fn run_benchmark(&self, job: &BenchmarkJob) -> Result<(), JobError> {
        info!("Running benchmark");

        let loaded = self
            .datasets
            .get(&job.dataset)
            .ok_or_else(|| JobError::UnknownDataset(job.dataset.clone()))?;

        let (results, profiles) = self.open_stores(job)?;

        let instances = self
            .engines
            .iter()
            .map(|engine| engine.init(job))
            .collect::<Result<Vec<_>, _>>()?;

        let written = results.written_query_names(&job.dataset)?;
        if !written.is_empty() {
            info!(
                results = results.name(),
                written = ?written,
                "Resuming after {} measured queries",
                written.len()
            );
        }

        for query in loaded
            .queries
            .iter()
            .filter(|query| !written.contains(&query.name))
        {
            let (measurements, engine_profiles) =
                self.execute_query(job, &loaded.path, query, &instances)?;

            results.append_measurements(&measurements)?;
            self.upload_profiles(job, &profiles, query, &engine_profiles);
        }

        self.ledger.finish(job)?;

        Ok(())
    }

    fn parameters(&self, job: &BenchmarkJob) -> BTreeMap<String, String> {
        let mut parameters = self.host.parameters();
        parameters.extend([
            (OWNER_PARAMETER.to_owned(), self.config.id.clone()),
            ("version".to_owned(), VERSION.to_owned()),
            ("repo".to_owned(), job.repo.clone()),
            ("branch".to_owned(), job.branch.clone()),
            ("revision".to_owned(), job.revision.clone()),
        ]);

        parameters
    }

    /// claim the job with fresh stores, or reopen the stores of a job this runner owns
    fn open_stores(&self, job: &BenchmarkJob) -> Result<(ResultStore, ProfileStore), JobError> {
        if job.is_claimed() {
            let results = self.storage.open_results(&job.results)?;
            let owner = results.owner()?;

            if owner.as_deref() != Some(self.config.id.as_str()) {
                return Err(JobError::OwnershipConflict {
                    job: job.to_string(),
                    owner: owner.unwrap_or_default(),
                    identity: self.config.id.clone(),
                });
            }

            let profiles = self.storage.open_profiles(&job.profiles)?;
            info!(results = %job.results, profiles = %job.profiles, "Resuming benchmark");

            return Ok((results, profiles));
        }

        let (results_name, profiles_name) = store_names(job);
        let (results, profiles) = self.create_stores(job, &results_name, &profiles_name)?;

        match self.ledger.claim(job, &results_name, &profiles_name) {
            Ok(true) => Ok((results, profiles)),
            outcome => {
                drop(results);
                drop(profiles);
                self.storage.discard(&results_name);
                self.storage.discard(&profiles_name);

                match outcome {
                    Err(error) => Err(error.into()),
                    Ok(_) => Err(JobError::OwnershipConflict {
                        job: job.to_string(),
                        owner: "claimed concurrently".to_owned(),
                        identity: self.config.id.clone(),
                    }),
                }
            }
        }
    }

    fn create_stores(
        &self,
        job: &BenchmarkJob,
        results_name: &str,
        profiles_name: &str,
    ) -> Result<(ResultStore, ProfileStore), JobError> {
        let results = self.storage.create_results(results_name)?;
        let profiles = match self.storage.create_profiles(profiles_name) {
            Ok(profiles) => profiles,
            Err(error) => {
                drop(results);
                self.storage.discard(results_name);
                return Err(error.into());
            }
        };

        let initialized = results
            .init_results(&self.parameters(job))
            .and_then(|()| profiles.init_profiles());

        if let Err(error) = initialized {
            drop(results);
            drop(profiles);
            self.storage.discard(results_name);
            self.storage.discard(profiles_name);
            return Err(error.into());
        }

        Ok((results, profiles))
    }

    /// run one query on every engine in order and check that their outputs agree
    fn execute_query(
        &self,
        job: &BenchmarkJob,
        path: &Path,
        query: &Query,
        instances: &[EngineInstance],
    ) -> Result<(Vec<Measurement>, Vec<EngineProfiles>), JobError> {
        let mut measurements = Vec::new();
        let mut outputs = Vec::with_capacity(instances.len());
        let mut profiles = Vec::with_capacity(instances.len());

        for instance in instances {
            info!(
                dataset = %job.dataset,
                query = %query.name,
                engine = instance.name(),
                "Running query"
            );

            let invocation = instance.run_cmd(path, &query.text);
            let failure = |source: BenchmarkError| {
                let engine = instance.name().to_owned();
                let query = query.name.clone();

                if source.is_prerequisite() {
                    JobError::PrerequisiteFailure {
                        engine,
                        query,
                        source,
                    }
                } else {
                    JobError::ExecutionFailure {
                        engine,
                        query,
                        source,
                    }
                }
            };

            self.benchmark.warmup(&invocation).map_err(failure)?;
            let (aggregate, lines) = self.benchmark.timed_run(&invocation).map_err(failure)?;
            let files = self.benchmark.profile(&invocation).map_err(failure)?;

            measurements.extend(aggregate.measurements(instance.name(), &job.dataset, &query.name));
            outputs.push(EngineOutput {
                engine: instance.name().to_owned(),
                lines,
            });
            profiles.push((instance.name().to_owned(), files));
        }

        verify::verify(query, &outputs)?;

        Ok((measurements, profiles))
    }

    /// store profiler outputs and remove them from disk, a failing file is logged and skipped
    fn upload_profiles(
        &self,
        job: &BenchmarkJob,
        store: &ProfileStore,
        query: &Query,
        profiles: &[EngineProfiles],
    ) {
        for (engine, files) in profiles {
            for file in files {
                let uploaded = ProfileArtifact::read(engine, &job.dataset, &query.name, file)
                    .and_then(|artifact| store.append_profile(&artifact));

                match uploaded {
                    Ok(()) => {
                        if let Err(error) = std::fs::remove_file(file) {
                            warn!(
                                file = ?file,
                                error = ?error,
                                "Failed to remove uploaded profile"
                            );
                        }
                    }
                    Err(error) => error!(
                        job = %job,
                        query = %query.name,
                        engine = %engine,
                        store = store.name(),
                        file = ?file,
                        error = ?error,
                        "Failed to upload profile: {error}"
                    ),
                }
            }
        }
    }
}

/// fresh (results, profiles) store handles for a job
pub fn store_names(job: &BenchmarkJob) -> (String, String) {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|time| time.as_secs())
        .unwrap_or_default();
    let nonce = rand::thread_rng().gen_range(0..1000);
    let revision = job.revision_short();

    (
        format!("benchmark-{VERSION}-{revision}-{unix}-{nonce}"),
        format!("profiles-{VERSION}-{revision}-{unix}-{nonce}"),
    )
}
