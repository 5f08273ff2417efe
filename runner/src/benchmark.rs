use crate::{
    config::BenchmarkConfig,
    database::{Measurement, Metric},
    exec::{self, ExecError, Invocation},
};
use once_cell::sync::Lazy;
use rand::Rng;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// platform specific commands flushing dirty pages and dropping the page cache
static DEFAULT_CACHE_DROP: Lazy<Option<Vec<Invocation>>> = Lazy::new(|| {
    if cfg!(target_os = "linux") {
        Some(vec![
            Invocation::new("sync"),
            Invocation::shell("echo 3 | sudo tee /proc/sys/vm/drop_caches"),
        ])
    } else if cfg!(target_os = "macos") {
        Some(vec![Invocation::new("sync"), Invocation::new("purge")])
    } else {
        None
    }
});

/// commands allowing the sampling profiler to read perf events
static DEFAULT_PROFILER_PREPARE: Lazy<Vec<Invocation>> = Lazy::new(|| {
    if cfg!(target_os = "linux") {
        vec![Invocation::shell(
            "echo '1' | sudo tee /proc/sys/kernel/perf_event_paranoid",
        )]
    } else {
        Vec::new()
    }
});

#[derive(Error, Debug)]
pub enum BenchmarkError {
    #[error("Warmup #{attempt} failed: {source}")]
    WarmupFailed { attempt: usize, source: ExecError },
    #[error("Run #{attempt} failed: {source}")]
    RunFailed { attempt: usize, source: ExecError },
    #[error("Profile command failed: {0}")]
    ProfileFailed(ExecError),
    #[error("Failed to clear caches: {0}")]
    CacheDrop(ExecError),
    #[error("Unable to clear caches on platform '{}'", std::env::consts::OS)]
    CacheDropUnsupported,
    #[error("Failed to prepare profiler: {0}")]
    ProfilerSetup(ExecError),
    #[error("Failed to create profile directory {path:?}: {source}")]
    ProfileDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BenchmarkError {
    /// failures of the environment around the engine rather than the engine itself
    pub fn is_prerequisite(&self) -> bool {
        matches!(
            self,
            Self::CacheDrop(_)
                | Self::CacheDropUnsupported
                | Self::ProfilerSetup(_)
                | Self::ProfileDirectory { .. }
        )
    }
}

/// Sums over all timed attempts of one engine for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunAggregate {
    pub total_time: Duration,
    pub user: Duration,
    pub sys: Duration,
    pub attempts: usize,
}

impl RunAggregate {
    fn add(&mut self, output: &exec::RunOutput) {
        self.total_time += output.runtime;
        self.user += output.user;
        self.sys += output.sys;
        self.attempts += 1;
    }

    /// one measurement per metric, values in seconds
    pub fn measurements(&self, runner: &str, dataset: &str, query: &str) -> Vec<Measurement> {
        [
            (Metric::TotalTime, self.total_time),
            (Metric::User, self.user),
            (Metric::Sys, self.sys),
        ]
        .into_iter()
        .map(|(metric, value)| Measurement {
            runner: runner.to_owned(),
            dataset: dataset.to_owned(),
            query: query.to_owned(),
            metric,
            iterations: self.attempts,
            value: value.as_secs_f64(),
        })
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Profiler {
    exec: PathBuf,
    path: PathBuf,
    prepare: Vec<Invocation>,
}

impl Profiler {
    /// prefix shared by all files of one profile
    fn prefix() -> String {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|time| time.as_secs())
            .unwrap_or_default();
        let nonce: u32 = rand::thread_rng().gen();

        format!("profile-{unix}-{nonce}")
    }
}

/// Measurement engine, runs invocations under controlled conditions
#[derive(Debug, Clone)]
pub struct Benchmark {
    warmup: usize,
    attempts: usize,
    clear_caches: bool,
    timeout: Option<Duration>,
    cache_drop: Option<Vec<Invocation>>,
    profiler: Option<Profiler>,
}

impl Benchmark {
    /// profiles are written to `<work>/profiles`
    pub fn load(config: &BenchmarkConfig, work: &Path) -> Self {
        let cache_drop = match config.cache_drop {
            Some(ref command) => {
                Invocation::from_parts(command.as_slice()).map(|command| vec![command])
            }
            None => DEFAULT_CACHE_DROP.clone(),
        };

        let profiler = config.profiler.enabled.then(|| Profiler {
            exec: config.profiler.exec.clone(),
            path: work.join("profiles"),
            prepare: match config.profiler.prepare {
                Some(ref commands) => commands
                    .iter()
                    .filter_map(|command| Invocation::from_parts(command.as_slice()))
                    .collect(),
                None => DEFAULT_PROFILER_PREPARE.clone(),
            },
        });

        Self {
            warmup: config.warmup,
            attempts: config.attempts,
            clear_caches: config.clear_caches,
            timeout: config.timeout(),
            cache_drop,
            profiler,
        }
    }

    fn clear_caches_if_needed(&self) -> Result<(), BenchmarkError> {
        if !self.clear_caches {
            return Ok(());
        }

        let Some(ref commands) = self.cache_drop else {
            return Err(BenchmarkError::CacheDropUnsupported);
        };

        info!("Clearing caches");
        for command in commands {
            exec::execute(command, None).map_err(BenchmarkError::CacheDrop)?;
        }

        Ok(())
    }

    pub fn warmup(&self, invocation: &Invocation) -> Result<(), BenchmarkError> {
        for attempt in 1..=self.warmup {
            info!("Running warmup #{attempt}/{}", self.warmup);

            exec::execute(invocation, self.timeout)
                .map_err(|source| BenchmarkError::WarmupFailed { attempt, source })?;
        }

        Ok(())
    }

    /// run all timed attempts, returns their sums and the output of the last attempt
    pub fn timed_run(
        &self,
        invocation: &Invocation,
    ) -> Result<(RunAggregate, Vec<String>), BenchmarkError> {
        let mut aggregate = RunAggregate::default();
        let mut lines = Vec::new();

        for attempt in 1..=self.attempts {
            self.clear_caches_if_needed()?;

            info!("Running workload #{attempt}/{}", self.attempts);

            let output = exec::execute(invocation, self.timeout)
                .map_err(|source| BenchmarkError::RunFailed { attempt, source })?;

            aggregate.add(&output);
            lines = output.lines();
        }

        debug!(
            total_time = ?aggregate.total_time,
            user = ?aggregate.user,
            sys = ?aggregate.sys,
            "Finished {} attempts",
            aggregate.attempts
        );

        Ok((aggregate, lines))
    }

    /// run once more under the sampling profiler, returns the produced files
    pub fn profile(&self, invocation: &Invocation) -> Result<Vec<PathBuf>, BenchmarkError> {
        let Some(ref profiler) = self.profiler else {
            return Ok(Vec::new());
        };

        self.clear_caches_if_needed()?;

        for command in profiler.prepare.iter() {
            exec::execute(command, None).map_err(BenchmarkError::ProfilerSetup)?;
        }

        std::fs::create_dir_all(&profiler.path).map_err(|source| {
            BenchmarkError::ProfileDirectory {
                path: profiler.path.clone(),
                source,
            }
        })?;

        let prefix = Profiler::prefix();
        let profile = profiler.path.join(format!("{prefix}.json.gz"));
        let symbols = profiler.path.join(format!("{prefix}.json.syms.json"));

        // samply forwards everything after `--` to the profiled command
        let arguments: Vec<OsString> = vec![
            "record".into(),
            "-s".into(),
            "-o".into(),
            profile.clone().into_os_string(),
            "--unstable-presymbolicate".into(),
            "--".into(),
        ];
        let wrapped = invocation.clone().wrap(&profiler.exec, &arguments);

        info!(command = %wrapped, "Running profile");
        exec::execute(&wrapped, self.timeout).map_err(BenchmarkError::ProfileFailed)?;

        Ok([profile, symbols]
            .into_iter()
            .filter(|file| {
                let exists = file.is_file();
                if !exists {
                    warn!(file = ?file, "Profiler did not produce expected file");
                }
                exists
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilerConfig;

    fn benchmark(warmup: usize, attempts: usize) -> Benchmark {
        Benchmark::load(
            &BenchmarkConfig {
                warmup,
                attempts,
                clear_caches: false,
                cache_drop: None,
                timeout: Some(10),
                profiler: ProfilerConfig {
                    enabled: false,
                    ..ProfilerConfig::default()
                },
            },
            Path::new("work"),
        )
    }

    #[test]
    fn timed_run_sums_all_attempts() {
        let (aggregate, lines) = benchmark(0, 3)
            .timed_run(&Invocation::shell("sleep 0.05; echo done"))
            .unwrap();

        assert_eq!(aggregate.attempts, 3);
        assert!(aggregate.total_time >= Duration::from_millis(150));
        assert!(aggregate.total_time < Duration::from_secs(5));
        assert_eq!(lines, vec!["done", ""]);
    }

    #[test]
    fn failing_warmup_reports_attempt() {
        let error = benchmark(2, 1)
            .warmup(&Invocation::new("false"))
            .unwrap_err();

        assert!(matches!(error, BenchmarkError::WarmupFailed { attempt: 1, .. }));
        assert!(!error.is_prerequisite());
    }

    #[test]
    fn failing_cache_drop_is_a_prerequisite_failure() {
        let benchmark = Benchmark::load(
            &BenchmarkConfig {
                clear_caches: true,
                cache_drop: Some(vec!["false".to_owned()]),
                ..BenchmarkConfig::default()
            },
            Path::new("work"),
        );

        let error = benchmark
            .timed_run(&Invocation::new("true"))
            .unwrap_err();

        assert!(matches!(error, BenchmarkError::CacheDrop(_)));
        assert!(error.is_prerequisite());
    }

    #[test]
    fn disabled_profiler_produces_nothing() {
        assert!(benchmark(0, 1)
            .profile(&Invocation::new("true"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn aggregate_becomes_one_measurement_per_metric() {
        let aggregate = RunAggregate {
            total_time: Duration::from_millis(1500),
            user: Duration::from_millis(1000),
            sys: Duration::from_millis(250),
            attempts: 3,
        };

        let measurements = aggregate.measurements("sqlite3", "tpc-h", "1.sql");

        assert_eq!(measurements.len(), 3);
        assert_eq!(measurements[0].metric, Metric::TotalTime);
        assert_eq!(measurements[0].value, 1.5);
        assert_eq!(measurements[2].value, 0.25);
        assert!(measurements.iter().all(|m| m.iterations == 3));
    }
}
