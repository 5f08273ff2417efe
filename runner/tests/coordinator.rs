use dbbench::{
    benchmark::BenchmarkError,
    config::{DatasetConfig, EngineConfig, ProfilerConfig, QueryConfig, RunnerConfig},
    database::{BenchmarkJob, Metric, Storage},
    dataset::MatchPolicy,
    system::{JobError, Poll, System},
};
use std::{
    fs::{self, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

fn config(dir: &Path, id: &str) -> RunnerConfig {
    let mut config = RunnerConfig::parse(&format!(
        r#"
id: {id}
path: {work}
database:
  path: {store}
benchmark:
  warmup: 1
  attempts: 2
  profiler:
    enabled: false
executor:
  sleep_delay: 0
  error_delay: 0
engines: []
datasets: []
"#,
        work = dir.join("work").display(),
        store = dir.join("store").display(),
    ))
    .unwrap();

    let dataset = dir.join("tiny.db");
    fs::write(&dataset, "").unwrap();

    config.datasets.push(DatasetConfig {
        name: "tiny".to_owned(),
        file: Some(dataset),
        prepare: Vec::new(),
        queries: vec![
            QueryConfig {
                name: "q1".to_owned(),
                text: "select one".to_owned(),
                policy: MatchPolicy::Exact,
            },
            QueryConfig {
                name: "q2".to_owned(),
                text: "select two".to_owned(),
                policy: MatchPolicy::CountOnly,
            },
        ],
        directory: None,
    });

    config
}

/// engine running `script` with the dataset path as $1 and the query text as $2
fn engine(name: &str, script: &str) -> EngineConfig {
    EngineConfig::Command {
        name: name.to_owned(),
        exec: "sh".into(),
        params: vec!["-c".to_owned(), script.to_owned(), name.to_owned()],
    }
}

/// an engine echoing the query which fails on q2 while `marker` exists
fn flaky_engine(name: &str, marker: &Path) -> EngineConfig {
    engine(
        name,
        &format!(
            r#"if [ -e "{}" ] && [ "$2" = "select two" ]; then echo broken; exit 1; fi; echo "$2""#,
            marker.display()
        ),
    )
}

/// profiler stand-in writing only the `-o` file, then running the command after `--`
fn fake_profiler(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("profiler.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();

    path
}

const RECORDING_PROFILER: &str = r#"while [ "$1" != "--" ]; do
    if [ "$1" = "-o" ]; then echo profile > "$2"; fi
    shift
done
shift
exec "$@""#;

fn job() -> BenchmarkJob {
    BenchmarkJob::new("org/engine", "main", "0123456789abcdef", "tiny")
}

fn measured_queries(config: &RunnerConfig, job: &BenchmarkJob) -> Vec<(String, String, Metric)> {
    let storage = Storage::load(&config.database).unwrap();
    let stored = storage.ledger().unwrap().job(job).unwrap().unwrap();

    storage
        .open_results(&stored.results)
        .unwrap()
        .measurements()
        .unwrap()
        .into_iter()
        .map(|measurement| (measurement.runner, measurement.query, measurement.metric))
        .collect()
}

#[test]
fn mismatch_keeps_earlier_queries_and_leaves_job_pending() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), "runner-a");
    config.engines = vec![
        engine("reference", r#"echo "$2""#),
        engine(
            "candidate",
            r#"case "$2" in *two*) printf 'x\ny\n' ;; *) echo "$2" ;; esac"#,
        ),
    ];

    let system = System::load(&config).unwrap();
    system.ledger().submit(&job()).unwrap();

    let pending = system.ledger().job(&job()).unwrap().unwrap();
    assert!(matches!(
        system.run_benchmark(&pending),
        Err(JobError::VerificationMismatch(_))
    ));

    let stored = system.ledger().job(&job()).unwrap().unwrap();
    assert!(!stored.finished);
    assert!(stored.is_claimed());

    let measured = measured_queries(&config, &job());
    assert_eq!(measured.len(), 6);
    assert!(measured.iter().all(|(_, query, _)| query == "q1"));
    assert!(measured.iter().any(|(engine, _, _)| engine == "reference"));
    assert!(measured.iter().any(|(engine, _, _)| engine == "candidate"));
}

#[test]
fn resumed_job_measures_only_missing_queries() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("fail");
    fs::write(&marker, "").unwrap();

    let mut config = config(dir.path(), "runner-a");
    config.engines = vec![flaky_engine("reference", &marker)];

    let system = System::load(&config).unwrap();
    system.ledger().submit(&job()).unwrap();

    assert_eq!(system.poll_once(), Poll::Failed);
    let claimed = system.ledger().job(&job()).unwrap().unwrap();
    assert_eq!(measured_queries(&config, &job()).len(), 3);

    fs::remove_file(&marker).unwrap();
    assert_eq!(system.poll_once(), Poll::Worked(1));

    let finished = system.ledger().job(&job()).unwrap().unwrap();
    assert!(finished.finished);
    assert_eq!(finished.results, claimed.results);
    assert_eq!(finished.profiles, claimed.profiles);

    let measured = measured_queries(&config, &job());
    assert_eq!(measured.len(), 6);
    assert_eq!(
        measured
            .iter()
            .filter(|(_, query, metric)| query == "q2" && *metric == Metric::TotalTime)
            .count(),
        1
    );

    // nothing left to do
    assert_eq!(system.poll_once(), Poll::Idle);
}

#[test]
fn job_owned_by_another_runner_is_skipped() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("fail");
    fs::write(&marker, "").unwrap();

    let mut first = config(dir.path(), "runner-a");
    first.engines = vec![flaky_engine("reference", &marker)];
    let mut second = config(dir.path(), "runner-b");
    second.engines = vec![engine("reference", r#"echo "$2""#)];

    let a = System::load(&first).unwrap();
    a.ledger().submit(&job()).unwrap();
    assert_eq!(a.poll_once(), Poll::Failed);
    let claimed = a.ledger().job(&job()).unwrap().unwrap();

    let b = System::load(&second).unwrap();
    assert!(matches!(
        b.run_benchmark(&claimed),
        Err(JobError::OwnershipConflict { owner, identity, .. })
            if owner == "runner-a" && identity == "runner-b"
    ));
    assert_eq!(b.poll_once(), Poll::Idle);

    let after = b.ledger().job(&job()).unwrap().unwrap();
    assert_eq!(after, claimed);
    assert_eq!(measured_queries(&first, &job()).len(), 3);

    let storage = Storage::load(&first.database).unwrap();
    let owner = storage.open_results(&after.results).unwrap().owner().unwrap();
    assert_eq!(owner.as_deref(), Some("runner-a"));
}

#[test]
fn empty_ledger_is_idle_and_unknown_datasets_fail() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), "runner-a");
    config.engines = vec![engine("reference", r#"echo "$2""#)];

    let system = System::load(&config).unwrap();
    assert_eq!(system.poll_once(), Poll::Idle);

    let unknown = BenchmarkJob::new("org/engine", "main", "abc", "clickbench");
    system.ledger().submit(&unknown).unwrap();

    assert_eq!(system.poll_once(), Poll::Failed);
    assert!(!system.ledger().job(&unknown).unwrap().unwrap().is_claimed());
}

#[test]
fn profiles_are_uploaded_and_removed_from_disk() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), "runner-a");
    config.engines = vec![
        engine("reference", r#"echo "$2""#),
        engine("candidate", r#"echo "$2""#),
    ];
    config.benchmark.profiler = ProfilerConfig {
        enabled: true,
        exec: fake_profiler(dir.path(), RECORDING_PROFILER),
        prepare: Some(Vec::new()),
    };

    let system = System::load(&config).unwrap();
    system.ledger().submit(&job()).unwrap();
    assert_eq!(system.poll_once(), Poll::Worked(1));

    let stored = system.ledger().job(&job()).unwrap().unwrap();
    assert!(stored.finished);

    // the symbol side-file is never written, its absence doesn't fail the job
    let files = Storage::load(&config.database)
        .unwrap()
        .open_profiles(&stored.profiles)
        .unwrap()
        .filenames()
        .unwrap();
    assert_eq!(
        files
            .iter()
            .map(|(engine, query, _)| (engine.as_str(), query.as_str()))
            .collect::<Vec<_>>(),
        vec![
            ("candidate", "q1"),
            ("candidate", "q2"),
            ("reference", "q1"),
            ("reference", "q2"),
        ]
    );
    assert!(files
        .iter()
        .all(|(_, _, file)| file.starts_with("profile-") && file.ends_with(".json.gz")));

    let leftovers = fs::read_dir(dir.path().join("work").join("profiles"))
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn failing_profiler_prepare_is_a_prerequisite_failure() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), "runner-a");
    config.engines = vec![engine("reference", r#"echo "$2""#)];
    config.benchmark.profiler = ProfilerConfig {
        enabled: true,
        exec: fake_profiler(dir.path(), RECORDING_PROFILER),
        prepare: Some(vec![vec!["false".to_owned()]]),
    };

    let system = System::load(&config).unwrap();
    system.ledger().submit(&job()).unwrap();

    let pending = system.ledger().job(&job()).unwrap().unwrap();
    assert!(matches!(
        system.run_benchmark(&pending),
        Err(JobError::PrerequisiteFailure {
            source: BenchmarkError::ProfilerSetup(_),
            ..
        })
    ));
    assert!(!system.ledger().job(&job()).unwrap().unwrap().finished);
}

#[test]
fn failing_profiler_is_an_execution_failure() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), "runner-a");
    config.engines = vec![engine("reference", r#"echo "$2""#)];
    config.benchmark.profiler = ProfilerConfig {
        enabled: true,
        exec: fake_profiler(dir.path(), "exit 1"),
        prepare: Some(Vec::new()),
    };

    let system = System::load(&config).unwrap();
    system.ledger().submit(&job()).unwrap();

    let pending = system.ledger().job(&job()).unwrap().unwrap();
    assert!(matches!(
        system.run_benchmark(&pending),
        Err(JobError::ExecutionFailure {
            source: BenchmarkError::ProfileFailed(_),
            ..
        })
    ));
}
