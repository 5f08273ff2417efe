use super::{pool::SqliteConnectionManager, BenchmarkJob, ConnectionError};
use r2d2::{Pool, PooledConnection};
use rusqlite::{params, Row};
use tracing::{debug, info, warn};

/// Shared record of all benchmark jobs and their lifecycle, the only point of coordination
/// between workers
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: Pool<SqliteConnectionManager>,
}

const JOB_COLUMNS: &str = "repo, branch, revision, dataset,
    coalesce(results, ''), coalesce(profiles, ''), coalesce(finished, 0)";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<BenchmarkJob> {
    Ok(BenchmarkJob {
        repo: row.get(0)?,
        branch: row.get(1)?,
        revision: row.get(2)?,
        dataset: row.get(3)?,
        results: row.get(4)?,
        profiles: row.get(5)?,
        finished: row.get(6)?,
    })
}

impl Ledger {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }

    fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>, ConnectionError> {
        Ok(self.pool.get()?)
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        self.connection()?.execute(LEDGER_SCHEMA, [])?;

        info!("Initialized benchmark ledger");

        Ok(())
    }

    /// all jobs which are not finished yet, in submission order
    pub fn fetch_pending(&self) -> Result<Vec<BenchmarkJob>, ConnectionError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(&format!(
            "select {JOB_COLUMNS} from benchmarks
             where coalesce(finished, 0) = 0
             order by rowid"
        ))?;
        let jobs = statement
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = jobs.len(), "Fetched pending benchmarks");

        Ok(jobs)
    }

    /// every job regardless of its state
    pub fn jobs(&self) -> Result<Vec<BenchmarkJob>, ConnectionError> {
        let connection = self.connection()?;
        let mut statement = connection
            .prepare_cached(&format!("select {JOB_COLUMNS} from benchmarks order by rowid"))?;
        let jobs = statement
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(jobs)
    }

    /// current ledger state of a job, looked up by its natural key
    pub fn job(&self, job: &BenchmarkJob) -> Result<Option<BenchmarkJob>, ConnectionError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare_cached(&format!(
            "select {JOB_COLUMNS} from benchmarks
             where repo = ? and branch = ? and revision = ? and dataset = ?"
        ))?;
        let mut rows = statement.query_map(
            params![job.repo, job.branch, job.revision, job.dataset],
            job_from_row,
        )?;

        let job = rows.next().transpose()?;

        Ok(job)
    }

    /// enqueue a new job, returns false if the job already exists
    pub fn submit(&self, job: &BenchmarkJob) -> Result<bool, ConnectionError> {
        let inserted = self.connection()?.execute(
            "insert into benchmarks (repo, branch, revision, dataset, results, profiles, finished)
             values (?, ?, ?, ?, null, null, 0)
             on conflict do nothing",
            params![job.repo, job.branch, job.revision, job.dataset],
        )?;

        if inserted == 1 {
            info!(job = %job, "Submitted benchmark");
        } else {
            info!(job = %job, "Benchmark was already submitted");
        }

        Ok(inserted == 1)
    }

    /// record the store handles of a job which has none yet
    ///
    /// The update is conditional on the row still being unclaimed, so of two workers racing for
    /// the same job only one sees `true`.
    pub fn claim(
        &self,
        job: &BenchmarkJob,
        results: &str,
        profiles: &str,
    ) -> Result<bool, ConnectionError> {
        let updated = self.connection()?.execute(
            "update benchmarks set results = ?, profiles = ?
             where repo = ? and branch = ? and revision = ? and dataset = ?
               and coalesce(results, '') = '' and coalesce(profiles, '') = ''",
            params![
                results,
                profiles,
                job.repo,
                job.branch,
                job.revision,
                job.dataset
            ],
        )?;

        if updated == 1 {
            info!(job = %job, results = results, profiles = profiles, "Claimed benchmark");
        } else {
            warn!(job = %job, "Benchmark was claimed by another runner first");
        }

        Ok(updated == 1)
    }

    /// mark a job as finished, finishing it again is a no-op
    pub fn finish(&self, job: &BenchmarkJob) -> Result<(), ConnectionError> {
        let updated = self.connection()?.execute(
            "update benchmarks set finished = 1
             where repo = ? and branch = ? and revision = ? and dataset = ?
               and coalesce(finished, 0) = 0",
            params![job.repo, job.branch, job.revision, job.dataset],
        )?;

        if updated == 1 {
            info!(job = %job, "Finished benchmark");
        } else {
            debug!(job = %job, "Benchmark was already finished");
        }

        Ok(())
    }
}

pub const LEDGER_SCHEMA: &str = "create table if not exists benchmarks (
    repo text not null,
    branch text not null,
    revision text not null,
    dataset text not null,
    results text,
    profiles text,
    finished bool not null default 0,
    primary key (repo, branch, revision, dataset)
);";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DatabaseConfig, database::Storage};
    use tempfile::TempDir;

    fn ledger() -> (TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::load(&DatabaseConfig {
            path: dir.path().to_path_buf(),
            ..DatabaseConfig::default()
        })
        .unwrap();
        let ledger = storage.ledger().unwrap();

        (dir, ledger)
    }

    #[test]
    fn submitted_jobs_are_pending() {
        let (_dir, ledger) = ledger();
        let first = BenchmarkJob::new("org/engine", "main", "aaaa", "tpc-h");
        let second = BenchmarkJob::new("org/engine", "main", "bbbb", "tpc-h");

        assert!(ledger.submit(&first).unwrap());
        assert!(ledger.submit(&second).unwrap());
        assert!(!ledger.submit(&first).unwrap());

        assert_eq!(ledger.fetch_pending().unwrap(), vec![first, second]);
    }

    #[test]
    fn only_one_claim_wins() {
        let (_dir, ledger) = ledger();
        let job = BenchmarkJob::new("org/engine", "main", "aaaa", "tpc-h");
        ledger.submit(&job).unwrap();

        assert!(ledger.claim(&job, "benchmark-a", "profiles-a").unwrap());
        assert!(!ledger.claim(&job, "benchmark-b", "profiles-b").unwrap());

        let stored = ledger.job(&job).unwrap().unwrap();
        assert_eq!(stored.results, "benchmark-a");
        assert_eq!(stored.profiles, "profiles-a");
        assert!(!stored.finished);
    }

    #[test]
    fn finish_is_idempotent() {
        let (_dir, ledger) = ledger();
        let job = BenchmarkJob::new("org/engine", "main", "aaaa", "tpc-h");
        ledger.submit(&job).unwrap();

        ledger.finish(&job).unwrap();
        let after_first = ledger.jobs().unwrap();
        ledger.finish(&job).unwrap();

        assert_eq!(ledger.jobs().unwrap(), after_first);
        assert!(after_first[0].finished);
        assert!(ledger.fetch_pending().unwrap().is_empty());
    }

    #[test]
    fn omitted_finished_defaults_to_pending() {
        let (_dir, ledger) = ledger();
        ledger
            .connection()
            .unwrap()
            .execute(
                "insert into benchmarks (repo, branch, revision, dataset, results, profiles)
                 values ('org/engine', 'main', 'cccc', 'tpc-h', null, null)",
                [],
            )
            .unwrap();

        let pending = ledger.fetch_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].is_claimed());
    }
}
