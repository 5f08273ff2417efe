use super::{ConnectionError, Measurement, Metric, ProfileArtifact};
use rusqlite::{params, Connection, DropBehavior};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info};

/// Parameter holding the identity of the runner owning a results store
pub const OWNER_PARAMETER: &str = "runner";

/// Per job store of run parameters and measurements
#[derive(Debug)]
pub struct ResultStore {
    name: String,
    connection: Connection,
}

impl ResultStore {
    pub fn new(name: &str, connection: Connection) -> Self {
        Self {
            name: name.to_owned(),
            connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// create the schema and write the run parameters, keys that already exist are kept as is
    pub fn init_results(
        &self,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), ConnectionError> {
        for (counter, table) in RESULTS_SCHEMA.iter().enumerate() {
            if let Err(error) = self.connection.execute(table, []) {
                error!(
                    error = ?error,
                    store = %self.name,
                    "Failed to apply results schema ({}/{RESULTS_SCHEMA_NUMBER}): {error}",
                    counter + 1
                );

                return Err(error.into());
            }
        }

        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(DropBehavior::Rollback);
        {
            let mut statement = tx.prepare_cached(
                "insert into parameters (name, value) values (?, ?)
                 on conflict do nothing",
            )?;

            statement.execute(params![
                "time",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
            ])?;
            for (name, value) in parameters {
                statement.execute(params![name, value])?;
            }
        }
        tx.commit()?;

        info!(store = %self.name, parameters = ?parameters, "Initialized results store");

        Ok(())
    }

    pub fn parameters(&self) -> Result<BTreeMap<String, String>, ConnectionError> {
        let mut statement = self
            .connection
            .prepare_cached("select name, coalesce(value, '') from parameters")?;
        let parameters = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<String, String>, _>>()?;

        Ok(parameters)
    }

    /// identity of the runner which initialized this store
    pub fn owner(&self) -> Result<Option<String>, ConnectionError> {
        Ok(self.parameters()?.remove(OWNER_PARAMETER))
    }

    /// names of all queries of `dataset` that already have measurements
    pub fn written_query_names(&self, dataset: &str) -> Result<BTreeSet<String>, ConnectionError> {
        let mut statement = self
            .connection
            .prepare_cached("select distinct name from measurements where dataset = ?")?;
        let names = statement
            .query_map(params![dataset], |row| row.get(0))?
            .collect::<Result<BTreeSet<String>, _>>()?;

        Ok(names)
    }

    /// store all measurements of one query execution, either all of them become visible or none
    pub fn append_measurements(&self, measurements: &[Measurement]) -> Result<(), ConnectionError> {
        // NOTE: a conflicting key fails the insert and the drop behavior rolls back the batch
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(DropBehavior::Rollback);
        {
            let mut statement = tx.prepare_cached(
                "insert into measurements (runner, dataset, name, measurement, iterations, value)
                 values (?, ?, ?, ?, ?, ?)",
            )?;

            for measurement in measurements {
                statement.execute(params![
                    measurement.runner,
                    measurement.dataset,
                    measurement.query,
                    measurement.metric.as_str(),
                    measurement.iterations as i64,
                    measurement.value
                ])?;

                debug!(measurement = ?measurement, "Inserted measurement");
            }
        }
        tx.commit()?;

        info!(store = %self.name, "Stored {} measurements", measurements.len());

        Ok(())
    }

    /// every stored measurement, ordered by its key
    pub fn measurements(&self) -> Result<Vec<Measurement>, ConnectionError> {
        let mut statement = self.connection.prepare_cached(
            "select runner, dataset, name, measurement, iterations, value from measurements
             order by runner, dataset, name, measurement",
        )?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(runner, dataset, query, metric, iterations, value)| {
                let Some(metric) = Metric::from_name(&metric) else {
                    debug!(metric = %metric, "Skipping unknown metric");
                    return None;
                };

                Some(Measurement {
                    runner,
                    dataset,
                    query,
                    metric,
                    iterations: iterations as usize,
                    value,
                })
            })
            .collect())
    }
}

/// Per job store of profiler outputs
#[derive(Debug)]
pub struct ProfileStore {
    name: String,
    connection: Connection,
}

impl ProfileStore {
    pub fn new(name: &str, connection: Connection) -> Self {
        Self {
            name: name.to_owned(),
            connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_profiles(&self) -> Result<(), ConnectionError> {
        self.connection.execute(PROFILES_SCHEMA, [])?;

        info!(store = %self.name, "Initialized profiles store");

        Ok(())
    }

    pub fn append_profile(&self, artifact: &ProfileArtifact) -> Result<(), ConnectionError> {
        self.connection
            .prepare_cached(
                "insert into profiles (runner, dataset, name, filename, content)
                 values (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                artifact.runner,
                artifact.dataset,
                artifact.query,
                artifact.filename,
                artifact.content
            ])?;

        info!(
            store = %self.name,
            runner = %artifact.runner,
            query = %artifact.query,
            filename = %artifact.filename,
            "Uploaded profile ({} bytes)",
            artifact.content.len()
        );

        Ok(())
    }

    /// (runner, query, filename) of every stored profile
    pub fn filenames(&self) -> Result<Vec<(String, String, String)>, ConnectionError> {
        let mut statement = self.connection.prepare_cached(
            "select runner, name, filename from profiles
             order by runner, name, filename",
        )?;
        let files = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(files)
    }
}

pub const RESULTS_SCHEMA: [&str; 2] = [
    "create table if not exists parameters (
    name text primary key,
    value text
);",
    "create table if not exists measurements (
    runner text not null,
    dataset text not null,
    name text not null,
    measurement text not null,
    iterations real not null,
    value real not null,
    primary key (runner, dataset, name, measurement)
);",
];
pub const RESULTS_SCHEMA_NUMBER: usize = RESULTS_SCHEMA.len();

pub const PROFILES_SCHEMA: &str = "create table if not exists profiles (
    runner text not null,
    dataset text not null,
    name text not null,
    filename text not null,
    content blob,
    primary key (runner, dataset, name, filename)
);";
