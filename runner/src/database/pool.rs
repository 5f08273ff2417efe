use rusqlite::{Connection, OpenFlags};
use std::{path::PathBuf, time::Duration};

/// r2d2 manager handing out SQLite connections to one database file
#[derive(Debug)]
pub struct SqliteConnectionManager {
    path: PathBuf,
    flags: OpenFlags,
    busy_timeout: Duration,
}

impl SqliteConnectionManager {
    pub fn new(path: PathBuf, flags: OpenFlags, busy_timeout: Duration) -> Self {
        Self {
            path,
            flags,
            busy_timeout,
        }
    }
}

impl r2d2::ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let connection = Connection::open_with_flags(&self.path, self.flags)?;
        connection.busy_timeout(self.busy_timeout)?;

        Ok(connection)
    }

    fn is_valid(&self, connection: &mut Connection) -> Result<(), rusqlite::Error> {
        connection.query_row("select 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _connection: &mut Connection) -> bool {
        false
    }
}
