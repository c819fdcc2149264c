/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::sql_types::{BigInt, Binary, Bool, Text};
use diesel::sqlite::Sqlite;

use super::batch::{BatchComposer, Param, Statement};
use super::dialect::{Dialect, SqliteDialect};
use crate::config::{BackendKind, StoreConfig};
use crate::error::{Result, StoreError};

#[cfg(feature = "postgres")]
use super::dialect::PostgresDialect;

pub enum Backend {
    Sqlite(Pool<ConnectionManager<SqliteConnection>>),
    #[cfg(feature = "postgres")]
    Postgres(Pool<ConnectionManager<PgConnection>>),
}

/// Run `$body` with `$conn` bound to a pooled connection of whichever
/// backend the database was opened with. The body is compiled once per
/// enabled backend, so it must only use DSL both support.
macro_rules! with_conn {
    ($db:expr, |$conn:ident| $body:expr) => {
        match $db.backend() {
            $crate::storage::conn::Backend::Sqlite(pool) => {
                let mut pooled = pool.get()?;
                let $conn = &mut *pooled;
                $body
            }
            #[cfg(feature = "postgres")]
            $crate::storage::conn::Backend::Postgres(pool) => {
                let mut pooled = pool.get()?;
                let $conn = &mut *pooled;
                $body
            }
        }
    };
}
pub(crate) use with_conn;

#[derive(Debug)]
struct SqlitePragmas {
    foreign_keys: bool,
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        let foreign_keys = if self.foreign_keys { "ON" } else { "OFF" };
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = {}; PRAGMA busy_timeout = {};",
            foreign_keys, self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub struct Database {
    backend: Backend,
    dialect: Box<dyn Dialect>,
    array_binding: bool,
}

impl Database {
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        let database = &config.database;
        let (backend, dialect): (Backend, Box<dyn Dialect>) = match database.backend {
            BackendKind::Sqlite => {
                let manager = ConnectionManager::<SqliteConnection>::new(&database.url);
                let pool = Pool::builder()
                    .max_size(database.max_connections)
                    .connection_customizer(Box::new(SqlitePragmas {
                        foreign_keys: database.foreign_keys,
                        busy_timeout_ms: database.busy_timeout_ms,
                    }))
                    .build(manager)?;
                (Backend::Sqlite(pool), Box::new(SqliteDialect))
            }
            #[cfg(feature = "postgres")]
            BackendKind::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(&database.url);
                let pool = Pool::builder()
                    .max_size(database.max_connections)
                    .build(manager)?;
                (Backend::Postgres(pool), Box::new(PostgresDialect))
            }
            #[cfg(not(feature = "postgres"))]
            BackendKind::Postgres => return Err(StoreError::UnsupportedBackend("postgres")),
        };

        log::debug!("Opened {} database", dialect.name());
        Ok(Database {
            backend,
            dialect,
            array_binding: config.array_binding,
        })
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub(crate) fn composer(&self) -> BatchComposer<'_> {
        BatchComposer::new(self.dialect.as_ref(), self.array_binding)
    }
}

/// Execution of composed statements, one typed bind per parameter.
pub(crate) trait ExecuteStatement {
    fn run_statement(&mut self, statement: &Statement) -> QueryResult<usize>;

    fn run_statements(&mut self, statements: &[Statement]) -> QueryResult<usize> {
        let mut affected = 0;
        for statement in statements {
            affected += self.run_statement(statement)?;
        }
        Ok(affected)
    }
}

impl ExecuteStatement for SqliteConnection {
    fn run_statement(&mut self, statement: &Statement) -> QueryResult<usize> {
        let mut query = diesel::sql_query(statement.sql.as_str()).into_boxed::<Sqlite>();
        for param in &statement.params {
            query = match param {
                Param::Text(value) => query.bind::<Text, _>(value.clone()),
                Param::Blob(value) => query.bind::<Binary, _>(value.clone()),
                Param::BigInt(value) => query.bind::<BigInt, _>(*value),
                Param::Bool(value) => query.bind::<Bool, _>(*value),
                Param::BlobArray(_) => {
                    return Err(diesel::result::Error::QueryBuilderError(
                        "sqlite cannot bind array parameters".into(),
                    ))
                }
            };
        }
        query.execute(self)
    }
}

#[cfg(feature = "postgres")]
impl ExecuteStatement for PgConnection {
    fn run_statement(&mut self, statement: &Statement) -> QueryResult<usize> {
        use diesel::pg::Pg;
        use diesel::sql_types::Array;

        let mut query = diesel::sql_query(statement.sql.as_str()).into_boxed::<Pg>();
        for param in &statement.params {
            query = match param {
                Param::Text(value) => query.bind::<Text, _>(value.clone()),
                Param::Blob(value) => query.bind::<Binary, _>(value.clone()),
                Param::BigInt(value) => query.bind::<BigInt, _>(*value),
                Param::Bool(value) => query.bind::<Bool, _>(*value),
                Param::BlobArray(values) => query.bind::<Array<Binary>, _>(values.clone()),
            };
        }
        query.execute(self)
    }
}

/// Transactions that read before they write. On sqlite the write lock is
/// taken at `BEGIN` so that concurrent writers wait out the busy timeout
/// instead of failing on a lock upgrade.
pub(crate) trait WriteTransaction: Sized {
    fn write_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>;
}

impl WriteTransaction for SqliteConnection {
    fn write_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.immediate_transaction::<_, StoreError, _>(f)
    }
}

#[cfg(feature = "postgres")]
impl WriteTransaction for PgConnection {
    fn write_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.transaction::<_, StoreError, _>(f)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::config::DatabaseConfig;
    use diesel::r2d2::PooledConnection;
    use tempfile::TempDir;

    /// A file backed sqlite database, so that every pooled connection sees
    /// the same data. Keep the directory alive as long as the database.
    pub fn sqlite_database(foreign_keys: bool) -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("cannot create temporary directory");
        let path = dir.path().join("store.db");
        let config = StoreConfig {
            database: DatabaseConfig {
                foreign_keys,
                ..DatabaseConfig::sqlite(path.to_string_lossy())
            },
            ..Default::default()
        };
        let database = Database::connect(&config).expect("cannot open database");
        (dir, database)
    }

    pub fn sqlite_conn(database: &Database) -> PooledConnection<ConnectionManager<SqliteConnection>> {
        match database.backend() {
            Backend::Sqlite(pool) => pool.get().expect("cannot get a connection"),
            #[cfg(feature = "postgres")]
            _ => panic!("not a sqlite database"),
        }
    }
}
