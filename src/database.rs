use log::info;
use postgres::NoTls;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::AutoscanError;

/// Which relational backend the datastore runs on. Dialect-dependent SQL
/// (placeholder style, `MAX` vs `GREATEST`) is selected on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub(crate) enum DbConn {
    Sqlite(Connection),
    Postgres(postgres::Client),
}

/// A handle to the scan datastore's backing database.
///
/// Access is serialized through a single connection; every multi-row
/// operation runs inside a transaction taken on that connection.
pub struct Database {
    kind: DbKind,
    conn: Mutex<DbConn>,
}

impl Database {
    pub fn open_sqlite(path: &Path) -> Result<Self, AutoscanError> {
        info!("Opening database: {}", path.display());
        let conn = Connection::open(path)?;
        configure_sqlite(&conn)?;

        Ok(Self {
            kind: DbKind::Sqlite,
            conn: Mutex::new(DbConn::Sqlite(conn)),
        })
    }

    /// In-memory sqlite database, used by tests.
    pub fn open_sqlite_memory() -> Result<Self, AutoscanError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            kind: DbKind::Sqlite,
            conn: Mutex::new(DbConn::Sqlite(conn)),
        })
    }

    pub fn open_postgres(
        host: &str,
        port: u16,
        name: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, AutoscanError> {
        info!("Opening database: postgres://{username}@{host}:{port}/{name}");
        let client = postgres::Config::new()
            .host(host)
            .port(port)
            .dbname(name)
            .user(username)
            .password(password)
            .connect(NoTls)?;

        Ok(Self {
            kind: DbKind::Postgres,
            conn: Mutex::new(DbConn::Postgres(client)),
        })
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, DbConn> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Reports the backend's server version, logged once at startup.
    pub fn server_version(&self) -> Result<String, AutoscanError> {
        match &mut *self.conn() {
            DbConn::Sqlite(conn) => {
                let version: String =
                    conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
                Ok(format!("sqlite {version}"))
            }
            DbConn::Postgres(client) => {
                let row = client.query_one("SHOW server_version", &[])?;
                let version: String = row.get(0);
                Ok(format!("postgres {version}"))
            }
        }
    }
}

fn configure_sqlite(conn: &Connection) -> Result<(), AutoscanError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_sqlite_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("autoscan.db");

        let db = Database::open_sqlite(&path).unwrap();
        assert_eq!(db.kind(), DbKind::Sqlite);
        assert!(path.exists());
    }

    #[test]
    fn server_version_reports_backend() {
        let db = Database::open_sqlite_memory().unwrap();
        let version = db.server_version().unwrap();
        assert!(version.starts_with("sqlite "));
    }
}
