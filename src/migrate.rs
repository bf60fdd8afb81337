use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_embed::RustEmbed;

use crate::database::{Database, DbConn, DbKind};
use crate::error::AutoscanError;

/// SQL migrations embedded at compile time. Filenames follow
/// `<version><optional-name>.sql` and are applied in ascending version order.
#[derive(RustEmbed)]
#[folder = "migrations/"]
struct MigrationFiles;

static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)[_-]?(.*?)\.sql$").expect("migration filename regex"));

#[derive(Debug)]
struct Migration {
    version: i64,
    name: String,
    filename: String,
    schema: String,
}

/// Applies embedded schema migrations, tracking applied versions per
/// component in the `schema_migration` table. Each migration runs in its own
/// transaction together with its version bookkeeping row.
pub struct Migrator {
    dir: &'static str,
}

impl Migrator {
    pub fn new(db: &Database) -> Result<Self, AutoscanError> {
        let dir = match db.kind() {
            DbKind::Sqlite => "sqlite",
            DbKind::Postgres => "postgres",
        };

        Self::new_in(db, dir)
    }

    /// Migrator over a specific embedded directory, regardless of backend.
    /// Used by the drive mirror, whose schema is sqlite-only.
    pub fn new_in(db: &Database, dir: &'static str) -> Result<Self, AutoscanError> {
        verify(db)?;
        Ok(Self { dir })
    }

    pub fn migrate(&self, db: &Database, component: &str) -> Result<(), AutoscanError> {
        let migrations = self.parse()?;
        if migrations.is_empty() {
            return Ok(());
        }

        let applied = versions(db, component)?;

        for migration in &migrations {
            if applied.contains(&migration.version) {
                continue;
            }

            info!(
                "Applying migration {} for component {component}",
                migration.filename
            );
            exec(db, component, migration).map_err(|err| {
                AutoscanError::Fatal(format!("migrate {}: {err}", migration.filename))
            })?;
        }

        Ok(())
    }

    fn parse(&self) -> Result<Vec<Migration>, AutoscanError> {
        let prefix = format!("{}/", self.dir);
        let mut migrations = Vec::new();

        for path in MigrationFiles::iter() {
            let Some(filename) = path.strip_prefix(&prefix) else {
                continue;
            };

            let caps = FILENAME_RE.captures(filename).ok_or_else(|| {
                AutoscanError::Config(format!("unrecognized migration filename: {filename}"))
            })?;

            let version: i64 = caps[1]
                .parse()
                .map_err(|_| AutoscanError::Config(format!("bad migration version: {filename}")))?;

            let file = MigrationFiles::get(&path)
                .ok_or_else(|| AutoscanError::Config(format!("missing migration: {path}")))?;
            let schema = String::from_utf8(file.data.into_owned())
                .map_err(|_| AutoscanError::Config(format!("migration not utf-8: {path}")))?;

            migrations.push(Migration {
                version,
                name: caps.get(2).map(|m| m.as_str().to_owned()).unwrap_or_default(),
                filename: filename.to_owned(),
                schema,
            });
        }

        migrations.sort_by(|a, b| (a.version, &a.name).cmp(&(b.version, &b.name)));
        Ok(migrations)
    }
}

fn verify(db: &Database) -> Result<(), AutoscanError> {
    const SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migration (\
        component VARCHAR(255) NOT NULL, \
        version INTEGER NOT NULL, \
        PRIMARY KEY (component, version))";

    match &mut *db.conn() {
        DbConn::Sqlite(conn) => conn.execute_batch(SQL)?,
        DbConn::Postgres(client) => client.batch_execute(SQL)?,
    }

    Ok(())
}

fn versions(db: &Database, component: &str) -> Result<Vec<i64>, AutoscanError> {
    match &mut *db.conn() {
        DbConn::Sqlite(conn) => {
            let mut stmt =
                conn.prepare("SELECT version FROM schema_migration WHERE component = ?1")?;
            let rows = stmt.query_map([component], |row| row.get::<_, i64>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        }
        DbConn::Postgres(client) => {
            let rows = client.query(
                "SELECT version FROM schema_migration WHERE component = $1",
                &[&component],
            )?;
            Ok(rows.iter().map(|row| row.get::<_, i32>(0) as i64).collect())
        }
    }
}

fn exec(db: &Database, component: &str, migration: &Migration) -> Result<(), AutoscanError> {
    match &mut *db.conn() {
        DbConn::Sqlite(conn) => {
            let tx = conn.transaction()?;
            tx.execute_batch(&migration.schema)?;
            tx.execute(
                "INSERT INTO schema_migration (component, version) VALUES (?1, ?2)",
                rusqlite::params![component, migration.version],
            )?;
            tx.commit()?;
        }
        DbConn::Postgres(client) => {
            let mut tx = client.transaction()?;
            tx.batch_execute(&migration.schema)?;
            tx.execute(
                "INSERT INTO schema_migration (component, version) VALUES ($1, $2)",
                &[&component, &(migration.version as i32)],
            )?;
            tx.commit()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(db: &Database, table: &str) -> bool {
        match &mut *db.conn() {
            DbConn::Sqlite(conn) => {
                let count: i64 = conn
                    .query_row(
                        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [table],
                        |row| row.get(0),
                    )
                    .unwrap();
                count == 1
            }
            DbConn::Postgres(_) => unreachable!("tests run on sqlite"),
        }
    }

    #[test]
    fn migrate_creates_scan_table() {
        let db = Database::open_sqlite_memory().unwrap();
        let mg = Migrator::new(&db).unwrap();

        mg.migrate(&db, "processor").unwrap();

        assert!(table_exists(&db, "schema_migration"));
        assert!(table_exists(&db, "scan"));
    }

    #[test]
    fn migrate_is_idempotent() {
        let db = Database::open_sqlite_memory().unwrap();
        let mg = Migrator::new(&db).unwrap();

        mg.migrate(&db, "processor").unwrap();
        mg.migrate(&db, "processor").unwrap();

        let versions = versions(&db, "processor").unwrap();
        assert_eq!(versions, vec![1]);
    }

    #[test]
    fn components_track_versions_independently() {
        let db = Database::open_sqlite_memory().unwrap();
        let mg = Migrator::new(&db).unwrap();

        mg.migrate(&db, "processor").unwrap();
        assert!(versions(&db, "mirror").unwrap().is_empty());
    }

    #[test]
    fn mirror_migrations_create_drive_tables() {
        let db = Database::open_sqlite_memory().unwrap();
        let mg = Migrator::new_in(&db, "mirror").unwrap();

        mg.migrate(&db, "mirror").unwrap();

        assert!(table_exists(&db, "drive"));
        assert!(table_exists(&db, "folder"));
        assert!(table_exists(&db, "file"));
    }

    #[test]
    fn filenames_parse_version_and_name() {
        let caps = FILENAME_RE.captures("12_add_index.sql").unwrap();
        assert_eq!(&caps[1], "12");
        assert_eq!(&caps[2], "add_index");

        let caps = FILENAME_RE.captures("3.sql").unwrap();
        assert_eq!(&caps[1], "3");
    }
}
