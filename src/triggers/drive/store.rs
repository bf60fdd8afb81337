use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::database::{Database, DbConn};
use crate::error::AutoscanError;
use crate::migrate::Migrator;
use crate::triggers::drive::diff::{DriveFile, DriveFolder};

/// The applied half of one sync: rows to upsert and rows to drop, committed
/// together with the new page token.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub folders: Vec<DriveFolder>,
    pub files: Vec<DriveFile>,
    pub removed_folder_ids: Vec<String>,
    pub removed_file_ids: Vec<String>,
}

pub struct Descendants {
    pub folders: HashMap<String, DriveFolder>,
    pub files: HashMap<String, DriveFile>,
}

/// Local relational mirror of one or more shared drives. Always sqlite; the
/// mirror lives next to the scan database but keeps its own schema.
pub struct MirrorStore {
    db: Database,
}

impl MirrorStore {
    pub fn open(path: &Path) -> Result<Self, AutoscanError> {
        Self::init(Database::open_sqlite(path)?)
    }

    pub fn open_memory() -> Result<Self, AutoscanError> {
        Self::init(Database::open_sqlite_memory()?)
    }

    fn init(db: Database) -> Result<Self, AutoscanError> {
        let migrator = Migrator::new_in(&db, "mirror")?;
        migrator.migrate(&db, "mirror")?;
        Ok(Self { db })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, AutoscanError>,
    ) -> Result<T, AutoscanError> {
        match &mut *self.db.conn() {
            DbConn::Sqlite(conn) => f(conn),
            DbConn::Postgres(_) => unreachable!("mirror store is sqlite"),
        }
    }

    /// The change-feed position for a drive. `None` means the drive has
    /// never completed a full sync.
    pub fn page_token(&self, drive_id: &str) -> Result<Option<String>, AutoscanError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT page_token FROM drive WHERE id = ?1",
                    [drive_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_file(&self, drive_id: &str, id: &str) -> Result<Option<DriveFile>, AutoscanError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, parent, trashed, size, md5 FROM file \
                     WHERE drive = ?1 AND id = ?2",
                    [drive_id, id],
                    |row| {
                        Ok(DriveFile {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            parent: row.get(2)?,
                            trashed: row.get(3)?,
                            size: row.get(4)?,
                            md5: row.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn get_folder(
        &self,
        drive_id: &str,
        id: &str,
    ) -> Result<Option<DriveFolder>, AutoscanError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, parent, trashed FROM folder \
                     WHERE drive = ?1 AND id = ?2",
                    [drive_id, id],
                    |row| {
                        Ok(DriveFolder {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            parent: row.get(2)?,
                            trashed: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Every folder and file beneath one folder, via a recursive walk of the
    /// parent edges. Asking for the drive root returns nothing: changed
    /// drives never expand to their full contents.
    pub fn folder_descendants(
        &self,
        drive_id: &str,
        folder_id: &str,
    ) -> Result<Descendants, AutoscanError> {
        let mut descendants = Descendants {
            folders: HashMap::new(),
            files: HashMap::new(),
        };

        if drive_id == folder_id {
            return Ok(descendants);
        }

        const SQL: &str = "\
WITH RECURSIVE cte_folders AS (
    SELECT f.id, f.drive, f.name, f.trashed, f.parent
    FROM folder f
    WHERE f.drive = ?1 AND f.id = ?2
    UNION
    SELECT f.id, f.drive, f.name, f.trashed, f.parent
    FROM folder f
    JOIN cte_folders cte ON f.drive = cte.drive AND f.parent = cte.id
)
SELECT 'folder' AS kind, id, name, trashed, parent, 0 AS size, '' AS md5
FROM cte_folders
UNION ALL
SELECT 'file' AS kind, f.id, f.name, f.trashed, f.parent, f.size, f.md5
FROM file f
JOIN cte_folders cte ON f.drive = cte.drive AND f.parent = cte.id";

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(SQL)?;
            let rows = stmt.query_map([drive_id, folder_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            for row in rows {
                let (kind, id, name, trashed, parent, size, md5) = row?;
                match kind.as_str() {
                    "folder" => {
                        descendants.folders.insert(
                            id.clone(),
                            DriveFolder {
                                id,
                                name,
                                parent,
                                trashed,
                            },
                        );
                    }
                    _ => {
                        descendants.files.insert(
                            id.clone(),
                            DriveFile {
                                id,
                                name,
                                parent,
                                trashed,
                                size,
                                md5,
                            },
                        );
                    }
                }
            }

            Ok(())
        })?;

        Ok(descendants)
    }

    /// Applies one partial sync atomically together with the new page token.
    pub fn apply_changes(
        &self,
        drive_id: &str,
        changes: &ChangeSet,
        page_token: &str,
    ) -> Result<(), AutoscanError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            for folder in &changes.folders {
                tx.execute(
                    "INSERT OR REPLACE INTO folder (id, drive, name, trashed, parent) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![folder.id, drive_id, folder.name, folder.trashed, folder.parent],
                )?;
            }

            for file in &changes.files {
                tx.execute(
                    "INSERT OR REPLACE INTO file (id, drive, name, size, md5, trashed, parent) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        file.id,
                        drive_id,
                        file.name,
                        file.size,
                        file.md5,
                        file.trashed,
                        file.parent
                    ],
                )?;
            }

            for id in &changes.removed_folder_ids {
                tx.execute(
                    "DELETE FROM folder WHERE drive = ?1 AND id = ?2",
                    [drive_id, id],
                )?;
            }

            for id in &changes.removed_file_ids {
                tx.execute(
                    "DELETE FROM file WHERE drive = ?1 AND id = ?2",
                    [drive_id, id],
                )?;
            }

            tx.execute(
                "UPDATE drive SET page_token = ?2 WHERE id = ?1",
                [drive_id, page_token],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    /// Replaces a drive's entire mirrored tree, used by full syncs.
    pub fn replace_drive(
        &self,
        drive_id: &str,
        folders: &[DriveFolder],
        files: &[DriveFile],
        page_token: &str,
    ) -> Result<(), AutoscanError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute("DELETE FROM file WHERE drive = ?1", [drive_id])?;
            tx.execute("DELETE FROM folder WHERE drive = ?1", [drive_id])?;
            tx.execute(
                "INSERT OR REPLACE INTO drive (id, page_token) VALUES (?1, ?2)",
                [drive_id, page_token],
            )?;

            for folder in folders {
                tx.execute(
                    "INSERT OR REPLACE INTO folder (id, drive, name, trashed, parent) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![folder.id, drive_id, folder.name, folder.trashed, folder.parent],
                )?;
            }

            for file in files {
                tx.execute(
                    "INSERT OR REPLACE INTO file (id, drive, name, size, md5, trashed, parent) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        file.id,
                        drive_id,
                        file.name,
                        file.size,
                        file.md5,
                        file.trashed,
                        file.parent
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn seed(
        &self,
        drive_id: &str,
        folders: &[DriveFolder],
        files: &[DriveFile],
    ) -> Result<(), AutoscanError> {
        self.replace_drive(drive_id, folders, files, "seed-token")
    }
}
