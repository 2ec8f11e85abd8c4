use crate::error::Result;
use crate::schema;
use rusqlite::Connection;
use std::path::Path;

/// SQLite-backed roster, session and attendance store.
///
/// Owns one connection; callers needing concurrency put the store behind a
/// single owner (the daemon's engine thread).
pub struct AttendanceStore {
    pub(crate) conn: Connection,
}

impl AttendanceStore {
    /// Open or create the database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(db = %path.display(), "attendance database opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }
}
