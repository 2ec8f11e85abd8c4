//! Schema migrations, tracked through `PRAGMA user_version`.

use rusqlite::Connection;

/// Schema version written by the newest migration.
pub const SCHEMA_VERSION: u32 = 1;

const V1_INITIAL: &str = "
CREATE TABLE IF NOT EXISTS students (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    roll_no     TEXT UNIQUE,
    name        TEXT NOT NULL,
    department  TEXT,
    created_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_students_name ON students(name);

CREATE TABLE IF NOT EXISTS sessions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id  INTEGER NOT NULL,
    teacher_id  INTEGER NOT NULL,
    date        TEXT NOT NULL,
    start_time  TEXT NOT NULL,
    end_time    TEXT NOT NULL,
    created_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_sessions_date ON sessions(date);

CREATE TABLE IF NOT EXISTS attendance (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  INTEGER NOT NULL,
    student_id  INTEGER NOT NULL,
    status      TEXT NOT NULL DEFAULT 'absent' CHECK(status IN ('present', 'absent')),
    marked_at   TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    confidence  REAL,
    UNIQUE(session_id, student_id),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE,
    FOREIGN KEY (student_id) REFERENCES students(id) ON DELETE CASCADE
);
";

/// Bring `conn` up to [`SCHEMA_VERSION`]. Returns the version found before migrating.
pub fn migrate(conn: &Connection) -> rusqlite::Result<u32> {
    let version: u32 = conn.query_row("SELECT user_version FROM pragma_user_version", [], |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(V1_INITIAL)?;
        conn.pragma_update(None, "user_version", 1)?;
        tracing::info!(from = version, to = 1, "attendance schema migrated");
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&conn).unwrap(), 0);
        assert_eq!(migrate(&conn).unwrap(), SCHEMA_VERSION);
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('students', 'sessions', 'attendance')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_status_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("INSERT INTO students (name) VALUES ('alice')", []).unwrap();
        conn.execute(
            "INSERT INTO sessions (subject_id, teacher_id, date, start_time, end_time) VALUES (1, 1, '2024-03-01', '09:00', '10:00')",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO attendance (session_id, student_id, status) VALUES (1, 1, 'late')",
            [],
        );
        assert!(err.is_err());
    }
}
