//! Roster: the students attendance is taken for.

use crate::error::{Result, StoreError};
use crate::store::AttendanceStore;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub id: i64,
    pub name: String,
    pub roll_no: Option<String>,
    pub department: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewStudent {
    /// Must equal the enrolled identity name for recognition to mark them.
    pub name: String,
    pub roll_no: Option<String>,
    pub department: Option<String>,
}

impl NewStudent {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

const STUDENT_COLUMNS: &str = "id, name, roll_no, department, created_at";

fn decode_student(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        roll_no: row.get(2)?,
        department: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl AttendanceStore {
    pub fn add_student(&self, student: &NewStudent) -> Result<Student> {
        let name = student.name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("student name is empty".into()));
        }
        self.conn.execute(
            "INSERT INTO students (name, roll_no, department) VALUES (?1, ?2, ?3)",
            params![name, student.roll_no, student.department],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(student_id = id, name, roll_no = ?student.roll_no, "student added");
        self.student(id)
    }

    pub fn student(&self, id: i64) -> Result<Student> {
        self.conn
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                params![id],
                decode_student,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("student {id}")))
    }

    /// All students ordered by name, then id.
    pub fn list_students(&self) -> Result<Vec<Student>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY name, id"))?;
        let rows = stmt.query_map([], decode_student)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a student together with their attendance records.
    pub fn remove_student(&self, id: i64) -> Result<()> {
        let removed = self.conn.execute("DELETE FROM students WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!("student {id}")));
        }
        tracing::info!(student_id = id, "student removed");
        Ok(())
    }

    /// Student id for an identity name; duplicates resolve to the lowest id.
    pub fn find_student_by_name(&self, name: &str) -> Result<Option<i64>> {
        Ok(crate::reconcile::lookup_student(&self.conn, name)?)
    }
}
