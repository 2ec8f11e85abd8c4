//! Read-side queries over sessions and attendance.

use crate::error::{Result, StoreError};
use crate::store::AttendanceStore;
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: i64,
    pub subject_id: i64,
    pub teacher_id: i64,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub created_at: String,
}

/// A session with its present/absent tallies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub present: u32,
    pub absent: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub student_id: i64,
    pub name: String,
    pub roll_no: Option<String>,
    pub status: String,
    pub confidence: Option<f64>,
    pub marked_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentReport {
    pub student_id: i64,
    pub name: String,
    pub roll_no: Option<String>,
    pub department: Option<String>,
    pub present: u32,
    pub absent: u32,
    pub total: u32,
    /// `present / total * 100`, two decimals; 0 with no sessions.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total_students: u32,
    pub sessions_on_date: u32,
    pub present_on_date: u32,
}

const SESSION_COLUMNS: &str = "se.id, se.subject_id, se.teacher_id, se.date, se.start_time, se.end_time, se.created_at";

fn decode_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        teacher_id: row.get(2)?,
        date: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn percentage(present: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(present) / f64::from(total) * 10_000.0).round() / 100.0
}

impl AttendanceStore {
    pub fn session(&self, id: i64) -> Result<Session> {
        self.conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions se WHERE se.id = ?1"),
                params![id],
                decode_session,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// Attendance records of one session, ordered by student name.
    pub fn session_attendance(&self, session_id: i64) -> Result<Vec<AttendanceEntry>> {
        self.session(session_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.roll_no, a.status, a.confidence, a.marked_at
             FROM attendance a JOIN students s ON s.id = a.student_id
             WHERE a.session_id = ?1
             ORDER BY s.name, s.id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(AttendanceEntry {
                student_id: row.get(0)?,
                name: row.get(1)?,
                roll_no: row.get(2)?,
                status: row.get(3)?,
                confidence: row.get(4)?,
                marked_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Sessions, newest first, with present/absent counts.
    pub fn list_sessions(&self, limit: Option<u32>) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS},
                    COALESCE(SUM(a.status = 'present'), 0),
                    COALESCE(SUM(a.status = 'absent'), 0)
             FROM sessions se LEFT JOIN attendance a ON a.session_id = se.id
             GROUP BY se.id
             ORDER BY se.id DESC
             LIMIT ?1"
        ))?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, i64::from);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(SessionSummary {
                session: decode_session(row)?,
                present: row.get(7)?,
                absent: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Per-student attendance totals across all sessions.
    pub fn attendance_report(&self) -> Result<Vec<StudentReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.roll_no, s.department,
                    COALESCE(SUM(a.status = 'present'), 0),
                    COALESCE(SUM(a.status = 'absent'), 0),
                    COUNT(a.id)
             FROM students s LEFT JOIN attendance a ON a.student_id = s.id
             GROUP BY s.id
             ORDER BY s.name, s.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let present: u32 = row.get(4)?;
            let total: u32 = row.get(6)?;
            Ok(StudentReport {
                student_id: row.get(0)?,
                name: row.get(1)?,
                roll_no: row.get(2)?,
                department: row.get(3)?,
                present,
                absent: row.get(5)?,
                total,
                percentage: percentage(present, total),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn dashboard_stats(&self, date: NaiveDate) -> Result<DashboardStats> {
        let date = date.format("%Y-%m-%d").to_string();
        Ok(self.conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM students),
                (SELECT COUNT(*) FROM sessions WHERE date = ?1),
                (SELECT COUNT(DISTINCT a.student_id)
                   FROM attendance a JOIN sessions se ON se.id = a.session_id
                  WHERE se.date = ?1 AND a.status = 'present')",
            params![date],
            |row| {
                Ok(DashboardStats {
                    total_students: row.get(0)?,
                    sessions_on_date: row.get(1)?,
                    present_on_date: row.get(2)?,
                })
            },
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::SessionRequest;
    use crate::roster::NewStudent;
    use rollcall_core::{BoundingBox, RecognitionResult};

    fn seen(name: &str) -> RecognitionResult {
        RecognitionResult {
            name: name.into(),
            confidence: 0.8,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            landmarks: vec![],
        }
    }

    fn on(day: u32, hour: u32) -> SessionRequest {
        SessionRequest {
            subject_id: 1,
            teacher_id: 1,
            started_at: NaiveDate::from_ymd_opt(2024, 3, day)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
        }
    }

    fn seeded() -> AttendanceStore {
        let mut store = AttendanceStore::open_in_memory().unwrap();
        store.add_student(&NewStudent::named("bob")).unwrap();
        store.add_student(&NewStudent::named("alice")).unwrap();
        store.add_student(&NewStudent::named("carol")).unwrap();
        store.reconcile(&on(1, 9), &[seen("alice"), seen("bob")]).unwrap();
        store.reconcile(&on(1, 11), &[seen("alice")]).unwrap();
        store.reconcile(&on(2, 9), &[seen("alice")]).unwrap();
        store
    }

    #[test]
    fn test_percentage_rounding() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(2, 3), 66.67);
        assert_eq!(percentage(3, 3), 100.0);
    }

    #[test]
    fn test_attendance_report() {
        let store = seeded();
        let report = store.attendance_report().unwrap();
        let alice = &report[0];
        assert_eq!(alice.name, "alice");
        assert_eq!((alice.present, alice.absent, alice.total), (3, 0, 3));
        assert_eq!(alice.percentage, 100.0);
        let bob = &report[1];
        assert_eq!((bob.present, bob.absent, bob.total), (1, 2, 3));
        assert_eq!(bob.percentage, 33.33);
        let carol = &report[2];
        assert_eq!(carol.present, 0);
    }

    #[test]
    fn test_report_student_without_sessions() {
        let store = AttendanceStore::open_in_memory().unwrap();
        store.add_student(&NewStudent::named("dave")).unwrap();
        let report = store.attendance_report().unwrap();
        assert_eq!(report[0].total, 0);
        assert_eq!(report[0].percentage, 0.0);
    }

    #[test]
    fn test_list_sessions_newest_first() {
        let store = seeded();
        let sessions = store.list_sessions(None).unwrap();
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[0].session.date, "2024-03-02");
        assert_eq!((sessions[0].present, sessions[0].absent), (1, 2));
        assert_eq!((sessions[2].present, sessions[2].absent), (2, 1));
        assert_eq!(store.list_sessions(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_session_attendance_and_not_found() {
        let store = seeded();
        let first = store.list_sessions(None).unwrap().pop().unwrap();
        let entries = store.session_attendance(first.session.id).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
        assert_eq!(entries[2].status, "absent");
        assert!(entries[2].confidence.is_none());
        assert_eq!(first.session.start_time, "09:00");
        assert_eq!(first.session.end_time, "10:00");

        assert!(matches!(store.session_attendance(999), Err(StoreError::NotFound(_))));
        assert!(matches!(store.session(999), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_dashboard_stats() {
        let store = seeded();
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            store.dashboard_stats(day1).unwrap(),
            DashboardStats {
                total_students: 3,
                sessions_on_date: 2,
                present_on_date: 2,
            }
        );
        let empty_day = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        assert_eq!(store.dashboard_stats(empty_day).unwrap().sessions_on_date, 0);
    }

    #[test]
    fn test_removing_student_cascades() {
        let store = seeded();
        let bob = store.find_student_by_name("bob").unwrap().unwrap();
        store.remove_student(bob).unwrap();
        let sessions = store.list_sessions(None).unwrap();
        assert!(sessions.iter().all(|s| s.present + s.absent == 2));
    }
}
