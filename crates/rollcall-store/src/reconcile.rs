//! Recognition results → one session plus a complete present/absent roster.

use crate::error::Result;
use crate::store::AttendanceStore;
use chrono::NaiveDateTime;
use rollcall_core::RecognitionResult;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Sessions are recorded as one hour long.
const SESSION_LENGTH_HOURS: i64 = 1;

/// Who taught what, and when the photo was taken.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub subject_id: i64,
    pub teacher_id: i64,
    pub started_at: NaiveDateTime,
}

impl SessionRequest {
    /// A session starting now, local time.
    pub fn now(subject_id: i64, teacher_id: i64) -> Self {
        Self {
            subject_id,
            teacher_id,
            started_at: chrono::Local::now().naive_local(),
        }
    }

    pub fn date(&self) -> String {
        self.started_at.format("%Y-%m-%d").to_string()
    }

    pub fn start_time(&self) -> String {
        self.started_at.format("%H:%M").to_string()
    }

    pub fn end_time(&self) -> String {
        (self.started_at + chrono::Duration::hours(SESSION_LENGTH_HOURS))
            .format("%H:%M")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub session_id: i64,
    /// Distinct roster members marked present.
    pub recognized_count: usize,
    pub total_faces_found: usize,
    /// Names marked present, in first-marked order.
    pub names_marked_present: Vec<String>,
}

impl AttendanceStore {
    /// Record a session and mark every roster member present or absent, all
    /// in one transaction.
    ///
    /// Matched names with no roster entry are dropped. A student matched by
    /// several faces gets one record carrying the last face's confidence.
    /// On any error the transaction is rolled back and no session remains.
    pub fn reconcile(
        &mut self,
        request: &SessionRequest,
        results: &[RecognitionResult],
    ) -> Result<ReconcileOutcome> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO sessions (subject_id, teacher_id, date, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.subject_id,
                request.teacher_id,
                request.date(),
                request.start_time(),
                request.end_time()
            ],
        )?;
        let session_id = tx.last_insert_rowid();

        let mut marked: Vec<(i64, String)> = Vec::new();
        for result in results {
            let Some(name) = result.identity() else {
                continue;
            };
            let Some(student_id) = lookup_student(&tx, name)? else {
                tracing::debug!(identity = name, session_id, "recognized identity not on roster; dropped");
                continue;
            };
            tx.execute(
                "INSERT INTO attendance (session_id, student_id, status, confidence)
                 VALUES (?1, ?2, 'present', ?3)
                 ON CONFLICT(session_id, student_id) DO UPDATE SET
                    status = 'present',
                    confidence = excluded.confidence,
                    marked_at = CURRENT_TIMESTAMP",
                params![session_id, student_id, f64::from(result.confidence)],
            )?;
            if !marked.iter().any(|(id, _)| *id == student_id) {
                marked.push((student_id, name.to_string()));
            }
        }

        let absent = tx.execute(
            "INSERT INTO attendance (session_id, student_id, status)
             SELECT ?1, id, 'absent' FROM students WHERE true
             ON CONFLICT(session_id, student_id) DO NOTHING",
            params![session_id],
        )?;

        tx.commit()?;

        let names_marked_present: Vec<String> = marked.into_iter().map(|(_, name)| name).collect();
        tracing::info!(
            session_id,
            subject_id = request.subject_id,
            teacher_id = request.teacher_id,
            faces = results.len(),
            present = names_marked_present.len(),
            absent,
            "attendance reconciled"
        );
        Ok(ReconcileOutcome {
            session_id,
            recognized_count: names_marked_present.len(),
            total_faces_found: results.len(),
            names_marked_present,
        })
    }
}

pub(crate) fn lookup_student(conn: &Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM students WHERE name = ?1 ORDER BY id LIMIT 1",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::roster::NewStudent;
    use chrono::NaiveDate;
    use rollcall_core::{BoundingBox, UNKNOWN};

    fn result(name: &str, confidence: f32) -> RecognitionResult {
        RecognitionResult {
            name: name.into(),
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            landmarks: vec![],
        }
    }

    fn request() -> SessionRequest {
        SessionRequest {
            subject_id: 3,
            teacher_id: 7,
            started_at: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(9, 15, 0)
                .unwrap(),
        }
    }

    fn store_with(names: &[&str]) -> AttendanceStore {
        let store = AttendanceStore::open_in_memory().unwrap();
        for name in names {
            store.add_student(&NewStudent::named(*name)).unwrap();
        }
        store
    }

    fn statuses(store: &AttendanceStore, session_id: i64) -> Vec<(String, String, Option<f64>)> {
        let mut stmt = store
            .conn
            .prepare(
                "SELECT s.name, a.status, a.confidence FROM attendance a
                 JOIN students s ON s.id = a.student_id
                 WHERE a.session_id = ?1 ORDER BY s.id",
            )
            .unwrap();
        stmt.query_map(params![session_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_session_times() {
        let r = request();
        assert_eq!(r.date(), "2024-03-01");
        assert_eq!(r.start_time(), "09:15");
        assert_eq!(r.end_time(), "10:15");

        let late = SessionRequest {
            started_at: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(23, 30, 0)
                .unwrap(),
            ..r
        };
        assert_eq!(late.end_time(), "00:30");
    }

    #[test]
    fn test_every_student_gets_exactly_one_record() {
        let mut store = store_with(&["alice", "bob", "carol"]);
        let out = store
            .reconcile(&request(), &[result("bob", 0.8), result(UNKNOWN, 0.0)])
            .unwrap();
        assert_eq!(out.recognized_count, 1);
        assert_eq!(out.total_faces_found, 2);
        assert_eq!(out.names_marked_present, vec!["bob"]);

        let rows = statuses(&store, out.session_id);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], ("alice".into(), "absent".into(), None));
        assert_eq!(rows[1].1, "present");
        assert_eq!(rows[2].1, "absent");
    }

    #[test]
    fn test_duplicate_faces_last_confidence_wins() {
        let mut store = store_with(&["alice", "bob"]);
        let out = store
            .reconcile(
                &request(),
                &[result("alice", 0.9), result("bob", 0.6), result("alice", 0.7)],
            )
            .unwrap();
        assert_eq!(out.names_marked_present, vec!["alice", "bob"]);
        assert_eq!(out.recognized_count, 2);

        let rows = statuses(&store, out.session_id);
        assert_eq!(rows.len(), 2);
        let alice_conf = rows[0].2.unwrap();
        assert!((alice_conf - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_names_not_on_roster_are_dropped() {
        let mut store = store_with(&["alice"]);
        let out = store.reconcile(&request(), &[result("mallory", 0.99)]).unwrap();
        assert_eq!(out.recognized_count, 0);
        assert_eq!(statuses(&store, out.session_id)[0].1, "absent");
    }

    #[test]
    fn test_zero_faces_marks_everyone_absent() {
        let mut store = store_with(&["alice", "bob"]);
        let out = store.reconcile(&request(), &[]).unwrap();
        assert_eq!(out.total_faces_found, 0);
        assert!(statuses(&store, out.session_id).iter().all(|r| r.1 == "absent"));
    }

    #[test]
    fn test_empty_roster_still_records_session() {
        let mut store = store_with(&[]);
        let out = store.reconcile(&request(), &[result("alice", 0.9)]).unwrap();
        let sessions: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(sessions, 1);
        assert!(statuses(&store, out.session_id).is_empty());
    }

    #[test]
    fn test_failure_rolls_back_session() {
        let mut store = store_with(&["alice", "bob"]);
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER refuse_absent BEFORE INSERT ON attendance
                 WHEN NEW.status = 'absent'
                 BEGIN SELECT RAISE(ABORT, 'absent refused'); END;",
            )
            .unwrap();

        let err = store.reconcile(&request(), &[result("alice", 0.9)]).unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));

        let (sessions, records): (i64, i64) = store
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM sessions), (SELECT COUNT(*) FROM attendance)",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((sessions, records), (0, 0));
    }
}
