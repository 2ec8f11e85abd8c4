//! rollcall-store: Roster, sessions and attendance in SQLite.
//!
//! The reconciler turns one photo's recognition results into a session row
//! plus exactly one present/absent record per roster member, atomically.

pub mod error;
pub mod reconcile;
pub mod report;
pub mod roster;
pub mod schema;
mod store;

pub use error::StoreError;
pub use reconcile::{ReconcileOutcome, SessionRequest};
pub use report::{AttendanceEntry, DashboardStats, Session, SessionSummary, StudentReport};
pub use roster::{NewStudent, Student};
pub use store::AttendanceStore;
