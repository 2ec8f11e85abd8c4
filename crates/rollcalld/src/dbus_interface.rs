use crate::engine::{EngineError, EngineHandle};
use rollcall_core::PutMode;
use rollcall_store::SessionRequest;
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method returns a JSON document.
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    if e.is_not_ready() {
        return zbus::fdo::Error::NotSupported(e.to_string());
    }
    match e {
        EngineError::Pipeline(rollcall_core::pipeline::PipelineError::Io { .. })
        | EngineError::Enroll(rollcall_core::enroll::EnrollError::Io { .. }) => {
            zbus::fdo::Error::FileNotFound(e.to_string())
        }
        EngineError::Enroll(rollcall_core::enroll::EnrollError::NoFaces(_))
        | EngineError::Pipeline(rollcall_core::pipeline::PipelineError::Match(
            rollcall_core::matcher::MatchError::InvalidThreshold(_),
        )) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Recognize the faces in `photo` and record attendance for the session.
    /// A negative `threshold` selects the configured one.
    async fn recognize(
        &self,
        photo: &str,
        subject_id: i64,
        teacher_id: i64,
        threshold: f64,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(photo, subject_id, teacher_id, threshold, "recognize requested");
        let threshold = (threshold >= 0.0).then_some(threshold as f32);
        let run = self
            .engine
            .recognize(
                PathBuf::from(photo),
                SessionRequest::now(subject_id, teacher_id),
                threshold,
            )
            .await
            .map_err(to_fdo)?;
        to_json(&run)
    }

    /// Enroll `name` from image files, replacing or extending their vectors.
    async fn enroll(&self, name: &str, images: Vec<String>, append: bool) -> zbus::fdo::Result<String> {
        tracing::info!(name, images = images.len(), append, "enroll requested");
        let mode = if append { PutMode::Append } else { PutMode::Replace };
        let images = images.into_iter().map(PathBuf::from).collect();
        let summary = self
            .engine
            .enroll(name.to_string(), images, mode)
            .await
            .map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Enroll every identity subdirectory of `dir`.
    async fn enroll_dataset(&self, dir: &str) -> zbus::fdo::Result<String> {
        tracing::info!(dir, "enroll_dataset requested");
        let summaries = self
            .engine
            .enroll_dataset(PathBuf::from(dir))
            .await
            .map_err(to_fdo)?;
        to_json(&summaries)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.engine.list_identities().await.map_err(to_fdo)?;
        to_json(&identities)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}
