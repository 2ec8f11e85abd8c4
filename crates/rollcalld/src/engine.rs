use rollcall_core::enroll::{self, EnrollError, EnrollSummary};
use rollcall_core::index::IdentitySummary;
use rollcall_core::pipeline::PipelineError;
use rollcall_core::timeline::{self, TimelineEntry};
use rollcall_core::{Config, EmbeddingIndex, GalleryCache, IndexError, PutMode, Recognition, RecognitionPipeline};
use rollcall_store::{AttendanceStore, ReconcileOutcome, SessionRequest, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine io: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// True when the encoder (or its models) is unavailable rather than the
    /// request being bad.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            EngineError::Pipeline(PipelineError::NotReady(_)) | EngineError::Enroll(EnrollError::NotReady(_))
        )
    }
}

/// A recognized photo and the attendance it produced.
#[derive(Debug, Serialize)]
pub struct AttendanceRun {
    #[serde(flatten)]
    pub recognition: Recognition,
    pub attendance: ReconcileOutcome,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub identities: usize,
    pub gallery_rows: usize,
    pub embedding_dim: usize,
    pub students: usize,
    pub recognition_threshold: f32,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        photo: PathBuf,
        session: SessionRequest,
        threshold: Option<f32>,
        reply: oneshot::Sender<Result<AttendanceRun, EngineError>>,
    },
    Enroll {
        name: String,
        images: Vec<PathBuf>,
        mode: PutMode,
        reply: oneshot::Sender<Result<EnrollSummary, EngineError>>,
    },
    EnrollDataset {
        dir: PathBuf,
        reply: oneshot::Sender<Result<Vec<EnrollSummary>, EngineError>>,
    },
    ListIdentities {
        reply: oneshot::Sender<Result<Vec<IdentitySummary>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Recognize a class photo and record attendance for the session.
    /// `threshold: None` uses the configured recognition threshold.
    pub async fn recognize(
        &self,
        photo: PathBuf,
        session: SessionRequest,
        threshold: Option<f32>,
    ) -> Result<AttendanceRun, EngineError> {
        self.call(|reply| EngineRequest::Recognize {
            photo,
            session,
            threshold,
            reply,
        })
        .await
    }

    pub async fn enroll(&self, name: String, images: Vec<PathBuf>, mode: PutMode) -> Result<EnrollSummary, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            name,
            images,
            mode,
            reply,
        })
        .await
    }

    pub async fn enroll_dataset(&self, dir: PathBuf) -> Result<Vec<EnrollSummary>, EngineError> {
        self.call(|reply| EngineRequest::EnrollDataset { dir, reply }).await
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.call(|reply| EngineRequest::ListIdentities { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Everything the engine thread owns.
pub struct Engine {
    pipeline: RecognitionPipeline,
    store: AttendanceStore,
    timeline_path: PathBuf,
    default_threshold: f32,
}

impl Engine {
    pub fn new(
        pipeline: RecognitionPipeline,
        store: AttendanceStore,
        timeline_path: PathBuf,
        default_threshold: f32,
    ) -> Self {
        Self {
            pipeline,
            store,
            timeline_path,
            default_threshold,
        }
    }

    /// Move the engine onto a dedicated OS thread and return its handle.
    pub fn spawn(mut self) -> Result<EngineHandle, EngineError> {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

        std::thread::Builder::new()
            .name("rollcall-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    self.handle(req);
                }
                tracing::info!("engine thread exiting");
            })?;

        Ok(EngineHandle { tx })
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Recognize {
                photo,
                session,
                threshold,
                reply,
            } => {
                let threshold = threshold.unwrap_or(self.default_threshold);
                let _ = reply.send(self.run_recognize(photo, &session, threshold));
            }
            EngineRequest::Enroll {
                name,
                images,
                mode,
                reply,
            } => {
                let gallery = Arc::clone(self.pipeline.gallery());
                let result = enroll::enroll_images(self.pipeline.encoder_mut(), &gallery, &name, &images, mode);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::EnrollDataset { dir, reply } => {
                let gallery = Arc::clone(self.pipeline.gallery());
                let result = enroll::enroll_dataset(self.pipeline.encoder_mut(), &gallery, &dir);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::ListIdentities { reply } => {
                let result = self.pipeline.gallery().index().identities();
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn run_recognize(
        &mut self,
        photo: PathBuf,
        session: &SessionRequest,
        threshold: f32,
    ) -> Result<AttendanceRun, EngineError> {
        let recognition = self.pipeline.recognize(&photo, threshold)?;
        let attendance = self.store.reconcile(session, &recognition.results)?;

        let entry = TimelineEntry {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            photo: recognition.annotated_filename.clone(),
            marked: attendance.recognized_count,
            faces_found: recognition.faces_found,
            subject_id: session.subject_id,
            teacher_id: session.teacher_id,
        };
        if let Err(e) = timeline::append(&self.timeline_path, entry) {
            tracing::warn!(error = %e, path = %self.timeline_path.display(), "timeline update failed");
        }

        Ok(AttendanceRun {
            recognition,
            attendance,
        })
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        let gallery = self.pipeline.gallery().reload()?;
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            identities: gallery.identity_count(),
            gallery_rows: gallery.len(),
            embedding_dim: gallery.dim(),
            students: self.store.list_students()?.len(),
            recognition_threshold: self.default_threshold,
        })
    }
}

/// Build the engine from configuration and spawn it.
///
/// Prepares the data directories, opens the embedding index and the
/// attendance database, and checks the face encoder. Fails fast if any of
/// them is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    config.ensure_dirs()?;

    let index = EmbeddingIndex::open(&config.encodings_dir, config.embedding_dim)?;
    tracing::info!(dir = %config.encodings_dir.display(), "embedding index opened");
    let gallery = Arc::new(GalleryCache::new(index));

    let pipeline = RecognitionPipeline::from_config(config, gallery)?;

    let store = AttendanceStore::open(&config.db_path)?;
    tracing::info!(db = %config.db_path.display(), "attendance store opened");

    Engine::new(
        pipeline,
        store,
        config.timeline_path.clone(),
        config.recognition_threshold,
    )
    .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use rollcall_core::annotate::Annotator;
    use rollcall_core::encoder::EncoderError;
    use rollcall_core::matcher::MatchError;
    use rollcall_core::pipeline::OutputSettings;
    use rollcall_core::{BoundingBox, Embedding, FaceObservation};
    use rollcall_store::NewStudent;

    fn face(values: Vec<f32>, detector_score: f32) -> FaceObservation {
        FaceObservation {
            bbox: BoundingBox::new(1.0, 1.0, 9.0, 9.0),
            landmarks: vec![],
            embedding: Some(Embedding::new(values)),
            detector_score,
        }
    }

    fn engine(dir: &std::path::Path) -> Engine {
        let gallery = Arc::new(GalleryCache::new(
            EmbeddingIndex::open(dir.join("encodings"), 2).unwrap(),
        ));
        // Every image holds one face matching "alice" and one stranger.
        let encoder = |_: &RgbImage| -> Result<Vec<FaceObservation>, EncoderError> {
            Ok(vec![face(vec![1.0, 0.0], 0.9), face(vec![-1.0, 0.0], 0.5)])
        };
        let pipeline = RecognitionPipeline::new(
            Box::new(encoder),
            gallery,
            Annotator::boxes_only(),
            OutputSettings {
                dir: dir.join("uploads"),
                keep: 3,
            },
        )
        .unwrap();
        let store = AttendanceStore::open_in_memory().unwrap();
        store.add_student(&NewStudent::named("alice")).unwrap();
        store.add_student(&NewStudent::named("bob")).unwrap();
        Engine::new(pipeline, store, dir.join("timeline.json"), 0.5)
    }

    fn photo(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("class.png");
        RgbImage::new(12, 12).save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_enroll_then_recognize_records_attendance() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path()).spawn().unwrap();
        let photo = photo(dir.path());

        let summary = handle
            .enroll("alice".into(), vec![photo.clone()], PutMode::Replace)
            .await
            .unwrap();
        assert_eq!(summary.stored, 1);

        let run = handle
            .recognize(photo, SessionRequest::now(4, 9), None)
            .await
            .unwrap();
        assert_eq!(run.recognition.faces_found, 2);
        assert_eq!(run.attendance.names_marked_present, vec!["alice"]);

        let entries = timeline::read(&dir.path().join("timeline.json")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].marked, 1);
        assert_eq!(entries[0].subject_id, 4);

        let status = handle.status().await.unwrap();
        assert_eq!(status.identities, 1);
        assert_eq!(status.students, 2);

        let identities = handle.list_identities().await.unwrap();
        assert_eq!(identities[0].name, "alice");
    }

    #[tokio::test]
    async fn test_threshold_override_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path()).spawn().unwrap();
        let photo = photo(dir.path());
        handle
            .enroll("alice".into(), vec![photo.clone()], PutMode::Replace)
            .await
            .unwrap();

        let err = handle
            .recognize(photo.clone(), SessionRequest::now(1, 1), Some(1.5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Pipeline(PipelineError::Match(MatchError::InvalidThreshold(_)))
        ));
        assert!(timeline::read(&dir.path().join("timeline.json")).unwrap().is_empty());

        // The stranger scores -1, so even a zero threshold leaves it unknown.
        let run = handle
            .recognize(photo, SessionRequest::now(1, 1), Some(0.0))
            .await
            .unwrap();
        assert_eq!(run.recognition.recognized, 1);
        assert_eq!(run.attendance.names_marked_present, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_recognize_follows_enrollments_made_outside_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path()).spawn().unwrap();
        let photo = photo(dir.path());

        let run = handle
            .recognize(photo.clone(), SessionRequest::now(1, 1), None)
            .await
            .unwrap();
        assert!(run.attendance.names_marked_present.is_empty());

        // Same encodings directory, separate handle: what the CLI does.
        let cli_index = EmbeddingIndex::open(dir.path().join("encodings"), 2).unwrap();
        cli_index
            .put_embeddings("alice", &[Embedding::new(vec![1.0, 0.0])], PutMode::Replace)
            .unwrap();
        let run = handle
            .recognize(photo.clone(), SessionRequest::now(1, 1), None)
            .await
            .unwrap();
        assert_eq!(run.attendance.names_marked_present, vec!["alice"]);
        assert_eq!(handle.status().await.unwrap().identities, 1);

        cli_index.remove("alice").unwrap();
        let run = handle
            .recognize(photo, SessionRequest::now(1, 1), None)
            .await
            .unwrap();
        assert!(run.attendance.names_marked_present.is_empty());
        assert_eq!(handle.status().await.unwrap().identities, 0);
    }

    #[tokio::test]
    async fn test_missing_photo_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path()).spawn().unwrap();
        let err = handle
            .recognize(dir.path().join("missing.jpg"), SessionRequest::now(1, 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::Io { .. })));
        assert!(timeline::read(&dir.path().join("timeline.json")).unwrap().is_empty());
    }

    #[test]
    fn test_unconfigured_encoder_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let err = spawn_engine(&config).err().unwrap();
        assert!(err.is_not_ready());
    }
}
