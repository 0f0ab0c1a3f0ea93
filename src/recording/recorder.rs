use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use strum_macros::Display;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};

use crate::{
    config::RecorderConfig,
    error::{Error, RecordingErrorKind},
    recording::store::ChunkStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RecorderStatus {
    Idle,
    Recording,
    Finalized,
}

/// Encoded media chunks produced by a capture pipeline, in arrival order.
#[derive(Debug)]
pub struct CaptureStream {
    pub receiver: mpsc::Receiver<Bytes>,
}

impl CaptureStream {
    pub fn new(receiver: mpsc::Receiver<Bytes>) -> Self {
        Self { receiver }
    }

    /// Creates a stream together with the sender the capture pipeline writes chunks into.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self::new(receiver))
    }
}

/// Concatenation of every recorded segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub mime_type: String,
    pub data: Bytes,
}

impl RecordingArtifact {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug)]
struct RecorderState {
    status: RecorderStatus,
    segments: Vec<Vec<Bytes>>,
    /// Base64 form of every chunk, mirrored to the store on each append.
    persisted: Vec<String>,
}

#[derive(Debug)]
struct ActiveCapture {
    stop_sender: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Chunked recorder that persists every chunk as it arrives and restores unfinished
/// recordings on construction.
///
/// Segments are concatenated in start order. The persisted record is cleared only by a
/// successful [`Recorder::finalize`].
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Recorder {
    config: RecorderConfig,
    #[derivative(Debug = "ignore")]
    store: Arc<dyn ChunkStore>,
    state: Arc<Mutex<RecorderState>>,
    capture: Arc<Mutex<Option<ActiveCapture>>>,
    restored: Arc<Mutex<bool>>,
}

impl Recorder {
    /// Creates a recorder and starts restoring the persisted record in the background.
    /// Every operation waits for the restore to finish.
    pub fn new(config: RecorderConfig, store: Arc<dyn ChunkStore>) -> Self {
        let recorder = Self {
            config,
            store,
            state: Arc::new(Mutex::new(RecorderState {
                status: RecorderStatus::Idle,
                segments: Vec::new(),
                persisted: Vec::new(),
            })),
            capture: Arc::new(Mutex::new(None)),
            restored: Arc::new(Mutex::new(false)),
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let r = recorder.clone();
            handle.spawn(async move { r.ensure_ready().await });
        }
        tracing::debug!("Recorder {} is created", recorder.config.storage_key);
        recorder
    }

    /// Waits until the persisted record has been restored.
    pub async fn ensure_ready(&self) {
        let mut restored = self.restored.lock().await;
        if *restored {
            return;
        }
        self.restore().await;
        *restored = true;
    }

    async fn restore(&self) {
        let key = &self.config.storage_key;
        let raw = match self.store.load(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(err) => {
                tracing::error!("failed to load recording {}: {}", key, err);
                return;
            }
        };
        match Self::decode(&raw) {
            Ok((encoded, chunks)) => {
                if chunks.is_empty() {
                    return;
                }
                tracing::info!("restored {} recording chunks from {}", chunks.len(), key);
                let mut state = self.state.lock().await;
                state.segments.insert(0, chunks);
                state.persisted = encoded;
            }
            Err(err) => {
                tracing::warn!("discarding unreadable recording {}: {}", key, err);
                if let Err(err) = self.store.remove(key).await {
                    tracing::error!("failed to remove recording {}: {}", key, err);
                }
            }
        }
    }

    fn decode(raw: &str) -> Result<(Vec<String>, Vec<Bytes>), Error> {
        let encoded: Vec<String> = serde_json::from_str(raw)?;
        let chunks = encoded
            .iter()
            .map(|chunk| STANDARD.decode(chunk).map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((encoded, chunks))
    }

    pub async fn status(&self) -> RecorderStatus {
        self.state.lock().await.status
    }

    pub async fn is_recording(&self) -> bool {
        self.status().await == RecorderStatus::Recording
    }

    /// Starts a new segment fed by `stream`.
    pub async fn start(&self, stream: Option<CaptureStream>) -> Result<(), Error> {
        self.ensure_ready().await;
        let Some(stream) = stream else {
            return Err(Error::new_recording(
                "No capture stream".to_string(),
                RecordingErrorKind::NoStream,
            ));
        };
        let mut capture = self.capture.lock().await;
        {
            let mut state = self.state.lock().await;
            match state.status {
                RecorderStatus::Recording => {
                    tracing::warn!("Recorder is already recording");
                    return Err(Error::new_recording(
                        "Already recording".to_string(),
                        RecordingErrorKind::AlreadyRecording,
                    ));
                }
                RecorderStatus::Finalized => {
                    return Err(Error::new_recording(
                        "Recording was finalized".to_string(),
                        RecordingErrorKind::Finalized,
                    ));
                }
                RecorderStatus::Idle => {}
            }
            state.status = RecorderStatus::Recording;
            state.segments.push(Vec::new());
        }

        let (stop_sender, stop_receiver) = oneshot::channel();
        let handle = self.capture_loop(stream, stop_receiver);
        *capture = Some(ActiveCapture {
            stop_sender,
            handle,
        });
        tracing::info!("Recorder started");
        Ok(())
    }

    fn capture_loop(
        &self,
        stream: CaptureStream,
        mut stop_receiver: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let recorder = self.clone();
        let mut receiver = stream.receiver;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = receiver.recv() => {
                        match chunk {
                            Some(chunk) => recorder.append(chunk).await,
                            None => {
                                tracing::debug!("capture stream ended");
                                return;
                            }
                        }
                    }
                    _ = &mut stop_receiver => {
                        while let Ok(chunk) = receiver.try_recv() {
                            recorder.append(chunk).await;
                        }
                        return;
                    }
                }
            }
        })
    }

    async fn append(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        state.persisted.push(STANDARD.encode(&chunk));
        if let Some(segment) = state.segments.last_mut() {
            segment.push(chunk);
        }
        let record = match serde_json::to_string(&state.persisted) {
            Ok(record) => record,
            Err(err) => {
                tracing::error!("failed to encode recording record: {}", err);
                return;
            }
        };
        if let Err(err) = self.store.save(&self.config.storage_key, &record).await {
            match err.recording_kind() {
                Some(RecordingErrorKind::StorageFull) => {
                    tracing::warn!("recording storage is full, keeping chunk in memory: {}", err)
                }
                _ => tracing::error!("failed to persist recording chunk: {}", err),
            }
        }
    }

    /// Closes the current segment after draining chunks already delivered.
    /// The persisted record is kept.
    pub async fn stop(&self) -> Result<(), Error> {
        self.ensure_ready().await;
        let active = self.capture.lock().await.take();
        let Some(active) = active else {
            tracing::warn!("Recorder is not recording");
            return Ok(());
        };
        let _ = active.stop_sender.send(());
        if let Err(err) = active.handle.await {
            tracing::error!("capture loop failed: {}", err);
        }
        let mut state = self.state.lock().await;
        state.status = RecorderStatus::Idle;
        tracing::info!("Recorder stopped with {} segments", state.segments.len());
        Ok(())
    }

    fn concat(&self, segments: &[Vec<Bytes>]) -> Option<RecordingArtifact> {
        let mut data = BytesMut::new();
        for chunk in segments.iter().flatten() {
            data.extend_from_slice(chunk);
        }
        if data.is_empty() {
            return None;
        }
        Some(RecordingArtifact {
            mime_type: self.config.mime_type.clone(),
            data: data.freeze(),
        })
    }

    /// Concatenation of every completed segment. `None` while recording or when empty.
    pub async fn preview(&self) -> Option<RecordingArtifact> {
        self.ensure_ready().await;
        let state = self.state.lock().await;
        if state.status == RecorderStatus::Recording {
            tracing::warn!("preview is not available while recording");
            return None;
        }
        let artifact = self.concat(&state.segments);
        if artifact.is_none() {
            tracing::debug!("nothing recorded to preview");
        }
        artifact
    }

    /// Returns the full recording and clears the persisted record. `None` while recording or
    /// when nothing was recorded.
    pub async fn finalize(&self) -> Result<Option<RecordingArtifact>, Error> {
        self.ensure_ready().await;
        let mut state = self.state.lock().await;
        if state.status == RecorderStatus::Recording {
            tracing::warn!("finalize is not available while recording");
            return Ok(None);
        }
        let Some(artifact) = self.concat(&state.segments) else {
            return Ok(None);
        };
        self.store.remove(&self.config.storage_key).await?;
        state.segments.clear();
        state.persisted.clear();
        state.status = RecorderStatus::Finalized;
        tracing::info!("Recorder finalized {} bytes", artifact.len());
        Ok(Some(artifact))
    }

    pub async fn segment_count(&self) -> usize {
        self.state.lock().await.segments.len()
    }

    /// Stops a running capture without waiting for it; used on teardown.
    pub(crate) fn abort(&self) {
        if let Ok(mut capture) = self.capture.try_lock() {
            if let Some(active) = capture.take() {
                let _ = active.stop_sender.send(());
            }
        }
        if let Ok(mut state) = self.state.try_lock() {
            if state.status == RecorderStatus::Recording {
                state.status = RecorderStatus::Idle;
            }
        }
    }
}
