use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RecordingConfig;
use crate::error::{Error, Result};
use crate::media::TrackSource;

// ---------------------------------------------------------------------------
// Chunk sources
// ---------------------------------------------------------------------------

/// Supplies the media captured since the previous call.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn take_chunk(&self) -> Result<Bytes>;

    /// Drop anything buffered before a recording starts.
    fn discard_buffered(&self) {}
}

/// Collects encoded frames written to local tracks.
///
/// Frame record layout:
///
///   [0..8]   capture timestamp, ms since UNIX epoch (i64 LE)
///   [8..9]   source: 0 = microphone, 1 = camera, 2 = screen
///   [9..13]  payload length (u32 LE)
///   [13..]   payload
#[derive(Clone, Default)]
pub struct MediaTap {
    buf: Arc<Mutex<BytesMut>>,
}

pub const TAP_HEADER_LEN: usize = 13;

impl MediaTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, source: TrackSource, payload: &[u8]) {
        self.push_at(chrono::Utc::now().timestamp_millis(), source, payload);
    }

    pub fn push_at(&self, timestamp_ms: i64, source: TrackSource, payload: &[u8]) {
        let kind = match source {
            TrackSource::Microphone => 0u8,
            TrackSource::Camera => 1,
            TrackSource::Screen => 2,
        };
        if let Ok(mut buf) = self.buf.lock() {
            buf.reserve(TAP_HEADER_LEN + payload.len());
            buf.put_i64_le(timestamp_ms);
            buf.put_u8(kind);
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(payload);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().map(|b| b.is_empty()).unwrap_or(true)
    }
}

#[async_trait]
impl ChunkSource for MediaTap {
    async fn take_chunk(&self) -> Result<Bytes> {
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| Error::InvalidState("media tap poisoned".into()))?;
        Ok(buf.split().freeze())
    }

    fn discard_buffered(&self) {
        if let Ok(mut buf) = self.buf.lock() {
            buf.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Upload hand-off
// ---------------------------------------------------------------------------

/// A finished recording ready for the upload endpoint.
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingUpload {
    pub session_id: String,
    #[serde(skip)]
    pub recording: Bytes,
    pub duration_seconds: f64,
}

impl fmt::Debug for RecordingUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingUpload")
            .field("session_id", &self.session_id)
            .field("bytes", &self.recording.len())
            .field("duration_seconds", &self.duration_seconds)
            .finish()
    }
}

#[async_trait]
pub trait RecordingUploader: Send + Sync {
    async fn upload(&self, upload: &RecordingUpload) -> Result<()>;
}

/// POSTs the recording body to the upload endpoint.
pub struct HttpRecordingUploader {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecordingUploader {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RecordingUploader for HttpRecordingUploader {
    async fn upload(&self, upload: &RecordingUpload) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("sessionId", upload.session_id.clone()),
                ("durationSeconds", format!("{:.3}", upload.duration_seconds)),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(upload.recording.clone())
            .send()
            .await
            .map_err(|e| Error::RecordingUpload(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::RecordingUpload(format!(
                "upload endpoint answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SessionRecorder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedChunk {
    pub at_ms: i64,
    pub data: Bytes,
}

struct ActiveRecording {
    started_at_ms: i64,
    cancel: CancellationToken,
    task: JoinHandle<Vec<RecordedChunk>>,
}

/// Captures timestamped chunks while recording and hands the concatenated
/// result to the uploader on stop. Recordings whose upload failed are kept
/// until a retry succeeds or they are discarded.
pub struct SessionRecorder {
    config: RecordingConfig,
    session_id: String,
    source: Arc<dyn ChunkSource>,
    uploader: Arc<dyn RecordingUploader>,
    clock: Arc<dyn Clock>,
    state: RecorderState,
    active: Option<ActiveRecording>,
    pending: Vec<RecordingUpload>,
}

impl SessionRecorder {
    pub fn new(
        config: RecordingConfig,
        session_id: impl Into<String>,
        source: Arc<dyn ChunkSource>,
        uploader: Arc<dyn RecordingUploader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            session_id: session_id.into(),
            source,
            uploader,
            clock,
            state: RecorderState::Idle,
            active: None,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn uploader(&self) -> Arc<dyn RecordingUploader> {
        self.uploader.clone()
    }

    /// Recordings waiting for a successful upload.
    pub fn pending_uploads(&self) -> &[RecordingUpload] {
        &self.pending
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != RecorderState::Idle {
            return Err(Error::InvalidState(format!(
                "cannot start recording while {:?}",
                self.state
            )));
        }

        self.source.discard_buffered();
        let cancel = CancellationToken::new();
        let task = spawn_chunker(
            self.source.clone(),
            self.clock.clone(),
            self.config.chunk_interval(),
            cancel.clone(),
        );
        self.active = Some(ActiveRecording {
            started_at_ms: self.clock.now_ms(),
            cancel,
            task,
        });
        self.state = RecorderState::Recording;
        info!(session_id = %self.session_id, "recording started");
        Ok(())
    }

    /// Stop chunking and assemble the recording. `None` when idle.
    pub async fn finalize(&mut self) -> Option<RecordingUpload> {
        let active = self.active.take()?;
        self.state = RecorderState::Finalizing;

        active.cancel.cancel();
        let mut chunks = match active.task.await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("recording chunk task failed: {}", e);
                Vec::new()
            }
        };
        match self.source.take_chunk().await {
            Ok(tail) if !tail.is_empty() => chunks.push(RecordedChunk {
                at_ms: self.clock.now_ms(),
                data: tail,
            }),
            Ok(_) => {}
            Err(e) => warn!("failed to read final recording chunk: {}", e),
        }

        let total: usize = chunks.iter().map(|c| c.data.len()).sum();
        let mut blob = BytesMut::with_capacity(total);
        for chunk in &chunks {
            blob.extend_from_slice(&chunk.data);
        }
        let elapsed_ms = (self.clock.now_ms() - active.started_at_ms).max(0);

        self.state = RecorderState::Idle;
        let upload = RecordingUpload {
            session_id: self.session_id.clone(),
            recording: blob.freeze(),
            duration_seconds: elapsed_ms as f64 / 1000.0,
        };
        info!(
            session_id = %self.session_id,
            chunks = chunks.len(),
            bytes = total,
            duration_seconds = upload.duration_seconds,
            "recording finalized"
        );
        Some(upload)
    }

    /// Stop and hand off. Idle recorders return `Ok(None)`.
    ///
    /// On upload failure the recording is retained for `retry_upload`.
    pub async fn stop(&mut self) -> Result<Option<RecordingUpload>> {
        let Some(upload) = self.finalize().await else {
            return Ok(None);
        };
        let delivery = deliver(self.uploader.clone(), vec![upload]).await;
        Ok(self.settle(delivery)?.pop())
    }

    /// Keep a recording whose upload did not succeed.
    pub fn retain(&mut self, upload: RecordingUpload) {
        warn!(
            session_id = %upload.session_id,
            bytes = upload.recording.len(),
            "recording upload failed, keeping local copy"
        );
        self.pending.push(upload);
    }

    /// Take retained recordings for another upload attempt.
    pub fn take_pending(&mut self) -> Vec<RecordingUpload> {
        std::mem::take(&mut self.pending)
    }

    /// Re-attempt every retained upload, keeping those that fail again.
    pub async fn retry_upload(&mut self) -> Result<usize> {
        let delivery = deliver(self.uploader.clone(), self.take_pending()).await;
        Ok(self.settle(delivery)?.len())
    }

    /// Fold a finished delivery back in: failures are retained. Returns the
    /// delivered recordings, or the last failure if any upload failed.
    pub fn settle(&mut self, delivery: Delivery) -> Result<Vec<RecordingUpload>> {
        for upload in delivery.failed {
            self.retain(upload);
        }
        match delivery.last_error {
            Some(e) => Err(upload_error(e)),
            None => Ok(delivery.delivered),
        }
    }

    /// Drop retained recordings without uploading them.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            info!(session_id = %self.session_id, dropped, "retained recordings discarded");
        }
        dropped
    }
}

/// Outcome of one upload attempt over a batch of recordings.
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: Vec<RecordingUpload>,
    pub failed: Vec<RecordingUpload>,
    pub last_error: Option<Error>,
}

/// Upload each recording once, in order. Does not touch recorder state, so
/// it can run on a task of its own; hand the result to
/// [`SessionRecorder::settle`].
pub async fn deliver(
    uploader: Arc<dyn RecordingUploader>,
    uploads: Vec<RecordingUpload>,
) -> Delivery {
    let mut delivery = Delivery::default();
    for upload in uploads {
        match uploader.upload(&upload).await {
            Ok(()) => {
                info!(session_id = %upload.session_id, "recording uploaded");
                delivery.delivered.push(upload);
            }
            Err(e) => {
                delivery.failed.push(upload);
                delivery.last_error = Some(e);
            }
        }
    }
    delivery
}

fn upload_error(e: Error) -> Error {
    match e {
        Error::RecordingUpload(_) => e,
        other => Error::RecordingUpload(other.to_string()),
    }
}

fn spawn_chunker(
    source: Arc<dyn ChunkSource>,
    clock: Arc<dyn Clock>,
    period: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<Vec<RecordedChunk>> {
    tokio::spawn(async move {
        let mut chunks = Vec::new();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match source.take_chunk().await {
                Ok(data) if !data.is_empty() => chunks.push(RecordedChunk {
                    at_ms: clock.now_ms(),
                    data,
                }),
                Ok(_) => {}
                Err(e) => debug!("recording chunk unavailable: {}", e),
            }
        }
        chunks
    })
}
