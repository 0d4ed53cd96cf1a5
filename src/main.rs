use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use office_hours_rtc::analytics::{HttpSummarySink, SessionSummary, SummarySink};
use office_hours_rtc::clock::SystemClock;
use office_hours_rtc::constraints::HostCaptureControl;
use office_hours_rtc::media::HostMediaDevices;
use office_hours_rtc::recorder::{HttpRecordingUploader, RecordingUpload, RecordingUploader};
use office_hours_rtc::room::{LocalParticipant, ParticipantRole};
use office_hours_rtc::signaling::websocket::WebSocketTransport;
use office_hours_rtc::webrtc::RtcPeerLinkFactory;
use office_hours_rtc::{ConferenceConfig, ConferenceDeps, ConferenceNotice, ConferenceOrchestrator};

/// Stand-in collaborator when no endpoint is configured.
struct LogOnly;

#[async_trait]
impl RecordingUploader for LogOnly {
    async fn upload(&self, upload: &RecordingUpload) -> office_hours_rtc::Result<()> {
        info!(?upload, "no upload endpoint configured, recording dropped");
        Ok(())
    }
}

#[async_trait]
impl SummarySink for LogOnly {
    async fn submit(&self, summary: &SessionSummary) -> office_hours_rtc::Result<()> {
        info!(session_id = %summary.session_id, "no analytics endpoint configured");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConferenceConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level.0)),
        )
        .init();
    config.log_summary();

    let room_id = std::env::var("OFFICE_HOURS_ROOM").unwrap_or_else(|_| "office-hours".to_string());
    let role = match std::env::var("OFFICE_HOURS_ROLE").as_deref() {
        Ok("instructor") => ParticipantRole::Instructor,
        _ => ParticipantRole::Student,
    };
    // Provisional: the relay's socket id replaces it once room-users arrives.
    let participant_id = format!("peer-{:08x}", rand::random::<u32>());
    let user_id = std::env::var("OFFICE_HOURS_USER_ID").unwrap_or_else(|_| participant_id.clone());
    let local = LocalParticipant {
        participant_id,
        user_id,
        role,
    };

    let uploader: Arc<dyn RecordingUploader> = match std::env::var("OFFICE_HOURS_UPLOAD_URL") {
        Ok(url) => Arc::new(HttpRecordingUploader::new(url)),
        Err(_) => Arc::new(LogOnly),
    };
    let summary_sink: Arc<dyn SummarySink> = match std::env::var("OFFICE_HOURS_ANALYTICS_URL") {
        Ok(url) => Arc::new(HttpSummarySink::new(url)),
        Err(_) => Arc::new(LogOnly),
    };

    let deps = ConferenceDeps {
        transport: Arc::new(WebSocketTransport::new(config.signaling.url.clone())),
        links: Arc::new(
            RtcPeerLinkFactory::new(&config.ice_servers).context("failed to set up WebRTC")?,
        ),
        devices: Arc::new(HostMediaDevices::new(HostCaptureControl::default())),
        uploader,
        summary_sink,
        clock: Arc::new(SystemClock),
    };

    let (handle, mut notices) = ConferenceOrchestrator::start(config, deps, &room_id, local)
        .await
        .context("failed to join room")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("leaving room");
                let summary = handle.leave().await.context("failed to leave cleanly")?;
                while let Ok(notice) = notices.try_recv() {
                    if let ConferenceNotice::RecordingsUndelivered(uploads) = notice {
                        keep_recordings(&uploads).await?;
                    }
                }
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            notice = notices.recv() => match notice {
                Some(ConferenceNotice::SessionEnded(summary)) => {
                    warn!("conference ended without leaving");
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    return Ok(());
                }
                Some(ConferenceNotice::RecordingsUndelivered(uploads)) => keep_recordings(&uploads).await?,
                Some(notice) => info!(?notice, "conference notice"),
                None => return Ok(()),
            },
        }
    }
}

/// Write recordings the upload endpoint never accepted to the working
/// directory so they survive the process.
async fn keep_recordings(uploads: &[RecordingUpload]) -> Result<()> {
    for (i, upload) in uploads.iter().enumerate() {
        let path = format!("recording-{}-{}.bin", upload.session_id, i);
        tokio::fs::write(&path, &upload.recording)
            .await
            .with_context(|| format!("failed to save undelivered recording to {path}"))?;
        warn!(%path, bytes = upload.recording.len(), "undelivered recording saved");
    }
    Ok(())
}
