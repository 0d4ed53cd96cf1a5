use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::audio::MicrophoneCapture;
use crate::constraints::{CaptureControl, HostCaptureControl};
use crate::error::{Error, Result};
use crate::recorder::MediaTap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn is_video(&self) -> bool {
        !matches!(self, TrackSource::Microphone)
    }
}

/// An outbound media source shared by every peer connection.
///
/// Clones refer to the same underlying track.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    ended: CancellationToken,
    taps: Arc<Mutex<Vec<MediaTap>>>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(source: TrackSource) -> Self {
        let id = format!("{}-{}", source_label(source), uuid::Uuid::new_v4());
        let mime_type = if source.is_video() { MIME_TYPE_VP8 } else { MIME_TYPE_OPUS };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            "office-hours".to_owned(),
        ));
        Self {
            id,
            source,
            rtc,
            enabled: Arc::new(AtomicBool::new(true)),
            ended: CancellationToken::new(),
            taps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Signal that the capture source stopped (device unplugged, OS
    /// "stop sharing", ...).
    pub fn end(&self) {
        self.ended.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Token that fires when the source ends.
    pub fn ended(&self) -> CancellationToken {
        self.ended.clone()
    }

    pub fn attach_tap(&self, tap: MediaTap) {
        if let Ok(mut taps) = self.taps.lock() {
            taps.push(tap);
        }
    }

    pub fn detach_taps(&self) {
        if let Ok(mut taps) = self.taps.lock() {
            taps.clear();
        }
    }

    /// Write one encoded frame to every peer using this track. Frames are
    /// dropped while the track is disabled or ended.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(());
        }
        if let Ok(taps) = self.taps.lock() {
            for tap in taps.iter() {
                tap.push(self.source, &sample.data);
            }
        }
        self.rtc.write_sample(sample).await?;
        Ok(())
    }
}

fn source_label(source: TrackSource) -> &'static str {
    match source {
        TrackSource::Microphone => "audio",
        TrackSource::Camera => "camera",
        TrackSource::Screen => "screen",
    }
}

/// The local outbound stream: microphone, camera, and whichever video
/// track is currently being sent.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub audio: LocalTrack,
    pub camera: LocalTrack,
    active_video: LocalTrack,
}

impl LocalMedia {
    pub fn new(audio: LocalTrack, camera: LocalTrack) -> Self {
        Self {
            active_video: camera.clone(),
            audio,
            camera,
        }
    }

    /// Stream used when devices could not be acquired: tracks exist so
    /// peers negotiate, but nothing is sent.
    pub fn placeholder() -> Self {
        let media = Self::new(LocalTrack::new(TrackSource::Microphone), LocalTrack::new(TrackSource::Camera));
        media.audio.set_enabled(false);
        media.camera.set_enabled(false);
        media
    }

    pub fn active_video(&self) -> &LocalTrack {
        &self.active_video
    }

    pub fn set_active_video(&mut self, track: LocalTrack) {
        self.active_video = track;
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.active_video.source() == TrackSource::Screen
    }
}

/// Capture device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Microphone plus camera.
    async fn acquire_user_media(&self) -> Result<LocalMedia>;

    /// A display surface for screen sharing.
    async fn acquire_display(&self) -> Result<LocalTrack>;

    /// Capture parameter control for the camera track.
    fn capture_control(&self) -> Arc<dyn CaptureControl>;
}

/// Devices backed by the host machine.
///
/// The microphone is opened through cpal for presence and level metering
/// only; no encoder lives in this crate. Every track, audio included, is fed
/// encoded frames by the embedding application through
/// [`LocalTrack::write_sample`], and camera capture follows `capture()` for
/// the requested parameters.
pub struct HostMediaDevices {
    capture: Arc<HostCaptureControl>,
    display_permitted: AtomicBool,
    microphone: Mutex<Option<MicrophoneCapture>>,
}

impl HostMediaDevices {
    pub fn new(capture: HostCaptureControl) -> Self {
        Self {
            capture: Arc::new(capture),
            display_permitted: AtomicBool::new(true),
            microphone: Mutex::new(None),
        }
    }

    pub fn capture(&self) -> Arc<HostCaptureControl> {
        self.capture.clone()
    }

    /// Mirror of the OS screen-recording permission.
    pub fn set_display_permitted(&self, permitted: bool) {
        self.display_permitted.store(permitted, Ordering::SeqCst);
    }

    /// Input level of the open microphone, in dBFS.
    pub fn microphone_level_db(&self) -> Option<f32> {
        self.microphone
            .lock()
            .ok()
            .and_then(|m| m.as_ref().map(|m| m.level_db()))
    }
}

#[async_trait]
impl MediaDevices for HostMediaDevices {
    async fn acquire_user_media(&self) -> Result<LocalMedia> {
        let capture = tokio::task::spawn_blocking(MicrophoneCapture::open)
            .await
            .map_err(|e| Error::DeviceAcquisition(format!("microphone task failed: {e}")))??;
        info!(device = %capture.device_name(), "microphone acquired");
        if let Ok(mut slot) = self.microphone.lock() {
            *slot = Some(capture);
        }
        Ok(LocalMedia::new(
            LocalTrack::new(TrackSource::Microphone),
            LocalTrack::new(TrackSource::Camera),
        ))
    }

    async fn acquire_display(&self) -> Result<LocalTrack> {
        if !self.display_permitted.load(Ordering::SeqCst) {
            warn!("display capture denied");
            return Err(Error::DeviceAcquisition("display capture permission denied".into()));
        }
        Ok(LocalTrack::new(TrackSource::Screen))
    }

    fn capture_control(&self) -> Arc<dyn CaptureControl> {
        self.capture.clone()
    }
}

/// Convenience for tests and taps: an encoded frame with a fixed duration.
pub fn sample_from(data: impl Into<Bytes>, duration: std::time::Duration) -> Sample {
    Sample {
        data: data.into(),
        duration,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{ChunkSource, TAP_HEADER_LEN};

    #[test]
    fn placeholder_media_is_muted() {
        let media = LocalMedia::placeholder();
        assert!(!media.audio.is_enabled());
        assert!(!media.camera.is_enabled());
        assert_eq!(media.active_video().id(), media.camera.id());
        assert!(!media.is_sharing_screen());
    }

    #[tokio::test]
    async fn written_audio_frames_reach_attached_taps() {
        let media = LocalMedia::new(
            LocalTrack::new(TrackSource::Microphone),
            LocalTrack::new(TrackSource::Camera),
        );
        let tap = MediaTap::new();
        media.audio.attach_tap(tap.clone());

        let frame = sample_from(vec![0xf8u8, 0xff, 0xfe], std::time::Duration::from_millis(20));
        media.audio.write_sample(&frame).await.unwrap();
        assert!(!tap.is_empty());

        media.audio.detach_taps();
        let chunk = tap.take_chunk().await.unwrap();
        media.audio.write_sample(&frame).await.unwrap();
        assert!(tap.is_empty());
        assert_eq!(chunk[8], 0);
        assert_eq!(&chunk[TAP_HEADER_LEN..], &[0xf8, 0xff, 0xfe]);
    }

    #[test]
    fn ending_a_track_fires_its_token() {
        let track = LocalTrack::new(TrackSource::Screen);
        let token = track.ended();
        let clone = track.clone();
        clone.end();
        assert!(token.is_cancelled());
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn denied_display_is_a_device_error() {
        let devices = HostMediaDevices::new(HostCaptureControl::default());
        devices.set_display_permitted(false);
        assert!(matches!(
            devices.acquire_display().await,
            Err(Error::DeviceAcquisition(_))
        ));
        devices.set_display_permitted(true);
        let track = devices.acquire_display().await.unwrap();
        assert_eq!(track.source(), TrackSource::Screen);
    }

    #[tokio::test]
    async fn disabled_track_drops_frames_before_taps() {
        let track = LocalTrack::new(TrackSource::Camera);
        let tap = MediaTap::new();
        track.attach_tap(tap.clone());
        track.set_enabled(false);
        track
            .write_sample(&sample_from(vec![1u8, 2, 3], std::time::Duration::from_millis(33)))
            .await
            .unwrap();
        assert!(tap.is_empty());
    }
}
