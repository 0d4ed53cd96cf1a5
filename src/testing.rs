//! In-memory collaborators for exercising the engine without a network,
//! capture devices or upload endpoints.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::analytics::{SessionSummary, SummarySink};
use crate::connection::{ConnectionMonitor, ConnectionState, ConnectionStatus};
use crate::constraints::{CaptureControl, MediaConstraints};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalTrack, MediaDevices, TrackSource};
use crate::metrics::RawStats;
use crate::peer::{NegotiationRole, PeerLink, PeerLinkFactory, SignalSink};
use crate::recorder::{RecordingUpload, RecordingUploader};
use crate::signaling::{SignalPayload, SignalingTransport, TransportSession, WireMessage};

const CHANNEL_DEPTH: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Relay side of one fake signaling connection. Dropping it disconnects
/// the client.
pub struct FakeServer {
    to_client: mpsc::Sender<WireMessage>,
    from_client: mpsc::Receiver<WireMessage>,
}

impl FakeServer {
    pub async fn send(&self, message: WireMessage) {
        let _ = self.to_client.send(message).await;
    }

    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }
}

/// Transport whose connections are picked up with `accept`.
pub struct FakeTransport {
    pending_tx: mpsc::UnboundedSender<FakeServer>,
    pending_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeServer>>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pending_tx,
            pending_rx: tokio::sync::Mutex::new(pending_rx),
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Wait for the next client connection.
    pub async fn accept(&self) -> FakeServer {
        let mut pending = self.pending_rx.lock().await;
        match pending.recv().await {
            Some(server) => server,
            None => panic!("fake transport closed"),
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn connect(&self) -> Result<TransportSession> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::SignalingTransport("connection refused".into()));
        }
        let (outgoing, from_client) = mpsc::channel(CHANNEL_DEPTH);
        let (to_client, incoming) = mpsc::channel(CHANNEL_DEPTH);
        let _ = self.pending_tx.send(FakeServer {
            to_client,
            from_client,
        });
        Ok(TransportSession { outgoing, incoming })
    }
}

// ---------------------------------------------------------------------------
// Peer links
// ---------------------------------------------------------------------------

/// Scriptable peer link: stats reports are queued with `push_stats`,
/// applied signals and the current outbound video are recorded.
pub struct FakePeerLink {
    peer_id: String,
    stats: Mutex<VecDeque<RawStats>>,
    repeat_last: AtomicBool,
    applied: Mutex<Vec<SignalPayload>>,
    video: Mutex<Option<String>>,
    fail_replace: AtomicBool,
    fail_apply: AtomicBool,
    closed: AtomicBool,
    monitor: ConnectionMonitor,
}

impl FakePeerLink {
    pub fn new(peer_id: &str) -> Arc<Self> {
        Arc::new(Self::build(peer_id, None))
    }

    fn build(peer_id: &str, video: Option<String>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            stats: Mutex::new(VecDeque::new()),
            repeat_last: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            video: Mutex::new(video),
            fail_replace: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            monitor: ConnectionMonitor::new(peer_id),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn push_stats(&self, report: RawStats) {
        lock(&self.stats).push_back(report);
    }

    /// Keep answering with the last queued report, advancing its
    /// timestamp, once the queue is down to one entry.
    pub fn repeat_last_stats(&self, repeat: bool) {
        self.repeat_last.store(repeat, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<SignalPayload> {
        lock(&self.applied).clone()
    }

    pub fn video_track_id(&self) -> Option<String> {
        lock(&self.video).clone()
    }

    pub fn fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    /// Reject every answer and candidate from now on.
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.monitor.update_state(state);
    }
}

#[async_trait]
impl PeerLink for FakePeerLink {
    async fn create_offer(&self) -> Result<SignalPayload> {
        Ok(SignalPayload::Offer {
            sdp: format!("offer-for-{}", self.peer_id),
        })
    }

    async fn accept_offer(&self, offer: &SignalPayload) -> Result<SignalPayload> {
        if !offer.is_offer() {
            return Err(Error::InvalidState("expected an offer".into()));
        }
        Ok(SignalPayload::Answer {
            sdp: format!("answer-for-{}", self.peer_id),
        })
    }

    async fn apply_signal(&self, payload: &SignalPayload) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("remote description rejected".into()));
        }
        lock(&self.applied).push(payload.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(Error::WebRTC(webrtc::Error::ErrConnectionClosed));
        }
        *lock(&self.video) = Some(track.id().to_string());
        Ok(())
    }

    async fn stats(&self) -> Result<Option<RawStats>> {
        let mut queue = lock(&self.stats);
        if queue.len() == 1 && self.repeat_last.load(Ordering::SeqCst) {
            if let Some(last) = queue.front_mut() {
                let report = *last;
                last.timestamp_ms += 1;
                return Ok(Some(report));
            }
        }
        Ok(queue.pop_front())
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.monitor.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.monitor.update_state(ConnectionState::Closed);
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    links: HashMap<String, Arc<FakePeerLink>>,
    created: Vec<(String, NegotiationRole)>,
    failing: HashSet<String>,
    scripted_stats: Vec<RawStats>,
}

/// Hands out `FakePeerLink`s and remembers what it built.
#[derive(Clone, Default)]
pub struct FakeLinkFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakeLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of links created with `role`.
    pub fn created(&self, role: NegotiationRole) -> usize {
        lock(&self.state)
            .created
            .iter()
            .filter(|(_, r)| *r == role)
            .count()
    }

    /// Most recent link created for `peer_id`.
    pub fn link(&self, peer_id: &str) -> Option<Arc<FakePeerLink>> {
        lock(&self.state).links.get(peer_id).cloned()
    }

    pub fn fail_for(&self, peer_id: &str) {
        lock(&self.state).failing.insert(peer_id.to_string());
    }

    /// Stats every future link reports; the last entry repeats.
    pub fn script_stats(&self, reports: Vec<RawStats>) {
        lock(&self.state).scripted_stats = reports;
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn create(
        &self,
        remote_id: &str,
        role: NegotiationRole,
        media: &LocalMedia,
        _signals: SignalSink,
    ) -> Result<Arc<dyn PeerLink>> {
        let mut state = lock(&self.state);
        if state.failing.contains(remote_id) {
            return Err(Error::WebRTC(webrtc::Error::ErrConnectionClosed));
        }
        let link = Arc::new(FakePeerLink::build(
            remote_id,
            Some(media.active_video().id().to_string()),
        ));
        if !state.scripted_stats.is_empty() {
            for report in &state.scripted_stats {
                link.push_stats(*report);
            }
            link.repeat_last_stats(true);
        }
        state.links.insert(remote_id.to_string(), link.clone());
        state.created.push((remote_id.to_string(), role));
        Ok(link as Arc<dyn PeerLink>)
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Records requested constraints; `fail_next` makes the next request fail.
#[derive(Default)]
pub struct FakeCaptureControl {
    applied: Mutex<Vec<MediaConstraints>>,
    fail_next: AtomicBool,
}

impl FakeCaptureControl {
    pub fn applied(&self) -> Vec<MediaConstraints> {
        lock(&self.applied).clone()
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail_next.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureControl for FakeCaptureControl {
    async fn apply_constraints(&self, constraints: &MediaConstraints) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::ConstraintApplication("unsupported resolution".into()));
        }
        lock(&self.applied).push(*constraints);
        Ok(())
    }
}

pub struct FakeDevices {
    control: Arc<FakeCaptureControl>,
    deny_display: AtomicBool,
    fail_user_media: AtomicBool,
    display_delay: Mutex<Option<Duration>>,
    displays: Mutex<Vec<LocalTrack>>,
    user_media: Mutex<Option<LocalMedia>>,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevices {
    pub fn new() -> Self {
        Self {
            control: Arc::new(FakeCaptureControl::default()),
            deny_display: AtomicBool::new(false),
            fail_user_media: AtomicBool::new(false),
            display_delay: Mutex::new(None),
            displays: Mutex::new(Vec::new()),
            user_media: Mutex::new(None),
        }
    }

    pub fn control(&self) -> Arc<FakeCaptureControl> {
        self.control.clone()
    }

    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::SeqCst);
    }

    pub fn fail_user_media(&self, fail: bool) {
        self.fail_user_media.store(fail, Ordering::SeqCst);
    }

    /// Make display acquisition take `delay` (a permission prompt).
    pub fn display_delay(&self, delay: Duration) {
        *lock(&self.display_delay) = Some(delay);
    }

    /// The microphone and camera most recently handed out.
    pub fn user_media(&self) -> Option<LocalMedia> {
        lock(&self.user_media).clone()
    }

    /// Display tracks handed out so far.
    pub fn displays(&self) -> Vec<LocalTrack> {
        lock(&self.displays).clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_user_media(&self) -> Result<LocalMedia> {
        if self.fail_user_media.load(Ordering::SeqCst) {
            return Err(Error::DeviceAcquisition("camera permission denied".into()));
        }
        let media = LocalMedia::new(
            LocalTrack::new(TrackSource::Microphone),
            LocalTrack::new(TrackSource::Camera),
        );
        *lock(&self.user_media) = Some(media.clone());
        Ok(media)
    }

    async fn acquire_display(&self) -> Result<LocalTrack> {
        let delay = *lock(&self.display_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(Error::DeviceAcquisition("display capture denied".into()));
        }
        let track = LocalTrack::new(TrackSource::Screen);
        lock(&self.displays).push(track.clone());
        Ok(track)
    }

    fn capture_control(&self) -> Arc<dyn CaptureControl> {
        self.control.clone()
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct FakeUploader {
    uploads: Arc<Mutex<Vec<RecordingUpload>>>,
    fail: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl FakeUploader {
    pub fn uploads(&self) -> Vec<RecordingUpload> {
        lock(&self.uploads).clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make every upload take `delay` before it resolves.
    pub fn delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }
}

#[async_trait]
impl RecordingUploader for FakeUploader {
    async fn upload(&self, upload: &RecordingUpload) -> Result<()> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::RecordingUpload("upload endpoint unavailable".into()));
        }
        lock(&self.uploads).push(upload.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeSummarySink {
    summaries: Arc<Mutex<Vec<SessionSummary>>>,
}

impl FakeSummarySink {
    pub fn summaries(&self) -> Vec<SessionSummary> {
        lock(&self.summaries).clone()
    }
}

#[async_trait]
impl SummarySink for FakeSummarySink {
    async fn submit(&self, summary: &SessionSummary) -> Result<()> {
        lock(&self.summaries).push(summary.clone());
        Ok(())
    }
}
