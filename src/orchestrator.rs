use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::{InteractionKind, SessionAnalytics, SessionSummary, SummarySink};
use crate::clock::Clock;
use crate::config::ConferenceConfig;
use crate::connection::ConnectionState;
use crate::constraints::{ConstraintApplier, MediaConstraintProfile};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalTrack, MediaDevices};
use crate::metrics::StatsSampler;
use crate::peer::{OutboundSignal, PeerInfo, PeerLinkFactory, PeerRegistry};
use crate::quality::{AveragedStats, QualityChange, QualityController, QualityLevel, QualitySample};
use crate::recorder::{
    deliver, Delivery, MediaTap, RecorderState, RecordingUpload, RecordingUploader,
    SessionRecorder,
};
use crate::room::LocalParticipant;
use crate::signaling::{RoomEvent, SignalingClient, SignalingTransport, StreamAction};
use crate::switcher::TrackSwitcher;

/// Collaborators the conference runs against.
pub struct ConferenceDeps {
    pub transport: Arc<dyn SignalingTransport>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub uploader: Arc<dyn RecordingUploader>,
    pub summary_sink: Arc<dyn SummarySink>,
    pub clock: Arc<dyn Clock>,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceNotice {
    ParticipantJoined(String),
    ParticipantLeft(String),
    /// A single peer's level changed.
    QualityChanged(QualityChange),
    /// The level the local stream is constrained to changed.
    EffectiveQualityChanged(QualityLevel),
    RemoteQuality { user_id: String, status: QualityLevel },
    RemoteStreamControl { user_id: String, action: StreamAction },
    ConnectionLost,
    Reconnected,
    ReconnectFailed,
    DeviceError(String),
    ScreenShareEnded,
    PeerFailed(String),
    RecordingUploaded { session_id: String, duration_seconds: f64 },
    RecordingUploadFailed(String),
    /// Recordings still not uploaded when the conference ended. The caller
    /// owns them from here on.
    RecordingsUndelivered(Vec<RecordingUpload>),
    SessionEnded(Box<SessionSummary>),
}

enum Command {
    ToggleAudio(oneshot::Sender<Result<bool>>),
    ToggleVideo(oneshot::Sender<Result<bool>>),
    ShareScreen(oneshot::Sender<Result<()>>),
    StopScreenShare(oneshot::Sender<Result<()>>),
    StartRecording(oneshot::Sender<Result<()>>),
    StopRecording(oneshot::Sender<Result<Option<RecordingUpload>>>),
    RetryUpload(oneshot::Sender<Result<usize>>),
    DiscardRecording(oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    EffectiveLevel(oneshot::Sender<QualityLevel>),
    Leave(oneshot::Sender<Result<SessionSummary>>),
}

/// Results of work the loop handed to background tasks.
enum Internal {
    DisplayAcquired {
        result: Result<LocalTrack>,
        reply: oneshot::Sender<Result<()>>,
    },
    PeerFailed {
        peer_id: String,
        generation: u64,
    },
    Delivered {
        delivery: Delivery,
        reply: DeliveryReply,
    },
}

/// Who is waiting on a background delivery.
enum DeliveryReply {
    Stop(oneshot::Sender<Result<Option<RecordingUpload>>>),
    Retry(oneshot::Sender<Result<usize>>),
}

/// Cloneable front end to a running conference.
#[derive(Clone)]
pub struct ConferenceHandle {
    commands: mpsc::Sender<Command>,
}

impl ConferenceHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await?;
        Ok(rx.await?)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Returns whether the microphone is now enabled.
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.request(Command::ToggleAudio).await?
    }

    /// Returns whether the camera is now enabled.
    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(Command::ToggleVideo).await?
    }

    pub async fn share_screen(&self) -> Result<()> {
        self.request(Command::ShareScreen).await?
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(Command::StopScreenShare).await?
    }

    pub async fn start_recording(&self) -> Result<()> {
        self.request(Command::StartRecording).await?
    }

    /// `None` when no recording was running.
    pub async fn stop_recording(&self) -> Result<Option<RecordingUpload>> {
        self.request(Command::StopRecording).await?
    }

    /// Re-attempt uploads that failed; returns how many were delivered.
    pub async fn retry_recording_upload(&self) -> Result<usize> {
        self.request(Command::RetryUpload).await?
    }

    pub async fn discard_recording(&self) -> Result<usize> {
        self.request(Command::DiscardRecording).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(Command::Peers).await
    }

    pub async fn effective_level(&self) -> Result<QualityLevel> {
        self.request(Command::EffectiveLevel).await
    }

    /// Leave the room, stop every timer and return the session summary.
    pub async fn leave(&self) -> Result<SessionSummary> {
        self.request(Command::Leave).await?
    }
}

pub struct ConferenceOrchestrator;

impl ConferenceOrchestrator {
    /// Acquire local media, join `room_id` and run the conference until
    /// `leave` or a terminal signaling failure.
    ///
    /// Device failures do not prevent joining: the conference continues
    /// with muted placeholder tracks and a `DeviceError` notice.
    pub async fn start(
        config: ConferenceConfig,
        deps: ConferenceDeps,
        room_id: &str,
        local: LocalParticipant,
    ) -> Result<(ConferenceHandle, mpsc::UnboundedReceiver<ConferenceNotice>)> {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let media = match deps.devices.acquire_user_media().await {
            Ok(media) => media,
            Err(e) => {
                warn!("continuing without local media: {}", e);
                let _ = notices_tx.send(ConferenceNotice::DeviceError(e.to_string()));
                LocalMedia::placeholder()
            }
        };

        let mut analytics = SessionAnalytics::new(deps.clock.clone());
        let session_id = analytics.start_session(room_id, &local.participant_id)?;

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(local.clone(), room_id, deps.links, signals_tx);

        let (signaling, room_events) =
            SignalingClient::join(deps.transport, config.signaling.clone(), room_id, local.clone())
                .await?;

        let mut quality = QualityController::new(config.quality.clone());
        let tx = notices_tx.clone();
        quality.on_change(move |change| {
            let _ = tx.send(ConferenceNotice::QualityChanged(change.clone()));
        });

        let mut applier =
            ConstraintApplier::new(MediaConstraintProfile::default(), deps.devices.capture_control());
        if let Err(e) = applier.apply(QualityLevel::High).await {
            warn!("initial media constraints not applied: {}", e);
        }

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let switcher = TrackSwitcher::new(deps.devices, ended_tx);

        let tap = MediaTap::new();
        let recorder = SessionRecorder::new(
            config.recording.clone(),
            session_id,
            Arc::new(tap.clone()),
            deps.uploader,
            deps.clock,
        );

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(32);

        let conference = Conference {
            config,
            local,
            signaling,
            registry,
            quality,
            applier,
            switcher,
            recorder,
            tap,
            analytics,
            summary_sink: deps.summary_sink,
            media,
            effective: QualityLevel::High,
            notices: notices_tx,
            samples: samples_tx,
            internal: internal_tx,
            deliveries: Vec::new(),
        };
        let channels = Channels {
            commands: commands_rx,
            room_events,
            signals: signals_rx,
            samples: samples_rx,
            internal: internal_rx,
            ended: ended_rx,
        };
        tokio::spawn(conference.run(channels));

        Ok((ConferenceHandle { commands: commands_tx }, notices_rx))
    }
}

struct Channels {
    commands: mpsc::Receiver<Command>,
    room_events: mpsc::UnboundedReceiver<RoomEvent>,
    signals: mpsc::UnboundedReceiver<OutboundSignal>,
    samples: mpsc::UnboundedReceiver<(String, u64, QualitySample)>,
    internal: mpsc::UnboundedReceiver<Internal>,
    ended: mpsc::UnboundedReceiver<String>,
}

/// The event loop. All conference state is owned here.
struct Conference {
    config: ConferenceConfig,
    local: LocalParticipant,
    signaling: SignalingClient,
    registry: PeerRegistry,
    quality: QualityController,
    applier: ConstraintApplier,
    switcher: TrackSwitcher,
    recorder: SessionRecorder,
    tap: MediaTap,
    analytics: SessionAnalytics,
    summary_sink: Arc<dyn SummarySink>,
    media: LocalMedia,
    effective: QualityLevel,
    notices: mpsc::UnboundedSender<ConferenceNotice>,
    samples: mpsc::UnboundedSender<(String, u64, QualitySample)>,
    internal: mpsc::UnboundedSender<Internal>,
    deliveries: Vec<JoinHandle<()>>,
}

impl Conference {
    async fn run(mut self, mut ch: Channels) {
        info!(
            room_id = %self.signaling.room_id(),
            participant_id = %self.local.participant_id,
            "conference running"
        );
        let mut room_open = true;

        loop {
            tokio::select! {
                cmd = ch.commands.recv() => match cmd {
                    Some(Command::Leave(reply)) => {
                        let _ = reply.send(self.shutdown(&mut ch.internal).await);
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("all conference handles dropped");
                        let _ = self.shutdown(&mut ch.internal).await;
                        break;
                    }
                },
                event = ch.room_events.recv(), if room_open => match event {
                    Some(RoomEvent::ReconnectFailed) => {
                        self.notify(ConferenceNotice::ReconnectFailed);
                        let _ = self.shutdown(&mut ch.internal).await;
                        break;
                    }
                    Some(event) => self.on_room_event(event).await,
                    None => room_open = false,
                },
                Some(signal) = ch.signals.recv() => {
                    if let Err(e) = self.signaling.send_signal(&signal.target, signal.payload) {
                        warn!(peer_id = %signal.target, "failed to relay signal: {}", e);
                    }
                }
                Some((peer_id, generation, sample)) = ch.samples.recv() => {
                    self.on_sample(&peer_id, generation, sample).await;
                }
                Some(internal) = ch.internal.recv() => self.on_internal(internal).await,
                Some(track_id) = ch.ended.recv() => self.on_source_ended(&track_id).await,
            }
        }
        info!("conference stopped");
    }

    fn notify(&self, notice: ConferenceNotice) {
        if self.notices.send(notice).is_err() {
            debug!("notice receiver dropped");
        }
    }

    // -----------------------------------------------------------------------
    // Room membership and signaling
    // -----------------------------------------------------------------------

    async fn on_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::ExistingParticipants(list) => {
                for p in &list {
                    self.analytics.log_participant(&p.participant_id, true);
                }
                let created = self
                    .registry
                    .on_existing_participants(list, &self.media)
                    .await;
                for id in created {
                    self.watch_peer(&id);
                }
            }
            RoomEvent::ParticipantJoined(participant) => {
                let id = participant.participant_id.clone();
                self.analytics.log_participant(&id, true);
                self.registry.on_participant_joined(participant);
                self.notify(ConferenceNotice::ParticipantJoined(id));
            }
            RoomEvent::ParticipantLeft(id) => {
                self.analytics.log_participant(&id, false);
                if self.registry.on_participant_left(&id).await {
                    self.forget_peer(&id).await;
                }
                self.notify(ConferenceNotice::ParticipantLeft(id));
            }
            RoomEvent::SignalReceived { from, payload } => {
                match self.registry.on_signal(&from, payload, &self.media).await {
                    Ok(Some(created)) => self.watch_peer(&created),
                    Ok(None) => {}
                    Err(Error::StaleSignal(peer)) => debug!(peer_id = %peer, "dropped stale signal"),
                    Err(e) => {
                        warn!(peer_id = %from, "signal handling failed: {}", e);
                        // A member left without a connection is reported
                        // the same way as a link that failed on its own.
                        if self.registry.get(&from).is_none()
                            && self.registry.room().contains(&from)
                        {
                            self.forget_peer(&from).await;
                            self.notify(ConferenceNotice::PeerFailed(from));
                        }
                    }
                }
            }
            RoomEvent::StreamControl { user_id, action } => {
                self.notify(ConferenceNotice::RemoteStreamControl { user_id, action });
            }
            RoomEvent::RemoteQuality { user_id, status } => {
                self.notify(ConferenceNotice::RemoteQuality { user_id, status });
            }
            RoomEvent::Identified(id) => {
                self.local.participant_id = id.clone();
                self.registry.set_local_participant_id(id);
            }
            RoomEvent::ConnectionLost => self.notify(ConferenceNotice::ConnectionLost),
            RoomEvent::Reconnected => {
                // The re-issued join rebuilds the mesh from room-users.
                self.registry.clear().await;
                self.quality.clear();
                self.refresh_effective("", AveragedStats::default()).await;
                self.notify(ConferenceNotice::Reconnected);
            }
            RoomEvent::ReconnectFailed => {}
        }
    }

    /// Start the sampler and status watcher for a new connection. Both stop
    /// when the connection's token is cancelled.
    fn watch_peer(&self, peer_id: &str) {
        let Some(peer) = self.registry.get(peer_id) else {
            return;
        };
        let cancel = peer.cancel_token();
        let generation = peer.generation();
        let link = peer.link();

        StatsSampler::spawn(
            peer_id.to_string(),
            generation,
            link.clone(),
            self.config.sampling.interval(),
            cancel.clone(),
            self.samples.clone(),
        );
        spawn_status_watch(
            peer_id.to_string(),
            generation,
            link.status(),
            cancel,
            self.internal.clone(),
        );
    }

    async fn forget_peer(&mut self, peer_id: &str) {
        self.quality.remove_peer(peer_id);
        self.refresh_effective(peer_id, AveragedStats::default()).await;
    }

    // -----------------------------------------------------------------------
    // Quality loop
    // -----------------------------------------------------------------------

    async fn on_sample(&mut self, peer_id: &str, generation: u64, sample: QualitySample) {
        if !self.registry.is_current(peer_id, generation) {
            debug!(peer_id, generation, "dropping sample from a replaced connection");
            return;
        }
        self.analytics.log_sample(&sample);

        let change = self.quality.add_sample(peer_id, sample);
        if let Some(peer) = self.registry.get_mut(peer_id) {
            peer.last_sample = Some(sample);
            if let Some(change) = &change {
                peer.current_quality = change.current;
            }
        }
        if let Some(change) = change {
            self.refresh_effective(peer_id, change.stats).await;
        }
    }

    /// The local stream serves every peer, so it is constrained to the
    /// worst peer level.
    async fn refresh_effective(&mut self, peer_id: &str, stats: AveragedStats) {
        let worst = self.quality.worst_level();
        if worst == self.effective {
            return;
        }
        let previous = self.effective;
        self.effective = worst;
        info!(from = %previous, to = %worst, "effective quality changed");

        self.analytics.log_quality_change(&QualityChange {
            peer_id: peer_id.to_string(),
            previous,
            current: worst,
            stats,
        });
        if let Err(e) = self.applier.apply(worst).await {
            warn!(level = %worst, "constraints not applied: {}", e);
        }
        if let Err(e) = self.signaling.send_quality(worst) {
            warn!("failed to announce quality: {}", e);
        }
        self.notify(ConferenceNotice::EffectiveQualityChanged(worst));
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::ToggleAudio(reply) => {
                let enabled = !self.media.audio.is_enabled();
                self.media.audio.set_enabled(enabled);
                let _ = reply.send(self.announce_toggle(StreamAction::ToggleAudio, enabled));
            }
            Command::ToggleVideo(reply) => {
                let enabled = !self.media.camera.is_enabled();
                self.media.camera.set_enabled(enabled);
                let _ = reply.send(self.announce_toggle(StreamAction::ToggleVideo, enabled));
            }
            Command::ShareScreen(reply) => {
                if self.media.is_sharing_screen() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                if let Err(e) = self.switcher.begin() {
                    let _ = reply.send(Err(e));
                    return;
                }
                let devices = self.switcher.devices();
                let internal = self.internal.clone();
                tokio::spawn(async move {
                    let result = devices.acquire_display().await;
                    let _ = internal.send(Internal::DisplayAcquired { result, reply });
                });
            }
            Command::StopScreenShare(reply) => {
                let was_sharing = self.media.is_sharing_screen();
                let links = self.registry.links();
                let result = self.switcher.switch_to_camera(&links, &mut self.media).await;
                if result.is_ok() && was_sharing {
                    self.analytics.log_interaction(InteractionKind::ScreenShareStopped);
                }
                let _ = reply.send(result);
            }
            Command::StartRecording(reply) => {
                let result = self.recorder.start();
                if result.is_ok() {
                    self.media.audio.attach_tap(self.tap.clone());
                    self.media.active_video().attach_tap(self.tap.clone());
                    self.analytics.log_interaction(InteractionKind::RecordingStarted);
                }
                let _ = reply.send(result);
            }
            Command::StopRecording(reply) => {
                if self.recorder.state() == RecorderState::Idle {
                    let _ = reply.send(Ok(None));
                    return;
                }
                // No frame may land in the tap after its tail is read.
                self.detach_taps();
                let Some(upload) = self.recorder.finalize().await else {
                    let _ = reply.send(Ok(None));
                    return;
                };
                self.analytics.log_interaction(InteractionKind::RecordingStopped);
                self.spawn_delivery(vec![upload], DeliveryReply::Stop(reply));
            }
            Command::RetryUpload(reply) => {
                let pending = self.recorder.take_pending();
                if pending.is_empty() {
                    let _ = reply.send(Ok(0));
                    return;
                }
                self.spawn_delivery(pending, DeliveryReply::Retry(reply));
            }
            Command::DiscardRecording(reply) => {
                let _ = reply.send(self.recorder.discard());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::EffectiveLevel(reply) => {
                let _ = reply.send(self.effective);
            }
            Command::Leave(_) => {}
        }
    }

    fn announce_toggle(&mut self, action: StreamAction, enabled: bool) -> Result<bool> {
        let kind = match action {
            StreamAction::ToggleAudio => InteractionKind::ToggleAudio,
            StreamAction::ToggleVideo => InteractionKind::ToggleVideo,
        };
        self.analytics.log_interaction(kind);
        debug!(?action, enabled, "local track toggled");
        self.signaling.send_stream_control(action)?;
        Ok(enabled)
    }

    fn detach_taps(&self) {
        self.media.audio.detach_taps();
        self.media.camera.detach_taps();
        self.media.active_video().detach_taps();
    }

    /// Upload off the loop; the result comes back as `Internal::Delivered`.
    fn spawn_delivery(&mut self, uploads: Vec<RecordingUpload>, reply: DeliveryReply) {
        let uploader = self.recorder.uploader();
        let internal = self.internal.clone();
        self.deliveries.retain(|task| !task.is_finished());
        self.deliveries.push(tokio::spawn(async move {
            let delivery = deliver(uploader, uploads).await;
            let _ = internal.send(Internal::Delivered { delivery, reply });
        }));
    }

    /// Report a delivery and hand failures back to the recorder.
    fn settle_delivery(&mut self, delivery: Delivery) -> Result<Vec<RecordingUpload>> {
        for upload in &delivery.delivered {
            self.notify(ConferenceNotice::RecordingUploaded {
                session_id: upload.session_id.clone(),
                duration_seconds: upload.duration_seconds,
            });
        }
        let result = self.recorder.settle(delivery);
        if let Err(e) = &result {
            self.notify(ConferenceNotice::RecordingUploadFailed(e.to_string()));
        }
        result
    }

    // -----------------------------------------------------------------------
    // Background results
    // -----------------------------------------------------------------------

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::DisplayAcquired { result, reply } => {
                let links = self.registry.links();
                let outcome = self
                    .switcher
                    .finish_screen_share(result, &links, &mut self.media)
                    .await;
                match &outcome {
                    Ok(()) => {
                        if self.recorder.state() != RecorderState::Idle {
                            self.media.active_video().attach_tap(self.tap.clone());
                        }
                        self.analytics.log_interaction(InteractionKind::ScreenShareStarted);
                    }
                    Err(Error::DeviceAcquisition(msg)) => {
                        self.notify(ConferenceNotice::DeviceError(msg.clone()));
                    }
                    Err(_) => {}
                }
                let _ = reply.send(outcome);
            }
            Internal::PeerFailed { peer_id, generation } => {
                if !self.registry.is_current(&peer_id, generation) {
                    return;
                }
                warn!(%peer_id, "peer connection failed, isolating it");
                self.registry.teardown(&peer_id).await;
                self.forget_peer(&peer_id).await;
                self.notify(ConferenceNotice::PeerFailed(peer_id));
            }
            Internal::Delivered { delivery, reply } => {
                let result = self.settle_delivery(delivery);
                match reply {
                    DeliveryReply::Stop(reply) => {
                        let _ = reply.send(result.map(|mut delivered| delivered.pop()));
                    }
                    DeliveryReply::Retry(reply) => {
                        let _ = reply.send(result.map(|delivered| delivered.len()));
                    }
                }
            }
        }
    }

    async fn on_source_ended(&mut self, track_id: &str) {
        let links = self.registry.links();
        match self
            .switcher
            .on_source_ended(track_id, &links, &mut self.media)
            .await
        {
            Ok(true) => {
                info!("screen source ended, camera restored");
                self.analytics.log_interaction(InteractionKind::ScreenShareStopped);
                self.notify(ConferenceNotice::ScreenShareEnded);
            }
            Ok(false) => {}
            Err(e) => warn!("failed to restore camera after screen share ended: {}", e),
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Wait for uploads still running in the background and fold their
    /// results in, so their callers get a reply and failures are retained.
    async fn await_deliveries(&mut self, internal: &mut mpsc::UnboundedReceiver<Internal>) {
        let tasks = std::mem::take(&mut self.deliveries);
        if tasks.iter().any(|task| !task.is_finished()) {
            debug!(count = tasks.len(), "waiting for recording uploads");
        }
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                warn!("recording upload task failed: {}", e);
            }
        }
        while let Ok(msg) = internal.try_recv() {
            self.on_internal(msg).await;
        }
    }

    async fn shutdown(
        &mut self,
        internal: &mut mpsc::UnboundedReceiver<Internal>,
    ) -> Result<SessionSummary> {
        self.await_deliveries(internal).await;

        // Any running recording plus everything retained gets one last try.
        self.detach_taps();
        let mut batch = self.recorder.take_pending();
        if let Some(upload) = self.recorder.finalize().await {
            batch.push(upload);
        }
        if !batch.is_empty() {
            let delivery = deliver(self.recorder.uploader(), batch).await;
            let _ = self.settle_delivery(delivery);
        }
        let undelivered = self.recorder.take_pending();
        if !undelivered.is_empty() {
            warn!(count = undelivered.len(), "leaving with undelivered recordings");
            self.notify(ConferenceNotice::RecordingsUndelivered(undelivered));
        }

        self.switcher.shutdown();
        self.registry.clear().await;
        self.quality.clear();
        self.signaling.leave().await;

        let summary = self.analytics.end_session()?;
        if let Err(e) = self.summary_sink.submit(&summary).await {
            error!(session_id = %summary.session_id, "failed to submit session summary: {}", e);
        }
        self.notify(ConferenceNotice::SessionEnded(Box::new(summary.clone())));
        Ok(summary)
    }
}

fn spawn_status_watch(
    peer_id: String,
    generation: u64,
    mut status: tokio::sync::watch::Receiver<crate::connection::ConnectionStatus>,
    cancel: CancellationToken,
    internal: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        loop {
            if status.borrow_and_update().state == ConnectionState::Failed {
                let _ = internal.send(Internal::PeerFailed { peer_id, generation });
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    });
}
