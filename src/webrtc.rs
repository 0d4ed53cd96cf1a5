use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::TrackLocal;

use crate::config::IceConfig;
use crate::connection::{ConnectionMonitor, ConnectionState, ConnectionStatus};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalTrack};
use crate::metrics::RawStats;
use crate::peer::{NegotiationRole, OutboundSignal, PeerLink, PeerLinkFactory, SignalSink};
use crate::signaling::SignalPayload;

/// Builds webrtc-rs peer connections that share one API instance.
pub struct RtcPeerLinkFactory {
    api: Arc<API>,
    config: RTCConfiguration,
}

impl RtcPeerLinkFactory {
    pub fn new(ice: &IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice.stun_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self {
            api: Arc::new(api),
            config,
        })
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(
        &self,
        remote_id: &str,
        role: NegotiationRole,
        media: &LocalMedia,
        signals: SignalSink,
    ) -> Result<Arc<dyn PeerLink>> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        pc.add_track(media.audio.rtc() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let video_sender = pc
            .add_track(media.active_video().rtc() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let monitor = ConnectionMonitor::new(remote_id);
        register_callbacks(&pc, remote_id, &monitor, signals);
        debug!(peer_id = remote_id, ?role, "webrtc peer connection built");

        Ok(Arc::new(RtcPeerLink {
            remote_id: remote_id.to_string(),
            pc,
            video_sender,
            monitor,
        }))
    }
}

fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    remote_id: &str,
    monitor: &ConnectionMonitor,
    signals: SignalSink,
) {
    let target = remote_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let signals = signals.clone();
        let target = target.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = signals.send(OutboundSignal {
                        target,
                        payload: SignalPayload::Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    });
                }
                Err(e) => warn!(peer_id = %target, "failed to serialize ICE candidate: {}", e),
            }
        })
    }));

    let m = monitor.clone();
    let peer_id = remote_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let m = m.clone();
        let peer_id = peer_id.clone();
        Box::pin(async move {
            m.update_peer_state(s);
            info!(%peer_id, state = %s, "peer connection state changed");
        })
    }));

    let m = monitor.clone();
    pc.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
        let m = m.clone();
        Box::pin(async move {
            m.update_signaling_state(s);
        })
    }));

    let m = monitor.clone();
    let peer_id = remote_id.to_string();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        let m = m.clone();
        let peer_id = peer_id.clone();
        Box::pin(async move {
            m.update_ice_state(s);
            debug!(%peer_id, state = %s, "ICE connection state changed");
        })
    }));

    let peer_id = remote_id.to_string();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let peer_id = peer_id.clone();
        Box::pin(async move {
            info!(%peer_id, kind = %track.kind(), track_id = %track.id(), "remote track received");
            // Rendering is external; keep the receive pipeline drained.
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        })
    }));
}

/// A `PeerLink` over one `RTCPeerConnection`.
pub struct RtcPeerLink {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    monitor: ConnectionMonitor,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SignalPayload> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SignalPayload::Offer { sdp: offer.sdp })
    }

    async fn accept_offer(&self, offer: &SignalPayload) -> Result<SignalPayload> {
        let SignalPayload::Offer { sdp } = offer else {
            return Err(Error::InvalidState("expected an offer".into()));
        };
        self.pc
            .set_remote_description(RTCSessionDescription::offer(sdp.clone())?)
            .await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SignalPayload::Answer { sdp: answer.sdp })
    }

    async fn apply_signal(&self, payload: &SignalPayload) -> Result<()> {
        match payload {
            SignalPayload::Answer { sdp } => {
                self.pc
                    .set_remote_description(RTCSessionDescription::answer(sdp.clone())?)
                    .await?;
            }
            SignalPayload::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.pc
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: candidate.clone(),
                        sdp_mid: sdp_mid.clone(),
                        sdp_mline_index: *sdp_mline_index,
                        username_fragment: None,
                    })
                    .await?;
            }
            SignalPayload::Offer { .. } => {
                return Err(Error::InvalidState("offers are handled by accept_offer".into()));
            }
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        self.video_sender
            .replace_track(Some(track.rtc() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        debug!(peer_id = %self.remote_id, track_id = %track.id(), "outbound video replaced");
        Ok(())
    }

    async fn stats(&self) -> Result<Option<RawStats>> {
        let report = self.pc.get_stats().await;
        Ok(Some(extract_raw_stats(
            &report,
            chrono::Utc::now().timestamp_millis(),
        )))
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.monitor.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.monitor.update_state(ConnectionState::Closed);
        self.pc.close().await?;
        Ok(())
    }
}

/// Pull the metrics the sampler needs out of a stats report. Fields the
/// report lacks stay `None`.
fn extract_raw_stats(report: &StatsReport, timestamp_ms: i64) -> RawStats {
    let mut raw = RawStats {
        timestamp_ms,
        ..Default::default()
    };

    for stat in report.reports.values() {
        match stat {
            StatsReportType::CandidatePair(cp) if cp.state == CandidatePairState::Succeeded => {
                raw.round_trip_time_ms = Some(cp.current_round_trip_time * 1000.0);
            }
            StatsReportType::InboundRTP(inbound) if inbound.kind == "video" => {
                *raw.bytes_received.get_or_insert(0) += inbound.bytes_received;
            }
            StatsReportType::RemoteInboundRTP(remote) if remote.kind == "video" => {
                *raw.packets_lost.get_or_insert(0) += remote.packets_lost.max(0) as u64;
            }
            _ => {}
        }
    }
    raw
}
