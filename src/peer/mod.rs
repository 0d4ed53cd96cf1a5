mod link;

pub use link::{NegotiationRole, OutboundSignal, PeerLink, PeerLinkFactory, SignalSink};

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::LocalMedia;
use crate::quality::{QualityLevel, QualitySample};
use crate::room::{LocalParticipant, Participant, Room};
use crate::signaling::SignalPayload;

/// A live connection to one remote participant.
pub struct PeerConnection {
    pub remote_participant_id: String,
    pub role: NegotiationRole,
    pub current_quality: QualityLevel,
    pub last_sample: Option<QualitySample>,
    generation: u64,
    link: Arc<dyn PeerLink>,
    cancel: CancellationToken,
}

impl PeerConnection {
    pub fn link(&self) -> Arc<dyn PeerLink> {
        self.link.clone()
    }

    /// Distinguishes this connection from earlier ones to the same peer.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fires when the connection is torn down; owns the peer's timers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            remote_participant_id: self.remote_participant_id.clone(),
            role: self.role,
            current_quality: self.current_quality,
            last_sample: self.last_sample,
        }
    }
}

/// Serialisable view of a `PeerConnection`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub remote_participant_id: String,
    pub role: NegotiationRole,
    pub current_quality: QualityLevel,
    pub last_sample: Option<QualitySample>,
}

/// Owns the mesh: one connection per other room member.
///
/// Members reported as already present at join time are dialled by us.
/// Members that join later dial us, so for those we wait for their offer.
pub struct PeerRegistry {
    local: LocalParticipant,
    room: Room,
    factory: Arc<dyn PeerLinkFactory>,
    signals: SignalSink,
    peers: HashMap<String, PeerConnection>,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new(
        local: LocalParticipant,
        room_id: &str,
        factory: Arc<dyn PeerLinkFactory>,
        signals: SignalSink,
    ) -> Self {
        Self {
            local,
            room: Room::new(room_id),
            factory,
            signals,
            peers: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn set_local_participant_id(&mut self, participant_id: String) {
        self.local.participant_id = participant_id;
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().map(PeerConnection::info).collect();
        peers.sort_by(|a, b| a.remote_participant_id.cmp(&b.remote_participant_id));
        peers
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerConnection> {
        self.peers.get_mut(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// True if `peer_id` is still served by the connection `generation`.
    pub fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.peers
            .get(peer_id)
            .map_or(false, |p| p.generation == generation)
    }

    pub fn links(&self) -> Vec<(String, Arc<dyn PeerLink>)> {
        let mut links: Vec<_> = self
            .peers
            .values()
            .map(|p| (p.remote_participant_id.clone(), p.link.clone()))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links
    }

    /// Dial every participant already in the room. Returns the ids of the
    /// connections created.
    pub async fn on_existing_participants(
        &mut self,
        participants: Vec<Participant>,
        media: &LocalMedia,
    ) -> Vec<String> {
        let mut created = Vec::new();
        for participant in participants {
            if self.local.is_self(&participant) {
                continue;
            }
            let id = participant.participant_id.clone();
            self.room.add_participant(participant);
            if self.peers.contains_key(&id) {
                continue;
            }

            match self.open_initiator(&id, media).await {
                Ok(()) => created.push(id),
                Err(e) => warn!(peer_id = %id, "failed to dial existing participant: {}", e),
            }
        }
        created
    }

    async fn open_initiator(&mut self, id: &str, media: &LocalMedia) -> Result<()> {
        let link = self
            .factory
            .create(id, NegotiationRole::Initiator, media, self.signals.clone())
            .await?;
        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };
        self.insert(id, NegotiationRole::Initiator, link);
        self.send(id, offer);
        Ok(())
    }

    /// A new member arrived; they will send us an offer.
    pub fn on_participant_joined(&mut self, participant: Participant) {
        if self.local.is_self(&participant) {
            return;
        }
        debug!(peer_id = %participant.participant_id, "participant joined, awaiting offer");
        self.room.add_participant(participant);
    }

    /// Returns true when a connection was torn down.
    pub async fn on_participant_left(&mut self, participant_id: &str) -> bool {
        self.room.remove_participant(participant_id);
        self.teardown(participant_id).await
    }

    /// Route a signaling payload. An offer from a member we have no
    /// connection to opens a responder connection and returns its id.
    ///
    /// Payloads for unknown or departed peers fail with `StaleSignal`.
    pub async fn on_signal(
        &mut self,
        from: &str,
        payload: SignalPayload,
        media: &LocalMedia,
    ) -> Result<Option<String>> {
        if payload.is_offer() {
            return self.handle_offer(from, payload, media).await;
        }

        let link = match self.peers.get(from) {
            Some(peer) => peer.link.clone(),
            None => return Err(Error::StaleSignal(from.to_string())),
        };
        if let Err(e) = link.apply_signal(&payload).await {
            // One unusable candidate does not sink the connection; ICE
            // continues with the others.
            if matches!(payload, SignalPayload::Candidate { .. }) {
                warn!(peer_id = %from, "ignoring rejected ICE candidate: {}", e);
                return Ok(None);
            }
            warn!(peer_id = %from, "failed to apply signal: {}", e);
            self.teardown(from).await;
            return Err(e);
        }
        Ok(None)
    }

    async fn handle_offer(
        &mut self,
        from: &str,
        offer: SignalPayload,
        media: &LocalMedia,
    ) -> Result<Option<String>> {
        if let Some(peer) = self.peers.get(from) {
            if peer.role == NegotiationRole::Initiator {
                // They were in our existing-participants list; we dial them.
                warn!(peer_id = %from, "dropping offer from a peer we initiated to");
                return Err(Error::StaleSignal(from.to_string()));
            }
            let link = peer.link.clone();
            return match link.accept_offer(&offer).await {
                Ok(answer) => {
                    debug!(peer_id = %from, "renegotiated");
                    self.send(from, answer);
                    Ok(None)
                }
                Err(e) => {
                    self.teardown(from).await;
                    Err(e)
                }
            };
        }

        if !self.room.contains(from) {
            return Err(Error::StaleSignal(from.to_string()));
        }

        let link = self
            .factory
            .create(from, NegotiationRole::Responder, media, self.signals.clone())
            .await?;
        let answer = match link.accept_offer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };
        self.insert(from, NegotiationRole::Responder, link);
        self.send(from, answer);
        Ok(Some(from.to_string()))
    }

    fn insert(&mut self, id: &str, role: NegotiationRole, link: Arc<dyn PeerLink>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        info!(peer_id = %id, ?role, generation, "peer connection created");
        self.peers.insert(
            id.to_string(),
            PeerConnection {
                remote_participant_id: id.to_string(),
                role,
                current_quality: QualityLevel::High,
                last_sample: None,
                generation,
                link,
                cancel: CancellationToken::new(),
            },
        );
    }

    fn send(&self, target: &str, payload: SignalPayload) {
        let signal = OutboundSignal {
            target: target.to_string(),
            payload,
        };
        if self.signals.send(signal).is_err() {
            debug!(peer_id = %target, "signal sink closed");
        }
    }

    /// Close and forget the connection to `peer_id`. No-op when absent.
    pub async fn teardown(&mut self, peer_id: &str) -> bool {
        let Some(peer) = self.peers.remove(peer_id) else {
            return false;
        };
        peer.cancel.cancel();
        if let Err(e) = peer.link.close().await {
            warn!(peer_id, "error closing peer connection: {}", e);
        }
        info!(peer_id, generation = peer.generation, "peer connection removed");
        true
    }

    /// Tear down every connection and forget membership. Links are closed
    /// concurrently.
    pub async fn clear(&mut self) {
        let peers: Vec<PeerConnection> = self.peers.drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.cancel.cancel();
        }
        let closed = join_all(peers.iter().map(|p| p.link.close())).await;
        for (peer, result) in peers.iter().zip(closed) {
            if let Err(e) = result {
                warn!(peer_id = %peer.remote_participant_id, "error closing peer connection: {}", e);
            }
        }
        if !peers.is_empty() {
            info!(count = peers.len(), "all peer connections removed");
        }
        self.room.clear();
    }
}
