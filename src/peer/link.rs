use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::connection::ConnectionStatus;
use crate::error::Result;
use crate::media::{LocalMedia, LocalTrack};
use crate::metrics::RawStats;
use crate::signaling::SignalPayload;

/// Which side of the offer/answer exchange this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

/// A payload to relay to one remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub target: String,
    pub payload: SignalPayload,
}

pub type SignalSink = mpsc::UnboundedSender<OutboundSignal>;

/// Transport for one direct connection to a remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produce and apply the local offer.
    async fn create_offer(&self) -> Result<SignalPayload>;

    /// Apply a remote offer and produce the answer.
    async fn accept_offer(&self, offer: &SignalPayload) -> Result<SignalPayload>;

    /// Apply an answer or a trickled ICE candidate.
    async fn apply_signal(&self, payload: &SignalPayload) -> Result<()>;

    /// Swap the outbound video track without renegotiating.
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()>;

    /// Current transport counters; `None` when no report is available.
    async fn stats(&self) -> Result<Option<RawStats>>;

    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    async fn close(&self) -> Result<()>;
}

/// Creates links carrying the local stream. Signals the link generates on
/// its own (ICE candidates) go to `signals`.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(
        &self,
        remote_id: &str,
        role: NegotiationRole,
        media: &LocalMedia,
        signals: SignalSink,
    ) -> Result<Arc<dyn PeerLink>>;
}
