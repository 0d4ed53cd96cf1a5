use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// Coarse transport state of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Transient loss; ICE may still recover.
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// No further media will flow on this connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn from_ice(state: RTCIceConnectionState) -> Option<ConnectionState> {
    match state {
        RTCIceConnectionState::Checking => Some(ConnectionState::Connecting),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(ConnectionState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

// Only terminal peer states override the ICE-derived state.
fn from_peer(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub peer_id: String,
    pub state: ConnectionState,
    pub signaling_state: RTCSignalingState,
    pub ice_state: RTCIceConnectionState,
    pub peer_state: RTCPeerConnectionState,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    fn new(peer_id: String) -> Self {
        Self {
            peer_id,
            state: ConnectionState::Connecting,
            signaling_state: RTCSignalingState::Stable,
            ice_state: RTCIceConnectionState::New,
            peer_state: RTCPeerConnectionState::New,
            last_error: None,
        }
    }
}

/// Per-peer transport status, published through a `watch` channel.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl ConnectionMonitor {
    pub fn new(peer_id: impl Into<String>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::new(peer_id.into()));
        Self {
            status: Arc::new(status),
        }
    }

    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }

    pub fn update_signaling_state(&self, state: RTCSignalingState) {
        self.status.send_modify(|status| status.signaling_state = state);
    }

    pub fn update_ice_state(&self, state: RTCIceConnectionState) {
        self.status.send_modify(|status| {
            status.ice_state = state;
            // A closed or failed connection does not come back through ICE.
            if !status.state.is_terminal() {
                if let Some(mapped) = from_ice(state) {
                    status.state = mapped;
                }
            }
        });
    }

    pub fn update_peer_state(&self, state: RTCPeerConnectionState) {
        self.status.send_modify(|status| {
            status.peer_state = state;
            if let Some(mapped) = from_peer(state) {
                status.state = mapped;
            }
        });
    }

    pub fn set_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.status.send_modify(|status| {
            status.last_error = Some(error);
            status.state = ConnectionState::Failed;
        });
    }

    pub fn current(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}
