use serde::{Deserialize, Serialize};

use crate::quality::QualityLevel;
use crate::room::ParticipantRole;

/// Negotiation data exchanged between two peers through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
}

impl SignalPayload {
    pub fn is_offer(&self) -> bool {
        matches!(self, SignalPayload::Offer { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamAction {
    ToggleAudio,
    ToggleVideo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUser {
    pub socket_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<ParticipantRole>,
}

/// Every message carried by the room channel, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        user_id: String,
        user_type: ParticipantRole,
    },
    #[serde(rename = "room-users", rename_all = "camelCase")]
    RoomUsers {
        users: Vec<RoomUser>,
        /// The recipient's own socket id, when the relay reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_id: Option<String>,
    },
    #[serde(rename = "user-joined", rename_all = "camelCase")]
    UserJoined {
        socket_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<SignalPayload>,
    },
    #[serde(rename = "signal", rename_all = "camelCase")]
    Signal {
        user_to_signal: String,
        caller_id: String,
        signal: SignalPayload,
    },
    #[serde(rename = "user-left", rename_all = "camelCase")]
    UserLeft { socket_id: String },
    #[serde(rename = "stream-control", rename_all = "camelCase")]
    StreamControl {
        room_id: String,
        action: StreamAction,
        user_id: String,
    },
    #[serde(rename = "connection:quality", rename_all = "camelCase")]
    ConnectionQuality {
        room_id: String,
        user_id: String,
        status: QualityLevel,
    },
}
