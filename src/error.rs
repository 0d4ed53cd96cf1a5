use thiserror::Error as ThisError;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Camera, microphone or display surface unavailable or denied.
    #[error("device acquisition failed: {0}")]
    DeviceAcquisition(String),

    #[error("signaling transport error: {0}")]
    SignalingTransport(String),

    /// Signal for a peer that is unknown or already gone.
    #[error("stale signal from {0}")]
    StaleSignal(String),

    #[error("failed to apply media constraints: {0}")]
    ConstraintApplication(String),

    #[error("recording upload failed: {0}")]
    RecordingUpload(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conference is no longer running")]
    ChannelClosed,

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Transient failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingTransport(_) | Error::Ws(_) | Error::RecordingUpload(_) | Error::Http(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

pub type Result<T> = std::result::Result<T, Error>;
