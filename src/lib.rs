//! Adaptive mesh conferencing engine for live office-hour sessions.
//!
//! [`orchestrator::ConferenceOrchestrator`] joins a room over a signaling
//! transport, keeps one WebRTC connection per other participant, samples
//! each connection's transport stats and constrains the local video to
//! the worst observed network quality.

pub mod analytics;
pub mod audio;
pub mod clock;
pub mod config;
pub mod connection;
pub mod constraints;
pub mod error;
pub mod media;
pub mod metrics;
pub mod orchestrator;
pub mod peer;
pub mod quality;
pub mod recorder;
pub mod room;
pub mod signaling;
pub mod switcher;
pub mod testing;
pub mod webrtc;

pub use config::ConferenceConfig;
pub use error::{Error, Result};
pub use orchestrator::{ConferenceDeps, ConferenceHandle, ConferenceNotice, ConferenceOrchestrator};
pub use quality::{QualityLevel, QualitySample};
