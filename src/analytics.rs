use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::quality::{AveragedStats, QualityChange, QualityLevel, QualitySample};

/// Transitions closer together than this count as rapid.
pub const RAPID_TRANSITION_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    ToggleAudio,
    ToggleVideo,
    ScreenShareStarted,
    ScreenShareStopped,
    RecordingStarted,
    RecordingStopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEventKind {
    SessionStarted,
    #[serde(rename_all = "camelCase")]
    QualityChanged {
        peer_id: String,
        previous: QualityLevel,
        current: QualityLevel,
    },
    Interaction {
        kind: InteractionKind,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        participant_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        participant_id: String,
    },
    SessionEnded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub at_ms: i64,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityDurations {
    pub high_ms: i64,
    pub medium_ms: i64,
    pub low_ms: i64,
    pub critical_ms: i64,
}

impl QualityDurations {
    fn add(&mut self, level: QualityLevel, ms: i64) {
        match level {
            QualityLevel::High => self.high_ms += ms,
            QualityLevel::Medium => self.medium_ms += ms,
            QualityLevel::Low => self.low_ms += ms,
            QualityLevel::Critical => self.critical_ms += ms,
        }
    }

    pub fn total_ms(&self) -> i64 {
        self.high_ms + self.medium_ms + self.low_ms + self.critical_ms
    }
}

/// The document handed to the analytics endpoint at session end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub room_id: String,
    pub participant_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub duration_ms: i64,
    pub time_in_quality: QualityDurations,
    pub average_network: AveragedStats,
    pub sample_count: u64,
    pub quality_transitions: usize,
    pub rapid_transitions: usize,
    pub stability_percentage: f64,
    pub interactions: BTreeMap<InteractionKind, u64>,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    at_ms: i64,
    current: QualityLevel,
}

#[derive(Debug)]
struct ActiveSession {
    session_id: String,
    room_id: String,
    participant_id: String,
    started_at_ms: i64,
    transitions: Vec<Transition>,
    rtt_sum: f64,
    loss_sum: f64,
    bitrate_sum: f64,
    sample_count: u64,
    interactions: BTreeMap<InteractionKind, u64>,
    events: Vec<SessionEvent>,
}

/// Builds the session summary incrementally. The summary is produced
/// exactly once per session.
pub struct SessionAnalytics {
    clock: Arc<dyn Clock>,
    session: Option<ActiveSession>,
}

impl SessionAnalytics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, session: None }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    /// Begin a session; returns its generated id.
    pub fn start_session(&mut self, room_id: &str, participant_id: &str) -> Result<String> {
        if self.session.is_some() {
            return Err(Error::InvalidState("analytics session already started".into()));
        }
        let now = self.clock.now_ms();
        let session_id = uuid::Uuid::new_v4().to_string();
        info!(%session_id, room_id, participant_id, "analytics session started");
        self.session = Some(ActiveSession {
            session_id: session_id.clone(),
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
            started_at_ms: now,
            transitions: Vec::new(),
            rtt_sum: 0.0,
            loss_sum: 0.0,
            bitrate_sum: 0.0,
            sample_count: 0,
            interactions: BTreeMap::new(),
            events: vec![SessionEvent {
                at_ms: now,
                kind: SessionEventKind::SessionStarted,
            }],
        });
        Ok(session_id)
    }

    pub fn log_quality_change(&mut self, change: &QualityChange) {
        let now = self.clock.now_ms();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.transitions.push(Transition {
            at_ms: now,
            current: change.current,
        });
        session.events.push(SessionEvent {
            at_ms: now,
            kind: SessionEventKind::QualityChanged {
                peer_id: change.peer_id.clone(),
                previous: change.previous,
                current: change.current,
            },
        });
    }

    pub fn log_sample(&mut self, sample: &QualitySample) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.rtt_sum += sample.round_trip_time_ms;
        session.loss_sum += sample.packet_loss_count as f64;
        session.bitrate_sum += sample.bitrate_bps;
        session.sample_count += 1;
    }

    pub fn log_interaction(&mut self, kind: InteractionKind) {
        let now = self.clock.now_ms();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        *session.interactions.entry(kind).or_insert(0) += 1;
        session.events.push(SessionEvent {
            at_ms: now,
            kind: SessionEventKind::Interaction { kind },
        });
    }

    pub fn log_participant(&mut self, participant_id: &str, joined: bool) {
        let now = self.clock.now_ms();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let participant_id = participant_id.to_string();
        let kind = if joined {
            SessionEventKind::ParticipantJoined { participant_id }
        } else {
            SessionEventKind::ParticipantLeft { participant_id }
        };
        session.events.push(SessionEvent { at_ms: now, kind });
    }

    /// Close the session and produce its summary. A second call fails
    /// with `InvalidState`.
    pub fn end_session(&mut self) -> Result<SessionSummary> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::InvalidState("no active analytics session".into()))?;

        let started = session.started_at_ms;
        let ended = self.clock.now_ms().max(started);
        session.events.push(SessionEvent {
            at_ms: ended,
            kind: SessionEventKind::SessionEnded,
        });

        let time_in_quality = time_in_quality(started, ended, &session.transitions);
        let total = session.transitions.len();
        let rapid = rapid_transitions(&session.transitions);
        let stability_percentage = if total == 0 {
            100.0
        } else {
            100.0 - (rapid as f64 / total as f64 * 100.0)
        };
        let average_network = if session.sample_count == 0 {
            AveragedStats::default()
        } else {
            let n = session.sample_count as f64;
            AveragedStats {
                round_trip_time_ms: session.rtt_sum / n,
                packet_loss: session.loss_sum / n,
                bitrate_bps: session.bitrate_sum / n,
            }
        };

        let summary = SessionSummary {
            session_id: session.session_id,
            room_id: session.room_id,
            participant_id: session.participant_id,
            started_at_ms: started,
            ended_at_ms: ended,
            duration_ms: ended - started,
            time_in_quality,
            average_network,
            sample_count: session.sample_count,
            quality_transitions: total,
            rapid_transitions: rapid,
            stability_percentage,
            interactions: session.interactions,
            events: session.events,
        };
        info!(
            session_id = %summary.session_id,
            duration_ms = summary.duration_ms,
            transitions = total,
            stability = summary.stability_percentage,
            "analytics session ended"
        );
        Ok(summary)
    }
}

/// Attribute each interval between changes to the level active during it.
/// Sessions start at `High`; change times are clamped into the session.
fn time_in_quality(started: i64, ended: i64, transitions: &[Transition]) -> QualityDurations {
    let mut durations = QualityDurations::default();
    let mut level = QualityLevel::High;
    let mut cursor = started;
    for t in transitions {
        let at = t.at_ms.clamp(cursor, ended);
        durations.add(level, at - cursor);
        level = t.current;
        cursor = at;
    }
    durations.add(level, ended - cursor);
    durations
}

fn rapid_transitions(transitions: &[Transition]) -> usize {
    transitions
        .windows(2)
        .filter(|pair| pair[1].at_ms - pair[0].at_ms < RAPID_TRANSITION_MS)
        .count()
}

/// Receives the finished summary.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn submit(&self, summary: &SessionSummary) -> Result<()>;
}

/// POSTs the summary as JSON to the analytics endpoint.
pub struct HttpSummarySink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSummarySink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SummarySink for HttpSummarySink {
    async fn submit(&self, summary: &SessionSummary) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(summary)
            .send()
            .await?
            .error_for_status()?;
        debug!(status = %response.status(), "session summary submitted");
        Ok(())
    }
}
