use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info};

use crate::config::QualityConfig;

/// Network quality bucket. Ordered worst to best, so `High > Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Critical,
    Low,
    Medium,
    High,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Critical => "critical",
            QualityLevel::Low => "low",
            QualityLevel::Medium => "medium",
            QualityLevel::High => "high",
        }
    }

    pub const ALL: [QualityLevel; 4] = [
        QualityLevel::High,
        QualityLevel::Medium,
        QualityLevel::Low,
        QualityLevel::Critical,
    ];
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One network observation for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub timestamp_ms: i64,
    pub round_trip_time_ms: f64,
    pub packet_loss_count: u64,
    pub bitrate_bps: f64,
}

/// Means over the most recent samples, attached to every transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AveragedStats {
    pub round_trip_time_ms: f64,
    pub packet_loss: f64,
    pub bitrate_bps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityChange {
    pub peer_id: String,
    pub previous: QualityLevel,
    pub current: QualityLevel,
    pub stats: AveragedStats,
}

// ─── Scoring ────────────────────────────────────────────────────────────────

pub fn score_rtt(rtt_ms: f64) -> u8 {
    if rtt_ms > 500.0 {
        0
    } else if rtt_ms > 300.0 {
        1
    } else if rtt_ms > 150.0 {
        2
    } else {
        3
    }
}

pub fn score_packet_loss(loss: f64) -> u8 {
    if loss > 10.0 {
        0
    } else if loss > 5.0 {
        1
    } else if loss > 2.0 {
        2
    } else {
        3
    }
}

pub fn score_bitrate(bps: f64) -> u8 {
    if bps < 250_000.0 {
        0
    } else if bps < 750_000.0 {
        1
    } else if bps < 1_500_000.0 {
        2
    } else {
        3
    }
}

/// Map averaged stats to a level by averaging the three 0..=3 scores.
pub fn classify(stats: &AveragedStats) -> QualityLevel {
    let total = score_rtt(stats.round_trip_time_ms) as f64
        + score_packet_loss(stats.packet_loss) as f64
        + score_bitrate(stats.bitrate_bps) as f64;
    let score = total / 3.0;

    if score >= 2.5 {
        QualityLevel::High
    } else if score >= 1.5 {
        QualityLevel::Medium
    } else if score >= 0.5 {
        QualityLevel::Low
    } else {
        QualityLevel::Critical
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PeerQuality {
    window: VecDeque<QualitySample>,
    level: QualityLevel,
    samples_since_change: usize,
    samples_since_evaluation: usize,
}

impl PeerQuality {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            level: QualityLevel::High,
            samples_since_change: 0,
            samples_since_evaluation: 0,
        }
    }

    fn averaged(&self, recent: usize) -> AveragedStats {
        let take = recent.max(1).min(self.window.len());
        if take == 0 {
            return AveragedStats::default();
        }
        let mut acc = AveragedStats::default();
        for s in self.window.iter().rev().take(take) {
            acc.round_trip_time_ms += s.round_trip_time_ms;
            acc.packet_loss += s.packet_loss_count as f64;
            acc.bitrate_bps += s.bitrate_bps;
        }
        let n = take as f64;
        AveragedStats {
            round_trip_time_ms: acc.round_trip_time_ms / n,
            packet_loss: acc.packet_loss / n,
            bitrate_bps: acc.bitrate_bps / n,
        }
    }
}

type ChangeHandler = Box<dyn FnMut(&QualityChange) + Send>;

/// Per-peer rolling window scorer with asymmetric hysteresis.
///
/// Downgrades apply at the next evaluation. Upgrades are held until
/// `upgrade_after_samples` samples have arrived since the last change.
pub struct QualityController {
    config: QualityConfig,
    peers: HashMap<String, PeerQuality>,
    handler: Option<ChangeHandler>,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            handler: None,
        }
    }

    pub fn on_change(&mut self, handler: impl FnMut(&QualityChange) + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Record a sample and return the accepted transition, if any.
    pub fn add_sample(&mut self, peer_id: &str, sample: QualitySample) -> Option<QualityChange> {
        let config = &self.config;
        let state = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(PeerQuality::new);

        state.window.push_back(sample);
        let horizon = sample.timestamp_ms - config.window_ms as i64;
        while state
            .window
            .front()
            .map_or(false, |s| s.timestamp_ms < horizon)
        {
            state.window.pop_front();
        }

        state.samples_since_change += 1;
        state.samples_since_evaluation += 1;
        if state.samples_since_evaluation < config.evaluation_stride.max(1) {
            return None;
        }
        state.samples_since_evaluation = 0;

        if state.window.len() < config.min_samples {
            debug!(peer_id, samples = state.window.len(), "not enough samples to evaluate");
            return None;
        }

        let stats = state.averaged(config.recent_samples);
        let candidate = classify(&stats);
        if candidate == state.level {
            return None;
        }
        if candidate > state.level && state.samples_since_change < config.upgrade_after_samples {
            debug!(
                peer_id,
                current = %state.level,
                candidate = %candidate,
                since_change = state.samples_since_change,
                "holding quality upgrade"
            );
            return None;
        }

        let change = QualityChange {
            peer_id: peer_id.to_string(),
            previous: state.level,
            current: candidate,
            stats,
        };
        state.level = candidate;
        state.samples_since_change = 0;

        info!(
            peer_id,
            from = %change.previous,
            to = %change.current,
            rtt_ms = stats.round_trip_time_ms,
            loss = stats.packet_loss,
            bitrate_bps = stats.bitrate_bps,
            "quality level changed"
        );

        if let Some(handler) = self.handler.as_mut() {
            handler(&change);
        }
        Some(change)
    }

    pub fn level(&self, peer_id: &str) -> Option<QualityLevel> {
        self.peers.get(peer_id).map(|p| p.level)
    }

    /// Lowest level among tracked peers; `High` when none are tracked.
    pub fn worst_level(&self) -> QualityLevel {
        self.peers
            .values()
            .map(|p| p.level)
            .min()
            .unwrap_or(QualityLevel::High)
    }

    pub fn window_len(&self, peer_id: &str) -> usize {
        self.peers.get(peer_id).map_or(0, |p| p.window.len())
    }

    pub fn remove_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const GOOD: (f64, u64, f64) = (50.0, 0, 2_000_000.0);
    const BAD: (f64, u64, f64) = (600.0, 12, 100_000.0);

    fn sample(t: i64, (rtt, loss, bitrate): (f64, u64, f64)) -> QualitySample {
        QualitySample {
            timestamp_ms: t,
            round_trip_time_ms: rtt,
            packet_loss_count: loss,
            bitrate_bps: bitrate,
        }
    }

    fn feed(
        ctl: &mut QualityController,
        start: &mut i64,
        n: usize,
        stats: (f64, u64, f64),
    ) -> Vec<QualityChange> {
        let mut out = Vec::new();
        for _ in 0..n {
            *start += 1000;
            if let Some(c) = ctl.add_sample("p1", sample(*start, stats)) {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn scores_follow_thresholds() {
        assert_eq!(score_rtt(501.0), 0);
        assert_eq!(score_rtt(301.0), 1);
        assert_eq!(score_rtt(151.0), 2);
        assert_eq!(score_rtt(150.0), 3);
        assert_eq!(score_packet_loss(11.0), 0);
        assert_eq!(score_packet_loss(2.0), 3);
        assert_eq!(score_bitrate(249_999.0), 0);
        assert_eq!(score_bitrate(1_500_000.0), 3);
    }

    #[test]
    fn steady_good_network_stays_high() {
        let mut ctl = QualityController::new(QualityConfig::default());
        let mut t = 0;
        assert!(feed(&mut ctl, &mut t, 5, GOOD).is_empty());
        assert_eq!(ctl.level("p1"), Some(QualityLevel::High));
    }

    #[test]
    fn collapse_emits_single_high_to_critical() {
        let mut ctl = QualityController::new(QualityConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctl.on_change(move |c| sink.lock().unwrap().push(c.clone()));

        let mut t = 0;
        assert!(feed(&mut ctl, &mut t, 5, GOOD).is_empty());
        let changes = feed(&mut ctl, &mut t, 5, BAD);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, QualityLevel::High);
        assert_eq!(changes[0].current, QualityLevel::Critical);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn insufficient_samples_is_noop() {
        let cfg = QualityConfig {
            evaluation_stride: 1,
            ..QualityConfig::default()
        };
        let mut ctl = QualityController::new(cfg);
        let mut t = 0;
        assert!(feed(&mut ctl, &mut t, 2, BAD).is_empty());
        assert_eq!(feed(&mut ctl, &mut t, 1, BAD).len(), 1);
    }

    #[test]
    fn upgrade_waits_for_sustained_recovery() {
        let mut ctl = QualityController::new(QualityConfig::default());
        let mut t = 0;
        feed(&mut ctl, &mut t, 5, BAD);
        assert_eq!(ctl.level("p1"), Some(QualityLevel::Critical));

        // Five good samples: evaluation sees a full good window but only
        // five samples since the change.
        assert!(feed(&mut ctl, &mut t, 5, GOOD).is_empty());
        let changes = feed(&mut ctl, &mut t, 5, GOOD);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].current, QualityLevel::High);
    }

    #[test]
    fn upgrades_never_precede_threshold_with_per_sample_evaluation() {
        let cfg = QualityConfig {
            evaluation_stride: 1,
            ..QualityConfig::default()
        };
        let mut ctl = QualityController::new(cfg.clone());
        let pattern = [BAD, GOOD, GOOD, BAD, GOOD, GOOD, GOOD, BAD, GOOD];
        let mut since_change = 0usize;
        let mut t = 0i64;
        for i in 0..200 {
            t += 1000;
            since_change += 1;
            let stats = pattern[(i * 7 + i / 3) % pattern.len()];
            if let Some(c) = ctl.add_sample("p1", sample(t, stats)) {
                if c.current > c.previous {
                    assert!(since_change >= cfg.upgrade_after_samples);
                }
                since_change = 0;
            }
        }
    }

    #[test]
    fn window_evicts_old_samples() {
        let cfg = QualityConfig {
            window_ms: 10_000,
            ..QualityConfig::default()
        };
        let mut ctl = QualityController::new(cfg);
        let mut t = 0;
        feed(&mut ctl, &mut t, 30, GOOD);
        assert_eq!(ctl.window_len("p1"), 11);
    }

    #[test]
    fn peers_are_independent() {
        let mut ctl = QualityController::new(QualityConfig::default());
        for i in 0..5 {
            ctl.add_sample("good", sample(i * 1000, GOOD));
            ctl.add_sample("bad", sample(i * 1000, BAD));
        }
        assert_eq!(ctl.level("good"), Some(QualityLevel::High));
        assert_eq!(ctl.level("bad"), Some(QualityLevel::Critical));
        assert_eq!(ctl.worst_level(), QualityLevel::Critical);

        ctl.remove_peer("bad");
        assert_eq!(ctl.worst_level(), QualityLevel::High);
    }
}
