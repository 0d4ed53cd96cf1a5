use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::peer::PeerLink;
use crate::quality::QualitySample;

/// Transport counters read from one stats report.
///
/// `None` fields were missing from the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStats {
    pub timestamp_ms: i64,
    /// Round-trip time of the succeeded candidate pair.
    pub round_trip_time_ms: Option<f64>,
    /// Cumulative inbound video bytes.
    pub bytes_received: Option<u64>,
    /// Cumulative video packets lost.
    pub packets_lost: Option<u64>,
}

/// Turns successive stats reports for one peer into `QualitySample`s.
#[derive(Debug, Default)]
pub struct StatsSampler {
    previous: Option<RawStats>,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when the report lacks the counters we score on; such
    /// reports are skipped rather than recorded as zeros.
    pub fn sample(&mut self, report: RawStats) -> Option<QualitySample> {
        let rtt = report.round_trip_time_ms?;
        let bytes = report.bytes_received?;
        let lost = report.packets_lost.unwrap_or(0);

        let (bitrate_bps, loss) = match self.previous {
            Some(prev) => {
                let elapsed_ms = report.timestamp_ms - prev.timestamp_ms;
                let prev_bytes = prev.bytes_received.unwrap_or(0);
                let bitrate = if elapsed_ms > 0 {
                    8.0 * bytes.saturating_sub(prev_bytes) as f64 * 1000.0 / elapsed_ms as f64
                } else {
                    0.0
                };
                (bitrate, lost.saturating_sub(prev.packets_lost.unwrap_or(0)))
            }
            None => (0.0, lost),
        };
        self.previous = Some(report);

        Some(QualitySample {
            timestamp_ms: report.timestamp_ms,
            round_trip_time_ms: rtt,
            packet_loss_count: loss,
            bitrate_bps,
        })
    }

    /// Poll `link` every `period` until `cancel` fires, forwarding samples
    /// tagged with the peer id and connection generation.
    pub fn spawn(
        peer_id: String,
        generation: u64,
        link: Arc<dyn PeerLink>,
        period: Duration,
        cancel: CancellationToken,
        samples: mpsc::UnboundedSender<(String, u64, QualitySample)>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sampler = StatsSampler::new();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let report = tokio::select! {
                    _ = cancel.cancelled() => break,
                    report = link.stats() => report,
                };
                match report {
                    Ok(Some(raw)) => match sampler.sample(raw) {
                        Some(sample) => {
                            debug!(
                                peer_id = %peer_id,
                                rtt_ms = sample.round_trip_time_ms,
                                loss = sample.packet_loss_count,
                                bitrate_bps = sample.bitrate_bps,
                                "stats sampled"
                            );
                            if samples.send((peer_id.clone(), generation, sample)).is_err() {
                                break;
                            }
                        }
                        None => debug!(peer_id = %peer_id, "incomplete stats report skipped"),
                    },
                    Ok(None) => debug!(peer_id = %peer_id, "no stats available"),
                    Err(e) => debug!(peer_id = %peer_id, "stats query failed: {}", e),
                }
            }
            debug!(peer_id = %peer_id, "stats sampling stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeerLink;

    fn report(t: i64, rtt: f64, bytes: u64, lost: u64) -> RawStats {
        RawStats {
            timestamp_ms: t,
            round_trip_time_ms: Some(rtt),
            bytes_received: Some(bytes),
            packets_lost: Some(lost),
        }
    }

    #[test]
    fn first_sample_has_zero_bitrate() {
        let mut sampler = StatsSampler::new();
        let s = sampler.sample(report(1000, 42.0, 50_000, 3)).unwrap();
        assert_eq!(s.bitrate_bps, 0.0);
        assert_eq!(s.packet_loss_count, 3);
        assert_eq!(s.round_trip_time_ms, 42.0);
    }

    #[test]
    fn bitrate_and_loss_are_deltas() {
        let mut sampler = StatsSampler::new();
        sampler.sample(report(0, 40.0, 0, 2)).unwrap();
        let s = sampler.sample(report(5000, 40.0, 625_000, 7)).unwrap();
        assert_eq!(s.bitrate_bps, 1_000_000.0);
        assert_eq!(s.packet_loss_count, 5);
    }

    #[test]
    fn incomplete_reports_are_skipped() {
        let mut sampler = StatsSampler::new();
        let missing_rtt = RawStats {
            round_trip_time_ms: None,
            ..report(0, 0.0, 10, 0)
        };
        assert!(sampler.sample(missing_rtt).is_none());

        // The skipped report must not become the bitrate baseline.
        let s = sampler.sample(report(1000, 30.0, 1000, 0)).unwrap();
        assert_eq!(s.bitrate_bps, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sampling_stops_on_cancel() {
        let link = FakePeerLink::new("p1");
        link.push_stats(report(0, 20.0, 0, 0));
        link.push_stats(report(5000, 20.0, 1_250_000, 0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = StatsSampler::spawn(
            "p1".into(),
            7,
            link.clone(),
            Duration::from_secs(5),
            cancel.clone(),
            tx,
        );

        let (peer, generation, first) = rx.recv().await.unwrap();
        assert_eq!((peer.as_str(), generation), ("p1", 7));
        assert_eq!(first.bitrate_bps, 0.0);
        let (_, _, second) = rx.recv().await.unwrap();
        assert_eq!(second.bitrate_bps, 2_000_000.0);

        cancel.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
