use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::quality::QualityLevel;

/// Capture and encoder parameters for the outbound video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub max_bitrate_bps: u64,
}

/// Fixed mapping from quality level to constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraintProfile {
    pub high: MediaConstraints,
    pub medium: MediaConstraints,
    pub low: MediaConstraints,
    pub critical: MediaConstraints,
}

impl Default for MediaConstraintProfile {
    fn default() -> Self {
        Self {
            high: MediaConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
                max_bitrate_bps: 2_500_000,
            },
            medium: MediaConstraints {
                width: 960,
                height: 540,
                frame_rate: 24,
                max_bitrate_bps: 1_200_000,
            },
            low: MediaConstraints {
                width: 640,
                height: 360,
                frame_rate: 15,
                max_bitrate_bps: 500_000,
            },
            critical: MediaConstraints {
                width: 320,
                height: 180,
                frame_rate: 10,
                max_bitrate_bps: 150_000,
            },
        }
    }
}

impl MediaConstraintProfile {
    pub fn for_level(&self, level: QualityLevel) -> MediaConstraints {
        match level {
            QualityLevel::High => self.high,
            QualityLevel::Medium => self.medium,
            QualityLevel::Low => self.low,
            QualityLevel::Critical => self.critical,
        }
    }
}

/// Renegotiates capture parameters of the local video source.
#[async_trait]
pub trait CaptureControl: Send + Sync {
    async fn apply_constraints(&self, constraints: &MediaConstraints) -> Result<()>;
}

/// Applies the profile for a level to the local video source, keeping the
/// previous constraints when the source refuses.
pub struct ConstraintApplier {
    profile: MediaConstraintProfile,
    control: Arc<dyn CaptureControl>,
    effective: Option<(QualityLevel, MediaConstraints)>,
}

impl ConstraintApplier {
    pub fn new(profile: MediaConstraintProfile, control: Arc<dyn CaptureControl>) -> Self {
        Self {
            profile,
            control,
            effective: None,
        }
    }

    pub fn effective(&self) -> Option<MediaConstraints> {
        self.effective.map(|(_, c)| c)
    }

    pub fn effective_level(&self) -> Option<QualityLevel> {
        self.effective.map(|(l, _)| l)
    }

    pub async fn apply(&mut self, level: QualityLevel) -> Result<MediaConstraints> {
        if let Some((current, constraints)) = self.effective {
            if current == level {
                return Ok(constraints);
            }
        }

        let constraints = self.profile.for_level(level);
        match self.control.apply_constraints(&constraints).await {
            Ok(()) => {
                info!(
                    %level,
                    width = constraints.width,
                    height = constraints.height,
                    frame_rate = constraints.frame_rate,
                    max_bitrate_bps = constraints.max_bitrate_bps,
                    "media constraints applied"
                );
                self.effective = Some((level, constraints));
                Ok(constraints)
            }
            Err(e) => {
                warn!(%level, "keeping previous media constraints: {}", e);
                Err(match e {
                    Error::ConstraintApplication(_) => e,
                    other => Error::ConstraintApplication(other.to_string()),
                })
            }
        }
    }
}

/// Capture control for a host-fed encoder: requested constraints are
/// published on a `watch` channel the encoder follows.
pub struct HostCaptureControl {
    max_width: u32,
    max_height: u32,
    requested: watch::Sender<Option<MediaConstraints>>,
}

impl Default for HostCaptureControl {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl HostCaptureControl {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        let (requested, _) = watch::channel(None);
        Self {
            max_width,
            max_height,
            requested,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MediaConstraints>> {
        self.requested.subscribe()
    }

    pub fn current(&self) -> Option<MediaConstraints> {
        *self.requested.borrow()
    }
}

#[async_trait]
impl CaptureControl for HostCaptureControl {
    async fn apply_constraints(&self, constraints: &MediaConstraints) -> Result<()> {
        if constraints.width == 0
            || constraints.height == 0
            || constraints.width > self.max_width
            || constraints.height > self.max_height
        {
            return Err(Error::ConstraintApplication(format!(
                "unsupported resolution {}x{}",
                constraints.width, constraints.height
            )));
        }
        let constraints = *constraints;
        self.requested.send_modify(|slot| *slot = Some(constraints));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCaptureControl;

    #[tokio::test]
    async fn applies_profile_for_level() {
        let control = Arc::new(FakeCaptureControl::default());
        let mut applier = ConstraintApplier::new(MediaConstraintProfile::default(), control.clone());

        let c = applier.apply(QualityLevel::Low).await.unwrap();
        assert_eq!((c.width, c.height), (640, 360));
        assert_eq!(control.applied().len(), 1);
    }

    #[tokio::test]
    async fn reapplying_same_level_is_a_noop() {
        let control = Arc::new(FakeCaptureControl::default());
        let mut applier = ConstraintApplier::new(MediaConstraintProfile::default(), control.clone());

        applier.apply(QualityLevel::Medium).await.unwrap();
        applier.apply(QualityLevel::Medium).await.unwrap();
        assert_eq!(control.applied().len(), 1);
    }

    #[tokio::test]
    async fn failure_keeps_previous_constraints() {
        let control = Arc::new(FakeCaptureControl::default());
        let mut applier = ConstraintApplier::new(MediaConstraintProfile::default(), control.clone());
        applier.apply(QualityLevel::High).await.unwrap();

        control.fail_next(true);
        assert!(matches!(
            applier.apply(QualityLevel::Critical).await,
            Err(Error::ConstraintApplication(_))
        ));
        assert_eq!(applier.effective_level(), Some(QualityLevel::High));
        assert_eq!(applier.effective().unwrap().width, 1280);
    }

    #[tokio::test]
    async fn host_control_rejects_oversized_resolution() {
        let host = Arc::new(HostCaptureControl::new(640, 360));
        let rx = host.subscribe();
        let mut applier = ConstraintApplier::new(MediaConstraintProfile::default(), host.clone());

        assert!(applier.apply(QualityLevel::High).await.is_err());
        assert!(rx.borrow().is_none());

        applier.apply(QualityLevel::Low).await.unwrap();
        assert_eq!(host.current().unwrap().frame_rate, 15);
    }
}
