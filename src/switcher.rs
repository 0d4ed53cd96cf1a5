use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalTrack, MediaDevices};
use crate::peer::PeerLink;

pub type Links = [(String, Arc<dyn PeerLink>)];

/// Swaps the outbound video between camera and screen on every peer.
///
/// A swap either lands on every connection or on none: if one peer rejects
/// the new track, peers already switched are put back.
pub struct TrackSwitcher {
    devices: Arc<dyn MediaDevices>,
    ended: mpsc::UnboundedSender<String>,
    in_flight: bool,
    cancel: CancellationToken,
}

impl TrackSwitcher {
    /// `ended` receives the id of a screen track whose source stopped.
    pub fn new(devices: Arc<dyn MediaDevices>, ended: mpsc::UnboundedSender<String>) -> Self {
        Self {
            devices,
            ended,
            in_flight: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        self.devices.clone()
    }

    pub fn is_switching(&self) -> bool {
        self.in_flight
    }

    /// Reserve the switcher for a screen-share acquisition.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_flight {
            return Err(Error::InvalidState("a track switch is already in progress".into()));
        }
        self.in_flight = true;
        Ok(())
    }

    /// Acquire a display and put it on every peer.
    pub async fn switch_to_screen_share(
        &mut self,
        links: &Links,
        media: &mut LocalMedia,
    ) -> Result<()> {
        if media.is_sharing_screen() {
            return Ok(());
        }
        self.begin()?;
        let acquired = self.devices.acquire_display().await;
        self.finish_screen_share(acquired, links, media).await
    }

    /// Complete a switch started with `begin`. A failed acquisition leaves
    /// the camera in place.
    pub async fn finish_screen_share(
        &mut self,
        acquired: Result<LocalTrack>,
        links: &Links,
        media: &mut LocalMedia,
    ) -> Result<()> {
        self.in_flight = false;
        let screen = match acquired {
            Ok(track) => track,
            Err(e) => {
                warn!("screen share unavailable: {}", e);
                return Err(match e {
                    Error::DeviceAcquisition(_) => e,
                    other => Error::DeviceAcquisition(other.to_string()),
                });
            }
        };

        let previous = media.active_video().clone();
        if let Err(e) = swap_all(links, &previous, &screen).await {
            screen.end();
            return Err(e);
        }
        media.set_active_video(screen.clone());
        self.watch(&screen);
        info!(track_id = %screen.id(), peers = links.len(), "screen share started");
        Ok(())
    }

    /// Put the camera back on every peer and stop the screen track.
    /// No-op while not sharing; rejected while a display is being acquired.
    pub async fn switch_to_camera(&mut self, links: &Links, media: &mut LocalMedia) -> Result<()> {
        if self.in_flight {
            return Err(Error::InvalidState("a track switch is already in progress".into()));
        }
        if !media.is_sharing_screen() {
            return Ok(());
        }

        let screen = media.active_video().clone();
        let camera = media.camera.clone();
        swap_all(links, &screen, &camera).await?;
        media.set_active_video(camera);
        // State is settled before the source stops, so the ended
        // notification for this track is ignored.
        screen.end();
        info!(peers = links.len(), "screen share stopped, camera restored");
        Ok(())
    }

    /// The screen source stopped on its own. Ignored unless `track_id` is
    /// the track currently sent; returns whether a switch happened.
    pub async fn on_source_ended(
        &mut self,
        track_id: &str,
        links: &Links,
        media: &mut LocalMedia,
    ) -> Result<bool> {
        if !media.is_sharing_screen() || media.active_video().id() != track_id {
            debug!(track_id, "ignoring end of inactive track");
            return Ok(false);
        }
        self.switch_to_camera(links, media).await?;
        Ok(true)
    }

    pub fn shutdown(&mut self) {
        self.cancel.cancel();
    }

    fn watch(&self, track: &LocalTrack) {
        let ended = track.ended();
        let cancel = self.cancel.clone();
        let tx = self.ended.clone();
        let id = track.id().to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = ended.cancelled() => {
                    let _ = tx.send(id);
                }
            }
        });
    }
}

impl Drop for TrackSwitcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn swap_all(links: &Links, from: &LocalTrack, to: &LocalTrack) -> Result<()> {
    for (i, (peer_id, link)) in links.iter().enumerate() {
        if let Err(e) = link.replace_video_track(to).await {
            warn!(peer_id = %peer_id, "track replacement failed, rolling back: {}", e);
            for (done_id, done) in &links[..i] {
                if let Err(e) = done.replace_video_track(from).await {
                    warn!(peer_id = %done_id, "rollback failed: {}", e);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}
