pub mod protocol;
pub mod websocket;

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::quality::QualityLevel;
use crate::room::{LocalParticipant, Participant};

pub use protocol::{RoomUser, SignalPayload, StreamAction, WireMessage};

/// One live connection to the room relay. The session is over when
/// `incoming` yields `None` or `outgoing` is closed.
pub struct TransportSession {
    pub outgoing: mpsc::Sender<WireMessage>,
    pub incoming: mpsc::Receiver<WireMessage>,
}

/// Reliable bidirectional message channel to the room relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<TransportSession>;
}

/// Room activity surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    ExistingParticipants(Vec<Participant>),
    ParticipantJoined(Participant),
    ParticipantLeft(String),
    SignalReceived { from: String, payload: SignalPayload },
    StreamControl { user_id: String, action: StreamAction },
    RemoteQuality { user_id: String, status: QualityLevel },
    /// The relay told us our own socket id; it replaces the provisional
    /// participant id.
    Identified(String),
    ConnectionLost,
    Reconnected,
    ReconnectFailed,
}

enum Command {
    Send(WireMessage),
}

pub struct SignalingClient {
    room_id: String,
    local: LocalParticipant,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Connect, announce ourselves and start relaying room events.
    ///
    /// A failure of the initial connection is returned directly; later
    /// disconnects are retried in the background.
    pub async fn join(
        transport: Arc<dyn SignalingTransport>,
        config: SignalingConfig,
        room_id: &str,
        local: LocalParticipant,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RoomEvent>)> {
        let session = transport.connect().await?;
        let join = join_message(room_id, &local);
        session
            .outgoing
            .send(join)
            .await
            .map_err(|_| Error::SignalingTransport("connection closed before join".into()))?;
        info!(room_id, participant_id = %local.participant_id, "joined room");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = Worker {
            transport,
            config,
            room_id: room_id.to_string(),
            local: local.clone(),
            events: events_tx,
            commands: commands_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run(session));

        Ok((
            Self {
                room_id: room_id.to_string(),
                local,
                commands: commands_tx,
                cancel,
                task: Some(task),
            },
            events_rx,
        ))
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local(&self) -> &LocalParticipant {
        &self.local
    }

    pub fn send(&self, message: WireMessage) -> Result<()> {
        self.commands
            .send(Command::Send(message))
            .map_err(|_| Error::SignalingTransport("signaling client stopped".into()))
    }

    /// `callerId` is stamped by the worker with the id the relay knows us by.
    pub fn send_signal(&self, target_participant_id: &str, payload: SignalPayload) -> Result<()> {
        self.send(WireMessage::Signal {
            user_to_signal: target_participant_id.to_string(),
            caller_id: self.local.participant_id.clone(),
            signal: payload,
        })
    }

    pub fn send_stream_control(&self, action: StreamAction) -> Result<()> {
        self.send(WireMessage::StreamControl {
            room_id: self.room_id.clone(),
            action,
            user_id: self.local.user_id.clone(),
        })
    }

    pub fn send_quality(&self, status: QualityLevel) -> Result<()> {
        self.send(WireMessage::ConnectionQuality {
            room_id: self.room_id.clone(),
            user_id: self.local.user_id.clone(),
            status,
        })
    }

    /// Stop relaying and drop the transport session. Safe to call twice.
    pub async fn leave(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("signaling task ended abnormally: {}", e);
            }
            info!(room_id = %self.room_id, "left room");
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn join_message(room_id: &str, local: &LocalParticipant) -> WireMessage {
    WireMessage::JoinRoom {
        room_id: room_id.to_string(),
        user_id: local.user_id.clone(),
        user_type: local.role,
    }
}

struct Worker {
    transport: Arc<dyn SignalingTransport>,
    config: SignalingConfig,
    room_id: String,
    local: LocalParticipant,
    events: mpsc::UnboundedSender<RoomEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self, mut session: TransportSession) {
        loop {
            let lost = tokio::select! {
                _ = self.cancel.cancelled() => return,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(msg)) => session.outgoing.send(self.stamp(msg)).await.is_err(),
                    None => return,
                },
                msg = session.incoming.recv() => match msg {
                    Some(msg) => {
                        self.dispatch(msg);
                        false
                    }
                    None => true,
                },
            };

            if !lost {
                continue;
            }

            warn!(room_id = %self.room_id, "signaling connection lost");
            self.emit(RoomEvent::ConnectionLost);
            match self.reconnect().await {
                Some(next) => {
                    session = next;
                    if session
                        .outgoing
                        .send(join_message(&self.room_id, &self.local))
                        .await
                        .is_err()
                    {
                        // Dropped straight away; the next loop turn sees the
                        // closed incoming side and retries.
                        warn!("connection closed while re-joining");
                    }
                    info!(room_id = %self.room_id, "signaling reconnected, re-joined room");
                    self.emit(RoomEvent::Reconnected);
                }
                None => {
                    if !self.cancel.is_cancelled() {
                        error!(
                            room_id = %self.room_id,
                            attempts = self.config.reconnect_attempts,
                            "signaling reconnection exhausted"
                        );
                        self.emit(RoomEvent::ReconnectFailed);
                    }
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<TransportSession> {
        for attempt in 1..=self.config.reconnect_attempts {
            let delay = self.jittered(self.config.backoff_for(attempt));
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.transport.connect().await {
                Ok(session) => return Some(session),
                Err(e) => warn!(attempt, "reconnect attempt failed: {}", e),
            }
        }
        None
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let ratio = self.config.backoff_jitter.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-ratio..=ratio);
        delay.mul_f64((1.0 + spread).max(0.0))
    }

    fn stamp(&self, msg: WireMessage) -> WireMessage {
        match msg {
            WireMessage::Signal {
                user_to_signal,
                signal,
                ..
            } => WireMessage::Signal {
                user_to_signal,
                caller_id: self.local.participant_id.clone(),
                signal,
            },
            other => other,
        }
    }

    /// Peers route their signals to the socket id the relay gave us, which
    /// changes on every reconnect.
    fn adopt_socket_id(&mut self, socket_id: String) {
        if socket_id == self.local.participant_id {
            return;
        }
        info!(
            previous = %self.local.participant_id,
            participant_id = %socket_id,
            "relay assigned participant id"
        );
        self.local.participant_id = socket_id.clone();
        self.emit(RoomEvent::Identified(socket_id));
    }

    fn dispatch(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::RoomUsers { users, socket_id } => {
                let own = socket_id.or_else(|| {
                    users
                        .iter()
                        .find(|u| u.user_id == self.local.user_id)
                        .map(|u| u.socket_id.clone())
                });
                if let Some(own) = own {
                    self.adopt_socket_id(own);
                }
                let existing = users
                    .into_iter()
                    .map(|u| {
                        let mut p = Participant::new(u.socket_id, u.user_id);
                        p.display_role = u.user_type;
                        p
                    })
                    .filter(|p| !self.local.is_self(p))
                    .collect();
                self.emit(RoomEvent::ExistingParticipants(existing));
            }
            WireMessage::UserJoined {
                socket_id,
                user_id,
                signal,
            } => {
                let participant = Participant::new(socket_id.clone(), user_id);
                if self.local.is_self(&participant) {
                    return;
                }
                self.emit(RoomEvent::ParticipantJoined(participant));
                if let Some(payload) = signal {
                    self.emit(RoomEvent::SignalReceived {
                        from: socket_id,
                        payload,
                    });
                }
            }
            WireMessage::Signal {
                caller_id, signal, ..
            } => self.emit(RoomEvent::SignalReceived {
                from: caller_id,
                payload: signal,
            }),
            WireMessage::UserLeft { socket_id } => self.emit(RoomEvent::ParticipantLeft(socket_id)),
            WireMessage::StreamControl {
                action, user_id, ..
            } => {
                if user_id != self.local.user_id {
                    self.emit(RoomEvent::StreamControl { user_id, action });
                }
            }
            WireMessage::ConnectionQuality {
                user_id, status, ..
            } => {
                if user_id != self.local.user_id {
                    self.emit(RoomEvent::RemoteQuality { user_id, status });
                }
            }
            WireMessage::JoinRoom { .. } => debug!("ignoring echoed join-room"),
        }
    }

    fn emit(&self, event: RoomEvent) {
        if self.events.send(event).is_err() {
            debug!("room event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::ParticipantRole;
    use crate::testing::FakeTransport;

    fn me() -> LocalParticipant {
        LocalParticipant {
            participant_id: "s-me".into(),
            user_id: "u-me".into(),
            role: ParticipantRole::Student,
        }
    }

    fn fast_config(attempts: u32) -> SignalingConfig {
        SignalingConfig {
            reconnect_attempts: attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 400,
            ..SignalingConfig::default()
        }
    }

    #[tokio::test]
    async fn join_announces_and_translates_room_users() {
        let transport = FakeTransport::new();
        let (client, mut events) = SignalingClient::join(transport.clone(), fast_config(1), "R1", me())
            .await
            .unwrap();

        let mut server = transport.accept().await;
        assert_eq!(
            server.recv().await,
            Some(WireMessage::JoinRoom {
                room_id: "R1".into(),
                user_id: "u-me".into(),
                user_type: ParticipantRole::Student,
            })
        );

        server
            .send(WireMessage::RoomUsers {
                users: vec![
                    RoomUser { socket_id: "s1".into(), user_id: "u1".into(), user_type: None },
                    RoomUser { socket_id: "s-me".into(), user_id: "u-me".into(), user_type: None },
                ],
                socket_id: None,
            })
            .await;
        match events.recv().await {
            Some(RoomEvent::ExistingParticipants(list)) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].participant_id, "s1");
            }
            other => panic!("unexpected event {other:?}"),
        }

        client
            .send_signal("s1", SignalPayload::Answer { sdp: "v=0".into() })
            .unwrap();
        assert_eq!(
            server.recv().await,
            Some(WireMessage::Signal {
                user_to_signal: "s1".into(),
                caller_id: "s-me".into(),
                signal: SignalPayload::Answer { sdp: "v=0".into() },
            })
        );
    }

    #[tokio::test]
    async fn outbound_signals_carry_the_relay_assigned_id() {
        let provisional = LocalParticipant {
            participant_id: "peer-0000abcd".into(),
            ..me()
        };
        let transport = FakeTransport::new();
        let (client, mut events) =
            SignalingClient::join(transport.clone(), fast_config(1), "R1", provisional)
                .await
                .unwrap();
        let mut server = transport.accept().await;
        server.recv().await;

        server
            .send(WireMessage::RoomUsers {
                users: vec![RoomUser { socket_id: "s1".into(), user_id: "u1".into(), user_type: None }],
                socket_id: Some("s-me".into()),
            })
            .await;
        assert_eq!(events.recv().await, Some(RoomEvent::Identified("s-me".into())));
        assert!(matches!(events.recv().await, Some(RoomEvent::ExistingParticipants(list)) if list.len() == 1));

        client
            .send_signal("s1", SignalPayload::Offer { sdp: "v=0".into() })
            .unwrap();
        assert!(matches!(
            server.recv().await,
            Some(WireMessage::Signal { caller_id, .. }) if caller_id == "s-me"
        ));
    }

    #[tokio::test]
    async fn own_entry_in_room_users_identifies_us() {
        let provisional = LocalParticipant {
            participant_id: "peer-0000abcd".into(),
            ..me()
        };
        let transport = FakeTransport::new();
        let (client, mut events) =
            SignalingClient::join(transport.clone(), fast_config(1), "R1", provisional)
                .await
                .unwrap();
        let mut server = transport.accept().await;
        server.recv().await;

        server
            .send(WireMessage::RoomUsers {
                users: vec![
                    RoomUser { socket_id: "s1".into(), user_id: "u1".into(), user_type: None },
                    RoomUser { socket_id: "s-me".into(), user_id: "u-me".into(), user_type: None },
                ],
                socket_id: None,
            })
            .await;
        assert_eq!(events.recv().await, Some(RoomEvent::Identified("s-me".into())));
        match events.recv().await {
            Some(RoomEvent::ExistingParticipants(list)) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].participant_id, "s1");
            }
            other => panic!("unexpected event {other:?}"),
        }

        client
            .send_signal("s1", SignalPayload::Answer { sdp: "v=0".into() })
            .unwrap();
        assert!(matches!(
            server.recv().await,
            Some(WireMessage::Signal { caller_id, .. }) if caller_id == "s-me"
        ));
    }

    #[tokio::test]
    async fn user_joined_with_offer_yields_join_then_signal() {
        let transport = FakeTransport::new();
        let (_client, mut events) = SignalingClient::join(transport.clone(), fast_config(1), "R1", me())
            .await
            .unwrap();
        let mut server = transport.accept().await;
        server.recv().await;

        server
            .send(WireMessage::UserJoined {
                socket_id: "s2".into(),
                user_id: "u2".into(),
                signal: Some(SignalPayload::Offer { sdp: "offer".into() }),
            })
            .await;

        assert!(matches!(events.recv().await, Some(RoomEvent::ParticipantJoined(p)) if p.participant_id == "s2"));
        assert_eq!(
            events.recv().await,
            Some(RoomEvent::SignalReceived {
                from: "s2".into(),
                payload: SignalPayload::Offer { sdp: "offer".into() },
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_rejoins_with_same_identity() {
        let transport = FakeTransport::new();
        let (_client, mut events) = SignalingClient::join(transport.clone(), fast_config(3), "R1", me())
            .await
            .unwrap();
        let server = transport.accept().await;
        drop(server);

        assert_eq!(events.recv().await, Some(RoomEvent::ConnectionLost));
        let mut server = transport.accept().await;
        assert_eq!(events.recv().await, Some(RoomEvent::Reconnected));
        assert!(matches!(
            server.recv().await,
            Some(WireMessage::JoinRoom { room_id, user_id, .. }) if room_id == "R1" && user_id == "u-me"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_surface_terminal_failure() {
        let transport = FakeTransport::new();
        let (_client, mut events) = SignalingClient::join(transport.clone(), fast_config(2), "R1", me())
            .await
            .unwrap();
        let server = transport.accept().await;
        transport.refuse_connections(true);
        drop(server);

        assert_eq!(events.recv().await, Some(RoomEvent::ConnectionLost));
        assert_eq!(events.recv().await, Some(RoomEvent::ReconnectFailed));
        assert_eq!(events.recv().await, None);
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn leave_stops_the_worker() {
        let transport = FakeTransport::new();
        let (mut client, mut events) = SignalingClient::join(transport.clone(), fast_config(1), "R1", me())
            .await
            .unwrap();
        client.leave().await;
        client.leave().await;
        assert_eq!(events.recv().await, None);
        assert!(client.send_stream_control(StreamAction::ToggleAudio).is_err());
    }
}
