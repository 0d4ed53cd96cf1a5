use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use office_hours_rtc::clock::ManualClock;
use office_hours_rtc::config::SignalingConfig;
use office_hours_rtc::connection::ConnectionState;
use office_hours_rtc::media::sample_from;
use office_hours_rtc::metrics::RawStats;
use office_hours_rtc::peer::NegotiationRole;
use office_hours_rtc::recorder::TAP_HEADER_LEN;
use office_hours_rtc::room::{LocalParticipant, ParticipantRole};
use office_hours_rtc::signaling::{RoomUser, SignalPayload, StreamAction, WireMessage};
use office_hours_rtc::testing::{
    FakeDevices, FakeLinkFactory, FakeServer, FakeSummarySink, FakeTransport, FakeUploader,
};
use office_hours_rtc::{
    ConferenceConfig, ConferenceDeps, ConferenceHandle, ConferenceNotice, ConferenceOrchestrator,
    Error, QualityLevel,
};

struct Harness {
    handle: ConferenceHandle,
    notices: UnboundedReceiver<ConferenceNotice>,
    server: FakeServer,
    transport: Arc<FakeTransport>,
    factory: FakeLinkFactory,
    devices: Arc<FakeDevices>,
    uploader: FakeUploader,
    sink: FakeSummarySink,
}

fn me() -> LocalParticipant {
    LocalParticipant {
        participant_id: "s-me".into(),
        user_id: "u-me".into(),
        role: ParticipantRole::Instructor,
    }
}

fn user(socket_id: &str) -> RoomUser {
    RoomUser {
        socket_id: socket_id.into(),
        user_id: format!("user-{socket_id}"),
        user_type: Some(ParticipantRole::Student),
    }
}

fn room_users(users: Vec<RoomUser>) -> WireMessage {
    WireMessage::RoomUsers {
        users,
        socket_id: None,
    }
}

async fn join(config: ConferenceConfig, factory: FakeLinkFactory, devices: Arc<FakeDevices>) -> Harness {
    let transport = FakeTransport::new();
    let uploader = FakeUploader::default();
    let sink = FakeSummarySink::default();
    let deps = ConferenceDeps {
        transport: transport.clone(),
        links: Arc::new(factory.clone()),
        devices: devices.clone(),
        uploader: Arc::new(uploader.clone()),
        summary_sink: Arc::new(sink.clone()),
        clock: Arc::new(ManualClock::new(1_700_000_000_000)),
    };
    let (handle, notices) = ConferenceOrchestrator::start(config, deps, "R1", me())
        .await
        .unwrap();

    let mut server = transport.accept().await;
    assert!(matches!(
        server.recv().await,
        Some(WireMessage::JoinRoom { room_id, .. }) if room_id == "R1"
    ));

    Harness {
        handle,
        notices,
        server,
        transport,
        factory,
        devices,
        uploader,
        sink,
    }
}

async fn join_default() -> Harness {
    join(
        ConferenceConfig::default(),
        FakeLinkFactory::new(),
        Arc::new(FakeDevices::new()),
    )
    .await
}

async fn wait_for(
    notices: &mut UnboundedReceiver<ConferenceNotice>,
    pred: impl Fn(&ConferenceNotice) -> bool,
) -> ConferenceNotice {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match notices.recv().await {
                Some(n) if pred(&n) => return n,
                Some(_) => continue,
                None => panic!("notice stream closed"),
            }
        }
    })
    .await
    .expect("notice not received")
}

async fn next_sent(
    server: &mut FakeServer,
    pred: impl Fn(&WireMessage) -> bool,
) -> WireMessage {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match server.recv().await {
                Some(m) if pred(&m) => return m,
                Some(_) => continue,
                None => panic!("client disconnected"),
            }
        }
    })
    .await
    .expect("message not sent")
}

fn is_offer_to(target: &'static str) -> impl Fn(&WireMessage) -> bool {
    move |m| {
        matches!(m, WireMessage::Signal { user_to_signal, signal, .. }
            if user_to_signal == target && signal.is_offer())
    }
}

#[tokio::test]
async fn existing_users_are_dialled_and_nobody_else() {
    let mut h = join_default().await;

    h.server
        .send(room_users(vec![user("s1"), user("s2"), user("s3"), RoomUser {
            socket_id: "s-me".into(),
            user_id: "u-me".into(),
            user_type: None,
        }]))
        .await;
    for target in ["s1", "s2", "s3"] {
        next_sent(&mut h.server, is_offer_to(target)).await;
    }

    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers.len(), 3);
    assert!(peers.iter().all(|p| p.role == NegotiationRole::Initiator));
    assert_eq!(h.factory.created(NegotiationRole::Initiator), 3);
    assert_eq!(h.factory.created(NegotiationRole::Responder), 0);
}

#[tokio::test]
async fn mesh_tracks_membership() {
    let mut h = join_default().await;

    h.server.send(room_users(vec![user("s1")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;

    // A newcomer is not dialled; their offer opens the connection.
    h.server
        .send(WireMessage::UserJoined {
            socket_id: "s2".into(),
            user_id: "user-s2".into(),
            signal: None,
        })
        .await;
    wait_for(&mut h.notices, |n| *n == ConferenceNotice::ParticipantJoined("s2".into())).await;
    assert_eq!(h.handle.peers().await.unwrap().len(), 1);

    h.server
        .send(WireMessage::Signal {
            user_to_signal: "s-me".into(),
            caller_id: "s2".into(),
            signal: SignalPayload::Offer { sdp: "offer".into() },
        })
        .await;
    let answer = next_sent(&mut h.server, |m| {
        matches!(m, WireMessage::Signal { signal: SignalPayload::Answer { .. }, .. })
    })
    .await;
    assert!(matches!(answer, WireMessage::Signal { user_to_signal, .. } if user_to_signal == "s2"));
    assert_eq!(h.handle.peers().await.unwrap().len(), 2);

    h.server
        .send(WireMessage::UserLeft { socket_id: "s1".into() })
        .await;
    wait_for(&mut h.notices, |n| *n == ConferenceNotice::ParticipantLeft("s1".into())).await;
    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].remote_participant_id, "s2");
    assert_eq!(peers[0].role, NegotiationRole::Responder);
    assert!(h.factory.link("s1").unwrap().is_closed());

    // Late signals for the departed peer are dropped without effect.
    h.server
        .send(WireMessage::Signal {
            user_to_signal: "s-me".into(),
            caller_id: "s1".into(),
            signal: SignalPayload::Answer { sdp: "late".into() },
        })
        .await;
    assert_eq!(h.handle.peers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn screen_share_ending_externally_restores_camera_everywhere() {
    let mut h = join_default().await;
    h.server.send(room_users(vec![user("s1"), user("s2")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;
    next_sent(&mut h.server, is_offer_to("s2")).await;

    let links = [h.factory.link("s1").unwrap(), h.factory.link("s2").unwrap()];
    let camera_id = links[0].video_track_id().unwrap();

    h.handle.share_screen().await.unwrap();
    let screen = h.devices.displays().pop().unwrap();
    for link in &links {
        assert_eq!(link.video_track_id().as_deref(), Some(screen.id()));
    }

    screen.end();
    wait_for(&mut h.notices, |n| *n == ConferenceNotice::ScreenShareEnded).await;
    for link in &links {
        assert_eq!(link.video_track_id(), Some(camera_id.clone()));
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_screen_share_requests_are_serialized() {
    let devices = Arc::new(FakeDevices::new());
    devices.display_delay(Duration::from_secs(2));
    let h = join(ConferenceConfig::default(), FakeLinkFactory::new(), devices).await;

    let (first, second) = tokio::join!(h.handle.share_screen(), h.handle.share_screen());
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(Error::InvalidState(_)))));
    assert_eq!(h.devices.displays().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stopping_a_share_still_being_acquired_is_rejected() {
    let devices = Arc::new(FakeDevices::new());
    devices.display_delay(Duration::from_secs(2));
    let mut h = join(ConferenceConfig::default(), FakeLinkFactory::new(), devices).await;
    h.server.send(room_users(vec![user("s1")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;

    let handle = h.handle.clone();
    let share = tokio::spawn(async move { handle.share_screen().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        h.handle.stop_screen_share().await,
        Err(Error::InvalidState(_))
    ));

    share.await.unwrap().unwrap();
    let screen = h.devices.displays().pop().unwrap();
    let link = h.factory.link("s1").unwrap();
    assert_eq!(link.video_track_id().as_deref(), Some(screen.id()));

    h.handle.stop_screen_share().await.unwrap();
    assert!(screen.is_ended());
    assert_ne!(link.video_track_id().as_deref(), Some(screen.id()));
}

#[tokio::test]
async fn denied_display_is_reported_and_camera_kept() {
    let devices = Arc::new(FakeDevices::new());
    devices.deny_display(true);
    let mut h = join(ConferenceConfig::default(), FakeLinkFactory::new(), devices).await;
    h.server.send(room_users(vec![user("s1")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;
    let camera_id = h.factory.link("s1").unwrap().video_track_id();

    assert!(matches!(
        h.handle.share_screen().await,
        Err(Error::DeviceAcquisition(_))
    ));
    wait_for(&mut h.notices, |n| matches!(n, ConferenceNotice::DeviceError(_))).await;
    assert_eq!(h.factory.link("s1").unwrap().video_track_id(), camera_id);
}

#[tokio::test(start_paused = true)]
async fn poor_network_lowers_constraints_and_is_announced() {
    let factory = FakeLinkFactory::new();
    factory.script_stats(vec![RawStats {
        timestamp_ms: 0,
        round_trip_time_ms: Some(600.0),
        bytes_received: Some(10_000),
        packets_lost: Some(0),
    }]);
    let devices = Arc::new(FakeDevices::new());
    let mut h = join(ConferenceConfig::default(), factory, devices).await;

    h.server.send(room_users(vec![user("s1")])).await;

    let change = wait_for(&mut h.notices, |n| matches!(n, ConferenceNotice::QualityChanged(_))).await;
    match change {
        ConferenceNotice::QualityChanged(c) => {
            assert_eq!(c.peer_id, "s1");
            assert_eq!((c.previous, c.current), (QualityLevel::High, QualityLevel::Low));
        }
        other => panic!("unexpected {other:?}"),
    }
    wait_for(&mut h.notices, |n| {
        *n == ConferenceNotice::EffectiveQualityChanged(QualityLevel::Low)
    })
    .await;

    let announced = next_sent(&mut h.server, |m| matches!(m, WireMessage::ConnectionQuality { .. })).await;
    assert!(matches!(
        announced,
        WireMessage::ConnectionQuality { status: QualityLevel::Low, ref user_id, .. } if user_id == "u-me"
    ));
    let applied = h.devices.control().applied();
    assert_eq!(applied.last().map(|c| (c.width, c.height)), Some((640, 360)));
    assert_eq!(h.handle.effective_level().await.unwrap(), QualityLevel::Low);

    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers[0].current_quality, QualityLevel::Low);
    assert!(peers[0].last_sample.is_some());

    // The departed peer no longer holds the stream down.
    h.server
        .send(WireMessage::UserLeft { socket_id: "s1".into() })
        .await;
    wait_for(&mut h.notices, |n| {
        *n == ConferenceNotice::EffectiveQualityChanged(QualityLevel::High)
    })
    .await;
}

#[tokio::test]
async fn failed_peer_is_isolated() {
    let mut h = join_default().await;
    h.server.send(room_users(vec![user("s1"), user("s2")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;
    next_sent(&mut h.server, is_offer_to("s2")).await;

    h.factory.link("s1").unwrap().set_state(ConnectionState::Failed);
    wait_for(&mut h.notices, |n| *n == ConferenceNotice::PeerFailed("s1".into())).await;

    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].remote_participant_id, "s2");
    assert!(h.handle.is_running());
}

#[tokio::test]
async fn rejected_answer_fails_the_peer_but_a_bad_candidate_does_not() {
    let mut h = join_default().await;
    h.server.send(room_users(vec![user("s1"), user("s2")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;
    next_sent(&mut h.server, is_offer_to("s2")).await;
    let link = h.factory.link("s1").unwrap();
    link.fail_apply(true);

    h.server
        .send(WireMessage::Signal {
            user_to_signal: "s-me".into(),
            caller_id: "s1".into(),
            signal: SignalPayload::Candidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        })
        .await;
    // Room events are handled in order, so this marks the candidate done.
    h.server
        .send(WireMessage::UserLeft { socket_id: "s9".into() })
        .await;
    wait_for(&mut h.notices, |n| {
        assert!(!matches!(n, ConferenceNotice::PeerFailed(_)), "unexpected {n:?}");
        *n == ConferenceNotice::ParticipantLeft("s9".into())
    })
    .await;
    assert_eq!(h.handle.peers().await.unwrap().len(), 2);
    assert!(!link.is_closed());

    h.server
        .send(WireMessage::Signal {
            user_to_signal: "s-me".into(),
            caller_id: "s1".into(),
            signal: SignalPayload::Answer { sdp: "garbled".into() },
        })
        .await;
    wait_for(&mut h.notices, |n| *n == ConferenceNotice::PeerFailed("s1".into())).await;
    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].remote_participant_id, "s2");
    assert!(link.is_closed());
}

#[tokio::test]
async fn offers_name_us_by_the_relay_assigned_id() {
    let mut h = join_default().await;
    h.server
        .send(WireMessage::RoomUsers {
            users: vec![user("s1")],
            socket_id: Some("s-relay".into()),
        })
        .await;
    let offer = next_sent(&mut h.server, is_offer_to("s1")).await;
    assert!(matches!(offer, WireMessage::Signal { caller_id, .. } if caller_id == "s-relay"));
}

#[tokio::test]
async fn missing_devices_degrade_instead_of_failing() {
    let devices = Arc::new(FakeDevices::new());
    devices.fail_user_media(true);
    let mut h = join(ConferenceConfig::default(), FakeLinkFactory::new(), devices).await;

    wait_for(&mut h.notices, |n| matches!(n, ConferenceNotice::DeviceError(_))).await;
    // Placeholder tracks start muted.
    assert!(h.handle.toggle_audio().await.unwrap());
}

#[tokio::test]
async fn toggles_are_relayed_and_counted() {
    let mut h = join_default().await;

    assert!(!h.handle.toggle_audio().await.unwrap());
    let sent = next_sent(&mut h.server, |m| matches!(m, WireMessage::StreamControl { .. })).await;
    assert_eq!(
        sent,
        WireMessage::StreamControl {
            room_id: "R1".into(),
            action: StreamAction::ToggleAudio,
            user_id: "u-me".into(),
        }
    );
    assert!(!h.handle.toggle_video().await.unwrap());
    assert!(h.handle.toggle_video().await.unwrap());

    h.server
        .send(WireMessage::StreamControl {
            room_id: "R1".into(),
            action: StreamAction::ToggleVideo,
            user_id: "user-s9".into(),
        })
        .await;
    wait_for(&mut h.notices, |n| {
        matches!(n, ConferenceNotice::RemoteStreamControl { user_id, .. } if user_id == "user-s9")
    })
    .await;

    let summary = h.handle.leave().await.unwrap();
    let counts: Vec<_> = summary.interactions.values().copied().collect();
    assert_eq!(counts, vec![1, 2]);
}

#[tokio::test]
async fn recording_lifecycle_through_the_handle() {
    let h = join_default().await;

    assert!(h.handle.stop_recording().await.unwrap().is_none());
    h.handle.start_recording().await.unwrap();
    assert!(matches!(
        h.handle.start_recording().await,
        Err(Error::InvalidState(_))
    ));

    h.uploader.fail(true);
    assert!(matches!(
        h.handle.stop_recording().await,
        Err(Error::RecordingUpload(_))
    ));
    assert!(h.handle.stop_recording().await.unwrap().is_none());

    h.uploader.fail(false);
    assert_eq!(h.handle.retry_recording_upload().await.unwrap(), 1);
    assert_eq!(h.uploader.uploads().len(), 1);
    assert_eq!(h.handle.retry_recording_upload().await.unwrap(), 0);
    assert_eq!(h.handle.discard_recording().await.unwrap(), 0);
}

#[tokio::test]
async fn frames_after_stop_do_not_leak_into_the_next_recording() {
    let h = join_default().await;
    let media = h.devices.user_media().unwrap();
    let frame = sample_from(vec![7u8; 4], Duration::from_millis(33));

    h.handle.start_recording().await.unwrap();
    media.camera.write_sample(&frame).await.unwrap();
    let first = h.handle.stop_recording().await.unwrap().unwrap();
    assert_eq!(first.recording.len(), TAP_HEADER_LEN + 4);

    media.camera.write_sample(&frame).await.unwrap();
    h.handle.start_recording().await.unwrap();
    let second = h.handle.stop_recording().await.unwrap().unwrap();
    assert!(second.recording.is_empty());
}

#[tokio::test(start_paused = true)]
async fn leaving_waits_for_uploads_in_flight_and_hands_back_failures() {
    let mut h = join_default().await;
    h.uploader.fail(true);
    h.uploader.delay(Duration::from_secs(5));
    h.handle.start_recording().await.unwrap();

    let handle = h.handle.clone();
    let stop = tokio::spawn(async move { handle.stop_recording().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.handle.leave().await.unwrap();

    assert!(matches!(
        stop.await.unwrap(),
        Err(Error::RecordingUpload(_))
    ));
    wait_for(&mut h.notices, |n| matches!(n, ConferenceNotice::RecordingUploadFailed(_))).await;
    match wait_for(&mut h.notices, |n| matches!(n, ConferenceNotice::RecordingsUndelivered(_))).await {
        ConferenceNotice::RecordingsUndelivered(uploads) => {
            assert_eq!(uploads.len(), 1);
            assert_eq!(uploads[0].session_id, h.sink.summaries()[0].session_id);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnection_ends_the_conference() {
    let config = ConferenceConfig {
        signaling: SignalingConfig {
            reconnect_attempts: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 200,
            ..SignalingConfig::default()
        },
        ..ConferenceConfig::default()
    };
    let mut h = join(config, FakeLinkFactory::new(), Arc::new(FakeDevices::new())).await;
    h.server.send(room_users(vec![user("s1")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;

    h.transport.refuse_connections(true);
    drop(h.server);

    wait_for(&mut h.notices, |n| *n == ConferenceNotice::ConnectionLost).await;
    wait_for(&mut h.notices, |n| *n == ConferenceNotice::ReconnectFailed).await;
    wait_for(&mut h.notices, |n| matches!(n, ConferenceNotice::SessionEnded(_))).await;

    assert_eq!(h.sink.summaries().len(), 1);
    assert!(h.factory.link("s1").unwrap().is_closed());
    assert!(matches!(h.handle.leave().await, Err(Error::ChannelClosed)));
}

#[tokio::test]
async fn leave_submits_one_summary_and_closes_everything() {
    let mut h = join_default().await;
    h.server.send(room_users(vec![user("s1")])).await;
    next_sent(&mut h.server, is_offer_to("s1")).await;

    let summary = h.handle.leave().await.unwrap();
    assert_eq!(summary.room_id, "R1");
    assert_eq!(summary.participant_id, "s-me");
    assert_eq!(summary.time_in_quality.total_ms(), summary.duration_ms);
    assert_eq!(h.sink.summaries(), vec![summary]);
    assert!(h.factory.link("s1").unwrap().is_closed());
    assert!(matches!(h.handle.leave().await, Err(Error::ChannelClosed)));
}
