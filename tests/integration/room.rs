use futures::future;
use huddle::{
    media::{MediaAcquisitionError, MediaKind, TrackId},
    peer::{NegotiationState, PeerEvent, SessionSeq},
    platform::{ChannelEvent, MediaStreamTrack as _},
    proto::{Answer, Broadcast, Participant, SessionDescription},
    room::{RoomError, RoomJoinError},
    RoomEvent,
};

use crate::{Client, Mesh};

fn remote_track_ids(client: &Client, of: &Client) -> Vec<String> {
    let snapshot = client.room.snapshot();
    let mut ids: Vec<_> = snapshot
        .remote_stream(&of.id())
        .map(|s| s.tracks.iter().map(|t| t.id().0).collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

fn assert_connected(a: &Client, b: &Client) {
    assert_eq!(a.room.peer_state(&b.id()), Some(NegotiationState::Connected));
    assert_eq!(b.room.peer_state(&a.id()), Some(NegotiationState::Connected));
}

#[test]
fn two_participants_connect_and_part() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");

    assert_connected(&alice, &bob);
    assert_eq!(remote_track_ids(&alice, &bob), vec!["cam-bob", "mic-bob"]);
    assert_eq!(
        remote_track_ids(&bob, &alice),
        vec!["cam-alice", "mic-alice"],
    );
    let snapshot = alice.room.snapshot();
    assert_eq!(snapshot.participants_count(), 2);
    assert!(snapshot.signalling_connected);
    assert_eq!(
        snapshot.remote_stream(&bob.id()).unwrap().display_name.as_deref(),
        Some("Bob"),
    );

    bob.room.hangup();
    mesh.settle();

    assert_eq!(alice.room.peers_count(), 0);
    assert!(alice.room.snapshot().remote_streams.is_empty());
    assert_eq!(alice.room.snapshot().participants_count(), 1);
    assert!(mesh.network.open_transports("alice").is_empty());
}

#[test]
fn candidates_follow_descriptions_of_their_session() {
    let mut mesh = Mesh::new();
    let _alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");
    let _carol = mesh.joined("carol");

    let sent = mesh.network.sent();
    for (i, s) in sent.iter().enumerate() {
        if s.event == "raise-hand" {
            continue;
        }
        assert_ne!(s.payload["from"], s.payload["to"]);
        if s.event == "ice" {
            assert!(
                sent[..i].iter().any(|d| {
                    (d.event == "offer" || d.event == "answer")
                        && d.payload["from"] == s.payload["from"]
                        && d.payload["to"] == s.payload["to"]
                }),
                "candidate sent before description: {:?}",
                s.payload,
            );
        }
    }
    let answered = |from: &str, to: &str| {
        sent.iter().any(|s| {
            s.event == "answer"
                && s.payload["from"] == from
                && s.payload["to"] == to
        })
    };
    assert!(answered("alice", "bob"));
    assert!(answered("alice", "carol"));
    assert!(answered("bob", "carol"));
    assert!(!answered("bob", "alice"));
}

#[test]
fn three_participants_form_full_mesh() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");
    let carol = mesh.joined("carol");

    assert_connected(&alice, &bob);
    assert_connected(&alice, &carol);
    assert_connected(&bob, &carol);
    for client in &[&alice, &bob, &carol] {
        assert_eq!(client.room.peers_count(), 2);
        assert_eq!(client.room.snapshot().participants_count(), 3);
    }
    assert_eq!(remote_track_ids(&carol, &bob), vec!["cam-bob", "mic-bob"]);

    carol.room.hangup();
    mesh.settle();

    assert_connected(&alice, &bob);
    assert_eq!(alice.room.peers_count(), 1);
    assert_eq!(bob.room.peers_count(), 1);
}

#[test]
fn duplicate_join_keeps_connected_session() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");

    let created = mesh.network.created_transports("alice");

    alice.fakes.channel.inject(ChannelEvent::PresenceJoin(vec![
        Participant::new("bob", Some("Bob".to_owned())),
    ]));
    mesh.settle();

    assert_connected(&alice, &bob);
    assert_eq!(mesh.network.created_transports("alice"), created);
    assert_eq!(alice.room.snapshot().remote_streams.len(), 1);
}

#[test]
fn presence_sync_discovers_participants() {
    let mut mesh = Mesh::new();
    mesh.network.drop_joins.set(true);
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");
    let carol = mesh.joined("carol");

    assert_connected(&alice, &bob);
    assert_connected(&alice, &carol);
    assert_connected(&bob, &carol);
    assert_eq!(
        alice
            .room
            .snapshot()
            .remote_stream(&carol.id())
            .unwrap()
            .display_name
            .as_deref(),
        Some("Carol"),
    );
}

#[test]
fn presence_sync_never_removes_sessions() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");

    alice.fakes.channel.inject(ChannelEvent::PresenceSync(vec![
        Participant::new("alice", Some("Alice".to_owned())),
        Participant::new("dave", Some("Dave".to_owned())),
    ]));
    mesh.settle();

    assert_eq!(alice.room.peers_count(), 2);
    assert_eq!(
        alice.room.peer_state(&bob.id()),
        Some(NegotiationState::Connected),
    );
    assert_eq!(
        alice.room.peer_state(&"dave".into()),
        Some(NegotiationState::AwaitingAnswer),
    );
}

#[test]
fn late_answer_is_ignored() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");
    let broadcast = Broadcast::Signalling(
        Answer {
            from: bob.id(),
            to: alice.id(),
            description: SessionDescription::answer("tracks="),
        }
        .into(),
    );

    alice.fakes.channel.inject(ChannelEvent::Broadcast {
        event: broadcast.event().to_owned(),
        payload: broadcast.to_payload().unwrap(),
    });
    mesh.settle();

    assert_connected(&alice, &bob);
    let transports = mesh.network.open_transports("alice");
    assert_eq!(transports.len(), 1);
    assert_eq!(transports[0].remote_descriptions_set(), 1);
}

#[test]
fn events_of_removed_sessions_are_dropped() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.client("bob");
    mesh.run(bob.room.init_local_media()).unwrap();

    // Bob is present for Alice, but his channel never delivers anything.
    alice.fakes.channel.inject(ChannelEvent::PresenceJoin(vec![
        Participant::new("bob", Some("Bob".to_owned())),
    ]));
    mesh.settle();
    assert_eq!(
        alice.room.peer_state(&bob.id()),
        Some(NegotiationState::AwaitingAnswer),
    );

    alice.room.dispatch(RoomEvent::Peer(PeerEvent::Connected {
        peer_id: bob.id(),
        seq: SessionSeq(u32::MAX),
    }));

    assert_eq!(
        alice.room.peer_state(&bob.id()),
        Some(NegotiationState::AwaitingAnswer),
    );
    assert!(alice.room.snapshot().remote_streams.is_empty());
}

#[test]
fn glare_converges_to_single_session() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");

    // Alice offers on Bob's join while Bob offers on the presence sync.
    let bob = mesh.joined("bob");

    assert_connected(&alice, &bob);
    assert_eq!(alice.room.peers_count(), 1);
    assert_eq!(bob.room.peers_count(), 1);
    assert_eq!(mesh.network.created_transports("alice"), 2);
    assert_eq!(mesh.network.created_transports("bob"), 1);
    assert_eq!(mesh.network.open_transports("alice").len(), 1);
    assert_eq!(mesh.network.open_transports("bob").len(), 1);
    assert_eq!(remote_track_ids(&alice, &bob), vec!["cam-bob", "mic-bob"]);
    assert_eq!(
        remote_track_ids(&bob, &alice),
        vec!["cam-alice", "mic-alice"],
    );
}

#[test]
fn candidates_of_discarded_offer_are_dropped() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");

    assert_connected(&alice, &bob);
    let transports = mesh.network.open_transports("bob");
    assert_eq!(transports.len(), 1);
    assert_eq!(transports[0].remote_candidates(), 1);
}

#[test]
fn misaddressed_and_malformed_broadcasts_are_ignored() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let offer = |to: &str| {
        serde_json::json!({
            "from": "bob",
            "to": to,
            "offer": {"type": "offer", "sdp": "tracks=mic-bob"},
        })
    };
    let inject = |event: &str, payload| {
        alice.fakes.channel.inject(ChannelEvent::Broadcast {
            event: event.to_owned(),
            payload,
        });
    };

    inject("offer", offer("carol"));
    inject("offer", serde_json::json!({"from": "bob"}));
    inject("answer", offer("alice"));
    inject("chat", offer("alice"));
    mesh.settle();
    assert_eq!(alice.room.peers_count(), 0);

    inject("offer", offer("alice"));
    mesh.settle();
    assert_eq!(alice.room.peers_count(), 1);
    assert_eq!(
        alice.room.peer_state(&"bob".into()),
        Some(NegotiationState::Negotiating),
    );
}

#[test]
fn screen_share_replaces_video_in_all_sessions() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");
    let _carol = mesh.joined("carol");
    let camera = Some(TrackId::from("cam-alice"));
    let screen = Some(TrackId::from("screen-alice-0"));

    mesh.run(alice.room.toggle_share()).unwrap();

    assert!(alice.room.snapshot().sharing);
    assert_eq!(mesh.network.video_sent_by("alice"), vec![screen.clone(); 2]);
    let local: Vec<_> = alice
        .room
        .snapshot()
        .local_tracks
        .iter()
        .map(|t| t.id())
        .collect();
    assert!(local.contains(&TrackId::from("screen-alice-0")));

    mesh.run(alice.room.toggle_share()).unwrap();

    assert!(!alice.room.snapshot().sharing);
    assert_eq!(mesh.network.video_sent_by("alice"), vec![camera; 2]);
    assert!(alice.fakes.devices.last_screen().unwrap().stopped());
    let transports = mesh.network.open_transports("alice");
    assert!(transports.iter().all(|t| t.remote_descriptions_set() == 1));
}

#[test]
fn session_created_while_capturing_receives_screen() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");

    let (started, ()) = mesh.run(future::join(
        alice.room.start_share(),
        async {
            alice.fakes.channel.inject(ChannelEvent::PresenceJoin(vec![
                Participant::new("carol", Some("Carol".to_owned())),
            ]));
        },
    ));
    started.unwrap();
    mesh.settle();

    assert_eq!(alice.room.peers_count(), 2);
    assert_eq!(
        mesh.network.video_sent_by("alice"),
        vec![Some(TrackId::from("screen-alice-0")); 2],
    );
}

#[test]
fn hangup_while_capturing_releases_screen() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");

    let (started, ()) = mesh.run(future::join(
        alice.room.start_share(),
        async { alice.room.hangup() },
    ));
    started.unwrap();
    mesh.settle();

    let snapshot = alice.room.snapshot();
    assert!(!snapshot.sharing);
    assert!(snapshot.local_tracks.is_empty());
    assert!(alice.fakes.devices.last_screen().unwrap().stopped());
    assert!(mesh.network.open_transports("alice").is_empty());
}

#[test]
fn newcomer_receives_shared_screen() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");
    mesh.run(alice.room.start_share()).unwrap();

    let carol = mesh.joined("carol");

    assert_connected(&alice, &carol);
    assert_eq!(
        mesh.network.video_sent_by("alice"),
        vec![Some(TrackId::from("screen-alice-0")); 2],
    );
    assert_eq!(
        remote_track_ids(&carol, &alice),
        vec!["mic-alice", "screen-alice-0"],
    );
}

#[test]
fn ended_capture_stops_sharing() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");
    mesh.run(alice.room.start_share()).unwrap();

    alice.fakes.devices.last_screen().unwrap().end();
    mesh.settle();

    assert!(!alice.room.snapshot().sharing);
    assert_eq!(
        mesh.network.video_sent_by("alice"),
        vec![Some(TrackId::from("cam-alice"))],
    );
}

#[test]
fn denied_screen_capture_keeps_camera() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");
    alice.fakes.devices.deny_screen.set(true);

    let err = mesh.run(alice.room.start_share()).unwrap_err();

    assert!(matches!(err.as_ref(), MediaAcquisitionError::Screen(_)));
    assert!(!alice.room.snapshot().sharing);
    assert_eq!(
        mesh.network.video_sent_by("alice"),
        vec![Some(TrackId::from("cam-alice"))],
    );
}

#[test]
fn loudest_participant_becomes_active_speaker() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");
    let _carol = mesh.joined("carol");

    mesh.network.set_level("mic-bob", 24);
    alice.fakes.ticker.tick();
    mesh.settle();
    assert_eq!(alice.room.snapshot().active_speaker, Some(bob.id()));

    mesh.network.set_level("mic-bob", 10);
    mesh.network.set_level("mic-carol", 15);
    alice.fakes.ticker.tick();
    mesh.settle();
    assert_eq!(alice.room.snapshot().active_speaker, None);

    mesh.network.set_level("mic-bob", 24);
    alice.fakes.ticker.tick();
    mesh.settle();
    bob.room.hangup();
    mesh.settle();
    assert_eq!(alice.room.snapshot().active_speaker, None);
}

#[test]
fn raised_hands_are_shared_with_room() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");

    assert!(bob.room.toggle_raise_hand().unwrap());
    mesh.settle();
    assert!(bob.room.snapshot().hand_raised);
    assert!(bob.room.snapshot().raised_hands.is_empty());
    assert_eq!(
        alice.room.snapshot().raised_hands,
        vec![Participant::new("bob", Some("Bob".to_owned()))],
    );

    assert!(!bob.room.toggle_raise_hand().unwrap());
    mesh.settle();
    assert!(alice.room.snapshot().raised_hands.is_empty());

    bob.room.toggle_raise_hand().unwrap();
    mesh.settle();
    bob.room.hangup();
    mesh.settle();
    assert!(alice.room.snapshot().raised_hands.is_empty());
}

#[test]
fn raising_hand_requires_joined_room() {
    let mut mesh = Mesh::new();
    let alice = mesh.client("alice");

    let err = alice.room.toggle_raise_hand().unwrap_err();
    assert!(matches!(err.as_ref(), RoomError::NotJoined));

    mesh.join(&alice);
    alice.room.hangup();
    let err = alice.room.toggle_raise_hand().unwrap_err();
    assert!(matches!(err.as_ref(), RoomError::Closed));
}

#[test]
fn hangup_releases_everything() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");
    mesh.run(alice.room.start_share()).unwrap();

    alice.room.hangup();
    alice.room.hangup();
    mesh.settle();

    let devices = &alice.fakes.devices;
    assert!(devices.local(MediaKind::Audio).unwrap().stopped());
    assert!(devices.local(MediaKind::Video).unwrap().stopped());
    assert!(devices.last_screen().unwrap().stopped());
    let snapshot = alice.room.snapshot();
    assert!(!snapshot.signalling_connected);
    assert!(!snapshot.sharing);
    assert!(snapshot.remote_streams.is_empty());
    assert_eq!(alice.room.peers_count(), 0);
    assert!(mesh.network.open_transports("alice").is_empty());
    assert_eq!(bob.room.peers_count(), 0);

    let err = mesh.run(alice.room.join(&mesh.code.clone())).unwrap_err();
    assert!(matches!(err.as_ref(), RoomJoinError::Closed));
    mesh.run(alice.room.start_share()).unwrap();
    assert!(!alice.room.snapshot().sharing);
}

#[test]
fn joining_twice_fails() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");

    let err = mesh.run(alice.room.join(&mesh.code.clone())).unwrap_err();

    assert!(matches!(err.as_ref(), RoomJoinError::AlreadyJoined));
}

#[test]
fn failed_subscription_may_be_retried() {
    let mut mesh = Mesh::new();
    let alice = mesh.client("alice");
    mesh.network.fail_subscribe.set(true);

    let err = mesh.run(alice.room.join(&mesh.code.clone())).unwrap_err();
    assert!(matches!(err.as_ref(), RoomJoinError::Subscribe(_)));
    assert!(!alice.room.snapshot().signalling_connected);

    mesh.network.fail_subscribe.set(false);
    mesh.join(&alice);
    let bob = mesh.joined("bob");

    assert_connected(&alice, &bob);
}

#[test]
fn participant_without_media_still_connects() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.client("bob");
    bob.fakes.devices.deny_av.set(true);

    let err = mesh.run(bob.room.init_local_media()).unwrap_err();
    assert!(matches!(err.as_ref(), MediaAcquisitionError::LocalAv(_)));
    mesh.run(bob.room.join(&mesh.code.clone())).unwrap();
    mesh.settle();

    assert_connected(&alice, &bob);
    assert!(bob.room.snapshot().local_tracks.is_empty());
    assert!(remote_track_ids(&alice, &bob).is_empty());
    assert_eq!(remote_track_ids(&bob, &alice), vec!["cam-alice", "mic-alice"]);
}

#[test]
fn toggling_media_does_not_renegotiate() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");
    let mic = alice.fakes.devices.local(MediaKind::Audio).unwrap();
    let cam = alice.fakes.devices.local(MediaKind::Video).unwrap();
    let sent = mesh.network.sent().len();

    assert!(alice.room.toggle_mute());
    assert!(alice.room.toggle_video());
    mesh.settle();

    assert!(!mic.enabled());
    assert!(!cam.enabled());
    let snapshot = alice.room.snapshot();
    assert!(snapshot.muted);
    assert!(snapshot.video_off);
    assert_eq!(mesh.network.sent().len(), sent);

    assert!(!alice.room.toggle_mute());
    assert!(mic.enabled());
}

#[test]
fn mute_is_applied_to_recaptured_media() {
    let mut mesh = Mesh::new();
    let alice = mesh.client("alice");
    alice.room.toggle_mute();

    mesh.run(alice.room.init_local_media()).unwrap();

    assert!(!alice.fakes.devices.local(MediaKind::Audio).unwrap().enabled());
    assert!(alice.fakes.devices.local(MediaKind::Video).unwrap().enabled());
}

#[test]
fn recaptured_media_is_sent_in_existing_sessions() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let bob = mesh.joined("bob");
    let old_cam = alice.fakes.devices.local(MediaKind::Video).unwrap();
    let sent = mesh.network.sent().len();

    mesh.run(alice.room.init_local_media()).unwrap();
    mesh.settle();

    assert!(old_cam.stopped());
    assert!(!alice
        .fakes
        .devices
        .local(MediaKind::Video)
        .unwrap()
        .stopped());
    assert_eq!(
        mesh.network.sent_by("alice", MediaKind::Video),
        vec![Some(TrackId::from("cam-alice-1"))],
    );
    assert_eq!(
        mesh.network.sent_by("alice", MediaKind::Audio),
        vec![Some(TrackId::from("mic-alice-1"))],
    );
    assert_eq!(mesh.network.sent().len(), sent);
    assert_connected(&alice, &bob);
}

#[test]
fn recaptured_camera_waits_for_share_to_stop() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let _bob = mesh.joined("bob");
    mesh.run(alice.room.start_share()).unwrap();

    mesh.run(alice.room.init_local_media()).unwrap();
    assert_eq!(
        mesh.network.video_sent_by("alice"),
        vec![Some(TrackId::from("screen-alice-0"))],
    );

    mesh.run(alice.room.stop_share());
    assert_eq!(
        mesh.network.video_sent_by("alice"),
        vec![Some(TrackId::from("cam-alice-1"))],
    );
}

#[test]
fn anonymous_participant_has_no_display_name() {
    let mut mesh = Mesh::new();
    let alice = mesh.joined("alice");
    let ghost = mesh.named_client("ghost", None);
    mesh.join(&ghost);

    let snapshot = alice.room.snapshot();
    let stream = snapshot.remote_stream(&ghost.id()).unwrap();
    assert_eq!(stream.display_name, None);
    assert_eq!(
        ghost
            .room
            .snapshot()
            .remote_stream(&alice.id())
            .unwrap()
            .display_name
            .as_deref(),
        Some("Alice"),
    );
}
