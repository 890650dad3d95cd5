use std::time::Duration;

use techlink::{
    calls::{CallKind, CallState, EndReason},
    db,
    error::ChatError,
    hub::{Connection, Hub, HubConfig},
    identity::{Identity, Role, RoomKey},
    protocol::{ClientEvent, ServerEvent},
    store::MessageStore,
};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

const DEALER: &str = "dealer@shop.com";
const TECH: &str = "tech@fixit.com";

async fn hub_with_timeout(call_timeout: Duration) -> Hub {
    let store = MessageStore::new(db::memory().await.unwrap());
    Hub::new(store, HubConfig { call_timeout, outbox_capacity: 64 })
}

async fn hub() -> Hub {
    hub_with_timeout(Duration::from_secs(30)).await
}

fn room_key() -> RoomKey {
    RoomKey::for_pair(DEALER, TECH).unwrap()
}

async fn next_event(rx: &mut Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn assert_quiet(rx: &mut Receiver<ServerEvent>) {
    let result = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(result.is_err(), "unexpected event: {result:?}");
}

async fn join(hub: &Hub, identity: Identity) -> (Connection, Receiver<ServerEvent>) {
    let role = identity.role;
    let (conn, mut rx) = hub.connect(identity);
    conn.handle(ClientEvent::JoinRoom {
        dealer_email: DEALER.into(),
        technician_email: TECH.into(),
        user_type: role,
    })
    .await
    .unwrap();
    match next_event(&mut rx).await {
        ServerEvent::RoomJoined { room_id, .. } => assert_eq!(room_id, room_key()),
        other => panic!("expected room_joined, got {other:?}"),
    }
    (conn, rx)
}

/// Dealer and technician both joined, with the dealer's `user_joined` drained.
async fn pair(
    hub: &Hub,
) -> (Connection, Receiver<ServerEvent>, Connection, Receiver<ServerEvent>) {
    let (dealer, mut dealer_rx) = join(hub, Identity::dealer(DEALER).unwrap()).await;
    let (tech, tech_rx) = join(hub, Identity::technician(TECH).unwrap()).await;
    match next_event(&mut dealer_rx).await {
        ServerEvent::UserJoined { user, .. } => assert_eq!(user.email, TECH),
        other => panic!("expected user_joined, got {other:?}"),
    }
    (dealer, dealer_rx, tech, tech_rx)
}

fn say(message: &str) -> ClientEvent {
    ClientEvent::SendMessage {
        room_id: room_key(),
        message: message.into(),
        sender_type: None,
    }
}

async fn start_call(
    caller: &Connection,
    caller_rx: &mut Receiver<ServerEvent>,
    callee_rx: &mut Receiver<ServerEvent>,
) -> Uuid {
    caller.handle(ClientEvent::CallInitiate { kind: CallKind::Video }).await.unwrap();
    let ServerEvent::IncomingCall(incoming) = next_event(callee_rx).await else {
        panic!("callee did not get incoming_call");
    };
    let ServerEvent::CallInitiated(initiated) = next_event(caller_rx).await else {
        panic!("caller did not get call_initiated");
    };
    assert_eq!(incoming.call_id, initiated.call_id);
    assert_eq!(initiated.state, CallState::Ringing);
    initiated.call_id
}

#[tokio::test]
async fn join_reports_roster_to_newcomer() {
    let hub = hub().await;
    let (_dealer, _dealer_rx) = join(&hub, Identity::dealer(DEALER).unwrap()).await;

    let (tech, mut tech_rx) = hub.connect(Identity::technician(TECH).unwrap());
    tech.handle(ClientEvent::JoinRoom {
        dealer_email: DEALER.into(),
        technician_email: TECH.into(),
        user_type: Role::Technician,
    })
    .await
    .unwrap();

    let ServerEvent::RoomJoined { members, active_call, .. } = next_event(&mut tech_rx).await
    else {
        panic!("expected room_joined");
    };
    let emails: Vec<_> = members.iter().map(|m| m.email.as_str()).collect();
    assert_eq!(emails, [DEALER, TECH]);
    assert!(active_call.is_none());
    assert_eq!(hub.members_of(&room_key()).await.len(), 2);
}

#[tokio::test]
async fn join_with_wrong_role_is_refused() {
    let hub = hub().await;
    let (conn, _rx) = hub.connect(Identity::dealer(DEALER).unwrap());
    let err = conn
        .handle(ClientEvent::JoinRoom {
            dealer_email: DEALER.into(),
            technician_email: TECH.into(),
            user_type: Role::Technician,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    assert!(hub.members_of(&room_key()).await.is_empty());
}

#[tokio::test]
async fn messages_need_a_joined_room() {
    let hub = hub().await;
    let (conn, _rx) = hub.connect(Identity::dealer(DEALER).unwrap());
    let err = conn.handle(say("anyone?")).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn message_reaches_both_parties() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, _tech, mut tech_rx) = pair(&hub).await;

    dealer.handle(say("first")).await.unwrap();
    dealer
        .handle(ClientEvent::SendMessage {
            room_id: room_key(),
            message: "hello".into(),
            sender_type: Some(Role::Dealer),
        })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for rx in [&mut dealer_rx, &mut tech_rx] {
        let ServerEvent::NewMessage(first) = next_event(rx).await else {
            panic!("expected new_message");
        };
        let ServerEvent::NewMessage(hello) = next_event(rx).await else {
            panic!("expected new_message");
        };
        assert_eq!(hello.content, "hello");
        assert_eq!(hello.sender_type, Role::Dealer);
        assert_eq!(hello.sender_email, DEALER);
        assert!(!hello.read_status);
        assert!(hello.id > first.id);
        ids.push(hello.id);
    }
    assert_eq!(ids[0], ids[1]);

    let history = hub.store().history(&room_key(), None, None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].id, ids[0]);
}

#[tokio::test]
async fn mismatched_sender_type_is_refused() {
    let hub = hub().await;
    let (dealer, _dealer_rx, _tech, mut tech_rx) = pair(&hub).await;

    let err = dealer
        .handle(ClientEvent::SendMessage {
            room_id: room_key(),
            message: "spoofed".into(),
            sender_type: Some(Role::Technician),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    assert_quiet(&mut tech_rx).await;
}

#[tokio::test]
async fn empty_message_is_not_broadcast() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, _tech, mut tech_rx) = pair(&hub).await;

    let err = dealer.handle(say("   ")).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    assert_quiet(&mut dealer_rx).await;
    assert_quiet(&mut tech_rx).await;
}

#[tokio::test]
async fn concurrent_senders_see_one_order() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let dealer_sends = async {
        for i in 0..10 {
            dealer.handle(say(&format!("d{i}"))).await.unwrap();
        }
    };
    let tech_sends = async {
        for i in 0..10 {
            tech.handle(say(&format!("t{i}"))).await.unwrap();
        }
    };
    tokio::join!(dealer_sends, tech_sends);

    let mut orders = Vec::new();
    for rx in [&mut dealer_rx, &mut tech_rx] {
        let mut ids = Vec::new();
        for _ in 0..20 {
            let ServerEvent::NewMessage(message) = next_event(rx).await else {
                panic!("expected new_message");
            };
            ids.push(message.id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids out of order: {ids:?}");
        orders.push(ids);
    }
    assert_eq!(orders[0], orders[1]);
}

#[tokio::test]
async fn mark_read_is_idempotent() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    dealer.handle(say("invoice attached")).await.unwrap();
    let ServerEvent::NewMessage(message) = next_event(&mut tech_rx).await else {
        panic!("expected new_message");
    };
    next_event(&mut dealer_rx).await;

    tech.handle(ClientEvent::MarkRead { message_id: message.id }).await.unwrap();
    match next_event(&mut dealer_rx).await {
        ServerEvent::MessageRead { message_id, reader_email, .. } => {
            assert_eq!(message_id, message.id);
            assert_eq!(reader_email, TECH);
        }
        other => panic!("expected message_read, got {other:?}"),
    }
    assert_quiet(&mut tech_rx).await;

    tech.handle(ClientEvent::MarkRead { message_id: message.id }).await.unwrap();
    tech.handle(ClientEvent::MarkRead { message_id: 9_999 }).await.unwrap();
    assert_quiet(&mut dealer_rx).await;

    let history = hub.store().history(&room_key(), None, None).await.unwrap();
    assert!(history[0].read_status);
}

#[tokio::test]
async fn room_read_clears_unread_for_reader() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, _tech, mut tech_rx) = pair(&hub).await;

    dealer.handle(say("one")).await.unwrap();
    dealer.handle(say("two")).await.unwrap();
    for _ in 0..2 {
        next_event(&mut dealer_rx).await;
        next_event(&mut tech_rx).await;
    }
    assert_eq!(hub.store().unread_count(&room_key(), TECH).await.unwrap(), 2);

    let reader = Identity::technician(TECH).unwrap();
    assert_eq!(hub.mark_room_read(&room_key(), &reader).await.unwrap(), 2);
    match next_event(&mut dealer_rx).await {
        ServerEvent::RoomRead { reader_email, updated, .. } => {
            assert_eq!(reader_email, TECH);
            assert_eq!(updated, 2);
        }
        other => panic!("expected room_read, got {other:?}"),
    }
    assert_eq!(hub.store().unread_count(&room_key(), TECH).await.unwrap(), 0);

    assert_eq!(hub.mark_room_read(&room_key(), &reader).await.unwrap(), 0);
    assert_quiet(&mut dealer_rx).await;
}

#[tokio::test]
async fn typing_skips_the_typist() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, _tech, mut tech_rx) = pair(&hub).await;

    dealer.handle(ClientEvent::Typing { is_typing: true }).await.unwrap();
    match next_event(&mut tech_rx).await {
        ServerEvent::UserTyping { user, is_typing, .. } => {
            assert_eq!(user.email, DEALER);
            assert!(is_typing);
        }
        other => panic!("expected user_typing, got {other:?}"),
    }
    assert_quiet(&mut dealer_rx).await;
}

#[tokio::test]
async fn second_call_is_refused() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let call_id = start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;

    let err = tech
        .handle(ClientEvent::CallInitiate { kind: CallKind::Audio })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::CallAlreadyActive));
    assert_eq!(hub.active_call(&room_key()).await.unwrap().call_id, call_id);
}

#[tokio::test]
async fn call_to_offline_callee_stays_initiated() {
    let hub = hub().await;
    let (dealer, mut dealer_rx) = join(&hub, Identity::dealer(DEALER).unwrap()).await;

    dealer.handle(ClientEvent::CallInitiate { kind: CallKind::Audio }).await.unwrap();
    let ServerEvent::CallInitiated(info) = next_event(&mut dealer_rx).await else {
        panic!("expected call_initiated");
    };
    assert_eq!(info.state, CallState::Initiated);
    assert_eq!(info.callee_email, TECH);
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let hub = hub_with_timeout(Duration::from_millis(200)).await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let call_id = start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;

    for rx in [&mut dealer_rx, &mut tech_rx] {
        match next_event(rx).await {
            ServerEvent::CallTimeout(info) => {
                assert_eq!(info.call_id, call_id);
                assert_eq!(info.state, CallState::TimedOut);
                assert!(info.ended_at.is_some());
            }
            other => panic!("expected call_timeout, got {other:?}"),
        }
    }
    assert!(hub.active_call(&room_key()).await.is_none());

    let err = tech.handle(ClientEvent::CallAccept { call_id }).await.unwrap_err();
    assert!(matches!(err, ChatError::CallAlreadyResolved(id) if id == call_id));

    tech.handle(ClientEvent::CallInitiate { kind: CallKind::Audio }).await.unwrap();
}

#[tokio::test]
async fn accepted_call_outlives_its_timer() {
    let hub = hub_with_timeout(Duration::from_millis(150)).await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let call_id = start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;
    tech.handle(ClientEvent::CallAccept { call_id }).await.unwrap();
    match next_event(&mut dealer_rx).await {
        ServerEvent::CallAccepted(info) => assert_eq!(info.state, CallState::Connected),
        other => panic!("expected call_accepted, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_quiet(&mut dealer_rx).await;
    assert_quiet(&mut tech_rx).await;
    assert_eq!(hub.active_call(&room_key()).await.unwrap().state, CallState::Connected);
}

#[tokio::test]
async fn late_hangup_after_reject_is_ignored() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let call_id = start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;
    tech.handle(ClientEvent::CallReject { call_id }).await.unwrap();
    match next_event(&mut dealer_rx).await {
        ServerEvent::CallRejected(info) => assert_eq!(info.state, CallState::Rejected),
        other => panic!("expected call_rejected, got {other:?}"),
    }

    dealer.handle(ClientEvent::CallEnd { call_id }).await.unwrap();
    assert_quiet(&mut tech_rx).await;

    let err = dealer
        .handle(ClientEvent::CallEnd { call_id: Uuid::new_v4() })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::UnknownCall(_)));
}

#[tokio::test]
async fn hangup_reaches_the_other_side() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let call_id = start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;
    tech.handle(ClientEvent::CallAccept { call_id }).await.unwrap();
    next_event(&mut dealer_rx).await;

    dealer.handle(ClientEvent::CallEnd { call_id }).await.unwrap();
    match next_event(&mut tech_rx).await {
        ServerEvent::CallEnded { call, reason } => {
            assert_eq!(call.state, CallState::Ended);
            assert_eq!(reason, EndReason::Hangup);
        }
        other => panic!("expected call_ended, got {other:?}"),
    }
    assert_quiet(&mut dealer_rx).await;
    assert!(hub.active_call(&room_key()).await.is_none());
}

#[tokio::test]
async fn media_failure_frees_the_slot() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let call_id = start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;
    tech.handle(ClientEvent::CallFail { call_id, reason: Some("ice failed".into()) })
        .await
        .unwrap();
    match next_event(&mut dealer_rx).await {
        ServerEvent::CallFailed { call, reason } => {
            assert_eq!(call.state, CallState::Failed);
            assert_eq!(reason.as_deref(), Some("ice failed"));
        }
        other => panic!("expected call_failed, got {other:?}"),
    }
    assert!(hub.active_call(&room_key()).await.is_none());
}

#[tokio::test]
async fn disconnect_ends_connected_call_once() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;

    let call_id = start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;
    tech.handle(ClientEvent::CallAccept { call_id }).await.unwrap();
    next_event(&mut dealer_rx).await;

    tech.close().await;

    match next_event(&mut dealer_rx).await {
        ServerEvent::UserLeft { user, .. } => assert_eq!(user.email, TECH),
        other => panic!("expected user_left, got {other:?}"),
    }
    match next_event(&mut dealer_rx).await {
        ServerEvent::CallEnded { call, reason } => {
            assert_eq!(call.call_id, call_id);
            assert_eq!(reason, EndReason::PeerDisconnected);
        }
        other => panic!("expected call_ended, got {other:?}"),
    }
    assert_quiet(&mut dealer_rx).await;

    assert!(hub.active_call(&room_key()).await.is_none());
    assert_eq!(hub.members_of(&room_key()).await.len(), 1);
}

#[tokio::test]
async fn second_tab_keeps_the_call_alive() {
    let hub = hub().await;
    let (dealer, mut dealer_rx, tech, mut tech_rx) = pair(&hub).await;
    let (tech_tab, _tab_rx) = join(&hub, Identity::technician(TECH).unwrap()).await;
    for rx in [&mut dealer_rx, &mut tech_rx] {
        assert!(matches!(next_event(rx).await, ServerEvent::UserJoined { .. }));
    }

    start_call(&dealer, &mut dealer_rx, &mut tech_rx).await;
    tech.close().await;

    match next_event(&mut dealer_rx).await {
        ServerEvent::UserLeft { user, .. } => assert_eq!(user.email, TECH),
        other => panic!("expected user_left, got {other:?}"),
    }
    assert_quiet(&mut dealer_rx).await;
    assert!(hub.active_call(&room_key()).await.is_some());

    tech_tab.close().await;
}

#[tokio::test]
async fn dropped_connection_releases_presence() {
    let hub = hub().await;
    let (_dealer, mut dealer_rx, tech, _tech_rx) = pair(&hub).await;

    drop(tech);

    match next_event(&mut dealer_rx).await {
        ServerEvent::UserLeft { user, .. } => assert_eq!(user.email, TECH),
        other => panic!("expected user_left, got {other:?}"),
    }
    assert_eq!(hub.members_of(&room_key()).await.len(), 1);
    assert_eq!(hub.joined_connections().await, 1);
}

#[tokio::test]
async fn empty_room_is_released() {
    let hub = hub().await;
    let (dealer, _dealer_rx, tech, _tech_rx) = pair(&hub).await;

    dealer.close().await;
    tech.close().await;

    assert!(hub.members_of(&room_key()).await.is_empty());
    assert_eq!(hub.joined_connections().await, 0);

    let room = hub.store().room(&room_key()).await.unwrap();
    assert!(room.is_some());
}

#[tokio::test]
async fn store_outage_is_reported_to_sender_only() {
    let db_pool = db::memory().await.unwrap();
    let hub = Hub::new(MessageStore::new(db_pool.clone()), HubConfig::default());
    let (dealer, mut dealer_rx, _tech, mut tech_rx) = pair(&hub).await;

    db_pool.close().await;

    let err = dealer.handle(say("lost?")).await.unwrap_err();
    assert!(matches!(err, ChatError::StoreUnavailable(_)));
    assert_eq!(err.code(), "STORE_UNAVAILABLE");
    assert_quiet(&mut dealer_rx).await;
    assert_quiet(&mut tech_rx).await;
}

#[tokio::test]
async fn sign_out_ends_the_sessions_connections() {
    let hub = hub().await;
    let (_dealer, mut dealer_rx) = join(&hub, Identity::dealer(DEALER).unwrap()).await;

    let (tech, mut tech_rx) = hub
        .connect_in_scope(Identity::technician(TECH).unwrap(), "session-1")
        .await;
    tech.handle(ClientEvent::JoinRoom {
        dealer_email: DEALER.into(),
        technician_email: TECH.into(),
        user_type: Role::Technician,
    })
    .await
    .unwrap();
    assert!(matches!(next_event(&mut tech_rx).await, ServerEvent::RoomJoined { .. }));
    assert!(matches!(next_event(&mut dealer_rx).await, ServerEvent::UserJoined { .. }));

    assert_eq!(hub.sign_out("another-session").await, 0);
    assert_eq!(hub.sign_out("session-1").await, 1);

    match next_event(&mut dealer_rx).await {
        ServerEvent::UserLeft { user, .. } => assert_eq!(user.email, TECH),
        other => panic!("expected user_left, got {other:?}"),
    }
    tokio::time::timeout(Duration::from_secs(2), tech.signed_out())
        .await
        .expect("connection was not told it signed out");
    assert_eq!(hub.members_of(&room_key()).await.len(), 1);

    assert_eq!(hub.sign_out("session-1").await, 0);
    tech.close().await;
    assert_quiet(&mut dealer_rx).await;
}

#[tokio::test]
async fn separator_in_email_cannot_reach_another_room() {
    let hub = hub().await;
    let (outsider, mut outsider_rx) = hub.connect(Identity::dealer("x@y.com").unwrap());
    let err = outsider
        .handle(ClientEvent::JoinRoom {
            dealer_email: "x@y.com".into(),
            technician_email: format!("z:{TECH}"),
            user_type: Role::Dealer,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidIdentity));
    assert_quiet(&mut outsider_rx).await;
    assert_eq!(hub.joined_connections().await, 0);
}

#[tokio::test]
async fn call_needs_a_different_party() {
    let hub = hub().await;
    let (conn, _rx) = hub.connect(Identity::dealer(DEALER).unwrap());
    let err = conn
        .handle(ClientEvent::JoinRoom {
            dealer_email: DEALER.into(),
            technician_email: DEALER.into(),
            user_type: Role::Dealer,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidIdentity));
}
