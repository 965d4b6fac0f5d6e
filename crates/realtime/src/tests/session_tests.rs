use super::*;
use crate::backoff::FixedBackoff;
use chrono::{TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use shared::{
    domain::{ConversationId, MessageId, UserId, WorkspaceId},
    protocol::MessageItem,
};

const RETRY: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_secs(1);

fn config() -> SessionConfig {
    SessionConfig {
        topic_prefix: "/topic/conversations/".into(),
        subscription_id: "sub-0".into(),
        protocol_version: "1.2".into(),
        workspace_poll: POLL,
        auth_close_code: 4001,
    }
}

fn machine() -> SessionMachine {
    SessionMachine::new(config(), Arc::new(FixedBackoff::new(RETRY)))
}

fn token(exp_offset_secs: i64) -> String {
    let exp = Utc::now().timestamp() + exp_offset_secs;
    encode(
        &Header::default(),
        &json!({ "sub": "7", "exp": exp }),
        &EncodingKey::from_secret(b"k"),
    )
    .expect("token")
}

fn credentials() -> Credentials {
    Credentials {
        identity_token: Some(token(600)),
        workspace_id: Some(WorkspaceId("ws-1".into())),
        subscriber_key: "alice@example.com".into(),
    }
}

fn connected_frame() -> Frame {
    Frame::new(Command::Connected).with_header("version", "1.2")
}

fn error_frame(message: &str) -> Frame {
    Frame::new(Command::Error).with_header("message", message)
}

fn message_frame(body: serde_json::Value) -> Frame {
    Frame::new(Command::Message)
        .with_header("destination", "/topic/conversations/alice%40example.com")
        .with_body(body.to_string())
}

fn statuses(actions: &[SessionAction]) -> Vec<ConnectionStatus> {
    actions
        .iter()
        .filter_map(|action| match action {
            SessionAction::PublishStatus(status) => Some(*status),
            _ => None,
        })
        .collect()
}

/// Drives a machine all the way to `Connected`.
fn connected_machine() -> SessionMachine {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    machine.handle(SessionEvent::CredentialsLoaded(credentials()));
    machine.handle(SessionEvent::SocketOpened);
    machine.handle(SessionEvent::FrameReceived(connected_frame()));
    assert_eq!(machine.phase(), &SessionPhase::Connected);
    machine
}

#[test]
fn activate_publishes_connecting_and_fetches_credentials() {
    let mut machine = machine();
    let actions = machine.handle(SessionEvent::Activate);
    assert_eq!(
        actions,
        vec![
            SessionAction::PublishStatus(ConnectionStatus::Connecting),
            SessionAction::FetchCredentials,
        ]
    );
    assert_eq!(machine.phase(), &SessionPhase::AwaitingCredentials);
}

#[test]
fn full_handshake_sends_connect_then_subscribe() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);

    let creds = credentials();
    let token = creds.identity_token.clone().expect("token");
    let actions = machine.handle(SessionEvent::CredentialsLoaded(creds));
    assert_eq!(actions, vec![SessionAction::OpenSocket]);

    let actions = machine.handle(SessionEvent::SocketOpened);
    let [SessionAction::Send(connect)] = actions.as_slice() else {
        panic!("expected a single CONNECT send, got {actions:?}");
    };
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(
        connect.header("Authorization"),
        Some(format!("Bearer {token}").as_str())
    );
    assert_eq!(connect.header("Workspace-Id"), Some("ws-1"));
    assert_eq!(connect.header("accept-version"), Some("1.2"));
    assert_eq!(machine.status(), ConnectionStatus::Connecting);

    let actions = machine.handle(SessionEvent::FrameReceived(connected_frame()));
    assert_eq!(
        actions,
        vec![
            SessionAction::Send(Frame::subscribe(
                "/topic/conversations/alice%40example.com",
                "sub-0"
            )),
            SessionAction::PublishStatus(ConnectionStatus::Connected),
        ]
    );
    assert_eq!(machine.status(), ConnectionStatus::Connected);
}

#[test]
fn missing_workspace_polls_without_opening_a_socket() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    let actions = machine.handle(SessionEvent::CredentialsLoaded(Credentials {
        workspace_id: None,
        ..credentials()
    }));
    assert_eq!(
        actions,
        vec![SessionAction::StartTimer {
            kind: TimerKind::WorkspacePoll,
            delay: POLL,
        }]
    );
    assert_eq!(machine.phase(), &SessionPhase::WaitingForWorkspace);
    assert_eq!(machine.status(), ConnectionStatus::Connecting);

    let actions = machine.handle(SessionEvent::TimerFired(TimerKind::WorkspacePoll));
    assert_eq!(actions, vec![SessionAction::FetchCredentials]);

    let actions = machine.handle(SessionEvent::CredentialsLoaded(credentials()));
    assert_eq!(actions, vec![SessionAction::OpenSocket]);
}

#[test]
fn missing_workspace_takes_precedence_over_missing_token() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    let actions = machine.handle(SessionEvent::CredentialsLoaded(Credentials {
        identity_token: None,
        workspace_id: None,
        subscriber_key: "alice".into(),
    }));
    assert!(matches!(
        actions.as_slice(),
        [SessionAction::StartTimer { kind: TimerKind::WorkspacePoll, .. }]
    ));
}

#[test]
fn missing_token_halts_before_any_socket() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    let actions = machine.handle(SessionEvent::CredentialsLoaded(Credentials {
        identity_token: None,
        ..credentials()
    }));
    assert!(!actions.contains(&SessionAction::OpenSocket));
    assert_eq!(
        statuses(&actions),
        vec![ConnectionStatus::Error(ErrorKind::Auth)]
    );
    assert_eq!(
        machine.phase(),
        &SessionPhase::Halted(HaltReason::MissingToken)
    );
}

#[test]
fn expired_and_malformed_tokens_halt() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    machine.handle(SessionEvent::CredentialsLoaded(Credentials {
        identity_token: Some(token(-30)),
        ..credentials()
    }));
    assert_eq!(
        machine.phase(),
        &SessionPhase::Halted(HaltReason::TokenExpired)
    );

    let mut machine = self::machine();
    machine.handle(SessionEvent::Activate);
    machine.handle(SessionEvent::CredentialsLoaded(Credentials {
        identity_token: Some("definitely.not.jwt".into()),
        ..credentials()
    }));
    assert_eq!(
        machine.phase(),
        &SessionPhase::Halted(HaltReason::InvalidToken)
    );
    assert!(machine.status().is_terminal());
}

#[test]
fn credentials_failure_is_transient() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    let actions = machine.handle(SessionEvent::CredentialsFailed("session store offline".into()));
    assert_eq!(
        statuses(&actions),
        vec![
            ConnectionStatus::Error(ErrorKind::Transient),
            ConnectionStatus::Disconnected,
        ]
    );
    assert!(actions.contains(&SessionAction::StartTimer {
        kind: TimerKind::Reconnect,
        delay: RETRY,
    }));
    assert_eq!(machine.phase(), &SessionPhase::BackingOff);
}

#[test]
fn message_frames_dispatch_decoded_payloads() {
    let mut machine = connected_machine();
    let sent_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let actions = machine.handle(SessionEvent::FrameReceived(message_frame(json!({
        "conversationId": 42,
        "messages": [{
            "id": 9,
            "conversationId": 42,
            "senderId": 3,
            "content": "hi",
            "sentAt": "2024-03-01T12:00:00Z"
        }]
    }))));

    assert_eq!(
        actions,
        vec![SessionAction::Dispatch(InboundPayload {
            conversation_id: ConversationId(42),
            conversation: None,
            messages: vec![MessageItem {
                id: MessageId(9),
                conversation_id: ConversationId(42),
                sender_id: UserId(3),
                sender_name: None,
                content: "hi".into(),
                sent_at,
            }],
        })]
    );
    assert_eq!(machine.phase(), &SessionPhase::Connected);
}

#[test]
fn empty_or_undecodable_payloads_are_dropped() {
    let mut machine = connected_machine();
    let actions = machine.handle(SessionEvent::FrameReceived(message_frame(json!({
        "conversationId": 42,
        "messages": []
    }))));
    assert!(actions.is_empty());

    let frame = Frame::new(Command::Message).with_body("{not json");
    assert!(machine.handle(SessionEvent::FrameReceived(frame)).is_empty());
    assert_eq!(machine.phase(), &SessionPhase::Connected);
}

#[test]
fn message_before_handshake_is_ignored() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    machine.handle(SessionEvent::CredentialsLoaded(credentials()));
    machine.handle(SessionEvent::SocketOpened);

    let actions = machine.handle(SessionEvent::FrameReceived(message_frame(json!({
        "conversationId": 1,
        "messages": []
    }))));
    assert!(actions.is_empty());
    assert!(matches!(machine.phase(), SessionPhase::Handshaking { .. }));
}

#[test]
fn auth_error_frame_halts_and_timer_cannot_revive() {
    let mut machine = connected_machine();
    let actions = machine.handle(SessionEvent::FrameReceived(error_frame(
        "Unauthorized: token rejected",
    )));
    assert_eq!(
        statuses(&actions),
        vec![ConnectionStatus::Error(ErrorKind::Auth)]
    );
    assert!(actions.contains(&SessionAction::CloseSocket));
    assert!(!actions
        .iter()
        .any(|action| matches!(action, SessionAction::StartTimer { .. })));

    for event in [
        SessionEvent::TimerFired(TimerKind::Reconnect),
        SessionEvent::SocketClosed {
            code: Some(1000),
            reason: String::new(),
        },
        SessionEvent::Activate,
        SessionEvent::Deactivate,
    ] {
        assert!(machine.handle(event).is_empty());
    }
    assert!(machine.status().is_terminal());
}

#[test]
fn structured_code_overrides_keyword_matching() {
    let mut machine = connected_machine();
    let frame = Frame::new(Command::Error)
        .with_header("code", "RATE_LIMITED")
        .with_header("message", "token bucket exhausted");
    let actions = machine.handle(SessionEvent::FrameReceived(frame));
    assert_eq!(machine.phase(), &SessionPhase::BackingOff);
    assert!(statuses(&actions).contains(&ConnectionStatus::Error(ErrorKind::Transient)));

    let mut machine = connected_machine();
    let frame = Frame::new(Command::Error)
        .with_header("code", "forbidden")
        .with_body("nope");
    machine.handle(SessionEvent::FrameReceived(frame));
    assert!(matches!(
        machine.phase(),
        SessionPhase::Halted(HaltReason::ServerRejected(BrokerError {
            code: Some(ErrorCode::Forbidden),
            ..
        }))
    ));
}

#[test]
fn generic_error_frame_reconnects() {
    let mut machine = connected_machine();
    let actions = machine.handle(SessionEvent::FrameReceived(error_frame(
        "broker overloaded",
    )));
    assert_eq!(
        actions,
        vec![
            SessionAction::CloseSocket,
            SessionAction::CancelTimer,
            SessionAction::PublishStatus(ConnectionStatus::Error(ErrorKind::Transient)),
            SessionAction::PublishStatus(ConnectionStatus::Disconnected),
            SessionAction::StartTimer {
                kind: TimerKind::Reconnect,
                delay: RETRY,
            },
        ]
    );

    let actions = machine.handle(SessionEvent::TimerFired(TimerKind::Reconnect));
    assert_eq!(
        actions,
        vec![
            SessionAction::PublishStatus(ConnectionStatus::Connecting),
            SessionAction::FetchCredentials,
        ]
    );
}

#[test]
fn ordinary_close_reconnects_without_error_status() {
    let mut machine = connected_machine();
    let actions = machine.handle(SessionEvent::SocketClosed {
        code: Some(1006),
        reason: "abnormal".into(),
    });
    assert_eq!(statuses(&actions), vec![ConnectionStatus::Disconnected]);
    assert_eq!(machine.phase(), &SessionPhase::BackingOff);
}

#[test]
fn auth_close_codes_halt() {
    for code in [1002, 1008, 4001] {
        let mut machine = connected_machine();
        let actions = machine.handle(SessionEvent::SocketClosed {
            code: Some(code),
            reason: String::new(),
        });
        assert_eq!(
            statuses(&actions),
            vec![ConnectionStatus::Error(ErrorKind::Auth)]
        );
        assert_eq!(
            machine.phase(),
            &SessionPhase::Halted(HaltReason::AuthClose { code })
        );
    }
}

#[test]
fn socket_failure_while_opening_backs_off() {
    let mut machine = machine();
    machine.handle(SessionEvent::Activate);
    machine.handle(SessionEvent::CredentialsLoaded(credentials()));
    let actions = machine.handle(SessionEvent::SocketFailed("connection refused".into()));
    assert!(statuses(&actions).contains(&ConnectionStatus::Error(ErrorKind::Transient)));
    assert_eq!(machine.phase(), &SessionPhase::BackingOff);
}

#[test]
fn deactivate_tears_down_from_any_live_phase() {
    let mut machine = connected_machine();
    let actions = machine.handle(SessionEvent::Deactivate);
    assert_eq!(
        actions,
        vec![
            SessionAction::CancelTimer,
            SessionAction::CloseSocket,
            SessionAction::PublishStatus(ConnectionStatus::Disconnected),
        ]
    );
    assert_eq!(machine.phase(), &SessionPhase::Disconnected);

    let mut machine = self::machine();
    machine.handle(SessionEvent::Activate);
    machine.handle(SessionEvent::CredentialsFailed("x".into()));
    assert_eq!(machine.phase(), &SessionPhase::BackingOff);
    machine.handle(SessionEvent::Deactivate);

    // A reconnect timer that raced the teardown must not restart anything.
    assert!(machine
        .handle(SessionEvent::TimerFired(TimerKind::Reconnect))
        .is_empty());
    assert_eq!(machine.phase(), &SessionPhase::Disconnected);
}

#[test]
fn stray_events_are_ignored() {
    let mut machine = machine();
    assert!(machine.handle(SessionEvent::SocketOpened).is_empty());
    assert!(machine
        .handle(SessionEvent::FrameReceived(connected_frame()))
        .is_empty());
    assert_eq!(machine.phase(), &SessionPhase::Disconnected);

    let mut machine = connected_machine();
    assert!(machine
        .handle(SessionEvent::TimerFired(TimerKind::WorkspacePoll))
        .is_empty());
    assert!(machine
        .handle(SessionEvent::CredentialsLoaded(credentials()))
        .is_empty());
    assert_eq!(machine.phase(), &SessionPhase::Connected);
}

#[test]
fn attempts_reset_after_a_successful_handshake() {
    struct Growing;
    impl ReconnectPolicy for Growing {
        fn next_delay(&self, attempt: u32) -> Duration {
            Duration::from_secs(u64::from(attempt))
        }
    }

    let mut machine = SessionMachine::new(config(), Arc::new(Growing));
    machine.handle(SessionEvent::Activate);
    machine.handle(SessionEvent::CredentialsFailed("a".into()));
    machine.handle(SessionEvent::TimerFired(TimerKind::Reconnect));
    let actions = machine.handle(SessionEvent::CredentialsFailed("b".into()));
    assert!(actions.contains(&SessionAction::StartTimer {
        kind: TimerKind::Reconnect,
        delay: Duration::from_secs(2),
    }));

    machine.handle(SessionEvent::TimerFired(TimerKind::Reconnect));
    machine.handle(SessionEvent::CredentialsLoaded(credentials()));
    machine.handle(SessionEvent::SocketOpened);
    machine.handle(SessionEvent::FrameReceived(connected_frame()));
    let actions = machine.handle(SessionEvent::SocketClosed {
        code: Some(1001),
        reason: "going away".into(),
    });
    assert!(actions.contains(&SessionAction::StartTimer {
        kind: TimerKind::Reconnect,
        delay: Duration::from_secs(1),
    }));
}

#[test]
fn destination_percent_encodes_subscriber_key() {
    assert_eq!(
        subscription_destination("/topic/conversations/", "a b@c.io"),
        "/topic/conversations/a+b%40c.io"
    );
}

#[test]
fn keyword_classification_is_case_insensitive() {
    assert!(is_auth_failure(&BrokerError::new(None, "JWT Expired")));
    assert!(is_auth_failure(&BrokerError::new(None, "AUTHENTICATION required")));
    assert!(!is_auth_failure(&BrokerError::new(None, "destination not found")));
}

#[test]
fn broker_error_joins_message_header_and_body() {
    let frame = error_frame("rejected").with_body("bad destination");
    assert_eq!(
        broker_error(&frame),
        BrokerError::new(None, "rejected: bad destination")
    );
}
