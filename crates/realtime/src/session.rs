//! Connection lifecycle as a pure state machine.
//!
//! [`SessionMachine::handle`] takes one [`SessionEvent`] and returns the
//! [`SessionAction`]s the driver must perform. It never touches the network
//! or the clock beyond reading the current time for token expiry, so every
//! `(phase, event)` pair can be exercised directly.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    error::{BrokerError, ErrorCode},
    protocol::InboundPayload,
};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::{
    backoff::ReconnectPolicy,
    config::Settings,
    credentials::{token_status, Credentials, TokenStatus},
    frame::{Command, Frame},
};

const CLOSE_PROTOCOL_ERROR: u16 = 1002;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const AUTH_KEYWORDS: [&str; 4] = ["unauthorized", "token", "expired", "auth"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Auth,
}

/// Coarse status for UI display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(ErrorKind),
}

impl ConnectionStatus {
    /// Auth failures end the session; only a fresh start can leave this.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error(ErrorKind::Auth))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    MissingToken,
    TokenExpired,
    InvalidToken,
    ServerRejected(BrokerError),
    AuthClose { code: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    WorkspacePoll,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    AwaitingCredentials,
    WaitingForWorkspace,
    Opening { connect: Frame, subscriber_key: String },
    Handshaking { subscriber_key: String },
    Connected,
    BackingOff,
    Halted(HaltReason),
}

impl SessionPhase {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected | Self::BackingOff => ConnectionStatus::Disconnected,
            Self::AwaitingCredentials
            | Self::WaitingForWorkspace
            | Self::Opening { .. }
            | Self::Handshaking { .. } => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
            Self::Halted(_) => ConnectionStatus::Error(ErrorKind::Auth),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Activate,
    Deactivate,
    CredentialsLoaded(Credentials),
    CredentialsFailed(String),
    SocketOpened,
    SocketFailed(String),
    SocketClosed { code: Option<u16>, reason: String },
    FrameReceived(Frame),
    TimerFired(TimerKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    FetchCredentials,
    OpenSocket,
    Send(Frame),
    CloseSocket,
    StartTimer { kind: TimerKind, delay: Duration },
    CancelTimer,
    Dispatch(InboundPayload),
    PublishStatus(ConnectionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub topic_prefix: String,
    pub subscription_id: String,
    pub protocol_version: String,
    pub workspace_poll: Duration,
    pub auth_close_code: u16,
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            topic_prefix: settings.topic_prefix.clone(),
            subscription_id: settings.subscription_id.clone(),
            protocol_version: settings.protocol_version.clone(),
            workspace_poll: settings.workspace_poll_interval(),
            auth_close_code: settings.auth_close_code,
        }
    }
}

pub struct SessionMachine {
    config: SessionConfig,
    policy: Arc<dyn ReconnectPolicy>,
    phase: SessionPhase,
    attempts: u32,
}

impl SessionMachine {
    pub fn new(config: SessionConfig, policy: Arc<dyn ReconnectPolicy>) -> Self {
        Self {
            config,
            policy,
            phase: SessionPhase::Disconnected,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn status(&self) -> ConnectionStatus {
        self.phase.status()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        let phase = std::mem::replace(&mut self.phase, SessionPhase::Disconnected);
        match (phase, event) {
            (SessionPhase::Halted(reason), _) => {
                self.phase = SessionPhase::Halted(reason);
                Vec::new()
            }
            (SessionPhase::Disconnected, SessionEvent::Activate) => self.begin_attempt(),
            (SessionPhase::Disconnected, _) => Vec::new(),
            (_, SessionEvent::Deactivate) => self.teardown(),

            (SessionPhase::AwaitingCredentials, SessionEvent::CredentialsLoaded(credentials)) => {
                self.evaluate_credentials(credentials)
            }
            (SessionPhase::AwaitingCredentials, SessionEvent::CredentialsFailed(reason)) => {
                warn!(reason = %reason, "realtime: credentials unavailable");
                self.schedule_reconnect(true)
            }

            (
                SessionPhase::WaitingForWorkspace,
                SessionEvent::TimerFired(TimerKind::WorkspacePoll),
            ) => {
                self.phase = SessionPhase::AwaitingCredentials;
                vec![SessionAction::FetchCredentials]
            }

            (
                SessionPhase::Opening {
                    connect,
                    subscriber_key,
                },
                SessionEvent::SocketOpened,
            ) => {
                self.phase = SessionPhase::Handshaking { subscriber_key };
                vec![SessionAction::Send(connect)]
            }

            (SessionPhase::Handshaking { subscriber_key }, SessionEvent::FrameReceived(frame))
                if frame.command == Command::Connected =>
            {
                self.attempts = 0;
                self.phase = SessionPhase::Connected;
                let destination =
                    subscription_destination(&self.config.topic_prefix, &subscriber_key);
                info!(destination = %destination, "realtime: handshake complete, subscribing");
                vec![
                    SessionAction::Send(Frame::subscribe(
                        destination,
                        self.config.subscription_id.clone(),
                    )),
                    SessionAction::PublishStatus(ConnectionStatus::Connected),
                ]
            }

            (SessionPhase::Connected, SessionEvent::FrameReceived(frame))
                if frame.command == Command::Message =>
            {
                self.phase = SessionPhase::Connected;
                decode_payload(&frame)
                    .map(SessionAction::Dispatch)
                    .into_iter()
                    .collect()
            }

            (
                phase @ (SessionPhase::Handshaking { .. } | SessionPhase::Connected),
                SessionEvent::FrameReceived(frame),
            ) => {
                if frame.command == Command::Error {
                    return self.on_error_frame(&frame);
                }
                debug!(command = frame.command.as_str(), "realtime: ignoring frame");
                self.phase = phase;
                Vec::new()
            }

            (
                SessionPhase::Opening { .. }
                | SessionPhase::Handshaking { .. }
                | SessionPhase::Connected,
                SessionEvent::SocketFailed(reason),
            ) => {
                warn!(reason = %reason, "realtime: socket error");
                self.schedule_reconnect(true)
            }
            (
                SessionPhase::Opening { .. }
                | SessionPhase::Handshaking { .. }
                | SessionPhase::Connected,
                SessionEvent::SocketClosed { code, reason },
            ) => self.on_close(code, &reason),

            (SessionPhase::BackingOff, SessionEvent::TimerFired(TimerKind::Reconnect)) => {
                self.begin_attempt()
            }

            (phase, event) => {
                debug!(?event, "realtime: event ignored in current phase");
                self.phase = phase;
                Vec::new()
            }
        }
    }

    fn begin_attempt(&mut self) -> Vec<SessionAction> {
        self.phase = SessionPhase::AwaitingCredentials;
        vec![
            SessionAction::PublishStatus(ConnectionStatus::Connecting),
            SessionAction::FetchCredentials,
        ]
    }

    fn evaluate_credentials(&mut self, credentials: Credentials) -> Vec<SessionAction> {
        let Some(workspace_id) = credentials.workspace_id else {
            debug!("realtime: workspace not selected yet, polling");
            self.phase = SessionPhase::WaitingForWorkspace;
            return vec![SessionAction::StartTimer {
                kind: TimerKind::WorkspacePoll,
                delay: self.config.workspace_poll,
            }];
        };
        let Some(token) = credentials.identity_token else {
            return self.halt(HaltReason::MissingToken);
        };
        match token_status(&token, Utc::now()) {
            TokenStatus::Valid => {}
            TokenStatus::Expired => return self.halt(HaltReason::TokenExpired),
            TokenStatus::Malformed => return self.halt(HaltReason::InvalidToken),
        }

        let connect = Frame::connect(
            &token,
            workspace_id.as_str(),
            &self.config.protocol_version,
        );
        self.phase = SessionPhase::Opening {
            connect,
            subscriber_key: credentials.subscriber_key,
        };
        vec![SessionAction::OpenSocket]
    }

    fn on_error_frame(&mut self, frame: &Frame) -> Vec<SessionAction> {
        let broker_error = broker_error(frame);
        if is_auth_failure(&broker_error) {
            return self.halt(HaltReason::ServerRejected(broker_error));
        }
        warn!(error = %broker_error, "realtime: broker reported an error");
        self.schedule_reconnect(true)
    }

    fn on_close(&mut self, code: Option<u16>, reason: &str) -> Vec<SessionAction> {
        if let Some(code) = code {
            if self.is_auth_close(code) {
                return self.halt(HaltReason::AuthClose { code });
            }
        }
        info!(code = ?code, reason, "realtime: socket closed");
        self.schedule_reconnect(false)
    }

    fn is_auth_close(&self, code: u16) -> bool {
        code == CLOSE_PROTOCOL_ERROR
            || code == CLOSE_POLICY_VIOLATION
            || code == self.config.auth_close_code
    }

    fn schedule_reconnect(&mut self, surface_error: bool) -> Vec<SessionAction> {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self.policy.next_delay(self.attempts);
        self.phase = SessionPhase::BackingOff;
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "realtime: scheduling reconnect"
        );

        let mut actions = vec![SessionAction::CloseSocket, SessionAction::CancelTimer];
        if surface_error {
            actions.push(SessionAction::PublishStatus(ConnectionStatus::Error(
                ErrorKind::Transient,
            )));
        }
        actions.push(SessionAction::PublishStatus(ConnectionStatus::Disconnected));
        actions.push(SessionAction::StartTimer {
            kind: TimerKind::Reconnect,
            delay,
        });
        actions
    }

    fn halt(&mut self, reason: HaltReason) -> Vec<SessionAction> {
        error!(reason = ?reason, "realtime: authentication failed, retries halted");
        self.phase = SessionPhase::Halted(reason);
        vec![
            SessionAction::CancelTimer,
            SessionAction::CloseSocket,
            SessionAction::PublishStatus(ConnectionStatus::Error(ErrorKind::Auth)),
        ]
    }

    fn teardown(&mut self) -> Vec<SessionAction> {
        info!("realtime: session torn down");
        self.phase = SessionPhase::Disconnected;
        vec![
            SessionAction::CancelTimer,
            SessionAction::CloseSocket,
            SessionAction::PublishStatus(ConnectionStatus::Disconnected),
        ]
    }
}

pub fn subscription_destination(topic_prefix: &str, subscriber_key: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(subscriber_key.as_bytes()).collect();
    format!("{topic_prefix}{encoded}")
}

/// Structured `code` header first; otherwise the `message` header and body
/// text are carried for keyword matching.
pub fn broker_error(frame: &Frame) -> BrokerError {
    let code = frame.header("code").and_then(ErrorCode::parse);
    let body = frame.body_text();
    let message = match (frame.header("message"), body.trim()) {
        (Some(header), "") => header.to_string(),
        (Some(header), body) => format!("{header}: {body}"),
        (None, body) => body.to_string(),
    };
    BrokerError::new(code, message)
}

pub fn is_auth_failure(error: &BrokerError) -> bool {
    if let Some(code) = error.code {
        return code.is_auth();
    }
    let text = error.message.to_ascii_lowercase();
    AUTH_KEYWORDS.iter().any(|keyword| text.contains(keyword))
}

fn decode_payload(frame: &Frame) -> Option<InboundPayload> {
    match frame.json::<InboundPayload>() {
        Ok(payload) if payload.is_empty() => {
            debug!(
                conversation_id = payload.conversation_id.0,
                "realtime: dropping empty payload"
            );
            None
        }
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(
                destination = frame.header("destination").unwrap_or_default(),
                "realtime: dropping undecodable payload: {err}"
            );
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
