//! Realtime connection manager for a STOMP-style broker over WebSocket.
//!
//! [`ConnectionManager`] owns one background task per active session. The
//! task feeds socket, timer and credential results into a
//! [`session::SessionMachine`] and performs whatever it asks for. Consumers
//! observe [`ConnectionStatus`] through a watch channel and receive decoded
//! payloads through a broadcast channel.

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod feed;
pub mod frame;
pub mod session;

use std::{future::Future, ops::ControlFlow, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use shared::protocol::InboundPayload;
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub use backoff::{FixedBackoff, ReconnectPolicy};
pub use config::{load_settings, Settings};
pub use credentials::{Credentials, CredentialsProvider, StaticCredentials};
pub use feed::{spawn_cache_sync, LiveCache};
pub use session::{ConnectionStatus, ErrorKind};

use crate::{
    frame::{decode_frame, encode_frame, Frame, FrameError},
    session::{SessionAction, SessionConfig, SessionEvent, SessionMachine, TimerKind},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct ActiveSession {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveSession {
    async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!("realtime: session task ended abnormally: {err}");
        }
    }
}

pub struct ConnectionManager {
    settings: Settings,
    credentials: Arc<dyn CredentialsProvider>,
    policy: Arc<dyn ReconnectPolicy>,
    status: watch::Sender<ConnectionStatus>,
    payloads: broadcast::Sender<InboundPayload>,
    active: Mutex<Option<ActiveSession>>,
}

impl ConnectionManager {
    pub fn new(settings: Settings, credentials: Arc<dyn CredentialsProvider>) -> Arc<Self> {
        let policy = Arc::new(FixedBackoff::new(settings.reconnect_delay()));
        Self::with_reconnect_policy(settings, credentials, policy)
    }

    pub fn with_reconnect_policy(
        settings: Settings,
        credentials: Arc<dyn CredentialsProvider>,
        policy: Arc<dyn ReconnectPolicy>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (payloads, _) = broadcast::channel(settings.payload_buffer.max(1));
        Arc::new(Self {
            settings,
            credentials,
            policy,
            status,
            payloads,
            active: Mutex::new(None),
        })
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receivers created before a payload arrives see it; dropping the
    /// receiver unsubscribes.
    pub fn subscribe_payloads(&self) -> broadcast::Receiver<InboundPayload> {
        self.payloads.subscribe()
    }

    /// Activates the session. A no-op while a session is live; after an auth
    /// halt it replaces the halted session with a fresh one.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let endpoint = self
            .settings
            .endpoint()
            .context("cannot start realtime session")?;

        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            if !session.task.is_finished() && !self.current_status().is_terminal() {
                debug!("realtime: start ignored, session already active");
                return Ok(());
            }
        }
        if let Some(previous) = active.take() {
            previous.shutdown().await;
        }

        info!(endpoint = %endpoint, "realtime: starting session");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = Driver {
            machine: SessionMachine::new(
                SessionConfig::from(&self.settings),
                Arc::clone(&self.policy),
            ),
            manager: Arc::clone(self),
            endpoint,
            socket: None,
            timer: None,
            shutdown: shutdown_rx,
        };
        *active = Some(ActiveSession {
            shutdown: shutdown_tx,
            task: tokio::spawn(driver.run()),
        });
        Ok(())
    }

    /// Deactivates the session and waits for the socket to close. Once this
    /// returns no timer fires, no payload is dispatched and no status changes.
    ///
    /// Holds the session lock until the old driver's teardown has published
    /// its last status; a concurrent `start()` waits behind it.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            session.shutdown().await;
            info!("realtime: session stopped");
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!(from = ?previous, to = ?status, "realtime: status changed");
        }
    }
}

struct Driver {
    manager: Arc<ConnectionManager>,
    machine: SessionMachine,
    endpoint: Url,
    socket: Option<Socket>,
    timer: Option<(TimerKind, Instant)>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut next = Some(SessionEvent::Activate);
        'session: loop {
            while let Some(event) = next.take() {
                let actions = self.machine.handle(event);
                match self.perform_batch(actions).await {
                    ControlFlow::Break(()) => break 'session,
                    ControlFlow::Continue(follow_up) => next = follow_up,
                }
            }

            match self.next_event().await {
                Some(event) => next = Some(event),
                None => break,
            }
        }
        self.teardown().await;
    }

    /// Performs `actions` in order. The first action that produces an event
    /// ends the batch: the rest were planned for a state the machine has
    /// already left.
    async fn perform_batch(
        &mut self,
        actions: Vec<SessionAction>,
    ) -> ControlFlow<(), Option<SessionEvent>> {
        for action in actions {
            if let Some(follow_up) = self.perform(action).await? {
                return ControlFlow::Continue(Some(follow_up));
            }
        }
        ControlFlow::Continue(None)
    }

    /// Waits for whichever comes first: shutdown, a socket frame or the timer.
    async fn next_event(&mut self) -> Option<SessionEvent> {
        let timer = self.timer;
        let event = tokio::select! {
            biased;
            _ = self.shutdown.changed() => None,
            event = next_socket_event(self.socket.as_mut()) => Some(event),
            kind = wait_for_timer(timer) => Some(SessionEvent::TimerFired(kind)),
        };
        if matches!(event, Some(SessionEvent::TimerFired(_))) {
            self.timer = None;
        }
        event
    }

    async fn perform(&mut self, action: SessionAction) -> ControlFlow<(), Option<SessionEvent>> {
        match action {
            SessionAction::FetchCredentials => {
                let provider = Arc::clone(&self.manager.credentials);
                let fetched = until_shutdown(&mut self.shutdown, provider.credentials()).await?;
                ControlFlow::Continue(Some(match fetched {
                    Ok(credentials) => SessionEvent::CredentialsLoaded(credentials),
                    Err(err) => SessionEvent::CredentialsFailed(format!("{err:#}")),
                }))
            }
            SessionAction::OpenSocket => {
                debug!(endpoint = %self.endpoint, "realtime: opening socket");
                let connected =
                    until_shutdown(&mut self.shutdown, connect_async(self.endpoint.as_str()))
                        .await?;
                ControlFlow::Continue(Some(match connected {
                    Ok((socket, _)) => {
                        self.socket = Some(socket);
                        SessionEvent::SocketOpened
                    }
                    Err(err) => SessionEvent::SocketFailed(err.to_string()),
                }))
            }
            SessionAction::Send(frame) => {
                let Some(socket) = self.socket.as_mut() else {
                    return ControlFlow::Continue(Some(SessionEvent::SocketFailed(format!(
                        "no open socket for {}",
                        frame.command.as_str()
                    ))));
                };
                debug!(command = frame.command.as_str(), "realtime: sending frame");
                let message = to_message(&frame);
                let sent = until_shutdown(&mut self.shutdown, socket.send(message)).await?;
                ControlFlow::Continue(
                    sent.err()
                        .map(|err| SessionEvent::SocketFailed(err.to_string())),
                )
            }
            SessionAction::CloseSocket => {
                self.close_socket().await;
                ControlFlow::Continue(None)
            }
            SessionAction::StartTimer { kind, delay } => {
                self.timer = Some((kind, Instant::now() + delay));
                ControlFlow::Continue(None)
            }
            SessionAction::CancelTimer => {
                self.timer = None;
                ControlFlow::Continue(None)
            }
            SessionAction::Dispatch(payload) => {
                debug!(
                    conversation_id = payload.conversation_id.0,
                    messages = payload.messages.len(),
                    "realtime: dispatching payload"
                );
                // No receivers is fine: nobody is listening yet.
                let _ = self.manager.payloads.send(payload);
                ControlFlow::Continue(None)
            }
            SessionAction::PublishStatus(status) => {
                self.manager.publish(status);
                ControlFlow::Continue(None)
            }
        }
    }

    /// Runs the machine's own teardown without honouring shutdown again.
    async fn teardown(mut self) {
        self.timer = None;
        for action in self.machine.handle(SessionEvent::Deactivate) {
            match action {
                SessionAction::CloseSocket => self.close_socket().await,
                SessionAction::PublishStatus(status) => self.manager.publish(status),
                _ => {}
            }
        }
        self.close_socket().await;
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            match timeout(CLOSE_TIMEOUT, socket.close(None)).await {
                Ok(Ok(())) => debug!("realtime: socket closed"),
                Ok(Err(err)) => debug!("realtime: socket close failed: {err}"),
                Err(_) => warn!("realtime: socket close timed out"),
            }
        }
    }
}

async fn until_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    work: F,
) -> ControlFlow<(), F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.changed() => ControlFlow::Break(()),
        output = work => ControlFlow::Continue(output),
    }
}

async fn wait_for_timer(timer: Option<(TimerKind, Instant)>) -> TimerKind {
    match timer {
        Some((kind, deadline)) => {
            sleep_until(deadline).await;
            kind
        }
        None => std::future::pending().await,
    }
}

async fn next_socket_event(socket: Option<&mut Socket>) -> SessionEvent {
    let Some(socket) = socket else {
        return std::future::pending().await;
    };
    loop {
        let raw = match socket.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|frame| (Some(u16::from(frame.code)), frame.reason.into_owned()))
                    .unwrap_or((None, String::new()));
                return SessionEvent::SocketClosed { code, reason };
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return SessionEvent::SocketFailed(err.to_string()),
            None => {
                return SessionEvent::SocketClosed {
                    code: None,
                    reason: "stream ended".into(),
                }
            }
        };
        match decode_frame(&raw) {
            Ok(frame) => return SessionEvent::FrameReceived(frame),
            Err(FrameError::Empty) => debug!("realtime: heart-beat"),
            Err(err) => warn!("realtime: dropping undecodable frame: {err}"),
        }
    }
}

fn to_message(frame: &Frame) -> Message {
    match String::from_utf8(encode_frame(frame)) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
