//! Async driver for one chat connection.
//!
//! ARCHITECTURE
//! ============
//! The driver owns the WebSocket, the timers, and the message list
//! cache; all protocol decisions live in [`ConnMachine`]. Transport
//! callbacks become machine events, and the effects each transition
//! returns are executed here: frames sent, timers armed, messages
//! cached and forwarded to the caller as [`ChatEvent`]s.
//!
//! The driver is the scope guard for the connection: when [`ChatClient::run`]
//! returns (command channel closed, fatal auth failure, retry budget
//! exhausted), the socket and any pending reconnect timer are dropped
//! with it, so nothing can reconnect after the owner is gone.

#[cfg(test)]
#[path = "chat_client_test.rs"]
mod chat_client_test;

use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use wire::{ChatMessage, Target};

use crate::net::api::{ApiClient, ApiError, DEFAULT_HISTORY_LIMIT};
use crate::net::backoff::ReconnectPolicy;
use crate::net::machine::{ConnMachine, ConnState, Effect, Event};
use crate::state::chat::ChatLog;
use crate::state::session::{SessionError, SessionStore};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Error returned by [`ChatClient::run`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("session store error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration for one conversation's connection.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// HTTP base URL of the backend; the WS URL is derived from it.
    pub base_url: String,
    /// The conversation this connection serves.
    pub target: Target,
    /// Reconnect backoff policy.
    pub policy: ReconnectPolicy,
    /// How long to wait for the handshake acknowledgment.
    pub auth_timeout: Duration,
    /// Page size for the initial history fetch (group targets).
    pub history_limit: u32,
}

impl ChatConfig {
    /// Defaults: 5-second handshake timeout, standard backoff, a
    /// 50-message history page.
    #[must_use]
    pub fn new(base_url: &str, target: Target) -> Self {
        Self {
            base_url: base_url.to_owned(),
            target,
            policy: ReconnectPolicy::default(),
            auth_timeout: Duration::from_secs(5),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// What the caller sees of the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    /// The historical page, chronological, delivered once before live
    /// traffic.
    History(Vec<ChatMessage>),
    /// A live message that passed deduplication.
    Message(ChatMessage),
    /// Transient status line: `Some` to show, `None` to clear.
    Status(Option<String>),
    /// Credentials were cleared; the user must log in again.
    AuthRequired(String),
    /// The connection is terminally closed.
    Closed(String),
}

/// Commands the caller feeds into a running connection.
#[derive(Debug)]
pub enum Command {
    /// Send a chat message.
    Send(String),
    /// Close the connection and stop.
    Shutdown,
}

/// Cheap handle for sending commands into a running [`ChatClient`].
#[derive(Clone, Debug)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChatHandle {
    /// Queue a message send. Returns `false` once the client stopped.
    pub fn send(&self, content: impl Into<String>) -> bool {
        self.commands.send(Command::Send(content.into())).is_ok()
    }

    /// Ask the client to close the transport and stop.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Connection manager for a single conversation.
pub struct ChatClient {
    config: ChatConfig,
    session: SessionStore,
    machine: ConnMachine,
    log: ChatLog,
    events: mpsc::UnboundedSender<ChatEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    retry_delay: Duration,
    socket_failure: Option<String>,
}

impl ChatClient {
    /// Build a client plus its command handle and event stream.
    #[must_use]
    pub fn new(
        config: ChatConfig,
        session: SessionStore,
    ) -> (Self, ChatHandle, mpsc::UnboundedReceiver<ChatEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let self_id = session.user_id().unwrap_or_default().to_owned();
        let machine = ConnMachine::new(config.target.clone(), self_id, config.policy);
        let retry_delay = config.policy.delay(0);
        let client = Self {
            config,
            session,
            machine,
            log: ChatLog::new(),
            events: event_tx,
            commands: command_rx,
            retry_delay,
            socket_failure: None,
        };
        (client, ChatHandle { commands: command_tx }, event_rx)
    }

    /// Drive the connection until it is terminally closed.
    ///
    /// # Errors
    ///
    /// Fails fast when no credentials are stored or the base URL is not
    /// HTTP(S); protocol-level failures are reported through
    /// [`ChatEvent`]s instead.
    pub async fn run(mut self) -> Result<(), ClientError> {
        if !self.session.is_logged_in() {
            return Err(ClientError::NotLoggedIn);
        }
        if !self.load_history().await? {
            return Ok(());
        }

        let url = ws_url(
            &self.config.base_url,
            &self.config.target,
            self.session.user_id().unwrap_or_default(),
        )?;

        loop {
            match self.machine.state() {
                ConnState::Connecting => match connect_async(url.as_str()).await {
                    Ok((stream, _)) => {
                        let effects = self.machine.handle(Event::TransportOpened);
                        self.run_socket(stream, effects).await?;
                    }
                    Err(error) => {
                        let effects =
                            self.machine.handle(Event::TransportError(error.to_string()));
                        self.apply_offline(effects)?;
                    }
                },
                ConnState::Reconnecting => self.wait_for_retry().await?,
                ConnState::Closed => return Ok(()),
                ConnState::AuthPending | ConnState::Authenticated => {
                    // run_socket only returns once the socket is gone.
                    return Ok(());
                }
            }
        }
    }

    /// Fetch and cache the history page for group targets.
    ///
    /// Returns `false` when the fetch was fatally unauthorized and the
    /// connection must not proceed.
    async fn load_history(&mut self) -> Result<bool, ClientError> {
        let Target::Group { group_id } = &self.config.target else {
            return Ok(true);
        };
        let Some(bearer) = self.session.bearer() else {
            return Err(ClientError::NotLoggedIn);
        };

        let api = ApiClient::new(&self.config.base_url);
        match api
            .group_history(&bearer, *group_id, self.config.history_limit)
            .await
        {
            Ok(batch) => {
                if !batch.is_empty() {
                    self.log.load_history(batch.clone());
                    let _ = self.events.send(ChatEvent::History(batch));
                }
                Ok(true)
            }
            Err(ApiError::Unauthorized) => {
                self.session.clear()?;
                let _ = self.events.send(ChatEvent::AuthRequired(
                    "not authenticated".to_owned(),
                ));
                Ok(false)
            }
            Err(error) => {
                tracing::warn!(%error, "history fetch failed");
                let _ = self.events.send(ChatEvent::Status(Some(format!(
                    "Failed to load messages: {error}"
                ))));
                Ok(true)
            }
        }
    }

    /// Process one live socket until the machine leaves its live states.
    async fn run_socket(
        &mut self,
        stream: WsStream,
        initial: Vec<Effect>,
    ) -> Result<(), ClientError> {
        let (mut sink, mut source) = stream.split();
        let mut auth_deadline: Option<Instant> = None;
        self.apply_online(&mut sink, &mut auth_deadline, initial).await?;

        while matches!(
            self.machine.state(),
            ConnState::AuthPending | ConnState::Authenticated
        ) {
            let event = tokio::select! {
                message = source.next() => match socket_event(message) {
                    Some(event) => event,
                    None => continue,
                },
                () = tokio::time::sleep_until(auth_deadline.unwrap_or_else(Instant::now)),
                    if auth_deadline.is_some() => Event::AuthTimerFired,
                command = self.commands.recv() => command_event(command),
            };

            let effects = self.machine.handle(event);
            self.apply_online(&mut sink, &mut auth_deadline, effects).await?;

            if let Some(reason) = self.socket_failure.take() {
                let effects = self.machine.handle(Event::TransportError(reason));
                self.apply_online(&mut sink, &mut auth_deadline, effects).await?;
            }
        }
        Ok(())
    }

    /// Wait out the backoff delay, still honoring caller commands.
    async fn wait_for_retry(&mut self) -> Result<(), ClientError> {
        let delay = self.retry_delay;
        tokio::select! {
            () = tokio::time::sleep(delay) => {
                let effects = self.machine.handle(Event::RetryTimerFired);
                self.apply_offline(effects)?;
            }
            command = self.commands.recv() => {
                let effects = self.machine.handle(command_event(command));
                self.apply_offline(effects)?;
            }
        }
        Ok(())
    }

    async fn apply_online(
        &mut self,
        sink: &mut WsSink,
        auth_deadline: &mut Option<Instant>,
        effects: Vec<Effect>,
    ) -> Result<(), ClientError> {
        for effect in effects {
            match effect {
                Effect::SendAuth => {
                    let Some(bearer) = self.session.bearer() else {
                        return Err(ClientError::NotLoggedIn);
                    };
                    self.send_text(sink, wire::encode_auth(&bearer)).await;
                }
                Effect::StartAuthTimer => {
                    *auth_deadline = Some(Instant::now() + self.config.auth_timeout);
                }
                Effect::CancelAuthTimer => *auth_deadline = None,
                Effect::SendText(text) => self.send_text(sink, text).await,
                Effect::CloseTransport => {
                    let _ = sink.close().await;
                }
                other => self.apply_common(other)?,
            }
        }
        Ok(())
    }

    fn apply_offline(&mut self, effects: Vec<Effect>) -> Result<(), ClientError> {
        for effect in effects {
            if matches!(
                effect,
                Effect::SendAuth
                    | Effect::StartAuthTimer
                    | Effect::CancelAuthTimer
                    | Effect::SendText(_)
                    | Effect::CloseTransport
            ) {
                tracing::debug!(?effect, "no live transport; dropping effect");
                continue;
            }
            self.apply_common(effect)?;
        }
        Ok(())
    }

    fn apply_common(&mut self, effect: Effect) -> Result<(), ClientError> {
        match effect {
            Effect::Append(message) => {
                if self.log.append_live(message.clone()) {
                    let _ = self.events.send(ChatEvent::Message(message));
                } else {
                    tracing::debug!("dropped duplicate message echo");
                }
            }
            Effect::Status(status) => {
                let _ = self.events.send(ChatEvent::Status(status));
            }
            Effect::ClearSession => self.session.clear()?,
            Effect::AuthRequired(reason) => {
                let _ = self.events.send(ChatEvent::AuthRequired(reason));
            }
            Effect::ScheduleReconnect { delay } => self.retry_delay = delay,
            Effect::Terminal(message) => {
                let _ = self.events.send(ChatEvent::Closed(message));
            }
            // OpenTransport is satisfied by the outer loop re-entering
            // Connecting; the transport effects were handled before.
            Effect::OpenTransport
            | Effect::SendAuth
            | Effect::StartAuthTimer
            | Effect::CancelAuthTimer
            | Effect::SendText(_)
            | Effect::CloseTransport => {}
        }
        Ok(())
    }

    async fn send_text(&mut self, sink: &mut WsSink, text: String) {
        if self.socket_failure.is_some() {
            return;
        }
        if let Err(error) = sink.send(Message::Text(text.into())).await {
            self.socket_failure = Some(error.to_string());
        }
    }
}

/// Map a raw socket read to a machine event; `None` for frames the
/// protocol ignores (pings, binary).
fn socket_event(
    message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Option<Event> {
    match message {
        Some(Ok(Message::Text(text))) => Some(Event::TextFrame(text.to_string())),
        Some(Ok(Message::Close(frame))) => {
            let (code, reason) = frame
                .map(|f| (u16::from(f.code), f.reason.to_string()))
                .unwrap_or((1005, String::new()));
            Some(Event::TransportClosed { code, reason })
        }
        Some(Ok(_)) => None,
        Some(Err(error)) => Some(Event::TransportError(error.to_string())),
        None => Some(Event::TransportClosed { code: 1006, reason: String::new() }),
    }
}

fn command_event(command: Option<Command>) -> Event {
    match command {
        Some(Command::Send(content)) => Event::SendRequested {
            content,
            timestamp: now_timestamp(),
        },
        // A dropped handle counts as the owner going away.
        Some(Command::Shutdown) | None => Event::Shutdown,
    }
}

/// Derive the per-conversation WebSocket URL from the HTTP base URL.
fn ws_url(base_url: &str, target: &Target, self_id: &str) -> Result<String, ClientError> {
    let base = if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        return Err(ClientError::InvalidBaseUrl(base_url.to_owned()));
    };
    let base = base.trim_end_matches('/');

    Ok(match target {
        Target::Direct { .. } => format!("{base}/ws?userid={self_id}"),
        Target::Group { group_id } => format!("{base}/ws/group?group_id={group_id}"),
    })
}

fn now_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
