//! Finite-state machine for one realtime chat connection.
//!
//! ARCHITECTURE
//! ============
//! The machine performs no I/O. Transport callbacks and timers arrive as
//! [`Event`]s through the single entry point [`ConnMachine::handle`], and
//! each transition returns the [`Effect`]s the driver must execute. The
//! auth handshake, the fatal-vs-retryable error split, and the reconnect
//! schedule are therefore testable without opening a socket.
//!
//! INVARIANTS
//! ==========
//! - A chat frame reaches [`Effect::Append`] only in `Authenticated`.
//! - The attempt counter resets to 0 on every authenticated handshake
//!   and increments once per `Reconnecting` entry.
//! - Fatal auth failures emit [`Effect::ClearSession`] and never
//!   [`Effect::ScheduleReconnect`].

#[cfg(test)]
#[path = "machine_test.rs"]
mod machine_test;

use std::time::Duration;

use wire::{ChatMessage, Inbound, Target};

use crate::net::backoff::{CloseClass, ReconnectPolicy, classify_close, is_fatal_auth_error};

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Transport is being opened.
    Connecting,
    /// Transport is open; auth envelope sent, acknowledgment pending.
    AuthPending,
    /// Handshake acknowledged; ordinary messages flow.
    Authenticated,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Terminal; no further automatic activity.
    Closed,
}

/// Everything that can happen to a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The transport finished opening.
    TransportOpened,
    /// A text frame arrived.
    TextFrame(String),
    /// The transport closed with the given code and reason.
    TransportClosed { code: u16, reason: String },
    /// The transport failed (connect refused, network drop).
    TransportError(String),
    /// The 5-second handshake timer fired without an acknowledgment.
    AuthTimerFired,
    /// The backoff delay elapsed.
    RetryTimerFired,
    /// The user asked to send a message. The driver stamps the wall
    /// clock so transitions stay deterministic under test.
    SendRequested { content: String, timestamp: String },
    /// The owning view is going away.
    Shutdown,
}

/// Side effects the driver executes after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Send the auth envelope built from the session store.
    SendAuth,
    /// Arm the handshake timeout.
    StartAuthTimer,
    /// Disarm the handshake timeout.
    CancelAuthTimer,
    /// Send an already-encoded text frame.
    SendText(String),
    /// Append a message to the message list cache.
    Append(ChatMessage),
    /// Set (`Some`) or clear (`None`) the transient status line.
    Status(Option<String>),
    /// Erase stored credentials; a fatal auth failure happened.
    ClearSession,
    /// The caller must re-login; carries the reason.
    AuthRequired(String),
    /// Wait out the delay, then feed [`Event::RetryTimerFired`].
    ScheduleReconnect { delay: Duration },
    /// Open a fresh transport (entering `Connecting`).
    OpenTransport,
    /// Close the current transport.
    CloseTransport,
    /// Terminal shutdown message for the user; no retries follow.
    Terminal(String),
}

/// State machine for a single socket's lifetime, reconnects included.
#[derive(Debug)]
pub struct ConnMachine {
    state: ConnState,
    attempts: u32,
    policy: ReconnectPolicy,
    target: Target,
    self_id: String,
}

impl ConnMachine {
    /// Create a machine in `Connecting` for the given conversation.
    #[must_use]
    pub fn new(target: Target, self_id: String, policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnState::Connecting,
            attempts: 0,
            policy,
            target,
            self_id,
        }
    }

    /// Current state, for drivers and tests.
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Reconnect attempts consumed since the last authenticated handshake.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Single transition entry point.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match (self.state, event) {
            // Opening the transport.
            (ConnState::Connecting, Event::TransportOpened) => {
                self.state = ConnState::AuthPending;
                vec![Effect::SendAuth, Effect::StartAuthTimer]
            }
            (ConnState::Connecting, Event::TransportError(reason)) => {
                tracing::warn!(%reason, "connect failed");
                self.begin_reconnect()
            }

            // Handshake.
            (ConnState::AuthPending, Event::TextFrame(frame)) => self.on_handshake_frame(&frame),
            (ConnState::AuthPending, Event::AuthTimerFired) => {
                tracing::warn!("handshake timed out waiting for acknowledgment");
                let mut effects = vec![Effect::CloseTransport];
                effects.extend(self.begin_reconnect());
                effects
            }

            // Authenticated traffic.
            (ConnState::Authenticated, Event::TextFrame(frame)) => self.on_chat_frame(&frame),
            (ConnState::Authenticated, Event::SendRequested { content, timestamp }) => {
                self.on_send(content, timestamp)
            }

            // Sends outside the authenticated state never touch the wire.
            (
                ConnState::Connecting | ConnState::AuthPending | ConnState::Reconnecting,
                Event::SendRequested { .. },
            ) => {
                vec![Effect::Status(Some(
                    "Not connected. Message not sent.".to_owned(),
                ))]
            }

            // Transport loss while a socket is live.
            (
                ConnState::AuthPending | ConnState::Authenticated,
                Event::TransportClosed { code, reason },
            ) => self.on_close(code, &reason),
            (
                ConnState::AuthPending | ConnState::Authenticated,
                Event::TransportError(reason),
            ) => {
                tracing::warn!(%reason, "transport error");
                self.begin_reconnect()
            }

            // Backoff elapsed.
            (ConnState::Reconnecting, Event::RetryTimerFired) => {
                self.state = ConnState::Connecting;
                vec![Effect::OpenTransport]
            }

            // The owner is going away: close everything, cancel timers by
            // leaving the driver loop, and never reconnect.
            (
                ConnState::Connecting | ConnState::AuthPending | ConnState::Authenticated,
                Event::Shutdown,
            ) => {
                self.state = ConnState::Closed;
                vec![Effect::CloseTransport]
            }
            (ConnState::Reconnecting, Event::Shutdown) => {
                self.state = ConnState::Closed;
                vec![]
            }

            // Stale timers, frames from a torn-down socket, and anything
            // after Closed are ignored.
            (_, event) => {
                tracing::debug!(state = ?self.state, ?event, "ignoring event");
                vec![]
            }
        }
    }

    fn on_handshake_frame(&mut self, frame: &str) -> Vec<Effect> {
        match wire::decode(frame) {
            Ok(Inbound::Authenticated) => {
                self.state = ConnState::Authenticated;
                self.attempts = 0;
                vec![Effect::CancelAuthTimer, Effect::Status(None)]
            }
            // Non-fatal errors leave the handshake timer armed; only the
            // sentinel or a fatal failure settles the handshake.
            Ok(Inbound::Error(error)) => self.on_error_envelope(error),
            Ok(Inbound::Chat(_)) => {
                // Not authenticated yet; data from this socket is not
                // trusted until the sentinel arrives.
                tracing::debug!("dropping chat frame before authentication");
                vec![]
            }
            Err(error) => {
                tracing::debug!(%error, "dropping undecodable handshake frame");
                vec![]
            }
        }
    }

    fn on_chat_frame(&mut self, frame: &str) -> Vec<Effect> {
        match wire::decode(frame) {
            Ok(Inbound::Chat(message)) => vec![Effect::Append(message)],
            Ok(Inbound::Error(error)) => self.on_error_envelope(error),
            Ok(Inbound::Authenticated) => vec![],
            Err(error) => {
                tracing::debug!(%error, "dropping undecodable frame");
                vec![]
            }
        }
    }

    fn on_send(&mut self, content: String, timestamp: String) -> Vec<Effect> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return vec![];
        }
        let (encoded, group_id) = match &self.target {
            Target::Direct { peer_id } => (
                wire::encode_direct(&self.self_id, peer_id, trimmed, &timestamp),
                None,
            ),
            Target::Group { group_id } => {
                (wire::encode_group(*group_id, trimmed), Some(*group_id))
            }
        };
        // Optimistic local append; the server echo is dropped by the
        // cache's (sender, content, timestamp) dedup.
        let message = ChatMessage {
            sender: self.self_id.clone(),
            content: trimmed.to_owned(),
            timestamp,
            group_id,
        };
        vec![Effect::SendText(encoded), Effect::Append(message)]
    }

    fn on_error_envelope(&mut self, error: String) -> Vec<Effect> {
        if is_fatal_auth_error(&error) {
            self.state = ConnState::Closed;
            vec![
                Effect::CancelAuthTimer,
                Effect::ClearSession,
                Effect::CloseTransport,
                Effect::AuthRequired(error),
            ]
        } else {
            vec![Effect::Status(Some(error))]
        }
    }

    fn on_close(&mut self, code: u16, reason: &str) -> Vec<Effect> {
        match classify_close(code, reason) {
            CloseClass::FatalAuth => {
                self.state = ConnState::Closed;
                vec![
                    Effect::ClearSession,
                    Effect::AuthRequired(reason.to_owned()),
                ]
            }
            CloseClass::Normal => {
                self.state = ConnState::Closed;
                vec![Effect::Terminal("Connection closed.".to_owned())]
            }
            CloseClass::Retryable => self.begin_reconnect(),
        }
    }

    fn begin_reconnect(&mut self) -> Vec<Effect> {
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnState::Closed;
            return vec![Effect::Terminal(
                "Connection lost. Please refresh the page.".to_owned(),
            )];
        }
        let delay = self.policy.delay(self.attempts);
        self.attempts += 1;
        self.state = ConnState::Reconnecting;
        vec![
            Effect::Status(Some(format!(
                "Connection lost. Reconnecting in {} seconds...",
                delay.as_secs()
            ))),
            Effect::ScheduleReconnect { delay },
        ]
    }
}
