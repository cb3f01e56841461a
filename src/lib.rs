//! Connection manager for the social-network realtime chat.
//!
//! ARCHITECTURE
//! ============
//! The protocol core is an explicit finite-state machine
//! ([`net::machine::ConnMachine`]) that performs no I/O: transport
//! callbacks become [`net::machine::Event`]s, and transitions return
//! [`net::machine::Effect`]s that the async driver
//! ([`net::chat_client::ChatClient`]) executes against a real WebSocket.
//! This keeps the auth-handshake/reconnect interplay testable without a
//! network.
//!
//! The remaining modules are the collaborators the machine drives:
//! the wire codec lives in the `wire` crate, the message list cache in
//! [`state::chat`], the persisted credentials in [`state::session`], and
//! the REST calls (login, history) in [`net::api`].

pub mod net;
pub mod state;

pub use wire::{ChatMessage, Target};
