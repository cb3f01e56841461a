//! Per-connection state owned by the chat client.

pub mod chat;
pub mod session;
