//! Network layer: REST collaborators and the realtime connection manager.

pub mod api;
pub mod backoff;
pub mod chat_client;
pub mod machine;
