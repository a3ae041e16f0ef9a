//! TerminalSync server: gateway, per-client protocol state machines, and the
//! session manager with its idle scheduler.

pub mod client;
pub mod manager;
pub mod web_server;
