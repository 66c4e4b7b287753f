//! Postfix policy delegation protocol: request parsing and the TCP server.

mod connection;
mod request;
mod server;

pub use connection::{evaluate, handle_connection, read_request};
pub use request::{RequestAttributes, RECIPIENT_COUNT, SASL_USERNAME, SENDER};
pub use server::{Listener, PolicyServer, ACCEPT_BACKOFF};
