//! Chat-facing glue over the inference service: stored message records,
//! context-window assembly, and the send-message client.

pub mod client;
pub mod context;
pub mod session;

pub use {
    client::ChatClient,
    context::{DEFAULT_HISTORY_WINDOW, build_context},
    session::StoredMessage,
};
