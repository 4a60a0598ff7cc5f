//! Chat client: registration, peer selection and messaging on top of the
//! network layer.

mod client;
mod config;

pub use client::{ChatClient, ChatHandle, ClientUpdate, ClientView};
pub use config::{ClientConfig, DEFAULT_ICE_SERVERS, DEFAULT_SERVER_URL};
