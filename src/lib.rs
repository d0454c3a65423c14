//! User-space VPN tunneling IP packets over WebSocket.
//!
//! A client host captures IP packets from a TUN device, encrypts each one
//! with its session key and ships it to the server as a binary WebSocket
//! message. The server decrypts, consults the peer table and either relays
//! the packet to another connected client of the virtual subnet or writes it
//! to its own TUN device for the host to route. Return traffic flows
//! symmetrically.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           wsvpn                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ TUN device ◄──► engine (peer table, AES-GCM) ◄──► WebSocket  │
//! ├──────────────────────────────────────────────────────────────┤
//! │     token auth: username + password-sealed session key       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod packet;
pub mod peers;
pub mod routes;
pub mod server;

// Re-exports for convenience
pub use client::VpnClient;
pub use config::{FileConfig, VpnOptions};
pub use error::{VpnError, VpnResult};
pub use server::VpnServer;
