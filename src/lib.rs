//! Duet: signaling coordinator for 1-on-1 WebRTC video sessions.
//!
//! Clients connect over WebSocket, join a room of at most two, and exchange
//! offers, answers and ICE candidates through the server. Room state lives in
//! memory only.

pub mod config;
pub mod health;
pub mod signaling;

pub use config::Config;
