//! Client core for a realtime voice conversation with an AI tutor: microphone
//! capture, the PCM16 wire format, the WebSocket session and token keep-alive.

pub mod audio;
pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
