//! Serenity bridge service.
//!
//! Accepts WebSocket connections from the voice platform, streams replies
//! from the configured LLM provider back as speakable chunks, and evicts
//! connections that stop answering heartbeats. The `bridge` binary is a thin
//! wrapper around this library.

pub mod config;
pub mod router;
pub mod state;
pub mod ws;
