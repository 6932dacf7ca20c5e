//! Serenity Core
//!
//! Provider-agnostic building blocks of the voice bridge: the streaming LLM
//! adapter, the system-instruction composer, and the speech chunker. Nothing
//! in this crate knows about WebSockets or the voice platform's wire format.

pub mod chunker;
pub mod llm_client;
pub mod prompt;
