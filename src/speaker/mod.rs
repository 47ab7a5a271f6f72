//! Chat Speaker: streaming text-to-speech for chat responses.
//!
//! Components:
//! - `tokens`: control-token parsing and the streaming tokenizer
//! - `chunker`: punctuation-aware chunking and special-token pairing
//! - `worker`: sequential synthesis queue with generation cancellation
//! - `stage`: synthesis hand-off into playback
//! - `synth`: synthesizer trait, HTTP provider, provider registry
//! - `playback`: clip registry and sequential playback scheduler
//! - `audio`: rodio and log-only audio sinks
//! - `state`: observable pipeline status
//! - `orchestrator`: lifecycle and event wiring
//! - `api`: Axum HTTP control server

pub mod api;
pub mod audio;
pub mod chunker;
pub mod orchestrator;
pub mod playback;
pub mod stage;
pub mod state;
pub mod synth;
pub mod tokens;
pub mod worker;
