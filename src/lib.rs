//! chat-speaker: streams chat responses to speech as they are generated.

pub mod config;
pub mod error;
pub mod speaker;

pub use error::{PlaybackError, SpeakerError, SpeakerResult, SynthesisError};
pub use speaker::orchestrator::{ChatEvent, OrchestratorConfig, StreamingOrchestrator};
