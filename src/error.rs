//! Error types for the speech pipeline.
//!
//! Only configuration errors ever reach a caller; synthesis and playback
//! failures are caught per item and surfaced through the pipeline status.

use thiserror::Error;

/// Failure while turning a chunk of text into audio.
#[derive(Error, Debug)]
pub enum SynthesisError {
    /// Transport-level failure talking to the synthesis endpoint
    #[error("speech request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response; carries the server's `detail`/`error` message
    #[error("speech provider returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Success response without a usable `audio` field
    #[error("speech response did not contain audio")]
    MissingAudio,

    /// `audio` field was not valid base64
    #[error("speech response audio is not valid base64: {0}")]
    InvalidAudio(#[from] base64::DecodeError),

    /// No synthesizer registered under this provider id
    #[error("unknown speech provider: {0}")]
    UnknownProvider(String),
}

/// Failure while playing a synthesized clip.
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("failed to decode audio clip: {0}")]
    Decode(String),

    #[error("audio output unavailable: {0}")]
    Output(String),

    #[error("audio clip {0} was already revoked")]
    Revoked(u64),
}

/// Errors surfaced by the orchestrator.
#[derive(Error, Debug)]
pub enum SpeakerError {
    /// Missing provider or voice selection; nothing is synthesized
    #[error("speech is not configured: {0}")]
    Config(String),
}

pub type SpeakerResult<T> = Result<T, SpeakerError>;
