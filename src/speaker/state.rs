//! Observable pipeline status shared by every stage.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Nothing queued, nothing playing
    Idle,
    /// Upstream text is still being chunked
    Chunking,
    /// Waiting on synthesis or sitting in a delay
    Buffering,
    /// Audio is sounding
    Playing,
    /// Last synthesis or playback attempt failed
    Error,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Chunking => write!(f, "CHUNKING"),
            Self::Buffering => write!(f, "BUFFERING"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Point-in-time copy of the pipeline status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub enabled: bool,
    pub status: PipelineStatus,
    pub last_error: Option<String>,
    pub last_emotion: Option<String>,
    pub synthesis_queue: usize,
    pub playback_queue: usize,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            enabled: false,
            status: PipelineStatus::Idle,
            last_error: None,
            last_emotion: None,
            synthesis_queue: 0,
            playback_queue: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    inner: Arc<Mutex<StatusSnapshot>>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().unwrap().clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.lock().unwrap().status
    }

    pub fn set_status(&self, status: PipelineStatus) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != status {
            info!("State: {} → {}", inner.status, status);
            inner.status = status;
        }
    }

    /// Move to `status` unless an error is being shown.
    pub fn set_status_unless_error(&self, status: PipelineStatus) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != PipelineStatus::Error && inner.status != status {
            info!("State: {} → {}", inner.status, status);
            inner.status = status;
        }
    }

    /// Record a failure; the pipeline keeps going.
    pub fn record_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_error = Some(message.into());
        if inner.status != PipelineStatus::Error {
            info!("State: {} → {}", inner.status, PipelineStatus::Error);
            inner.status = PipelineStatus::Error;
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().enabled = enabled;
    }

    pub fn set_last_emotion(&self, emotion: &str) {
        self.inner.lock().unwrap().last_emotion = Some(emotion.to_string());
    }

    /// Raise an idle or chunking pipeline to `status`. Playing and error
    /// states are left for the playback side to resolve.
    pub fn promote(&self, status: PipelineStatus) {
        let mut inner = self.inner.lock().unwrap();
        let from = inner.status;
        let raise = matches!(
            (from, status),
            (PipelineStatus::Idle, PipelineStatus::Chunking)
                | (PipelineStatus::Idle, PipelineStatus::Buffering)
                | (PipelineStatus::Chunking, PipelineStatus::Buffering)
        );
        if raise {
            info!("State: {from} → {status}");
            inner.status = status;
        }
    }

    /// Back to idle with the error cleared, as after a hard reset.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != PipelineStatus::Idle {
            info!("State: {} → {}", inner.status, PipelineStatus::Idle);
        }
        inner.status = PipelineStatus::Idle;
        inner.last_error = None;
    }
}
