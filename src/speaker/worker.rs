//! Sequential synthesis queue with generation-based cancellation.
//!
//! Chunks are handed to a [`ChunkHandler`] strictly one at a time and in
//! arrival order. [`ChunkQueueWorker::reset`] advances the shared
//! [`Generation`], which invalidates everything queued or in flight
//! before it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use super::chunker::TtsChunkItem;

/// Monotonic cancellation counter shared by the queues and in-flight work.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Invalidate all work tagged with earlier generations.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

/// A chunk tagged with the generation it was queued under.
#[derive(Debug, Clone)]
pub struct QueuedChunk {
    pub payload: TtsChunkItem,
    pub generation: u64,
}

/// Consumer of queued chunks. `generation` travels with the item so the
/// handler can re-check it after its own await points.
#[async_trait]
pub trait ChunkHandler: Send + Sync {
    async fn handle(&self, item: TtsChunkItem, generation: u64);
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedChunk>,
    running: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    generation: Generation,
    handler: Arc<dyn ChunkHandler>,
}

/// Single-consumer FIFO draining chunks through a [`ChunkHandler`].
#[derive(Clone)]
pub struct ChunkQueueWorker {
    shared: Arc<Shared>,
}

impl ChunkQueueWorker {
    pub fn new(handler: Arc<dyn ChunkHandler>, generation: Generation) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                generation,
                handler,
            }),
        }
    }

    /// Chunks waiting to be handled (excluding the one in flight).
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().running
    }

    /// Queue a chunk under the current generation and make sure the drain
    /// task is running. Must be called from within a tokio runtime.
    pub fn enqueue(&self, payload: TtsChunkItem) {
        let generation = self.shared.generation.current();
        let start = {
            let mut state = self.shared.state.lock().unwrap();
            state.pending.push_back(QueuedChunk {
                payload,
                generation,
            });
            !std::mem::replace(&mut state.running, true)
        };

        if start {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                drain(shared).await;
            });
        }
    }

    /// Drop all pending chunks and invalidate in-flight work.
    pub fn reset(&self) -> u64 {
        let generation = self.shared.generation.advance();
        let dropped = {
            let mut state = self.shared.state.lock().unwrap();
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        info!("Synthesis queue reset (generation {generation}, dropped {dropped})");
        generation
    }
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.state.lock().unwrap();
            match state.pending.pop_front() {
                Some(item) => item,
                None => {
                    state.running = false;
                    return;
                }
            }
        };

        if !shared.generation.is_current(next.generation) {
            debug!(
                "Skipping stale chunk from generation {}: {:?}",
                next.generation, next.payload.chunk
            );
            continue;
        }

        shared.handler.handle(next.payload, next.generation).await;
    }
}
