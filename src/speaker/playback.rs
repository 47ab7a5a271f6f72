//! Sequential playback of synthesized chunks.
//!
//! Audio lives in a [`ClipRegistry`] between synthesis and playback and is
//! addressed by [`ClipUrl`] handles; every handle is revoked exactly once,
//! either after its item plays or when `stop` discards it. After each item
//! the scheduler applies the control token attached to it.
//!
//! Items carry the [`Generation`] they were produced under. The scheduler
//! checks it under its queue lock, so an item from before a reset is either
//! drained by `stop` or refused at `enqueue`, never played.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::state::{PipelineState, PipelineStatus};
use super::synth::AudioClip;
use super::tokens::{parse_tokens, TokenKind};
use super::worker::Generation;
use crate::error::PlaybackError;

/// Handle to a registered clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipUrl(u64);

impl ClipUrl {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClipUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clip:{}", self.0)
    }
}

#[derive(Default)]
struct Clips {
    next: u64,
    live: HashMap<u64, Arc<AudioClip>>,
    created: usize,
    revoked: usize,
    repeated: usize,
}

/// Owner of synthesized audio awaiting playback.
#[derive(Clone, Default)]
pub struct ClipRegistry {
    inner: Arc<Mutex<Clips>>,
}

impl ClipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, clip: AudioClip) -> ClipUrl {
        let mut inner = self.inner.lock().unwrap();
        inner.next += 1;
        let id = inner.next;
        inner.live.insert(id, Arc::new(clip));
        inner.created += 1;
        ClipUrl(id)
    }

    pub fn resolve(&self, url: ClipUrl) -> Option<Arc<AudioClip>> {
        self.inner.lock().unwrap().live.get(&url.0).cloned()
    }

    /// Release a clip. Returns false (and counts it) if it was already gone.
    pub fn revoke(&self, url: ClipUrl) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.live.remove(&url.0).is_some() {
            inner.revoked += 1;
            true
        } else {
            warn!("{url} revoked twice");
            inner.repeated += 1;
            false
        }
    }

    pub fn live(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn created(&self) -> usize {
        self.inner.lock().unwrap().created
    }

    pub fn revoked(&self) -> usize {
        self.inner.lock().unwrap().revoked
    }

    /// Revocations of handles that were already released.
    pub fn repeated_revocations(&self) -> usize {
        self.inner.lock().unwrap().repeated
    }
}

/// One unit of playback: a clip, a control token, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    pub clip: Option<ClipUrl>,
    pub text: String,
    pub special: Option<String>,
    /// Generation the item was synthesized under
    pub generation: u64,
}

impl PlaybackItem {
    pub fn audio(
        clip: ClipUrl,
        text: impl Into<String>,
        special: Option<String>,
        generation: u64,
    ) -> Self {
        Self {
            clip: Some(clip),
            text: text.into(),
            special,
            generation,
        }
    }

    /// A control token with nothing to play.
    pub fn control(special: impl Into<String>, generation: u64) -> Self {
        Self {
            clip: None,
            text: String::new(),
            special: Some(special.into()),
            generation,
        }
    }
}

/// Audio output. `play` resolves once the clip has finished or `halt`
/// cut it short.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, clip: Arc<AudioClip>) -> Result<(), PlaybackError>;

    fn halt(&self);
}

#[derive(Default)]
struct Queue {
    items: VecDeque<PlaybackItem>,
    playing: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    sink: Arc<dyn AudioSink>,
    clips: ClipRegistry,
    state: PipelineState,
    generation: Generation,
    /// Bumped by `stop` under the queue lock; side effects of older items
    /// are skipped
    epoch: AtomicU64,
    stopped: Notify,
}

#[derive(Clone)]
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
}

impl PlaybackScheduler {
    pub fn new(
        sink: Arc<dyn AudioSink>,
        clips: ClipRegistry,
        state: PipelineState,
        generation: Generation,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                sink,
                clips,
                state,
                generation,
                epoch: AtomicU64::new(0),
                stopped: Notify::new(),
            }),
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().items.len()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.queue.lock().unwrap().playing
    }

    /// Append an item; starts the playback task if it is not running.
    ///
    /// Items from an earlier generation are refused and their clip is
    /// revoked. Returns whether the item was queued.
    pub fn enqueue(&self, item: PlaybackItem) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();
        if !self.shared.generation.is_current(item.generation) {
            drop(queue);
            debug!(
                "Refusing playback item from generation {}: {:?}",
                item.generation, item.text
            );
            if let Some(url) = item.clip {
                self.shared.clips.revoke(url);
            }
            return false;
        }
        queue.items.push_back(item);
        let start = !std::mem::replace(&mut queue.playing, true);
        drop(queue);

        if start {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                play_queue(shared).await;
            });
        }
        true
    }

    /// Halt the current clip, interrupt any delay and discard the queue,
    /// revoking every discarded clip.
    pub fn stop(&self) -> usize {
        let dropped: Vec<PlaybackItem> = {
            let mut queue = self.shared.queue.lock().unwrap();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            queue.items.drain(..).collect()
        };
        for url in dropped.iter().filter_map(|item| item.clip) {
            self.shared.clips.revoke(url);
        }

        self.shared.sink.halt();
        self.shared.stopped.notify_waiters();
        info!("Playback stopped ({} queued items dropped)", dropped.len());
        dropped.len()
    }
}

async fn play_queue(shared: Arc<Shared>) {
    loop {
        let (item, epoch) = {
            let mut queue = shared.queue.lock().unwrap();
            match queue.items.pop_front() {
                Some(item) => (item, shared.epoch.load(Ordering::SeqCst)),
                None => {
                    queue.playing = false;
                    shared.state.set_status_unless_error(PipelineStatus::Idle);
                    return;
                }
            }
        };

        let stale = !shared.generation.is_current(item.generation);
        if let Some(url) = item.clip {
            // Registered before the epoch check so a concurrent stop cannot
            // slip between the check and the start of the clip.
            let stopped = shared.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if stale || shared.epoch.load(Ordering::SeqCst) != epoch {
                debug!("Skipping {url}: playback was reset");
                shared.clips.revoke(url);
                continue;
            }
            match shared.clips.resolve(url) {
                Some(clip) => {
                    shared.state.set_status(PipelineStatus::Playing);
                    debug!("Playing {url}: {:?}", item.text);
                    let result = tokio::select! {
                        biased;
                        result = shared.sink.play(clip) => result,
                        _ = &mut stopped => {
                            // The sink may have missed the halt if it came
                            // before the clip started.
                            shared.sink.halt();
                            Ok(())
                        }
                    };
                    if let Err(e) = result {
                        warn!("Playback failed for {url}: {e}");
                        shared.state.record_error(e.to_string());
                    }
                    shared.clips.revoke(url);
                }
                None => {
                    let e = PlaybackError::Revoked(url.id());
                    warn!("{e}");
                    shared.state.record_error(e.to_string());
                }
            }

            if shared.queue.lock().unwrap().items.is_empty() {
                shared.state.set_status_unless_error(PipelineStatus::Idle);
            } else {
                shared.state.set_status_unless_error(PipelineStatus::Buffering);
            }
        }

        if stale || shared.epoch.load(Ordering::SeqCst) != epoch {
            continue;
        }
        if let Some(special) = item.special.as_deref() {
            apply_special(&shared, special, epoch).await;
        }
    }
}

async fn apply_special(shared: &Shared, special: &str, epoch: u64) {
    for token in parse_tokens(special).tokens {
        match token.kind {
            TokenKind::Delay { seconds } => {
                let Ok(pause) = Duration::try_from_secs_f64(seconds) else {
                    warn!("Ignoring out-of-range delay {}", token.raw);
                    continue;
                };
                debug!("Delay {seconds}s");

                let stopped = shared.stopped.notified();
                tokio::pin!(stopped);
                stopped.as_mut().enable();
                if shared.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                shared.state.set_status_unless_error(PipelineStatus::Buffering);
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = &mut stopped => {
                        debug!("Delay interrupted");
                        return;
                    }
                }
            }
            TokenKind::Emote { name, known: true } => {
                info!("Emotion: {name}");
                shared.state.set_last_emotion(&name);
            }
            TokenKind::Emote { name, known: false } => {
                warn!("Unknown emotion {name}, ignoring");
            }
            TokenKind::Motion { name } => {
                debug!("Motion {name} has no playback effect");
            }
        }
    }
}
