//! Wires the streaming pipeline together and exposes its lifecycle.
//!
//! ```text
//! chat deltas ─▶ StreamTokenizer ─▶ SemanticChunker ─▶ ChunkEmitter
//!                                                          │
//!           PlaybackScheduler ◀── SynthesisStage ◀── ChunkQueueWorker
//! ```
//!
//! Text handling is synchronous and runs on the caller's task; synthesis
//! and playback each run on their own task. A shared [`Generation`]
//! invalidates everything downstream on stop or reset.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use super::chunker::{Chunk, ChunkEmitter, ChunkerOptions, SemanticChunker, TtsChunkItem};
use super::playback::{AudioSink, ClipRegistry, PlaybackScheduler};
use super::stage::SynthesisStage;
use super::state::{PipelineState, PipelineStatus, StatusSnapshot};
use super::synth::{ProviderRegistry, VoiceConfig};
use super::tokens::{Piece, StreamTokenizer, DEFAULT_MAX_BUFFER, FLUSH_SENTINEL, SPECIAL_SENTINEL};
use super::worker::{ChunkQueueWorker, Generation};
use crate::error::{SpeakerError, SpeakerResult};

/// Events from an upstream chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Assistant text, possibly containing inline control markers
    TextDelta(String),
    /// A control token delivered out of band, e.g. `<|EMOTE_HAPPY|>`
    ControlToken(String),
    /// The assistant turn is complete
    Finished,
    /// The conversation was reset upstream
    Reset,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub voice: VoiceConfig,
    pub chunker: ChunkerOptions,
    pub max_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            voice: VoiceConfig::default(),
            chunker: ChunkerOptions::default(),
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

/// Per-turn text state: tokenizer, chunker and emitter.
struct TextPipeline {
    tokenizer: StreamTokenizer,
    chunker: SemanticChunker,
    emitter: ChunkEmitter,
}

impl TextPipeline {
    fn new(config: &OrchestratorConfig) -> Self {
        Self {
            tokenizer: StreamTokenizer::new(config.max_buffer),
            chunker: SemanticChunker::new(config.chunker),
            emitter: ChunkEmitter::new(),
        }
    }

    fn text(&mut self, delta: &str) -> Vec<TtsChunkItem> {
        let pieces = self.tokenizer.ingest_pieces(delta);
        let chunks = self.feed(pieces);
        self.emit(chunks)
    }

    fn control(&mut self, raw: &str) -> Vec<TtsChunkItem> {
        // Text already delivered keeps its place ahead of the token.
        let pieces = self.tokenizer.flush_pieces();
        let mut chunks = self.feed(pieces);
        chunks.extend(self.special(raw));
        self.emit(chunks)
    }

    fn finish(&mut self) -> Vec<TtsChunkItem> {
        let pieces = self.tokenizer.flush_pieces();
        let mut chunks = self.feed(pieces);
        chunks.extend(self.chunker.push(&FLUSH_SENTINEL.to_string()));
        chunks.extend(self.chunker.finish());
        self.emit(chunks)
    }

    fn feed(&mut self, pieces: Vec<Piece>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for piece in pieces {
            match piece {
                Piece::Text(text) => chunks.extend(self.chunker.push(&text)),
                Piece::Token(token) => chunks.extend(self.special(&token.raw)),
            }
        }
        chunks
    }

    fn special(&mut self, raw: &str) -> Vec<Chunk> {
        self.emitter.push_special(raw);
        self.chunker.push(&SPECIAL_SENTINEL.to_string())
    }

    fn emit(&mut self, chunks: Vec<Chunk>) -> Vec<TtsChunkItem> {
        chunks.into_iter().map(|c| self.emitter.emit(c)).collect()
    }
}

pub struct StreamingOrchestrator {
    config: OrchestratorConfig,
    providers: ProviderRegistry,
    state: PipelineState,
    clips: ClipRegistry,
    scheduler: PlaybackScheduler,
    worker: ChunkQueueWorker,
    /// `None` while disabled
    pipeline: Mutex<Option<TextPipeline>>,
}

impl StreamingOrchestrator {
    pub fn new(config: OrchestratorConfig, providers: ProviderRegistry, sink: Arc<dyn AudioSink>) -> Self {
        let state = PipelineState::new();
        let clips = ClipRegistry::new();
        let generation = Generation::new();
        let scheduler =
            PlaybackScheduler::new(sink, clips.clone(), state.clone(), generation.clone());
        let stage = SynthesisStage::new(
            providers.clone(),
            config.voice.clone(),
            clips.clone(),
            scheduler.clone(),
            state.clone(),
            generation.clone(),
        );
        let worker = ChunkQueueWorker::new(Arc::new(stage), generation);

        Self {
            config,
            providers,
            state,
            clips,
            scheduler,
            worker,
            pipeline: Mutex::new(None),
        }
    }

    pub fn clips(&self) -> &ClipRegistry {
        &self.clips
    }

    pub fn is_enabled(&self) -> bool {
        self.pipeline.lock().unwrap().is_some()
    }

    /// Check provider and voice selection, then start a fresh pipeline.
    pub fn enable(&self) -> SpeakerResult<()> {
        if let Err(e) = self.preflight() {
            warn!("Cannot enable speech: {e}");
            self.state.record_error(e.to_string());
            return Err(e);
        }

        self.hard_reset();
        *self.pipeline.lock().unwrap() = Some(TextPipeline::new(&self.config));
        self.state.set_enabled(true);
        info!(
            "Speech enabled (provider {}, voice {})",
            self.config.voice.provider_id, self.config.voice.voice_id
        );
        Ok(())
    }

    fn preflight(&self) -> SpeakerResult<()> {
        let voice = &self.config.voice;
        if voice.provider_id.is_empty() {
            return Err(SpeakerError::Config("no speech provider selected".into()));
        }
        if !self.providers.contains(&voice.provider_id) {
            return Err(SpeakerError::Config(format!(
                "speech provider {} is not available",
                voice.provider_id
            )));
        }
        if voice.voice_id.is_empty() {
            return Err(SpeakerError::Config("no voice selected".into()));
        }
        Ok(())
    }

    pub fn disable(&self) {
        self.hard_reset();
        *self.pipeline.lock().unwrap() = None;
        self.state.set_enabled(false);
        info!("Speech disabled");
    }

    /// Silence everything and drop buffered text; stays enabled.
    pub fn stop(&self) {
        info!("Stop requested");
        self.restart();
    }

    /// Upstream conversation reset; same teardown as [`stop`](Self::stop).
    pub fn reset(&self) {
        info!("Conversation reset");
        self.restart();
    }

    fn restart(&self) {
        self.hard_reset();
        let mut pipeline = self.pipeline.lock().unwrap();
        if pipeline.is_some() {
            *pipeline = Some(TextPipeline::new(&self.config));
        }
    }

    fn hard_reset(&self) {
        // Advance the generation before the scheduler drains, so a hand-off
        // racing the drain is refused at the queue.
        self.worker.reset();
        self.scheduler.stop();
        self.state.clear();
    }

    pub fn status(&self) -> StatusSnapshot {
        let mut snapshot = self.state.snapshot();
        snapshot.synthesis_queue = self.worker.pending();
        snapshot.playback_queue = self.scheduler.pending();
        snapshot
    }

    /// True once nothing is queued, synthesizing or playing.
    pub fn is_drained(&self) -> bool {
        !self.worker.is_running() && !self.scheduler.is_playing()
    }

    /// Wait until [`is_drained`](Self::is_drained).
    pub async fn wait_drained(&self) {
        while !self.is_drained() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn on_text_delta(&self, delta: &str) {
        self.with_pipeline(|pipeline| pipeline.text(delta));
    }

    pub fn on_control_token(&self, raw: &str) {
        debug!("Control token {raw}");
        self.with_pipeline(|pipeline| pipeline.control(raw));
    }

    pub fn on_stream_end(&self) {
        let ended = self.with_pipeline(|pipeline| {
            let items = pipeline.finish();
            *pipeline = TextPipeline::new(&self.config);
            items
        });
        if !ended {
            return;
        }
        debug!("Stream ended");
        // Nothing left to synthesize: the turn produced no speech.
        if self.is_drained() && self.state.status() == PipelineStatus::Chunking {
            self.state.set_status(PipelineStatus::Idle);
        }
    }

    pub fn handle_event(&self, event: ChatEvent) {
        match event {
            ChatEvent::TextDelta(delta) => self.on_text_delta(&delta),
            ChatEvent::ControlToken(raw) => self.on_control_token(&raw),
            ChatEvent::Finished => self.on_stream_end(),
            ChatEvent::Reset => self.reset(),
        }
    }

    /// Drive the pipeline from a stream of chat events.
    pub async fn run<S>(&self, events: S)
    where
        S: Stream<Item = ChatEvent>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            self.handle_event(event);
        }
    }

    /// Run `f` against the live text pipeline and queue what it produced.
    /// Returns false while disabled.
    fn with_pipeline(&self, f: impl FnOnce(&mut TextPipeline) -> Vec<TtsChunkItem>) -> bool {
        let items = {
            let mut guard = self.pipeline.lock().unwrap();
            match guard.as_mut() {
                Some(pipeline) => f(pipeline),
                None => return false,
            }
        };

        self.state.promote(PipelineStatus::Chunking);
        for item in items {
            self.worker.enqueue(item);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speaker::audio::LogSink;

    fn orchestrator(voice: VoiceConfig) -> StreamingOrchestrator {
        StreamingOrchestrator::new(
            OrchestratorConfig {
                voice,
                ..OrchestratorConfig::default()
            },
            ProviderRegistry::new(),
            Arc::new(LogSink),
        )
    }

    #[test]
    fn test_enable_requires_provider() {
        let speaker = orchestrator(VoiceConfig::default());
        let err = speaker.enable().unwrap_err();
        assert!(matches!(err, SpeakerError::Config(_)));
        assert!(!speaker.is_enabled());

        let snapshot = speaker.status();
        assert_eq!(snapshot.status, PipelineStatus::Error);
        assert!(snapshot.last_error.unwrap().contains("no speech provider"));
    }

    #[test]
    fn test_enable_rejects_unregistered_provider() {
        let speaker = orchestrator(VoiceConfig {
            provider_id: "elsewhere".into(),
            voice_id: "v".into(),
            ..VoiceConfig::default()
        });
        let err = speaker.enable().unwrap_err();
        assert!(err.to_string().contains("elsewhere is not available"));
    }

    #[test]
    fn test_disabled_pipeline_ignores_input() {
        let speaker = orchestrator(VoiceConfig::default());
        speaker.on_text_delta("Hello there. ");
        speaker.on_control_token("<|EMOTE_HAPPY|>");
        speaker.on_stream_end();
        assert_eq!(speaker.status().synthesis_queue, 0);
        assert!(speaker.is_drained());
    }

    #[test]
    fn test_text_pipeline_places_tokens_in_order() {
        let mut pipeline = TextPipeline::new(&OrchestratorConfig::default());
        let mut items = pipeline.text("The answer is");
        items.extend(pipeline.control("<|EMOTE_HAPPY|>"));
        items.extend(pipeline.text(" 42."));
        items.extend(pipeline.finish());

        let chunks: Vec<(&str, Option<&str>)> = items
            .iter()
            .map(|i| (i.chunk.as_str(), i.special.as_deref()))
            .collect();
        assert_eq!(
            chunks,
            vec![("The answer is", Some("<|EMOTE_HAPPY|>")), ("42.", None)]
        );
    }

    #[test]
    fn test_inline_markers_split_fragmented_text() {
        let mut pipeline = TextPipeline::new(&OrchestratorConfig::default());
        let mut items = Vec::new();
        for delta in ["Hmm <|EM", "OTE_THINK|", "> let me see", ". <|DELAY:1|>Okay!"] {
            items.extend(pipeline.text(delta));
        }
        items.extend(pipeline.finish());

        let chunks: Vec<(&str, Option<&str>)> = items
            .iter()
            .map(|i| (i.chunk.as_str(), i.special.as_deref()))
            .collect();
        assert_eq!(
            chunks,
            vec![
                ("Hmm", Some("<|EMOTE_THINK|>")),
                ("let me see.", None),
                ("", Some("<|DELAY:1|>")),
                ("Okay!", None),
            ]
        );
    }
}
