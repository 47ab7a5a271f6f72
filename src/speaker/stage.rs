//! Hand-off from the synthesis queue to playback.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::chunker::TtsChunkItem;
use super::playback::{ClipRegistry, PlaybackItem, PlaybackScheduler};
use super::state::{PipelineState, PipelineStatus};
use super::synth::{ProviderRegistry, VoiceConfig};
use super::worker::{ChunkHandler, Generation};
use crate::error::SynthesisError;

/// Synthesizes each chunk and queues the result for playback. Work that
/// outlives a reset is dropped here or refused by the scheduler.
pub struct SynthesisStage {
    providers: ProviderRegistry,
    voice: VoiceConfig,
    clips: ClipRegistry,
    scheduler: PlaybackScheduler,
    state: PipelineState,
    generation: Generation,
}

impl SynthesisStage {
    pub fn new(
        providers: ProviderRegistry,
        voice: VoiceConfig,
        clips: ClipRegistry,
        scheduler: PlaybackScheduler,
        state: PipelineState,
        generation: Generation,
    ) -> Self {
        Self {
            providers,
            voice,
            clips,
            scheduler,
            state,
            generation,
        }
    }

    fn forward_special(&self, special: Option<String>, generation: u64) {
        if let Some(special) = special {
            self.scheduler.enqueue(PlaybackItem::control(special, generation));
        }
    }
}

#[async_trait]
impl ChunkHandler for SynthesisStage {
    async fn handle(&self, item: TtsChunkItem, generation: u64) {
        if !self.generation.is_current(generation) {
            return;
        }

        let text = item.chunk.trim();
        if text.is_empty() {
            self.forward_special(item.special, generation);
            return;
        }

        let Some(synthesizer) = self.providers.get(&self.voice.provider_id) else {
            let e = SynthesisError::UnknownProvider(self.voice.provider_id.clone());
            warn!("{e}");
            self.state.record_error(e.to_string());
            self.forward_special(item.special, generation);
            return;
        };

        self.state.promote(PipelineStatus::Buffering);
        let t0 = Instant::now();
        let result = synthesizer.synthesize(text, &self.voice).await;

        if !self.generation.is_current(generation) {
            debug!("Discarding synthesis for {text:?}: pipeline was reset");
            return;
        }

        match result {
            Ok(audio) => {
                debug!(
                    "Synthesized {:?} in {}ms ({} bytes)",
                    text,
                    t0.elapsed().as_millis(),
                    audio.bytes.len()
                );
                // A reset may still land before the hand-off; the scheduler
                // re-checks the generation under its queue lock.
                let url = self.clips.create(audio);
                self.scheduler
                    .enqueue(PlaybackItem::audio(url, text, item.special, generation));
            }
            Err(e) => {
                warn!("Synthesis failed for {text:?}: {e}");
                self.state.record_error(e.to_string());
                self.forward_special(item.special, generation);
            }
        }
    }
}
