//! End-to-end scenarios: chat events in, played clips and status out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_speaker::speaker::playback::AudioSink;
use chat_speaker::speaker::state::PipelineStatus;
use chat_speaker::speaker::synth::{AudioClip, ProviderRegistry, Synthesizer, VoiceConfig};
use chat_speaker::{
    ChatEvent, OrchestratorConfig, PlaybackError, StreamingOrchestrator, SynthesisError,
};
use tokio::sync::Notify;

/// Echoes the chunk text back as audio after `latency`; fails on "fail".
struct EchoSynth {
    latency: Duration,
}

#[async_trait]
impl Synthesizer for EchoSynth {
    async fn synthesize(&self, text: &str, _voice: &VoiceConfig) -> Result<AudioClip, SynthesisError> {
        tokio::time::sleep(self.latency).await;
        if text.contains("fail") {
            return Err(SynthesisError::Api {
                status: 503,
                message: "provider unavailable".into(),
            });
        }
        Ok(AudioClip {
            bytes: text.as_bytes().to_vec(),
            mime_type: "audio/mpeg".into(),
        })
    }
}

/// Records each clip as it starts; `halt` cuts the current one short.
struct RecordingSink {
    duration: Duration,
    played: Mutex<Vec<String>>,
    halted: Notify,
}

impl RecordingSink {
    fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, clip: Arc<AudioClip>) -> Result<(), PlaybackError> {
        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&clip.bytes).to_string());
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = self.halted.notified() => {}
        }
        Ok(())
    }

    fn halt(&self) {
        self.halted.notify_waiters();
    }
}

fn speaker(latency: Duration, duration: Duration) -> (Arc<StreamingOrchestrator>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink {
        duration,
        played: Mutex::new(Vec::new()),
        halted: Notify::new(),
    });
    let providers = ProviderRegistry::new().with(
        "echo",
        Arc::new(EchoSynth { latency }) as Arc<dyn Synthesizer>,
    );
    let config = OrchestratorConfig {
        voice: VoiceConfig {
            provider_id: "echo".into(),
            voice_id: "test-voice".into(),
            ..VoiceConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    let speaker = Arc::new(StreamingOrchestrator::new(config, providers, sink.clone()));
    speaker.enable().unwrap();
    (speaker, sink)
}

fn assert_clips_released(speaker: &StreamingOrchestrator) {
    let clips = speaker.clips();
    assert_eq!(clips.live(), 0);
    assert_eq!(clips.created(), clips.revoked());
    assert_eq!(clips.repeated_revocations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_control_token_splits_speech_and_sets_emotion() {
    let (speaker, sink) = speaker(Duration::from_millis(30), Duration::from_millis(100));

    speaker.on_text_delta("The answer is");
    speaker.on_control_token("<|EMOTE_HAPPY|>");
    speaker.on_text_delta(" 42.");
    speaker.on_stream_end();
    speaker.wait_drained().await;

    assert_eq!(sink.played(), vec!["The answer is", "42."]);
    let status = speaker.status();
    assert_eq!(status.last_emotion.as_deref(), Some("HAPPY"));
    assert_eq!(status.status, PipelineStatus::Idle);
    assert!(status.last_error.is_none());
    assert_clips_released(&speaker);
}

#[tokio::test(start_paused = true)]
async fn test_reset_discards_stale_speech() {
    let (speaker, sink) = speaker(Duration::from_millis(50), Duration::from_millis(200));

    speaker.on_text_delta("One is first. Two is second. Three is third. Four is fourth. ");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.played(), vec!["One is first."]);

    speaker.reset();
    speaker.on_text_delta("Fresh start.");
    speaker.on_stream_end();
    speaker.wait_drained().await;

    assert_eq!(sink.played(), vec!["One is first.", "Fresh start."]);
    assert_eq!(speaker.status().status, PipelineStatus::Idle);
    assert_clips_released(&speaker);
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_does_not_stall_the_stream() {
    let (speaker, sink) = speaker(Duration::from_millis(10), Duration::from_millis(50));

    speaker.on_text_delta("This one will fail. <|EMOTE_SAD|>But this works.");
    speaker.on_stream_end();
    speaker.wait_drained().await;

    assert_eq!(sink.played(), vec!["But this works."]);
    let status = speaker.status();
    assert!(status.last_error.unwrap().contains("provider unavailable"));
    assert_eq!(status.last_emotion.as_deref(), Some("SAD"));
    assert_clips_released(&speaker);
}

#[tokio::test(start_paused = true)]
async fn test_run_drives_pipeline_from_event_stream() {
    let (speaker, sink) = speaker(Duration::from_millis(10), Duration::from_millis(20));

    let events = vec![
        ChatEvent::TextDelta("Hi <|EMOTE_SURP".into()),
        ChatEvent::TextDelta("RISED|>there".into()),
        ChatEvent::TextDelta(". Bye".into()),
        ChatEvent::Finished,
    ];
    speaker.run(futures::stream::iter(events)).await;
    speaker.wait_drained().await;

    assert_eq!(sink.played(), vec!["Hi", "there.", "Bye"]);
    assert_eq!(speaker.status().last_emotion.as_deref(), Some("SURPRISED"));
    assert_clips_released(&speaker);
}

#[tokio::test(start_paused = true)]
async fn test_delay_token_pauses_between_sentences() {
    let (speaker, sink) = speaker(Duration::from_millis(10), Duration::from_millis(10));

    let started = tokio::time::Instant::now();
    speaker.on_text_delta("Let me think.");
    speaker.on_control_token("<|DELAY:3|>");
    speaker.on_text_delta(" Got it!");
    speaker.on_stream_end();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.played(), vec!["Let me think."]);
    assert_eq!(speaker.status().status, PipelineStatus::Buffering);

    speaker.wait_drained().await;
    assert_eq!(sink.played(), vec!["Let me think.", "Got it!"]);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_clips_released(&speaker);
}

#[tokio::test]
async fn test_disable_silences_and_ignores_input() {
    let (speaker, sink) = speaker(Duration::from_millis(5), Duration::from_secs(30));

    speaker.on_text_delta("This sentence plays. ");
    speaker.on_stream_end();
    while sink.played().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    speaker.disable();
    speaker.handle_event(ChatEvent::TextDelta("Nobody hears this.".into()));
    speaker.handle_event(ChatEvent::Finished);
    speaker.wait_drained().await;

    assert_eq!(sink.played(), vec!["This sentence plays."]);
    let status = speaker.status();
    assert!(!status.enabled);
    assert_eq!(status.status, PipelineStatus::Idle);
    assert_clips_released(&speaker);
}
