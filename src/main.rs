//! chat-speaker: speaks streamed chat responses as they arrive.

use chat_speaker::config;
use chat_speaker::speaker::api::{start_speaker_api, SpeakerApiState};
use chat_speaker::speaker::audio::{LogSink, RodioSink};
use chat_speaker::speaker::playback::AudioSink;
use chat_speaker::speaker::synth::{HttpSynthesizer, ProviderRegistry, Synthesizer};
use chat_speaker::{ChatEvent, StreamingOrchestrator};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Characters per simulated delta in `--text` mode
const FRAGMENT_CHARS: usize = 6;

#[derive(Parser, Debug)]
#[command(name = "chat-speaker", about = "Streaming text-to-speech for chat responses")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Speak this text (markers allowed) and exit instead of serving the API
    #[arg(short, long)]
    text: Option<String>,

    /// Log audio instead of playing it
    #[arg(long)]
    no_audio: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

/// Split text into small deltas the way a chat stream delivers it.
fn fragments(text: &str) -> Vec<ChatEvent> {
    let chars: Vec<char> = text.chars().collect();
    let mut events: Vec<ChatEvent> = chars
        .chunks(FRAGMENT_CHARS)
        .map(|c| ChatEvent::TextDelta(c.iter().collect()))
        .collect();
    events.push(ChatEvent::Finished);
    events
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy HTTP/decoder internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info,symphonia=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn,symphonia=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("chat-speaker starting");

    let config = config::Config::load(args.config.as_deref());
    info!(
        "Speech provider: {:?}, voice: {:?}",
        config.speech.provider_id, config.speech.voice_id
    );

    let synthesizer: Arc<dyn Synthesizer> = Arc::new(HttpSynthesizer::new(
        &config.speech.endpoint,
        config.speech.timeout(),
    )?);
    let providers = ProviderRegistry::new().with(config.speech.provider_id.clone(), synthesizer);

    let sink: Arc<dyn AudioSink> = if args.no_audio || !config.playback.audio_output {
        Arc::new(LogSink)
    } else {
        match RodioSink::open() {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!("{e}");
                info!("Continuing without audio output");
                Arc::new(LogSink)
            }
        }
    };

    let speaker = Arc::new(StreamingOrchestrator::new(
        config.orchestrator(),
        providers,
        sink,
    ));

    if let Some(text) = args.text {
        speaker.enable()?;
        speaker.run(futures::stream::iter(fragments(&text))).await;
        speaker.wait_drained().await;
        info!("Done: {:?}", speaker.status());
        return Ok(());
    }

    if let Err(e) = speaker.enable() {
        warn!("Speech not enabled: {e}");
    }

    if config.api.enabled {
        let state = SpeakerApiState {
            speaker: speaker.clone(),
        };
        start_speaker_api(state, config.api.port).await;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    speaker.disable();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_keep_multibyte_text_intact() {
        let events = fragments("héllo wörld, 你好");
        let mut text = String::new();
        for event in &events[..events.len() - 1] {
            match event {
                ChatEvent::TextDelta(delta) => text.push_str(delta),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(text, "héllo wörld, 你好");
        assert_eq!(events.last(), Some(&ChatEvent::Finished));
    }
}
