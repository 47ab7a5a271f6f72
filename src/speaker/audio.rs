//! Audio sinks for the playback scheduler.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::playback::AudioSink;
use super::synth::AudioClip;
use crate::error::PlaybackError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct PlayRequest {
    clip: Arc<AudioClip>,
    done: oneshot::Sender<Result<(), PlaybackError>>,
}

/// Plays clips on the default output device.
///
/// The output stream is not `Send` on every platform; it lives on a
/// dedicated thread that plays one request at a time.
pub struct RodioSink {
    requests: mpsc::Sender<PlayRequest>,
    cancel_flag: Arc<AtomicBool>,
}

impl RodioSink {
    pub fn open() -> Result<Self, PlaybackError> {
        let (requests, rx) = mpsc::channel::<PlayRequest>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let flag = cancel_flag.clone();
        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                // In rodio 0.21, OutputStream is the handle; dropping it silences output
                let stream = match OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError::Output(e.to_string())));
                        return;
                    }
                };
                for request in rx {
                    let result = play_blocking(&stream, &request.clip, &flag);
                    let _ = request.done.send(result);
                }
                debug!("Audio output thread exiting");
            })
            .map_err(|e| PlaybackError::Output(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|e| PlaybackError::Output(e.to_string()))??;
        info!("Audio output opened");
        Ok(Self {
            requests,
            cancel_flag,
        })
    }
}

/// Play one clip, polling for completion or cancellation.
fn play_blocking(
    stream: &OutputStream,
    clip: &AudioClip,
    cancel_flag: &AtomicBool,
) -> Result<(), PlaybackError> {
    let source = Decoder::new(Cursor::new(clip.bytes.clone()))
        .map_err(|e| PlaybackError::Decode(format!("{e} ({})", clip.mime_type)))?;

    // rodio 0.21: Sink::connect_new takes &Mixer
    let sink = Sink::connect_new(stream.mixer());
    sink.append(source);

    while !sink.empty() {
        if cancel_flag.load(Ordering::Relaxed) {
            sink.stop();
            debug!("Clip cut short");
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, clip: Arc<AudioClip>) -> Result<(), PlaybackError> {
        self.cancel_flag.store(false, Ordering::Relaxed);

        let (done, result) = oneshot::channel();
        self.requests
            .send(PlayRequest { clip, done })
            .map_err(|_| PlaybackError::Output("audio output thread has stopped".into()))?;
        result
            .await
            .map_err(|_| PlaybackError::Output("audio output thread has stopped".into()))?
    }

    fn halt(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }
}

/// Discards audio; used with `--no-audio` and on machines without an
/// output device.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AudioSink for LogSink {
    async fn play(&self, clip: Arc<AudioClip>) -> Result<(), PlaybackError> {
        info!("Would play {} bytes of {}", clip.bytes.len(), clip.mime_type);
        Ok(())
    }

    fn halt(&self) {}
}
