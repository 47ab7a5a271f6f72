//! Speech synthesis providers.
//!
//! The pipeline only sees [`Synthesizer`]: text plus voice settings in,
//! encoded audio out. [`HttpSynthesizer`] talks to the speech service's
//! `/api/speech/providers/{id}/synthesize` endpoint and normalizes its
//! response; [`ProviderRegistry`] maps provider ids to synthesizers and is
//! built explicitly by whoever constructs the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SynthesisError;

const DEFAULT_MIME_TYPE: &str = "audio/mpeg";

/// Encoded audio for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Voice settings sent with every synthesis request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub provider_id: String,
    pub voice_id: String,
    pub voice_metadata: Value,
    pub pitch: f32,
    pub rate: f32,
    pub ssml_enabled: bool,
    /// Credentials and provider options, sent alongside the voice fields
    pub provider_config: Map<String, Value>,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioClip, SynthesisError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    #[serde(flatten)]
    provider_config: &'a Map<String, Value>,
    text: &'a str,
    ssml_enabled: bool,
    voice_id: &'a str,
    voice_metadata: &'a Value,
    pitch: f32,
    rate: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio: Option<String>,
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    detail: Option<String>,
}

/// Synthesizer backed by the speech service HTTP API.
pub struct HttpSynthesizer {
    endpoint: String,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SynthesisError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, provider_id: &str) -> String {
        format!(
            "{}/api/speech/providers/{provider_id}/synthesize",
            self.endpoint
        )
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioClip, SynthesisError> {
        let body = SynthesizeRequest {
            provider_config: &voice.provider_config,
            text,
            ssml_enabled: voice.ssml_enabled,
            voice_id: &voice.voice_id,
            voice_metadata: &voice.voice_metadata,
            pitch: voice.pitch,
            rate: voice.rate,
        };

        let url = self.url(&voice.provider_id);
        debug!("POST {url} ({} chars)", text.len());
        let resp = self.client.post(&url).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&raw)
                .ok()
                .and_then(|e| e.detail.or(e.error))
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                });
            return Err(SynthesisError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let data: SynthesizeResponse = resp.json().await?;
        let audio = data
            .audio
            .filter(|a| !a.is_empty())
            .ok_or(SynthesisError::MissingAudio)?;
        // Some providers hand back a data URL instead of bare base64.
        let encoded = match audio.split_once("base64,") {
            Some((_, payload)) => payload,
            None => audio.as_str(),
        };
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;

        Ok(AudioClip {
            bytes,
            mime_type: data
                .mime_type
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
        })
    }
}

/// Provider id → synthesizer lookup, passed to the orchestrator.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Synthesizer>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.register(id, synthesizer);
        self
    }

    pub fn register(&mut self, id: impl Into<String>, synthesizer: Arc<dyn Synthesizer>) {
        self.providers.insert(id.into(), synthesizer);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Synthesizer>> {
        self.providers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }
}
