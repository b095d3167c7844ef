use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::signaling::HttpReply;

/// Multipart form field the ASR proxy expects the recording under.
const AUDIO_FIELD: &str = "audio_file";

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("invalid transcription configuration: {0}")]
    InvalidConfig(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("transcription service returned {status}: {body}")]
    RemoteService { status: u16, body: String },
    #[error("malformed transcription response: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug)]
pub struct TranscribeConfig {
    base_url: Url,
}

impl TranscribeConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, TranscribeError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(TranscribeError::InvalidConfig(
                "asr base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{}", base);
        }
        let parsed = Url::parse(&base)
            .map_err(|err| TranscribeError::InvalidConfig(format!("invalid asr url: {err}")))?;
        Ok(Self { base_url: parsed })
    }

    fn transcribe_endpoint(&self) -> String {
        format!(
            "{}/proxy/asr?task=transcribe&output=json",
            self.base_url.as_str().trim_end_matches('/')
        )
    }
}

#[async_trait]
pub trait TranscribeBackend: Send + Sync {
    async fn upload(
        &self,
        url: &str,
        file_name: String,
        audio: Vec<u8>,
    ) -> Result<HttpReply, TranscribeError>;
}

pub struct ReqwestTranscribeBackend {
    client: reqwest::Client,
}

impl ReqwestTranscribeBackend {
    pub fn new() -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| TranscribeError::InvalidConfig(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TranscribeBackend for ReqwestTranscribeBackend {
    async fn upload(
        &self,
        url: &str,
        file_name: String,
        audio: Vec<u8>,
    ) -> Result<HttpReply, TranscribeError> {
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|err| TranscribeError::InvalidConfig(err.to_string()))?;
        let form = reqwest::multipart::Form::new().part(AUDIO_FIELD, part);
        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| TranscribeError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| TranscribeError::Network(err.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionBody {
    text: String,
}

/// Uploads a recorded utterance to the proxied speech-to-text endpoint.
/// Failures here never touch the avatar session.
pub struct TranscriptionClient {
    config: TranscribeConfig,
    backend: Arc<dyn TranscribeBackend>,
}

impl TranscriptionClient {
    pub fn new(config: TranscribeConfig) -> Result<Self, TranscribeError> {
        let backend = Arc::new(ReqwestTranscribeBackend::new()?);
        Ok(Self { config, backend })
    }

    pub fn with_backend(config: TranscribeConfig, backend: Arc<dyn TranscribeBackend>) -> Self {
        Self { config, backend }
    }

    pub async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
    ) -> Result<String, TranscribeError> {
        let url = self.config.transcribe_endpoint();
        let bytes = audio.len();
        let reply = self.backend.upload(&url, file_name.to_string(), audio).await?;
        if !(200..300).contains(&reply.status) {
            return Err(TranscribeError::RemoteService {
                status: reply.status,
                body: reply.body,
            });
        }
        let body: TranscriptionBody = serde_json::from_str(&reply.body)
            .map_err(|err| TranscribeError::Malformed(err.to_string()))?;
        debug!(bytes, chars = body.text.len(), "transcription complete");
        Ok(body.text)
    }
}
