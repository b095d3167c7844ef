use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Retry budget for stream-creation and talk calls. Submitting the SDP
/// answer and forwarding ICE candidates are single-shot.
const MAX_RETRIES: u32 = 5;
const MAX_DELAY_SECS: f64 = 10.0;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling configuration: {0}")]
    InvalidConfig(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("avatar service returned {status}: {body}")]
    RemoteService { status: u16, body: String },
    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<SignalingError>,
    },
    #[error("missing session state: {0} is not set")]
    MissingSessionState(&'static str),
    #[error("malformed avatar service response: {0}")]
    MalformedResponse(String),
}

impl SignalingError {
    /// Whether the HTTP retry loop may take another attempt at this error.
    /// Transport failures are retryable; HTTP errors are not, except 429.
    fn is_retryable(&self) -> bool {
        match self {
            SignalingError::Network(_) => true,
            SignalingError::RemoteService { status, .. } => *status == 429,
            _ => false,
        }
    }

    /// Walks the source chain looking for an HTTP 429, including one buried
    /// inside `MaxRetriesExceeded`.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            SignalingError::RemoteService { status, .. } => *status == 429,
            SignalingError::MaxRetriesExceeded { source, .. } => source.is_rate_limited(),
            _ => false,
        }
    }
}

/// SDP description as it crosses the signaling API: `{"type": ..., "sdp": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub typ: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

/// ICE server entry as advertised by the avatar provider. `urls` arrives
/// either as a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Successful stream-creation response: identifiers scoping every later
/// signaling call, plus the remote offer and ICE servers to negotiate with.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamCreated {
    pub id: String,
    pub session_id: String,
    pub offer: SdpPayload,
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
}

/// One discovered ICE candidate, forwarded as-is and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct AvatarConfig {
    base_url: Url,
    api_key: String,
    pub voice_provider: String,
    pub voice_id: String,
    pub stream_warmup: bool,
    pub compatibility_mode: Option<String>,
    pub audio_optimization: Option<u8>,
}

impl AvatarConfig {
    pub fn new(
        base_url: impl AsRef<str>,
        api_key: impl Into<String>,
    ) -> Result<Self, SignalingError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(SignalingError::InvalidConfig(
                "avatar api base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("https://{}", base);
        }
        let parsed = Url::parse(&base)
            .map_err(|err| SignalingError::InvalidConfig(format!("invalid avatar api url: {err}")))?;
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SignalingError::InvalidConfig(
                "avatar api key cannot be empty".into(),
            ));
        }
        Ok(Self {
            base_url: parsed,
            api_key,
            voice_provider: "microsoft".to_string(),
            voice_id: "en-US-JennyNeural".to_string(),
            stream_warmup: false,
            compatibility_mode: Some("off".to_string()),
            audio_optimization: None,
        })
    }

    pub fn with_voice(mut self, provider: impl Into<String>, voice_id: impl Into<String>) -> Self {
        self.voice_provider = provider.into();
        self.voice_id = voice_id.into();
        self
    }

    pub fn with_stream_warmup(mut self, warmup: bool) -> Self {
        self.stream_warmup = warmup;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `Authorization` header value. Keys supplied as `user:pass` are
    /// Base64-encoded first; anything else is assumed pre-encoded.
    pub fn auth_header(&self) -> String {
        if self.api_key.contains(':') {
            format!("Basic {}", BASE64.encode(self.api_key.as_bytes()))
        } else {
            format!("Basic {}", self.api_key)
        }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), suffix)
    }

    fn streams_endpoint(&self) -> String {
        self.endpoint("streams")
    }

    fn stream_endpoint(&self, stream_id: &str, tail: Option<&str>) -> String {
        match tail {
            Some(tail) => self.endpoint(&format!("streams/{stream_id}/{tail}")),
            None => self.endpoint(&format!("streams/{stream_id}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn into_error(self) -> SignalingError {
        SignalingError::RemoteService {
            status: self.status,
            body: self.body,
        }
    }
}

/// Transport seam for the avatar REST API. Production uses reqwest; tests
/// substitute scripted replies.
#[async_trait]
pub trait SignalingBackend: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        auth: &str,
        body: &Value,
    ) -> Result<HttpReply, SignalingError>;
}

pub struct ReqwestSignalingBackend {
    client: reqwest::Client,
}

impl ReqwestSignalingBackend {
    pub fn new() -> Result<Self, SignalingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| SignalingError::InvalidConfig(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SignalingBackend for ReqwestSignalingBackend {
    async fn post_json(
        &self,
        url: &str,
        auth: &str,
        body: &Value,
    ) -> Result<HttpReply, SignalingError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|err| SignalingError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| SignalingError::Network(err.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

/// Delay before retry `attempt` (1-based): `min(2^n / 4 + jitter, 10)`
/// seconds, with `jitter` drawn uniformly from [0, 1).
fn backoff_delay(attempt: u32, jitter: f64) -> Duration {
    let base = 2f64.powi(attempt as i32) / 4.0;
    Duration::from_secs_f64((base + jitter).min(MAX_DELAY_SECS))
}

fn require_ids<'a>(
    stream_id: Option<&'a str>,
    session_id: Option<&'a str>,
) -> Result<(&'a str, &'a str), SignalingError> {
    let stream_id = stream_id
        .filter(|id| !id.is_empty())
        .ok_or(SignalingError::MissingSessionState("stream id"))?;
    let session_id = session_id
        .filter(|id| !id.is_empty())
        .ok_or(SignalingError::MissingSessionState("session id"))?;
    Ok((stream_id, session_id))
}

/// HTTP half of the session lifecycle: creates the remote stream, submits
/// the negotiated answer, forwards ICE candidates, and issues talk requests
/// against a connected stream.
pub struct SignalingClient {
    config: AvatarConfig,
    backend: Arc<dyn SignalingBackend>,
}

impl SignalingClient {
    pub fn new(config: AvatarConfig) -> Result<Self, SignalingError> {
        let backend = Arc::new(ReqwestSignalingBackend::new()?);
        Ok(Self { config, backend })
    }

    /// Construct with a custom transport. The seam exists for tests and for
    /// embedders that pool or instrument their HTTP client.
    pub fn with_backend(config: AvatarConfig, backend: Arc<dyn SignalingBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &AvatarConfig {
        &self.config
    }

    pub async fn create_stream(&self, source_url: &str) -> Result<StreamCreated, SignalingError> {
        let mut body = json!({ "source_url": source_url, "stream_warmup": self.config.stream_warmup });
        if let Some(mode) = &self.config.compatibility_mode {
            body["compatibility_mode"] = json!(mode);
        }
        let reply = self
            .post_with_retries(&self.config.streams_endpoint(), &body)
            .await?;
        let created: StreamCreated = serde_json::from_str(&reply.body)
            .map_err(|err| SignalingError::MalformedResponse(err.to_string()))?;
        debug!(
            stream_id = %created.id,
            session_id = %created.session_id,
            ice_servers = created.ice_servers.len(),
            "stream created"
        );
        Ok(created)
    }

    pub async fn submit_answer(
        &self,
        stream_id: Option<&str>,
        session_id: Option<&str>,
        answer: &SdpPayload,
    ) -> Result<(), SignalingError> {
        let (stream_id, session_id) = require_ids(stream_id, session_id)?;
        let url = self.config.stream_endpoint(stream_id, Some("sdp"));
        let body = json!({ "answer": answer, "session_id": session_id });
        let reply = self
            .backend
            .post_json(&url, &self.config.auth_header(), &body)
            .await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }

    /// Best-effort: the peer controller logs and swallows failures here, so
    /// this call reports errors but never retries.
    pub async fn submit_ice_candidate(
        &self,
        stream_id: Option<&str>,
        session_id: Option<&str>,
        candidate: &IceCandidatePayload,
    ) -> Result<Value, SignalingError> {
        let (stream_id, session_id) = require_ids(stream_id, session_id)?;
        let url = self.config.stream_endpoint(stream_id, Some("ice"));
        let body = json!({
            "candidate": candidate.candidate,
            "sdpMid": candidate.sdp_mid,
            "sdpMLineIndex": candidate.sdp_mline_index,
            "session_id": session_id,
        });
        let reply = self
            .backend
            .post_json(&url, &self.config.auth_header(), &body)
            .await?;
        if reply.is_success() {
            parse_ack_body(&reply.body)
        } else {
            Err(reply.into_error())
        }
    }

    pub async fn send_talk_request(
        &self,
        stream_id: Option<&str>,
        session_id: Option<&str>,
        text: &str,
    ) -> Result<Value, SignalingError> {
        let (stream_id, session_id) = require_ids(stream_id, session_id)?;
        let url = self.config.stream_endpoint(stream_id, None);
        let mut body = json!({
            "script": {
                "type": "text",
                "provider": {
                    "type": self.config.voice_provider,
                    "voice_id": self.config.voice_id,
                },
                "ssml": false,
                "input": text,
            },
            "config": {
                "fluent": false,
                "pad_audio": 0.0,
            },
            "session_id": session_id,
        });
        if let Some(level) = self.config.audio_optimization {
            body["audio_optimization"] = json!(level);
        }
        let reply = self.post_with_retries(&url, &body).await?;
        parse_ack_body(&reply.body)
    }

    /// Bounded retry loop: transport failures and 429s back off and retry;
    /// any other HTTP error surfaces immediately.
    async fn post_with_retries(&self, url: &str, body: &Value) -> Result<HttpReply, SignalingError> {
        let auth = self.config.auth_header();
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.backend.post_json(url, &auth, body).await {
                Ok(reply) if reply.is_success() => return Ok(reply),
                Ok(reply) => reply.into_error(),
                Err(err) => err,
            };
            if !outcome.is_retryable() {
                return Err(outcome);
            }
            attempt += 1;
            if attempt > MAX_RETRIES {
                return Err(SignalingError::MaxRetriesExceeded {
                    attempts: MAX_RETRIES,
                    source: Box::new(outcome),
                });
            }
            let delay = backoff_delay(attempt, rand::random::<f64>());
            warn!(
                url,
                attempt,
                max = MAX_RETRIES,
                delay_ms = delay.as_millis() as u64,
                error = %outcome,
                "signaling call failed, retrying"
            );
            sleep(delay).await;
        }
    }
}

fn parse_ack_body(body: &str) -> Result<Value, SignalingError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| SignalingError::MalformedResponse(err.to_string()))
}
