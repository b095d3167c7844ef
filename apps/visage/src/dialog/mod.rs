use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::signaling::HttpReply;

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("invalid dialogue configuration: {0}")]
    InvalidConfig(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("dialogue service returned {status}: {body}")]
    RemoteService { status: u16, body: String },
    #[error("malformed dialogue response: {0}")]
    Malformed(String),
}

/// One conversational turn sent to the dialogue service: `Launch` opens the
/// conversation, `Text` carries a user utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogAction {
    Launch,
    Text(String),
}

impl DialogAction {
    fn to_value(&self) -> Value {
        match self {
            DialogAction::Launch => json!({ "type": "launch" }),
            DialogAction::Text(text) => json!({ "type": "text", "payload": text }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DialogConfig {
    base_url: Url,
    api_key: String,
}

impl DialogConfig {
    pub fn new(base_url: impl AsRef<str>, api_key: impl Into<String>) -> Result<Self, DialogError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(DialogError::InvalidConfig(
                "dialogue api base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("https://{}", base);
        }
        let parsed = Url::parse(&base)
            .map_err(|err| DialogError::InvalidConfig(format!("invalid dialogue api url: {err}")))?;
        Ok(Self {
            base_url: parsed,
            api_key: api_key.into(),
        })
    }

    fn interact_endpoint(&self, user_id: &str) -> String {
        format!(
            "{}/user/{}/interact",
            self.base_url.as_str().trim_end_matches('/'),
            user_id
        )
    }
}

#[async_trait]
pub trait DialogBackend: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        auth: &str,
        body: &Value,
    ) -> Result<HttpReply, DialogError>;
}

pub struct ReqwestDialogBackend {
    client: reqwest::Client,
}

impl ReqwestDialogBackend {
    pub fn new() -> Result<Self, DialogError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| DialogError::InvalidConfig(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DialogBackend for ReqwestDialogBackend {
    async fn post_json(
        &self,
        url: &str,
        auth: &str,
        body: &Value,
    ) -> Result<HttpReply, DialogError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|err| DialogError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| DialogError::Network(err.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

/// Routes conversational turns through the external dialogue-management
/// service and extracts the reply text the avatar should speak.
pub struct DialogClient {
    config: DialogConfig,
    backend: Arc<dyn DialogBackend>,
}

impl DialogClient {
    pub fn new(config: DialogConfig) -> Result<Self, DialogError> {
        let backend = Arc::new(ReqwestDialogBackend::new()?);
        Ok(Self { config, backend })
    }

    pub fn with_backend(config: DialogConfig, backend: Arc<dyn DialogBackend>) -> Self {
        Self { config, backend }
    }

    pub async fn interact(
        &self,
        user_id: &str,
        action: DialogAction,
    ) -> Result<String, DialogError> {
        let url = self.config.interact_endpoint(user_id);
        let body = json!({ "action": action.to_value() });
        let reply = self
            .backend
            .post_json(&url, &self.config.api_key, &body)
            .await?;
        if !(200..300).contains(&reply.status) {
            return Err(DialogError::RemoteService {
                status: reply.status,
                body: reply.body,
            });
        }
        let value: Value = serde_json::from_str(&reply.body)
            .map_err(|err| DialogError::Malformed(err.to_string()))?;
        let text = extract_reply_text(&value)?;
        debug!(user = user_id, chars = text.len(), "dialogue reply extracted");
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct TraceItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<TracePayload>,
}

#[derive(Debug, Deserialize)]
struct TracePayload {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateEnvelope {
    state: StateBody,
}

#[derive(Debug, Deserialize)]
struct StateBody {
    variables: StateVariables,
}

#[derive(Debug, Deserialize)]
struct StateVariables {
    #[serde(default)]
    last_response: Option<String>,
}

/// The provider answers in one of two shapes: a list of typed trace items,
/// or a session-state envelope. Decode each explicitly; anything else is a
/// malformed response, not a type error at the call site.
fn extract_reply_text(value: &Value) -> Result<String, DialogError> {
    if value.is_array() {
        let traces: Vec<TraceItem> = serde_json::from_value(value.clone())
            .map_err(|err| DialogError::Malformed(format!("trace list: {err}")))?;
        return traces
            .into_iter()
            .filter(|item| item.kind == "text")
            .find_map(|item| item.payload.and_then(|payload| payload.message))
            .ok_or_else(|| DialogError::Malformed("no text trace in reply".into()));
    }
    if value.get("state").is_some() {
        let envelope: StateEnvelope = serde_json::from_value(value.clone())
            .map_err(|err| DialogError::Malformed(format!("state envelope: {err}")))?;
        return envelope
            .state
            .variables
            .last_response
            .ok_or_else(|| DialogError::Malformed("state reply without last_response".into()));
    }
    Err(DialogError::Malformed(
        "reply is neither a trace list nor a state envelope".into(),
    ))
}
