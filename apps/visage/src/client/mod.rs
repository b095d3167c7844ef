use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dialog::{DialogAction, DialogClient, DialogError};
use crate::rtc::{NegotiationError, PeerController};
use crate::session::{ChatTurn, SessionStore};
use crate::signaling::{SignalingClient, SignalingError};

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    /// Raised by embedders whose media sink refuses to start playback; the
    /// session core never produces it on its own.
    #[error("media playback blocked: {0}")]
    MediaBlocked(String),
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("no dialogue service configured")]
    NoDialogRoute,
    #[error(transparent)]
    Dialog(#[from] DialogError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// The three user-visible failure shapes. They demand different user
/// actions, so initialization errors collapse into exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    MediaBlocked,
    Failed,
}

impl FailureKind {
    pub fn classify(err: &InitError) -> Self {
        match err {
            InitError::MediaBlocked(_) => FailureKind::MediaBlocked,
            InitError::Signaling(err) if err.is_rate_limited() => FailureKind::RateLimited,
            _ => FailureKind::Failed,
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::RateLimited => {
                "The avatar service is rate limiting this key. Wait a moment and try again."
            }
            FailureKind::MediaBlocked => {
                "Media playback was blocked by this environment. Allow audio/video output and reconnect."
            }
            FailureKind::Failed => "The avatar stream could not be initialized. Please try again.",
        }
    }
}

/// Orchestrates one avatar session: initialize the stream, route
/// conversational turns through the dialogue service, speak the replies,
/// tear everything down.
pub struct AvatarChat {
    signaling: Arc<SignalingClient>,
    controller: PeerController,
    store: Arc<SessionStore>,
    dialog: Option<DialogClient>,
    user_id: String,
    launched: AsyncMutex<bool>,
}

impl AvatarChat {
    pub fn new(signaling: Arc<SignalingClient>, store: Arc<SessionStore>) -> Self {
        let controller = PeerController::new(Arc::clone(&signaling), Arc::clone(&store));
        Self {
            signaling,
            controller,
            store,
            dialog: None,
            user_id: Uuid::new_v4().to_string(),
            launched: AsyncMutex::new(false),
        }
    }

    pub fn with_dialog(mut self, dialog: DialogClient) -> Self {
        self.dialog = Some(dialog);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Full stream bring-up: reset → create stream → negotiate answer →
    /// submit it → mark initialized. Any prior connection is torn down and
    /// awaited before the new negotiation starts; that ordering is the only
    /// concurrency control the session needs.
    pub async fn initialize(&self, source_url: &str) -> Result<(), InitError> {
        self.controller.close().await;
        self.store.reset().await;
        *self.launched.lock().await = false;

        let created = self.signaling.create_stream(source_url).await?;
        self.store
            .set_stream(created.id.clone(), created.session_id.clone());

        let answer = match self.controller.open(&created.offer, &created.ice_servers).await {
            Ok(answer) => answer,
            Err(err) => {
                self.abort_attempt().await;
                return Err(err.into());
            }
        };

        if let Err(err) = self
            .signaling
            .submit_answer(Some(&created.id), Some(&created.session_id), &answer)
            .await
        {
            self.abort_attempt().await;
            return Err(err.into());
        }

        self.store.set_initialized(true);
        info!(stream_id = %created.id, "avatar stream initialized");
        Ok(())
    }

    /// Routes one user turn through the dialogue service and speaks the
    /// reply. The first turn opens the conversation with a launch action;
    /// its greeting is spoken as well.
    pub async fn send_turn(&self, text: &str) -> Result<String, TurnError> {
        let dialog = self.dialog.as_ref().ok_or(TurnError::NoDialogRoute)?;
        self.store.record_turn(ChatTurn {
            outgoing: true,
            text: text.to_string(),
        });

        let mut launched = self.launched.lock().await;
        if !*launched {
            let greeting = dialog.interact(&self.user_id, DialogAction::Launch).await?;
            *launched = true;
            self.speak(&greeting).await?;
            self.store.record_turn(ChatTurn {
                outgoing: false,
                text: greeting,
            });
        }

        let reply = dialog
            .interact(&self.user_id, DialogAction::Text(text.to_string()))
            .await?;
        self.speak(&reply).await?;
        self.store.record_turn(ChatTurn {
            outgoing: false,
            text: reply.clone(),
        });
        Ok(reply)
    }

    /// Direct talk request against the connected stream, bypassing the
    /// dialogue service.
    pub async fn say(&self, text: &str) -> Result<Value, SignalingError> {
        self.speak(text).await
    }

    /// Safe from any state; never fails.
    pub async fn shutdown(&self) {
        self.controller.close().await;
        self.store.reset().await;
    }

    async fn speak(&self, text: &str) -> Result<Value, SignalingError> {
        self.signaling
            .send_talk_request(
                self.store.stream_id().as_deref(),
                self.store.session_id().as_deref(),
                text,
            )
            .await
    }

    async fn abort_attempt(&self) {
        warn!("stream initialization aborted, releasing session state");
        self.controller.close().await;
        self.store.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::AvatarConfig;

    fn init_error_with_status(status: u16) -> InitError {
        InitError::Signaling(SignalingError::RemoteService {
            status,
            body: "body".into(),
        })
    }

    #[test]
    fn classification_distinguishes_the_three_statuses() {
        assert_eq!(
            FailureKind::classify(&init_error_with_status(429)),
            FailureKind::RateLimited
        );
        assert_eq!(
            FailureKind::classify(&InitError::MediaBlocked("autoplay refused".into())),
            FailureKind::MediaBlocked
        );
        assert_eq!(
            FailureKind::classify(&init_error_with_status(500)),
            FailureKind::Failed
        );
        assert_eq!(
            FailureKind::classify(&InitError::Negotiation(NegotiationError::Setup(
                "no dtls".into()
            ))),
            FailureKind::Failed
        );
    }

    #[test]
    fn rate_limit_classification_sees_through_retry_exhaustion() {
        let err = InitError::Signaling(SignalingError::MaxRetriesExceeded {
            attempts: 5,
            source: Box::new(SignalingError::RemoteService {
                status: 429,
                body: "too many".into(),
            }),
        });
        assert_eq!(FailureKind::classify(&err), FailureKind::RateLimited);

        let err = InitError::Signaling(SignalingError::MaxRetriesExceeded {
            attempts: 5,
            source: Box::new(SignalingError::Network("down".into())),
        });
        assert_eq!(FailureKind::classify(&err), FailureKind::Failed);
    }

    #[test]
    fn user_messages_are_distinct() {
        let messages = [
            FailureKind::RateLimited.user_message(),
            FailureKind::MediaBlocked.user_message(),
            FailureKind::Failed.user_message(),
        ];
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
        assert_ne!(messages[0], messages[2]);
    }

    #[tokio::test]
    async fn send_turn_without_dialogue_route_is_rejected() {
        let config = AvatarConfig::new("https://avatar.test", "a2V5OnNlY3JldA==").unwrap();
        let signaling = Arc::new(SignalingClient::new(config).unwrap());
        let chat = AvatarChat::new(signaling, Arc::new(SessionStore::new()));

        let err = chat.send_turn("hello").await.unwrap_err();
        assert!(matches!(err, TurnError::NoDialogRoute));
    }
}
