use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::session::{ConnectionState, MediaBinding, RemoteMediaTrack, SessionStore};
use crate::signaling::{IceCandidatePayload, IceServerConfig, SdpPayload, SignalingClient};

/// Carries nothing but diagnostics; session data never travels over it.
const DIAGNOSTIC_CHANNEL_LABEL: &str = "visage-diagnostics";

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("sdp negotiation failed: {0}")]
    Sdp(String),
    #[error("unsupported sdp type {0:?}")]
    UnsupportedSdp(String),
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}

fn to_sdp_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Sdp(err.to_string())
}

/// Remote track handle backed by the WebRTC receiver that delivers it.
struct RtcTrack {
    id: String,
    kind: String,
    receiver: Arc<RTCRtpReceiver>,
}

#[async_trait]
impl RemoteMediaTrack for RtcTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    async fn stop(&self) {
        if let Err(err) = self.receiver.stop().await {
            warn!(track = %self.id, error = %err, "failed to stop remote track receiver");
        }
    }
}

struct ActiveConnection {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

/// Owns the peer connection lifecycle: turns the remote offer into a local
/// answer, relays discovered ICE candidates to the signaling client, and
/// pushes inbound tracks into the session store. At most one connection is
/// open at a time; `open` tears down any predecessor first.
pub struct PeerController {
    signaling: Arc<SignalingClient>,
    store: Arc<SessionStore>,
    active: AsyncMutex<Option<ActiveConnection>>,
}

impl PeerController {
    pub fn new(signaling: Arc<SignalingClient>, store: Arc<SessionStore>) -> Self {
        Self {
            signaling,
            store,
            active: AsyncMutex::new(None),
        }
    }

    /// Negotiates a local answer for the given remote offer. On any SDP
    /// failure the partially built connection is released and the whole
    /// initialization attempt is aborted; retries happen at the HTTP layer
    /// only, never here.
    pub async fn open(
        &self,
        offer: &SdpPayload,
        ice_servers: &[IceServerConfig],
    ) -> Result<SdpPayload, NegotiationError> {
        self.close().await;
        self.store.set_connection_state(ConnectionState::Negotiating);
        match self.negotiate(offer, ice_servers).await {
            Ok((answer, pc, dc)) => {
                *self.active.lock().await = Some(ActiveConnection { pc, dc });
                Ok(answer)
            }
            Err(err) => {
                self.store.set_connection_state(ConnectionState::Closed);
                Err(err)
            }
        }
    }

    /// Idempotent teardown; safe when nothing is open and never fails out.
    pub async fn close(&self) {
        let active = self.active.lock().await.take();
        if let Some(conn) = active {
            if let Err(err) = conn.dc.close().await {
                debug!(error = %err, "diagnostic channel close failed");
            }
            if let Err(err) = conn.pc.close().await {
                warn!(error = %err, "peer connection close failed");
            }
            self.store.set_connection_state(ConnectionState::Closed);
        }
    }

    pub async fn is_open(&self) -> bool {
        self.active.lock().await.is_some()
    }

    async fn negotiate(
        &self,
        offer: &SdpPayload,
        ice_servers: &[IceServerConfig],
    ) -> Result<(SdpPayload, Arc<RTCPeerConnection>, Arc<RTCDataChannel>), NegotiationError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_setup_error)?);

        let dc = match pc.create_data_channel(DIAGNOSTIC_CHANNEL_LABEL, None).await {
            Ok(dc) => dc,
            Err(err) => {
                let _ = pc.close().await;
                return Err(to_setup_error(err));
            }
        };
        self.install_handlers(&pc, &dc);

        match self.apply_sdp(&pc, offer).await {
            Ok(answer) => Ok((answer, pc, dc)),
            Err(err) => {
                let _ = pc.close().await;
                Err(err)
            }
        }
    }

    async fn apply_sdp(
        &self,
        pc: &Arc<RTCPeerConnection>,
        offer: &SdpPayload,
    ) -> Result<SdpPayload, NegotiationError> {
        if offer.typ != "offer" {
            return Err(NegotiationError::UnsupportedSdp(offer.typ.clone()));
        }
        let remote = RTCSessionDescription::offer(offer.sdp.clone()).map_err(to_sdp_error)?;
        pc.set_remote_description(remote).await.map_err(to_sdp_error)?;
        let answer = pc.create_answer(None).await.map_err(to_sdp_error)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(to_sdp_error)?;
        Ok(SdpPayload {
            sdp: answer.sdp,
            typ: answer.sdp_type.to_string(),
        })
    }

    fn install_handlers(&self, pc: &Arc<RTCPeerConnection>, dc: &Arc<RTCDataChannel>) {
        let signaling = Arc::clone(&self.signaling);
        let store_for_candidates = Arc::clone(&self.store);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let signaling = Arc::clone(&signaling);
            let store = Arc::clone(&store_for_candidates);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!("ice candidate gathering complete");
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize ice candidate");
                        return;
                    }
                };
                let payload = IceCandidatePayload {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                };
                // Best-effort: a lost candidate narrows path selection but
                // never aborts the session.
                if let Err(err) = signaling
                    .submit_ice_candidate(
                        store.stream_id().as_deref(),
                        store.session_id().as_deref(),
                        &payload,
                    )
                    .await
                {
                    warn!(error = %err, "ice candidate submission failed");
                }
            })
        }));

        let store_for_tracks = Arc::clone(&self.store);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let store = Arc::clone(&store_for_tracks);
                Box::pin(async move {
                    info!(
                        track = %track.id(),
                        kind = %track.kind(),
                        "remote track received"
                    );
                    let handle: Arc<dyn RemoteMediaTrack> = Arc::new(RtcTrack {
                        id: track.id(),
                        kind: track.kind().to_string(),
                        receiver,
                    });
                    store.set_media(Some(MediaBinding::single(handle)));
                })
            },
        ));

        let store_for_state = Arc::clone(&self.store);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let store = Arc::clone(&store_for_state);
            Box::pin(async move {
                debug!(?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        store.set_connection_state(ConnectionState::Connected);
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        // Failure cleanup is identical to a close.
                        store.set_connection_state(ConnectionState::Closed);
                    }
                    _ => {}
                }
            })
        }));

        dc.on_open(Box::new(|| {
            Box::pin(async {
                debug!("diagnostic channel open");
            })
        }));
        dc.on_message(Box::new(|message: DataChannelMessage| {
            Box::pin(async move {
                trace!(bytes = message.data.len(), "diagnostic channel message");
            })
        }));
    }
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.as_vec(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}
