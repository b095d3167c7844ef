use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use state_bus::{Bus, LocalBus};
use tokio::sync::broadcast;
use tracing::debug;

/// Default bus channel carrying session state events.
pub const SESSION_CHANNEL: &str = "session/state";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Closed,
}

/// A remote media track the platform can stop. The peer controller binds
/// real WebRTC receivers behind this; tests bind counters.
#[async_trait]
pub trait RemoteMediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> &str;
    async fn stop(&self);
}

/// The most recently received remote media. Single-slot on the store,
/// last write wins; no ordering across multiple tracks is guaranteed.
#[derive(Clone, Default)]
pub struct MediaBinding {
    tracks: Vec<Arc<dyn RemoteMediaTrack>>,
}

impl MediaBinding {
    pub fn single(track: Arc<dyn RemoteMediaTrack>) -> Self {
        Self {
            tracks: vec![track],
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn RemoteMediaTrack>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    async fn stop_all(&self) {
        for track in &self.tracks {
            debug!(track = track.id(), kind = track.kind(), "stopping remote track");
            track.stop().await;
        }
    }
}

impl fmt::Debug for MediaBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.tracks.iter().map(|t| t.id()).collect();
        f.debug_struct("MediaBinding").field("tracks", &ids).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub outgoing: bool,
    pub text: String,
}

/// Advisory state events published to sibling contexts. Media bindings are
/// deliberately absent: a media handle cannot cross context boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StreamChanged {
        stream_id: String,
        session_id: String,
    },
    InitializedChanged(bool),
    StateChanged(ConnectionState),
    TurnRecorded(ChatTurn),
    Reset,
}

#[derive(Default)]
struct SessionState {
    stream_id: Option<String>,
    session_id: Option<String>,
    media: Option<MediaBinding>,
    initialized: bool,
    initialized_at: Option<Instant>,
    connection_state: ConnectionState,
    transcript: Vec<ChatTurn>,
}

/// Holds the one active session per process and mirrors every mutation onto
/// the bus. Delivery there is cache propagation, not consensus: concurrent
/// writers race and the last event received wins.
pub struct SessionStore {
    inner: RwLock<SessionState>,
    bus: Arc<dyn Bus<SessionEvent>>,
    channel: String,
}

impl SessionStore {
    pub fn new() -> Self {
        let bus: Arc<LocalBus<SessionEvent>> = Arc::new(LocalBus::new());
        Self::with_bus(bus, SESSION_CHANNEL)
    }

    pub fn with_bus(bus: Arc<dyn Bus<SessionEvent>>, channel: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(SessionState::default()),
            bus,
            channel: channel.into(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe(&self.channel)
    }

    pub fn set_stream(&self, stream_id: impl Into<String>, session_id: impl Into<String>) {
        let stream_id = stream_id.into();
        let session_id = session_id.into();
        {
            let mut guard = self.inner.write();
            guard.stream_id = Some(stream_id.clone());
            guard.session_id = Some(session_id.clone());
        }
        self.publish(SessionEvent::StreamChanged {
            stream_id,
            session_id,
        });
    }

    pub fn stream_id(&self) -> Option<String> {
        self.inner.read().stream_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session_id.clone()
    }

    /// Replaces the media binding. Local-only: nothing is published, and the
    /// displaced binding is simply dropped; the peer connection that created
    /// it remains responsible for its transport.
    pub fn set_media(&self, binding: Option<MediaBinding>) {
        self.inner.write().media = binding;
    }

    pub fn media(&self) -> Option<MediaBinding> {
        self.inner.read().media.clone()
    }

    pub fn set_initialized(&self, initialized: bool) {
        {
            let mut guard = self.inner.write();
            guard.initialized = initialized;
            guard.initialized_at = initialized.then(Instant::now);
        }
        self.publish(SessionEvent::InitializedChanged(initialized));
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().initialized
    }

    pub fn initialized_at(&self) -> Option<Instant> {
        self.inner.read().initialized_at
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        {
            let mut guard = self.inner.write();
            if guard.connection_state == state {
                return;
            }
            guard.connection_state = state;
        }
        debug!(?state, "session connection state changed");
        self.publish(SessionEvent::StateChanged(state));
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.read().connection_state
    }

    pub fn record_turn(&self, turn: ChatTurn) {
        self.inner.write().transcript.push(turn.clone());
        self.publish(SessionEvent::TurnRecorded(turn));
    }

    pub fn transcript(&self) -> Vec<ChatTurn> {
        self.inner.read().transcript.clone()
    }

    /// Clears identifiers, stops every bound track exactly once, and drops
    /// the initialized flag. Safe from any state and safe to call twice: the
    /// binding is taken out under the lock, so a second reset finds nothing.
    pub async fn reset(&self) {
        let media = {
            let mut guard = self.inner.write();
            guard.stream_id = None;
            guard.session_id = None;
            guard.initialized = false;
            guard.initialized_at = None;
            guard.connection_state = ConnectionState::Idle;
            guard.media.take()
        };
        if let Some(binding) = media {
            binding.stop_all().await;
        }
        self.publish(SessionEvent::Reset);
    }

    fn publish(&self, event: SessionEvent) {
        // Advisory only; nobody listening is fine.
        let _ = self.bus.publish(&self.channel, event);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTrack {
        id: String,
        stops: AtomicUsize,
    }

    impl CountingTrack {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                stops: AtomicUsize::new(0),
            })
        }

        fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteMediaTrack for CountingTrack {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &str {
            "video"
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn reset_stops_each_track_exactly_once_even_when_called_twice() {
        let store = SessionStore::new();
        let video = CountingTrack::new("v0");
        let audio = CountingTrack::new("a0");
        let binding = MediaBinding {
            tracks: vec![video.clone(), audio.clone()],
        };
        store.set_stream("s1", "x1");
        store.set_media(Some(binding));

        store.reset().await;
        store.reset().await;

        assert_eq!(video.stop_count(), 1);
        assert_eq!(audio.stop_count(), 1);
        assert_eq!(store.stream_id(), None);
        assert_eq!(store.session_id(), None);
        assert!(!store.is_initialized());
        assert_eq!(store.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn media_binding_is_single_slot_last_write_wins() {
        let store = SessionStore::new();
        let first = CountingTrack::new("first");
        let second = CountingTrack::new("second");

        store.set_media(Some(MediaBinding::single(first.clone())));
        store.set_media(Some(MediaBinding::single(second.clone())));

        let bound = store.media().expect("binding present");
        assert_eq!(bound.tracks().len(), 1);
        assert_eq!(bound.tracks()[0].id(), "second");
        // Displaced bindings are dropped, not stopped.
        assert_eq!(first.stop_count(), 0);

        store.reset().await;
        assert_eq!(second.stop_count(), 1);
        assert_eq!(first.stop_count(), 0);
    }

    #[tokio::test]
    async fn mutations_publish_advisory_events_except_media() {
        let store = SessionStore::new();
        let mut events = store.subscribe();

        store.set_stream("s1", "x1");
        store.set_media(Some(MediaBinding::single(CountingTrack::new("v0"))));
        store.set_initialized(true);

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::StreamChanged {
                stream_id: "s1".into(),
                session_id: "x1".into(),
            }
        );
        // The media mutation must not have produced an event.
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::InitializedChanged(true)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn connection_state_changes_are_deduplicated() {
        let store = SessionStore::new();
        let mut events = store.subscribe();

        store.set_connection_state(ConnectionState::Negotiating);
        store.set_connection_state(ConnectionState::Negotiating);
        store.set_connection_state(ConnectionState::Connected);

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::StateChanged(ConnectionState::Negotiating)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::StateChanged(ConnectionState::Connected)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn transcript_survives_reset() {
        let store = SessionStore::new();
        store.record_turn(ChatTurn {
            outgoing: true,
            text: "hello".into(),
        });
        store.reset().await;
        assert_eq!(store.transcript().len(), 1);
    }
}
