//! Client facade
//!
//! [`SessionClient`] wires the lifecycle manager, the session negotiator and
//! the scheduler lane together and hands out push/pull pipelines.

use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::connection::ConnectionManager;
use super::http_signaling::HttpSignaling;
use super::lane::Lane;
use super::peer::{LocalTrack, PeerConnection, PeerFactory, RemoteTrack, WebRtcPeerFactory};
use super::pull::pull_track;
use super::push::push_track;
use super::session::{spawn_negotiator, Session};
use super::signaling::{ConnectionState, SignalingApi, TrackDescriptor};
use crate::config::{AppConfig, NegotiationConfig};
use crate::error::{AppError, Result};
use crate::events::{ClientEvent, EventBus};

/// Negotiation engine for one client
pub struct SessionClient {
    connections: Arc<ConnectionManager>,
    sessions: watch::Receiver<Option<Arc<Session>>>,
    lane: Arc<Lane>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionClient {
    /// Connect using the HTTP signaling service and `webrtc` peers
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let signaling = Arc::new(HttpSignaling::new(&config.signaling)?);
        let factory = Arc::new(WebRtcPeerFactory::new(config.ice.clone()));
        Self::with_parts(signaling, factory, config.negotiation.clone()).await
    }

    /// Build a client over arbitrary signaling and peer implementations
    pub async fn with_parts(
        signaling: Arc<dyn SignalingApi>,
        factory: Arc<dyn PeerFactory>,
        settings: NegotiationConfig,
    ) -> Result<Self> {
        let events = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let lane = Arc::new(Lane::new(signaling, settings, events.clone()));

        let (connections, monitor) =
            ConnectionManager::start(factory, events.clone(), cancel.clone()).await?;

        let (sessions_tx, sessions) = watch::channel(None);
        let negotiator = spawn_negotiator(
            connections.subscribe(),
            sessions_tx,
            lane.clone(),
            cancel.clone(),
        );

        info!("Session client started");
        Ok(Self {
            connections,
            sessions,
            lane,
            events,
            cancel,
            tasks: Mutex::new(vec![monitor, negotiator]),
        })
    }

    /// State of the current connection, replayed to new subscribers
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connections.state()
    }

    pub fn current_connection(&self) -> Arc<dyn PeerConnection> {
        self.connections.current()
    }

    /// Current session, `None` while one is being negotiated
    pub fn sessions(&self) -> watch::Receiver<Option<Arc<Session>>> {
        self.sessions.clone()
    }

    /// Wait until a session is established
    pub async fn wait_for_session(&self) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.clone();
        let ready = sessions
            .wait_for(|session| session.is_some())
            .await
            .map_err(|_| AppError::Closed)?;
        ready
            .clone()
            .ok_or_else(|| AppError::Internal("session vanished while waiting".to_string()))
    }

    /// Push local tracks; see [`push_track`](super::push) for the protocol
    pub fn push_track<S>(&self, tracks: S) -> impl Stream<Item = Result<TrackDescriptor>> + Send + 'static
    where
        S: Stream<Item = Result<LocalTrack>> + Send + 'static,
    {
        push_track(self.sessions.clone(), self.lane.clone(), tracks)
    }

    /// Pull remote tracks described by `descriptors`
    pub fn pull_track<S>(&self, descriptors: S) -> impl Stream<Item = Result<RemoteTrack>> + Send + 'static
    where
        S: Stream<Item = TrackDescriptor> + Send + 'static,
    {
        pull_track(self.sessions.clone(), self.lane.clone(), descriptors)
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Close the current connection; a replacement and a new session follow
    pub async fn force_close(&self) -> Result<()> {
        self.connections.force_close().await
    }

    /// Stop background negotiation and close the connection
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.connections.current().close().await {
            tracing::debug!("Closing peer on shutdown: {}", e);
        }
        info!("Session client stopped");
    }

    #[cfg(test)]
    pub(crate) fn lane(&self) -> &Arc<Lane> {
        &self.lane
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::mock::{vp8_track, Harness};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_force_close_yields_new_session() {
        let harness = Harness::start(true).await;
        let first = harness.client.wait_for_session().await.unwrap();
        let mut sessions = harness.client.sessions();

        harness.client.force_close().await.unwrap();
        sessions
            .wait_for(|s| s.as_ref().is_some_and(|s| s.id() != first.id()))
            .await
            .unwrap();
        assert_eq!(harness.factory.created(), 2);
    }

    #[tokio::test]
    async fn test_loopback_push_then_pull() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();

        let mut pushed = Box::pin(
            harness
                .client
                .push_track(futures::stream::iter(vec![Ok(vp8_track("mic"))])),
        );
        let descriptor = pushed.next().await.unwrap().unwrap();

        let mut pulled = Box::pin(
            harness
                .client
                .pull_track(futures::stream::iter(vec![descriptor.clone()])),
        );
        let track = pulled.next().await.unwrap().unwrap();
        assert!(!track.mid().is_empty());

        harness.client.shutdown().await;
        assert!(harness.client.sessions().borrow().is_none());
        assert_eq!(
            harness.factory.peer(0).connection_state(),
            ConnectionState::Closed
        );
    }

    #[tokio::test]
    async fn test_wait_for_session_fails_after_shutdown() {
        let harness = Harness::start(false).await;
        harness.client.shutdown().await;
        assert!(matches!(
            harness.client.wait_for_session().await,
            Err(AppError::Closed)
        ));
    }
}
