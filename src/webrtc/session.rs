//! Session negotiation
//!
//! For every connection the lifecycle manager publishes, run the initial
//! offer/answer exchange with the signaling service, wait for ICE, and
//! publish the resulting [`Session`]. A failed attempt is retried on the
//! same connection until it succeeds or the connection is replaced.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bulk::BulkDispatcher;
use super::lane::Lane;
use super::peer::PeerConnection;
use super::pull::submit_pulls;
use super::push::{submit_pushes, PushItem};
use super::signaling::{SoftError, TrackDescriptor, TracksResponse};
use crate::error::{AppError, Result, TimeoutKind};
use crate::events::ClientEvent;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// A signaling session bound to one connection instance
///
/// Valid only while its connection is current. Pushes and pulls issued in
/// the same tick against this session are batched by its dispatchers.
pub struct Session {
    peer: Arc<dyn PeerConnection>,
    session_id: String,
    pub(crate) pushes: BulkDispatcher<PushItem, TracksResponse>,
    pub(crate) pulls: BulkDispatcher<TrackDescriptor, TracksResponse>,
}

impl Session {
    pub(crate) fn new(peer: Arc<dyn PeerConnection>, session_id: String, lane: &Arc<Lane>) -> Self {
        let pushes = {
            let (lane, peer, session_id) = (lane.clone(), peer.clone(), session_id.clone());
            BulkDispatcher::new(
                "push",
                lane.settings.push_batch_size,
                Arc::new(move |items| {
                    submit_pushes(lane.clone(), peer.clone(), session_id.clone(), items).boxed()
                }),
            )
        };
        let pulls = {
            let (lane, peer, session_id) = (lane.clone(), peer.clone(), session_id.clone());
            BulkDispatcher::new(
                "pull",
                lane.settings.pull_batch_size,
                Arc::new(move |items| {
                    submit_pulls(lane.clone(), peer.clone(), session_id.clone(), items).boxed()
                }),
            )
        };

        Self {
            peer,
            session_id,
            pushes,
            pulls,
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("peer", &self.peer.id())
            .finish()
    }
}

/// Whether two optional sessions are the same instance
pub(crate) fn same_session(a: &Option<Arc<Session>>, b: &Option<Arc<Session>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Offer, `sessions/new`, answer, then wait for ICE
async fn establish(peer: Arc<dyn PeerConnection>, lane: &Arc<Lane>) -> Result<Arc<Session>> {
    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    let local = peer.local_description().await.unwrap_or(offer);

    let response = lane.signaling.new_session(local).await?.into_checked()?;
    let session_id = response
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Invariant("new session response carried no sessionId".to_string()))?;
    let answer = response.session_description.ok_or_else(|| {
        AppError::Invariant("new session response carried no session description".to_string())
    })?;

    let mut ice = peer.ice_state_watch();
    peer.set_remote_description(answer).await?;

    let deadline = lane.settings.ice_connect_timeout();
    match tokio::time::timeout(deadline, ice.wait_for(|state| state.is_connected())).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => return Err(AppError::Closed),
        Err(_) => return Err(AppError::Timeout(TimeoutKind::IceConnect)),
    }

    Ok(Arc::new(Session::new(peer, session_id, lane)))
}

/// Outcome of waiting on something while the current connection may change
enum Interrupted<T> {
    Done(T),
    Replaced,
    Stopped,
}

async fn until_replaced<F: std::future::Future>(
    connections: &mut watch::Receiver<Arc<dyn PeerConnection>>,
    cancel: &CancellationToken,
    fut: F,
) -> Interrupted<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Interrupted::Stopped,
        changed = connections.changed() => match changed {
            Ok(()) => Interrupted::Replaced,
            Err(_) => Interrupted::Stopped,
        },
        out = fut => Interrupted::Done(out),
    }
}

/// Keep `sessions` holding a session for the current connection
pub(crate) fn spawn_negotiator(
    mut connections: watch::Receiver<Arc<dyn PeerConnection>>,
    sessions: watch::Sender<Option<Arc<Session>>>,
    lane: Arc<Lane>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let throttler = LogThrottler::default();

        loop {
            let peer = connections.borrow_and_update().clone();

            sessions.send_if_modified(|current| match current.take() {
                Some(stale) => {
                    info!("Session {} withdrawn with peer {}", stale.id(), stale.peer().id());
                    lane.events.publish(ClientEvent::SessionLost {
                        session_id: stale.id().to_string(),
                    });
                    true
                }
                None => false,
            });

            debug!("Negotiating session on peer {}", peer.id());
            let session = match until_replaced(&mut connections, &cancel, establish(peer.clone(), &lane)).await {
                Interrupted::Done(Ok(session)) => session,
                Interrupted::Done(Err(e)) => {
                    warn_throttled!(
                        throttler,
                        "negotiate",
                        "Session negotiation on peer {} failed, retrying: {}",
                        peer.id(),
                        e
                    );
                    lane.events.publish(ClientEvent::SessionFailed {
                        peer_id: peer.id(),
                        message: e.to_string(),
                    });

                    let pause = async {
                        tokio::time::sleep(lane.settings.session_retry_delay()).await;
                        tokio::task::yield_now().await;
                    };
                    match until_replaced(&mut connections, &cancel, pause).await {
                        Interrupted::Stopped => break,
                        _ => continue,
                    }
                }
                Interrupted::Replaced => continue,
                Interrupted::Stopped => break,
            };

            throttler.clear("negotiate");
            info!("Session {} established on peer {}", session.id(), peer.id());
            lane.events.publish(ClientEvent::SessionEstablished {
                peer_id: peer.id(),
                session_id: session.id().to_string(),
            });
            sessions.send_replace(Some(session));

            match until_replaced(&mut connections, &cancel, std::future::pending::<()>()).await {
                Interrupted::Stopped => break,
                _ => continue,
            }
        }

        sessions.send_replace(None);
        debug!("Session negotiator stopped");
    })
}
