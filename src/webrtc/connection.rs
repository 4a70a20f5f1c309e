//! Connection lifecycle manager
//!
//! Owns the current [`PeerConnection`] and publishes it on a watch channel.
//! When the current connection reports `failed` or `closed` it is torn down
//! and a brand-new one takes its place. There is no retry limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::peer::{PeerConnection, PeerFactory};
use super::signaling::ConnectionState;
use crate::error::Result;
use crate::events::{ClientEvent, EventBus};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Pause before asking the factory again after it failed
const FACTORY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Single owner of the client's connection
pub struct ConnectionManager {
    current: watch::Sender<Arc<dyn PeerConnection>>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Build the first connection and start watching it
    pub async fn start(
        factory: Arc<dyn PeerFactory>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let first = factory.create().await?;
        info!("Peer {} is current", first.id());
        events.publish(ClientEvent::ConnectionReplaced {
            peer_id: first.id(),
            previous: None,
        });

        let (current, _) = watch::channel(first.clone());
        let (state, _) = watch::channel(first.connection_state());
        let manager = Arc::new(Self { current, state });

        let monitor = tokio::spawn(manager.clone().monitor(factory, events, cancel));
        Ok((manager, monitor))
    }

    pub fn current(&self) -> Arc<dyn PeerConnection> {
        self.current.borrow().clone()
    }

    /// Watch the current connection; a new value means the old one is gone
    pub fn subscribe(&self) -> watch::Receiver<Arc<dyn PeerConnection>> {
        self.current.subscribe()
    }

    /// State of whichever connection is current
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Close the current connection; the monitor replaces it
    pub async fn force_close(&self) -> Result<()> {
        let peer = self.current();
        info!("Force closing peer {}", peer.id());
        peer.close().await
    }

    async fn monitor(
        self: Arc<Self>,
        factory: Arc<dyn PeerFactory>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) {
        let throttler = LogThrottler::default();

        loop {
            let peer = self.current();
            let mut states = peer.state_watch();

            loop {
                let state = *states.borrow_and_update();
                let changed = self.state.send_if_modified(|current| {
                    let changed = *current != state;
                    *current = state;
                    changed
                });
                if changed {
                    events.publish(ClientEvent::ConnectionStateChanged {
                        peer_id: peer.id(),
                        state,
                    });
                }
                if state.is_terminal() {
                    break;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = states.changed() => {
                        if changed.is_err() {
                            debug!("Peer {} state source gone", peer.id());
                            break;
                        }
                    }
                }
            }

            info!("Peer {} is {}, replacing it", peer.id(), *states.borrow());
            if let Err(e) = peer.close().await {
                debug!("Closing stale peer {}: {}", peer.id(), e);
            }

            let fresh = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    created = factory.create() => match created {
                        Ok(fresh) => break fresh,
                        Err(e) => {
                            warn_throttled!(throttler, "peer_factory", "Failed to create peer: {}", e);
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(FACTORY_RETRY_DELAY) => {}
                }
            };
            throttler.clear("peer_factory");

            info!("Peer {} replaces peer {}", fresh.id(), peer.id());
            events.publish(ClientEvent::ConnectionReplaced {
                peer_id: fresh.id(),
                previous: Some(peer.id()),
            });
            self.current.send_replace(fresh);
        }
    }
}
