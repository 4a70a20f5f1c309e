//! The shared execution lane every SDP-mutating operation goes through

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::close::close_track;
use super::peer::{PeerConnection, Transceiver};
use super::scheduler::FifoScheduler;
use super::signaling::SignalingApi;
use crate::config::NegotiationConfig;
use crate::events::{ClientEvent, EventBus};

/// Which transceiver a deferred close refers to
pub(crate) enum CloseTarget {
    Mid(String),
    /// Resolved to its mid when the close runs
    Transceiver(Arc<dyn Transceiver>),
}

/// Scheduler plus everything a scheduled negotiation step needs
pub(crate) struct Lane {
    pub scheduler: FifoScheduler,
    pub signaling: Arc<dyn SignalingApi>,
    pub settings: NegotiationConfig,
    pub events: Arc<EventBus>,
}

impl Lane {
    pub fn new(
        signaling: Arc<dyn SignalingApi>,
        settings: NegotiationConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            scheduler: FifoScheduler::new(),
            signaling,
            settings,
            events,
        }
    }

    /// Queue a track close without waiting for it
    ///
    /// Failures are logged and published, never returned.
    pub fn schedule_close(
        self: &Arc<Self>,
        peer: Arc<dyn PeerConnection>,
        session_id: String,
        target: CloseTarget,
    ) {
        let lane = self.clone();
        let task = self.scheduler.schedule(move || async move {
            let mid = match target {
                CloseTarget::Mid(mid) => Some(mid),
                CloseTarget::Transceiver(transceiver) => transceiver.mid(),
            };
            let Some(mid) = mid else {
                debug!("Close skipped: transceiver never negotiated");
                return Ok(());
            };

            match close_track(peer.as_ref(), lane.signaling.as_ref(), &session_id, &mid).await {
                Ok(true) => lane.events.publish(ClientEvent::TrackClosed { session_id, mid }),
                Ok(false) => {}
                Err(e) => {
                    warn!("Closing mid {} on session {} failed: {}", mid, session_id, e);
                    lane.events.publish(ClientEvent::NegotiationError {
                        operation: "close".to_string(),
                        message: e.to_string(),
                    });
                }
            }
            Ok(())
        });
        // The task is already queued; nothing waits for its outcome
        drop(task);
    }

    /// Queue a track close once `target` resolves
    ///
    /// Used when the track is still part of an unsettled batch: the close
    /// must run after the batch that publishes it. `None` skips the close.
    pub fn schedule_close_after<F>(
        self: &Arc<Self>,
        peer: Arc<dyn PeerConnection>,
        session_id: String,
        target: F,
    ) where
        F: Future<Output = Option<CloseTarget>> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No runtime left to close a track on session {}", session_id);
            return;
        };
        let lane = self.clone();
        runtime.spawn(async move {
            match target.await {
                Some(target) => lane.schedule_close(peer, session_id, target),
                None => debug!("Close skipped: batch on session {} did not publish", session_id),
            }
        });
    }
}
