//! Track pull pipeline
//!
//! Turns a stream of descriptors into a stream of inbound tracks. Pulls run
//! only while the session's connection is `connected`; the assigned mid is
//! resolved by waiting for the connection's matching `track` event.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::bulk::BatchTicket;
use super::lane::{CloseTarget, Lane};
use super::peer::{PeerConnection, RemoteTrack};
use super::push::session_changed;
use super::session::Session;
use super::signaling::{
    ConnectionState, SoftError, TrackDescriptor, TrackObject, TracksRequest, TracksResponse,
};
use crate::error::{AppError, Result, TimeoutKind};
use crate::events::ClientEvent;

/// Batch submission: one `tracks/new` call for every descriptor in `items`,
/// followed by the renegotiation round the service may ask for
///
/// Queued on the lane when called.
pub(crate) fn submit_pulls(
    lane: Arc<Lane>,
    peer: Arc<dyn PeerConnection>,
    session_id: String,
    items: Vec<TrackDescriptor>,
) -> impl Future<Output = Result<TracksResponse>> + Send + 'static {
    let signaling = lane.signaling.clone();
    lane.scheduler
        .schedule(move || async move {
            debug!("Pulling {} track(s) into session {}", items.len(), session_id);
            let response = signaling
                .new_tracks(
                    &session_id,
                    TracksRequest {
                        session_description: None,
                        tracks: items.iter().map(TrackObject::pull).collect(),
                    },
                )
                .await?
                .into_checked()?;

            if response.requires_immediate_renegotiation {
                let offer = response.session_description.clone().ok_or_else(|| {
                    AppError::Invariant(
                        "renegotiation requested without a session description".to_string(),
                    )
                })?;
                peer.set_remote_description(offer).await?;
                let answer = peer.create_answer().await?;
                peer.set_local_description(answer.clone()).await?;
                let local = peer.local_description().await.unwrap_or(answer);
                signaling.renegotiate(&session_id, local).await?;
            }

            Ok(response)
        })
}

/// This caller's entry in a pull response
///
/// Entries come back in request order; the track name guards against a
/// service that reorders them.
fn entry_for<'a>(
    response: &'a TracksResponse,
    position: usize,
    descriptor: &TrackDescriptor,
) -> Option<&'a TrackObject> {
    let named = |t: &&TrackObject| {
        t.track_name
            .as_deref()
            .map_or(true, |name| name == descriptor.track_name)
    };
    response
        .tracks
        .get(position)
        .filter(named)
        .or_else(|| {
            response
                .tracks
                .iter()
                .find(|t| t.track_name.as_deref() == Some(descriptor.track_name.as_str()))
        })
}

/// Wait for the `track` event on `mid`
pub(crate) async fn resolve_track(
    events: &mut broadcast::Receiver<RemoteTrack>,
    mid: &str,
    deadline: Duration,
) -> Result<RemoteTrack> {
    let matching = async {
        loop {
            match events.recv().await {
                Ok(track) if track.mid() == mid => return Ok(track),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Missed {} track event(s) while resolving mid {}", skipped, mid);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(AppError::Closed),
            }
        }
    };
    tokio::time::timeout(deadline, matching)
        .await
        .map_err(|_| AppError::Timeout(TimeoutKind::TrackResolution))?
}

/// What a pull has been assigned so far
enum Pulled {
    /// Still in an unsettled batch
    Requested(BatchTicket<TracksResponse>, TrackDescriptor),
    Mid(String),
}

/// Schedules a close of a pulled mid when dropped
struct PullGuard {
    lane: Arc<Lane>,
    session: Arc<Session>,
    pulled: Pulled,
}

impl Drop for PullGuard {
    fn drop(&mut self) {
        let peer = self.session.peer().clone();
        let session_id = self.session.id().to_string();

        match &self.pulled {
            Pulled::Mid(mid) => {
                self.lane
                    .schedule_close(peer, session_id, CloseTarget::Mid(mid.clone()))
            }
            Pulled::Requested(ticket, descriptor) => {
                let ticket = ticket.clone();
                let descriptor = descriptor.clone();
                self.lane.schedule_close_after(peer, session_id, async move {
                    let position = ticket.position();
                    let response = ticket.settled().await?;
                    entry_for(&response, position, &descriptor)
                        .and_then(|entry| entry.mid.clone())
                        .filter(|mid| !mid.is_empty())
                        .map(CloseTarget::Mid)
                });
            }
        }
    }
}

async fn pull_one(
    lane: &Arc<Lane>,
    session: &Arc<Session>,
    descriptor: &TrackDescriptor,
    guard: &mut Option<PullGuard>,
) -> Result<RemoteTrack> {
    // Subscribe first: the event can fire during the batch's renegotiation
    let mut track_events = session.peer().track_events();

    info!("Pulling {} from session {}", descriptor.track_name, descriptor.session_id);
    let ticket = session.pulls.join(descriptor.clone());
    *guard = Some(PullGuard {
        lane: lane.clone(),
        session: session.clone(),
        pulled: Pulled::Requested(ticket.clone(), descriptor.clone()),
    });
    let slot = ticket.slot().await?;

    let entry = entry_for(&slot.response, slot.position, descriptor).ok_or_else(|| {
        AppError::Invariant(format!("pull response has no entry for {}", descriptor.track_name))
    })?;
    if let Some(e) = entry.soft_error() {
        return Err(e);
    }
    let mid = entry
        .mid
        .clone()
        .filter(|mid| !mid.is_empty())
        .ok_or_else(|| AppError::Invariant(format!("no mid assigned to {}", descriptor.track_name)))?;

    if let Some(guard) = guard.as_mut() {
        guard.pulled = Pulled::Mid(mid.clone());
    }

    let track = resolve_track(&mut track_events, &mid, lane.settings.track_resolve_timeout()).await?;
    lane.events.publish(ClientEvent::TrackPulled {
        session_id: session.id().to_string(),
        track_name: descriptor.track_name.clone(),
        mid,
    });
    Ok(track)
}

enum Step {
    Descriptor(Option<TrackDescriptor>),
    SessionChanged,
    StateChanged,
    Stopped,
}

async fn state_changed(states: &mut Option<watch::Receiver<ConnectionState>>) {
    if let Some(rx) = states {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Pull the latest descriptor into whichever session is current
///
/// Repeated equal descriptors are pulled once per session. A new
/// descriptor, or a new session, closes the previously pulled mid and pulls
/// again. Any failure ends the stream with that error.
pub(crate) fn pull_track<S>(
    mut sessions: watch::Receiver<Option<Arc<Session>>>,
    lane: Arc<Lane>,
    descriptors: S,
) -> impl Stream<Item = Result<RemoteTrack>> + Send + 'static
where
    S: Stream<Item = TrackDescriptor> + Send + 'static,
{
    stream! {
        let mut descriptors = Box::pin(descriptors);
        let mut session = sessions.borrow_and_update().clone();
        let mut states = session.as_ref().map(|s| s.peer().state_watch());
        let mut wanted: Option<TrackDescriptor> = None;
        let mut pulled: Option<(String, TrackDescriptor)> = None;
        let mut guard: Option<PullGuard> = None;
        let mut input_done = false;

        loop {
            if let (Some(current), Some(descriptor)) = (session.clone(), wanted.clone()) {
                let already = pulled
                    .as_ref()
                    .is_some_and(|(id, d)| id == current.id() && *d == descriptor);
                if !already && current.peer().connection_state() == ConnectionState::Connected {
                    pulled = Some((current.id().to_string(), descriptor.clone()));
                    // Closes the previous mid
                    guard = None;

                    let outcome = tokio::select! {
                        track = pull_one(&lane, &current, &descriptor, &mut guard) => Some(track),
                        _ = session_changed(&mut sessions, &session) => None,
                    };
                    match outcome {
                        Some(Ok(track)) => yield Ok(track),
                        Some(Err(e)) => {
                            yield Err(e);
                            return;
                        }
                        None => {
                            session = sessions.borrow().clone();
                            states = session.as_ref().map(|s| s.peer().state_watch());
                            continue;
                        }
                    }
                }
            }

            let step = tokio::select! {
                changed = session_changed(&mut sessions, &session) => {
                    if changed { Step::SessionChanged } else { Step::Stopped }
                }
                next = descriptors.next(), if !input_done => Step::Descriptor(next),
                _ = state_changed(&mut states) => Step::StateChanged,
            };

            match step {
                Step::Descriptor(Some(descriptor)) => {
                    if wanted.as_ref() != Some(&descriptor) {
                        wanted = Some(descriptor);
                    }
                }
                Step::Descriptor(None) => input_done = true,
                Step::SessionChanged => {
                    session = sessions.borrow().clone();
                    states = session.as_ref().map(|s| s.peer().state_watch());
                    debug!("Pull pipeline moved to session {:?}", session.as_ref().map(|s| s.id()));
                }
                Step::StateChanged => {}
                Step::Stopped => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::mock::{Harness, SignalingCall};
    use futures::channel::mpsc;
    use futures::SinkExt;

    fn pulled_names(calls: &[SignalingCall]) -> Vec<Vec<String>> {
        calls
            .iter()
            .filter_map(|c| match c {
                SignalingCall::NewTracks {
                    tracks,
                    with_offer: false,
                    ..
                } => Some(
                    tracks
                        .iter()
                        .filter_map(|t| t.track_name.clone())
                        .collect(),
                ),
                _ => None,
            })
            .collect()
    }

    fn remote(name: &str) -> TrackDescriptor {
        TrackDescriptor::remote("other-session", name)
    }

    #[tokio::test]
    async fn test_pull_resolves_track_by_mid() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();

        let mut pulled = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("cam")])));
        let track = pulled.next().await.unwrap().unwrap();

        assert_eq!(track.mid(), "100");
        assert_eq!(pulled_names(&harness.signaling.calls()), vec![vec!["cam".to_string()]]);
        assert!(harness
            .signaling
            .calls()
            .contains(&SignalingCall::Renegotiate {
                session_id: "session-1".to_string()
            }));
    }

    #[tokio::test]
    async fn test_equal_descriptors_pulled_once() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();

        let (mut tx, rx) = mpsc::unbounded();
        let mut pulled = Box::pin(harness.client.pull_track(rx));
        tx.send(remote("cam")).await.unwrap();
        pulled.next().await.unwrap().unwrap();

        tx.send(remote("cam")).await.unwrap();
        let again = tokio::time::timeout(Duration::from_millis(50), pulled.next()).await;
        assert!(again.is_err());
        assert_eq!(pulled_names(&harness.signaling.calls()).len(), 1);
    }

    #[tokio::test]
    async fn test_new_descriptor_closes_previous_mid() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();

        let (mut tx, rx) = mpsc::unbounded();
        let mut pulled = Box::pin(harness.client.pull_track(rx));
        tx.send(remote("a")).await.unwrap();
        let first = pulled.next().await.unwrap().unwrap();
        tx.send(remote("b")).await.unwrap();
        let second = pulled.next().await.unwrap().unwrap();
        assert_ne!(first.mid(), second.mid());

        harness.settle().await;
        assert!(harness.signaling.calls().contains(&SignalingCall::CloseTracks {
            session_id: "session-1".to_string(),
            mids: vec![first.mid().to_string()],
            force: false,
        }));
    }

    #[tokio::test]
    async fn test_same_tick_pulls_share_one_request() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();

        let mut a = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("a")])));
        let mut b = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("b")])));
        let (a, b) = tokio::join!(a.next(), b.next());

        assert_eq!(a.unwrap().unwrap().mid(), "100");
        assert_eq!(b.unwrap().unwrap().mid(), "101");
        assert_eq!(
            pulled_names(&harness.signaling.calls()),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_track_event_times_out() {
        let harness = Harness::start_with(true, |signaling| signaling.skip_renegotiation()).await;
        harness.client.wait_for_session().await.unwrap();

        let mut pulled = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("cam")])));
        let err = pulled.next().await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Timeout(TimeoutKind::TrackResolution)));
        assert!(pulled.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pull_waits_for_connected() {
        let harness = Harness::start(true).await;
        let session = harness.client.wait_for_session().await.unwrap();
        let peer = harness.factory.peer(0);
        peer.set_state(ConnectionState::Disconnected);

        let mut pulled = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("cam")])));
        let waiting = tokio::time::timeout(Duration::from_millis(50), pulled.next()).await;
        assert!(waiting.is_err());
        assert!(pulled_names(&harness.signaling.calls()).is_empty());

        peer.set_state(ConnectionState::Connected);
        let track = pulled.next().await.unwrap().unwrap();
        assert_eq!(track.mid(), "100");
        assert_eq!(session.peer().id(), peer.id());
    }

    #[tokio::test]
    async fn test_per_track_error_fails_only_that_pull() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();
        harness.signaling.fail_track("gone", "not_found", "track not published");

        let mut ok = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("cam")])));
        let mut gone = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("gone")])));
        let (ok, gone) = tokio::join!(ok.next(), gone.next());

        assert!(ok.unwrap().is_ok());
        assert!(gone.unwrap().unwrap_err().is_signaling());
    }

    #[tokio::test]
    async fn test_drop_while_batched_closes_assigned_mid() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();
        let mut events = harness.client.events();

        let mut pulled = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("cam")])));
        assert!(futures::poll!(pulled.next()).is_pending());
        drop(pulled);

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let ClientEvent::TrackClosed { mid, .. } = events.recv().await.unwrap() {
                    return mid;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, "100");
        assert_eq!(pulled_names(&harness.signaling.calls()).len(), 1);
    }

    #[tokio::test]
    async fn test_session_change_repulls_on_new_connection() {
        let harness = Harness::start(true).await;
        harness.client.wait_for_session().await.unwrap();

        let mut pulled = Box::pin(harness.client.pull_track(futures::stream::iter(vec![remote("cam")])));
        pulled.next().await.unwrap().unwrap();

        harness.factory.peer(0).set_state(ConnectionState::Failed);
        let second = tokio::time::timeout(Duration::from_secs(2), pulled.next())
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());

        let pull_sessions: Vec<String> = harness
            .signaling
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SignalingCall::NewTracks {
                    session_id,
                    with_offer: false,
                    ..
                } => Some(session_id),
                _ => None,
            })
            .collect();
        assert_eq!(pull_sessions, vec!["session-1", "session-2"]);
    }

    #[tokio::test]
    async fn test_resolve_skips_other_mids() {
        let (tx, mut rx) = broadcast::channel(4);
        tx.send(RemoteTrack::detached("7", "x", crate::webrtc::peer::MediaKind::Video))
            .unwrap();
        tx.send(RemoteTrack::detached("8", "y", crate::webrtc::peer::MediaKind::Video))
            .unwrap();

        let track = resolve_track(&mut rx, "8", Duration::from_secs(1)).await.unwrap();
        assert_eq!(track.id(), "y");
    }
}
