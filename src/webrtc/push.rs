//! Track push pipeline
//!
//! Turns a stream of local tracks into a stream of descriptors other
//! sessions can pull. The first track on a session's transceiver is
//! negotiated through the push dispatcher; later tracks replace the
//! outgoing media in place without signaling.

use std::future::Future;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};
use webrtc::track::track_local::TrackLocal;

use super::bulk::BatchTicket;
use super::lane::{CloseTarget, Lane};
use super::peer::{LocalTrack, PeerConnection, Transceiver, TransceiverDirection};
use super::session::{same_session, Session};
use super::signaling::{SoftError, TrackDescriptor, TrackObject, TracksRequest, TracksResponse};
use crate::error::{AppError, Result};
use crate::events::ClientEvent;

/// One transceiver waiting to be offered in a push batch
pub(crate) struct PushItem {
    pub transceiver: Arc<dyn Transceiver>,
    pub track_name: String,
}

/// Batch submission: one offer covering every transceiver in `items`
///
/// Queued on the lane when called, so a close scheduled after the batch is
/// sealed runs after it.
pub(crate) fn submit_pushes(
    lane: Arc<Lane>,
    peer: Arc<dyn PeerConnection>,
    session_id: String,
    items: Vec<PushItem>,
) -> impl Future<Output = Result<TracksResponse>> + Send + 'static {
    let signaling = lane.signaling.clone();
    lane.scheduler
        .schedule(move || async move {
            debug!("Pushing {} track(s) on session {}", items.len(), session_id);
            let offer = peer.create_offer().await?;
            peer.set_local_description(offer.clone()).await?;
            let local = peer.local_description().await.unwrap_or(offer);

            let tracks = items
                .iter()
                .map(|item| {
                    let mid = item.transceiver.mid().ok_or_else(|| {
                        AppError::Invariant(format!(
                            "transceiver for {} has no mid after offer",
                            item.track_name
                        ))
                    })?;
                    Ok(TrackObject::local(mid, item.track_name.clone()))
                })
                .collect::<Result<Vec<_>>>()?;

            let response = signaling
                .new_tracks(
                    &session_id,
                    TracksRequest {
                        session_description: Some(local),
                        tracks,
                    },
                )
                .await?
                .into_checked()?;

            let answer = response.session_description.clone().ok_or_else(|| {
                AppError::Invariant("push response carried no session description".to_string())
            })?;
            peer.set_remote_description(answer).await?;
            Ok(response)
        })
}

/// Schedules a close of its transceiver when dropped
///
/// While the first push is still in a batch, the close waits for that
/// batch to settle.
struct PushGuard {
    lane: Arc<Lane>,
    session: Arc<Session>,
    transceiver: Arc<dyn Transceiver>,
    pending: Mutex<Option<BatchTicket<TracksResponse>>>,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        let peer = self.session.peer().clone();
        let session_id = self.session.id().to_string();
        let target = CloseTarget::Transceiver(self.transceiver.clone());

        match self.pending.get_mut().take() {
            Some(ticket) => self.lane.schedule_close_after(peer, session_id, async move {
                ticket.settled().await.map(|_| target)
            }),
            None => self.lane.schedule_close(peer, session_id, target),
        }
    }
}

/// Publish `track` on the guarded transceiver
///
/// `fresh` marks the track the transceiver was created with.
async fn publish(
    guard: &PushGuard,
    stable_id: &str,
    track: LocalTrack,
    fresh: bool,
) -> Result<TrackDescriptor> {
    let session = &guard.session;
    let transceiver = &guard.transceiver;
    let descriptor = TrackDescriptor::remote(session.id(), stable_id);

    if transceiver.sender_bound().await {
        info!("Replacing track {} on session {}", stable_id, session.id());
        transceiver.replace_track(track).await?;
        guard.lane.events.publish(ClientEvent::TrackReplaced {
            session_id: session.id().to_string(),
            track_name: stable_id.to_string(),
        });
        return Ok(descriptor);
    }

    if !fresh {
        transceiver.replace_track(track).await?;
    }

    info!("Pushing track {} on session {}", stable_id, session.id());
    let ticket = session.pushes.join(PushItem {
        transceiver: transceiver.clone(),
        track_name: stable_id.to_string(),
    });
    *guard.pending.lock() = Some(ticket.clone());
    let slot = ticket.slot().await?;
    guard.pending.lock().take();

    let mid = transceiver
        .mid()
        .ok_or_else(|| AppError::Invariant(format!("pushed track {} has no mid", stable_id)))?;
    let entry = slot.response.track_for_mid(&mid).ok_or_else(|| {
        AppError::Invariant(format!("push response has no track for mid {}", mid))
    })?;
    if let Some(e) = entry.soft_error() {
        return Err(e);
    }

    guard.lane.events.publish(ClientEvent::TrackPushed {
        session_id: session.id().to_string(),
        track_name: stable_id.to_string(),
        mid,
    });
    Ok(descriptor)
}

enum Step {
    Track(Option<Result<LocalTrack>>),
    SessionChanged,
    Stopped,
}

/// Wait for a published session
async fn next_session(sessions: &mut watch::Receiver<Option<Arc<Session>>>) -> Option<Arc<Session>> {
    loop {
        if let Some(session) = sessions.borrow_and_update().clone() {
            return Some(session);
        }
        sessions.changed().await.ok()?;
    }
}

/// Push every track from `tracks` into whichever session is current
///
/// The stable id is the first track's id. Each session gets its own
/// send-only transceiver; it is closed (fire-and-forget) when the session
/// goes away or the returned stream is dropped. An upstream error, or a
/// failed push, ends the stream with that error.
pub(crate) fn push_track<S>(
    mut sessions: watch::Receiver<Option<Arc<Session>>>,
    lane: Arc<Lane>,
    tracks: S,
) -> impl Stream<Item = Result<TrackDescriptor>> + Send + 'static
where
    S: Stream<Item = Result<LocalTrack>> + Send + 'static,
{
    stream! {
        let mut tracks = Box::pin(tracks);
        let mut latest = match tracks.next().await {
            Some(Ok(track)) => track,
            Some(Err(e)) => {
                yield Err(e);
                return;
            }
            None => return,
        };
        let stable_id = latest.id().to_string();
        let mut tracks_done = false;

        'sessions: loop {
            let Some(session) = next_session(&mut sessions).await else {
                return;
            };

            let transceiver = match session
                .peer()
                .add_transceiver(latest.clone(), TransceiverDirection::SendOnly)
                .await
            {
                Ok(transceiver) => transceiver,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let guard = PushGuard {
                lane: lane.clone(),
                session: session.clone(),
                transceiver,
                pending: Mutex::new(None),
            };
            let mut pending = Some((latest.clone(), true));

            loop {
                if let Some((track, fresh)) = pending.take() {
                    let current = Some(session.clone());
                    let outcome = tokio::select! {
                        published = publish(&guard, &stable_id, track, fresh) => Some(published),
                        _ = session_changed(&mut sessions, &current) => None,
                    };
                    match outcome {
                        Some(Ok(descriptor)) => yield Ok(descriptor),
                        Some(Err(e)) => {
                            yield Err(e);
                            return;
                        }
                        None => continue 'sessions,
                    }
                }

                let current = Some(session.clone());
                let step = tokio::select! {
                    changed = session_changed(&mut sessions, &current) => {
                        if changed { Step::SessionChanged } else { Step::Stopped }
                    }
                    next = tracks.next(), if !tracks_done => Step::Track(next),
                };

                match step {
                    Step::Track(Some(Ok(track))) => {
                        latest = track.clone();
                        pending = Some((track, false));
                    }
                    Step::Track(Some(Err(e))) => {
                        yield Err(e);
                        return;
                    }
                    Step::Track(None) => tracks_done = true,
                    Step::SessionChanged => {
                        debug!("Session changed under pushed track {}", stable_id);
                        continue 'sessions;
                    }
                    Step::Stopped => return,
                }
            }
        }
    }
}

/// Resolves `true` once the published session differs from `current`,
/// `false` if the publisher is gone
pub(crate) async fn session_changed(
    sessions: &mut watch::Receiver<Option<Arc<Session>>>,
    current: &Option<Arc<Session>>,
) -> bool {
    loop {
        if sessions.changed().await.is_err() {
            return false;
        }
        if !same_session(&sessions.borrow_and_update(), current) {
            return true;
        }
    }
}
