//! Track close protocol
//!
//! Must run on the scheduler lane: it rewrites the local and remote
//! descriptions like every other renegotiation.

use tracing::{debug, info};

use super::peer::{PeerConnection, TransceiverDirection};
use super::signaling::{
    ClosedTrack, CloseTracksRequest, ConnectionState, SignalingApi, SoftError,
};
use crate::error::{AppError, Result};

/// Deactivate the transceiver at `mid` and remove it from the session
///
/// Returns `false` without touching anything when there is nothing to close:
/// the connection is not connected, the mid no longer resolves, or the
/// transceiver is already inactive.
pub(crate) async fn close_track(
    peer: &dyn PeerConnection,
    signaling: &dyn SignalingApi,
    session_id: &str,
    mid: &str,
) -> Result<bool> {
    if peer.connection_state() != ConnectionState::Connected {
        debug!("Close of mid {} skipped: peer {} not connected", mid, peer.id());
        return Ok(false);
    }
    let Some(transceiver) = peer.transceiver_for_mid(mid).await else {
        debug!("Close of mid {} skipped: no such transceiver", mid);
        return Ok(false);
    };
    if transceiver.direction() == TransceiverDirection::Inactive {
        debug!("Close of mid {} skipped: already inactive", mid);
        return Ok(false);
    }

    info!("Closing track mid {} on session {}", mid, session_id);
    transceiver.set_direction(TransceiverDirection::Inactive).await;

    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    let local = peer.local_description().await.unwrap_or(offer);

    let response = signaling
        .close_tracks(
            session_id,
            CloseTracksRequest {
                tracks: vec![ClosedTrack {
                    mid: mid.to_string(),
                }],
                session_description: local,
                force: false,
            },
        )
        .await?
        .into_checked()?;

    let answer = response.session_description.ok_or_else(|| {
        AppError::Invariant("close response carried no session description".to_string())
    })?;
    peer.set_remote_description(answer).await?;
    Ok(true)
}
