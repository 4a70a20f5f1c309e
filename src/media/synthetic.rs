//! Synthetic VP8 camera for demos and loopback checks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::source::{AcquiredTrack, DeviceAcquirer, MediaDevice, TrackConstraints};
use crate::error::Result;
use crate::webrtc::peer::MediaKind;

const DEFAULT_FRAME_RATE: u32 = 30;

/// Payload of every generated frame
const FRAME: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

/// Produces a VP8 track per acquisition and feeds it placeholder frames
pub struct SyntheticCamera {
    stream_id: String,
}

impl SyntheticCamera {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }

    /// The single device this source exposes
    pub fn device() -> MediaDevice {
        MediaDevice::new("synthetic-camera", "Synthetic camera", MediaKind::Video)
    }
}

#[async_trait]
impl DeviceAcquirer for SyntheticCamera {
    async fn acquire(
        &self,
        device: &MediaDevice,
        constraints: &TrackConstraints,
    ) -> Result<Option<AcquiredTrack>> {
        if device.kind != MediaKind::Video {
            return Ok(None);
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            format!("{}-{}", device.device_id, uuid::Uuid::new_v4()),
            self.stream_id.clone(),
        ));

        let fps = constraints.frame_rate.unwrap_or(DEFAULT_FRAME_RATE).max(1);
        let frame_duration = Duration::from_secs(1) / fps;
        let ended = CancellationToken::new();
        let stop = CancellationToken::new();

        let writer = track.clone();
        let writer_stop = stop.clone();
        let writer_ended = ended.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_duration);
            loop {
                tokio::select! {
                    _ = writer_stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let sample = Sample {
                    data: Bytes::from_static(FRAME),
                    duration: frame_duration,
                    ..Default::default()
                };
                if let Err(e) = writer.write_sample(&sample).await {
                    warn!("Synthetic frame write failed: {}", e);
                    writer_ended.cancel();
                    break;
                }
            }
            debug!("Synthetic camera writer stopped");
        });

        Ok(Some(
            AcquiredTrack::new(track, ended).on_release(move || stop.cancel()),
        ))
    }
}
