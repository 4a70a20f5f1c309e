use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::webrtc::peer::{LocalTrack, MediaKind};

/// Capture constraints applied when acquiring a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
}

/// A capture device as reported by the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDevice {
    pub device_id: String,
    pub label: String,
    pub kind: MediaKind,
}

impl MediaDevice {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            kind,
        }
    }
}

/// Latest-value holder for externally supplied constraints
#[derive(Clone)]
pub struct ConstraintsCell {
    tx: Arc<watch::Sender<TrackConstraints>>,
}

impl ConstraintsCell {
    pub fn new(initial: TrackConstraints) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> TrackConstraints {
        self.tx.borrow().clone()
    }

    /// Publish new constraints; unchanged values are not re-published
    pub fn set(&self, constraints: TrackConstraints) {
        self.tx.send_if_modified(|current| {
            if *current == constraints {
                return false;
            }
            *current = constraints;
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackConstraints> {
        self.tx.subscribe()
    }
}

impl Default for ConstraintsCell {
    fn default() -> Self {
        Self::new(TrackConstraints::default())
    }
}

/// A track held open on one device
///
/// The device is released when this value is dropped.
pub struct AcquiredTrack {
    track: LocalTrack,
    ended: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl AcquiredTrack {
    /// `ended` is cancelled by the acquirer when the device stops producing media
    pub fn new(track: LocalTrack, ended: CancellationToken) -> Self {
        Self {
            track,
            ended,
            release: None,
        }
    }

    /// Run `release` when the track is dropped
    pub fn on_release(mut self, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn track(&self) -> LocalTrack {
        self.track.clone()
    }

    pub async fn ended(&self) {
        self.ended.cancelled().await
    }
}

impl Drop for AcquiredTrack {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Opens tracks on capture devices
#[async_trait]
pub trait DeviceAcquirer: Send + Sync {
    /// `Ok(None)` means the device is unusable right now and should be skipped
    async fn acquire(
        &self,
        device: &MediaDevice,
        constraints: &TrackConstraints,
    ) -> Result<Option<AcquiredTrack>>;
}

enum Hold {
    Ended,
    Restart,
}

async fn changed_or_pending<T>(rx: &mut watch::Receiver<T>) {
    if rx.changed().await.is_err() {
        // Publisher gone: nothing will ever change again
        std::future::pending::<()>().await;
    }
}

/// Lazily walk `devices` of `kind`, yielding one usable track at a time
///
/// Each track is held until it ends, then released before the next device is
/// tried. A change of the device list or of the constraints releases the
/// held track and restarts from the first device. When the list is used up
/// the stream fails with [`AppError::DevicesExhausted`].
pub fn device_tracks(
    kind: MediaKind,
    mut devices: watch::Receiver<Vec<MediaDevice>>,
    mut constraints: watch::Receiver<TrackConstraints>,
    acquirer: Arc<dyn DeviceAcquirer>,
) -> impl Stream<Item = Result<LocalTrack>> + Send + 'static {
    stream! {
        'walk: loop {
            let candidates: Vec<MediaDevice> = devices
                .borrow_and_update()
                .iter()
                .filter(|d| d.kind == kind)
                .cloned()
                .collect();
            let current = constraints.borrow_and_update().clone();
            debug!("Walking {} {:?} device(s)", candidates.len(), kind);

            for device in candidates {
                let acquired = match acquirer.acquire(&device, &current).await {
                    Ok(Some(acquired)) => acquired,
                    Ok(None) => {
                        debug!("Skipping unusable device {}", device.label);
                        continue;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                info!("Using {:?} device {}", kind, device.label);
                yield Ok(acquired.track());

                let hold = tokio::select! {
                    _ = acquired.ended() => Hold::Ended,
                    _ = changed_or_pending(&mut devices) => Hold::Restart,
                    _ = changed_or_pending(&mut constraints) => Hold::Restart,
                };
                drop(acquired);

                if let Hold::Restart = hold {
                    debug!("Devices or constraints changed, restarting");
                    continue 'walk;
                }
                debug!("Device {} ended", device.label);
            }

            yield Err(AppError::DevicesExhausted);
            return;
        }
    }
}
