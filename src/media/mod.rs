//! Local media acquisition
//!
//! The negotiation engine only needs a lazy, restartable sequence of local
//! tracks. Device enumeration, ordering and health checks belong to the
//! embedding application and reach this module through [`DeviceAcquirer`].

mod source;
pub mod synthetic;

pub use source::{
    device_tracks, AcquiredTrack, ConstraintsCell, DeviceAcquirer, MediaDevice, TrackConstraints,
};
