//! Multi-camera recorder: per-camera streams demux network video, fan units
//! out to writers that record rotating segments, relay them to object storage
//! and derive preview stills.

pub mod camera;
pub mod clock;
pub mod config;
pub mod error;
pub mod media;
pub mod stream;
pub mod upload;
pub mod writer;

#[cfg(test)]
mod testing;

pub use camera::{Camera, CameraHandler};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CaptureConfig;
pub use error::{CaptureError, Result};
pub use stream::{Stream, StreamState};
