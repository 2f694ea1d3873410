use lookout_common::Still;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::CameraConfig;

pub mod handler;

pub use handler::CameraHandler;

/// A named video source and the most recent still taken from it.
#[derive(Debug)]
pub struct Camera {
    name: String,
    source_url: String,
    record_interval: Duration,
    latest_image: watch::Sender<Option<Still>>,
}

impl Camera {
    pub fn new(name: &str, source_url: &str, record_interval: Duration) -> Self {
        let (latest_image, _) = watch::channel(None);
        Self {
            name: name.to_string(),
            source_url: source_url.to_string(),
            record_interval,
            latest_image,
        }
    }

    pub fn from_config(config: &CameraConfig, record_interval: Duration) -> Self {
        Self::new(&config.name, &config.source, record_interval)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn record_interval(&self) -> Duration {
        self.record_interval
    }

    pub fn latest_image(&self) -> Option<Still> {
        self.latest_image.borrow().clone()
    }

    pub fn set_latest_image(&self, still: Still) {
        self.latest_image.send_replace(Some(still));
    }

    /// Notifies on every replaced still.
    pub fn watch_image(&self) -> watch::Receiver<Option<Still>> {
        self.latest_image.subscribe()
    }
}
