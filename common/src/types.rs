use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One encoded preview image (JPEG) taken from a camera's video.
///
/// Cloning is cheap: the encoded bytes are reference counted, so a still can
/// be handed to any number of HTTP responses without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Still {
    data: Bytes,
    captured_at: DateTime<Utc>,
}

impl Still {
    pub fn new(data: impl Into<Bytes>, captured_at: DateTime<Utc>) -> Self {
        Self {
            data: data.into(),
            captured_at,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-camera status line exposed to viewers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CameraSummary {
    pub name: String,
    pub has_image: bool,
    pub captured_at: Option<DateTime<Utc>>,
    pub image_bytes: usize,
}

/// Read side of the recorder, as seen by anything that serves stills.
pub trait StillSource: Send + Sync {
    /// Latest still for `camera`, `None` if the camera is unknown or has not
    /// produced an image yet.
    fn latest_still(&self, camera: &str) -> Option<Still>;

    /// Every registered camera, sorted by name.
    fn cameras(&self) -> Vec<CameraSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_still_shares_bytes_on_clone() {
        let still = Still::new(vec![0xFF, 0xD8, 0xFF, 0xD9], Utc::now());
        let copy = still.clone();

        assert_eq!(copy.len(), 4);
        assert_eq!(copy.data().as_ptr(), still.data().as_ptr());
        assert!(!copy.is_empty());
    }

    #[test]
    fn test_summary_serializes_camera_name() {
        let summary = CameraSummary {
            name: "front_door".to_string(),
            has_image: false,
            captured_at: None,
            image_bytes: 0,
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["name"], "front_door");
        assert_eq!(json["has_image"], false);
        assert!(json["captured_at"].is_null());
    }
}
