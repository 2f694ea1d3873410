use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Writer error: {0}")]
    WriterError(String),

    #[error("Rotation error: {0}")]
    RotationError(String),

    #[error("Upload error: {0}")]
    UploadError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media error: {0}")]
    MediaError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),
}

impl From<config::ConfigError> for CaptureError {
    fn from(error: config::ConfigError) -> Self {
        CaptureError::ConfigError(error.to_string())
    }
}

impl From<validator::ValidationErrors> for CaptureError {
    fn from(error: validator::ValidationErrors) -> Self {
        CaptureError::ConfigError(error.to_string())
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_status() || error.is_builder() {
            CaptureError::SourceUnavailable(error.to_string())
        } else {
            CaptureError::ReadError(error.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for CaptureError {
    fn from(error: tokio::task::JoinError) -> Self {
        CaptureError::InvalidState(format!("task failed: {}", error))
    }
}

#[cfg(feature = "gstreamer")]
impl From<gstreamer::glib::Error> for CaptureError {
    fn from(error: gstreamer::glib::Error) -> Self {
        CaptureError::MediaError(error.to_string())
    }
}

#[cfg(feature = "gstreamer")]
impl From<gstreamer::glib::BoolError> for CaptureError {
    fn from(error: gstreamer::glib::BoolError) -> Self {
        CaptureError::MediaError(error.to_string())
    }
}

#[cfg(feature = "gstreamer")]
impl From<gstreamer::StateChangeError> for CaptureError {
    fn from(error: gstreamer::StateChangeError) -> Self {
        CaptureError::MediaError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
