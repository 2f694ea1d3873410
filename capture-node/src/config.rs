use lookout_common::utils::{duration, validate_url};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::{path::PathBuf, time::Duration};
use validator::{Validate, ValidationError};

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Validate, Default)]
#[serde(default)]
#[validate(schema(function = "validate_capture_config"))]
pub struct CaptureConfig {
    #[validate]
    pub cameras: Vec<CameraConfig>,
    #[validate]
    pub storage: StorageConfig,
    #[validate]
    pub cloud: CloudConfig,
    #[validate]
    pub still: StillConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
pub struct CameraConfig {
    #[validate(length(min = 1, max = 100), custom = "validate_camera_name")]
    pub name: String,
    #[validate(custom = "validate_source")]
    pub source: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Local,
    S3,
    Disabled,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    #[serde(with = "duration")]
    #[validate(custom = "validate_non_zero")]
    pub rotation_interval: Duration,
    pub segment_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct CloudConfig {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint_url: Option<String>,
    pub prefix: String,
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    #[serde(with = "duration")]
    pub retry_backoff: Duration,
    #[serde(with = "duration")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct StillConfig {
    #[validate(range(min = 16, max = 7680))]
    pub width: u32,
    #[validate(range(min = 16, max = 4320))]
    pub height: u32,
    #[validate(range(min = 1, max = 100))]
    pub quality: u8,
    #[serde(with = "duration")]
    #[validate(custom = "validate_non_zero")]
    pub interval: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl CloudConfig {
    /// Whether every credential needed to reach the bucket is present.
    pub fn ready(&self) -> bool {
        !self.bucket.is_empty()
            && !self.region.is_empty()
            && !self.access_key.is_empty()
            && !self.secret_key.is_empty()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            rotation_interval: Duration::from_secs(60),
            segment_dir: PathBuf::from("/tmp/lookout"),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            endpoint_url: None,
            prefix: String::new(),
            max_attempts: 5,
            retry_backoff: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Default for StillConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            quality: 75,
            interval: Duration::from_secs(1),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Reads `path` (YAML), overlays `LOOKOUT__SECTION__KEY` environment
/// variables and validates the result.
pub fn load_config(path: &str) -> Result<CaptureConfig> {
    use config::{Config, Environment, File};

    let settings = Config::builder()
        .add_source(File::with_name(path))
        .add_source(
            Environment::with_prefix("LOOKOUT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: CaptureConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

fn validate_camera_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        let mut error = ValidationError::new("camera_name");
        error.message = Some(format!("camera name '{}' may only contain [A-Za-z0-9_-]", name).into());
        Err(error)
    }
}

fn validate_source(source: &str) -> std::result::Result<(), ValidationError> {
    validate_url(source).map_err(|message| {
        let mut error = ValidationError::new("source_url");
        error.message = Some(message.into());
        error
    })
}

fn validate_non_zero(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        Err(ValidationError::new("zero_duration"))
    } else {
        Ok(())
    }
}

fn validate_capture_config(config: &CaptureConfig) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for camera in &config.cameras {
        if !seen.insert(camera.name.as_str()) {
            let mut error = ValidationError::new("duplicate_camera");
            error.message = Some(format!("camera '{}' is configured twice", camera.name).into());
            return Err(error);
        }
    }

    if config.storage.mode == StorageMode::S3 && !config.cloud.ready() {
        let mut error = ValidationError::new("cloud_not_ready");
        error.message =
            Some("storage mode s3 needs cloud bucket, region, access_key and secret_key".into());
        return Err(error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use std::io::Write;

    fn camera(name: &str, source: &str) -> CameraConfig {
        CameraConfig {
            name: name.to_string(),
            source: source.to_string(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CaptureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.mode, StorageMode::Local);
        assert_eq!(config.still.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_duplicate_and_malformed_names() {
        let mut config = CaptureConfig::default();
        config.cameras = vec![
            camera("front_door", "rtsp://10.0.0.2/live"),
            camera("front_door", "rtsp://10.0.0.3/live"),
        ];
        assert!(config.validate().is_err());

        config.cameras = vec![camera("front door", "rtsp://10.0.0.2/live")];
        assert!(config.validate().is_err());

        config.cameras = vec![camera("front_door", "smb://10.0.0.2/live")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_mode_requires_credentials() {
        let mut config = CaptureConfig::default();
        config.storage.mode = StorageMode::S3;
        assert!(config.validate().is_err());

        config.cloud.bucket = "recordings".to_string();
        config.cloud.region = "eu-west-1".to_string();
        config.cloud.access_key = "AKIA".to_string();
        config.cloud.secret_key = "secret".to_string();
        assert!(config.cloud.ready());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookout.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "cameras:\n  - name: front_door\n    source: http://10.0.0.2/video.mjpg\n\
             storage:\n  mode: disabled\n  rotation_interval: 5m\n\
             still:\n  interval: 500ms\n  quality: 60\n"
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();

        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.storage.mode, StorageMode::Disabled);
        assert_eq!(config.storage.rotation_interval, Duration::from_secs(300));
        assert_eq!(config.still.interval, Duration::from_millis(500));
        assert_eq!(config.still.quality, 60);
        assert_eq!(config.still.width, 640);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_config_rejects_oversized_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookout.yaml");
        std::fs::write(
            &path,
            "storage:\n  rotation_interval: 100000000000000000000h\n",
        )
        .unwrap();

        let err = load_config(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, CaptureError::ConfigError(_)));
    }
}
