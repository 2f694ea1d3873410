//! Relaying finished segments to object storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::CloudConfig;
use crate::error::{CaptureError, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub type UploadBody = Box<dyn AsyncRead + Send + Unpin>;

/// Anything that can store a byte stream under a key.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload_file(&self, body: UploadBody, key: &str) -> Result<()>;
}

/// Uploads with the `aws` command line client, streaming the body through
/// its stdin. Credentials only reach the child's environment.
#[derive(Clone)]
pub struct AwsCliUploader {
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    endpoint_url: Option<String>,
}

impl AwsCliUploader {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            endpoint_url: config.endpoint_url.clone(),
        }
    }
}

#[async_trait]
impl Uploader for AwsCliUploader {
    async fn upload_file(&self, mut body: UploadBody, key: &str) -> Result<()> {
        let s3_url = format!("s3://{}/{}", self.bucket, key);

        let mut cmd = Command::new("aws");
        cmd.args(["s3", "cp", "-", &s3_url, "--region", &self.region]);
        if let Some(ref endpoint) = self.endpoint_url {
            cmd.args(["--endpoint-url", endpoint]);
        }
        cmd.env("AWS_ACCESS_KEY_ID", &self.access_key)
            .env("AWS_SECRET_ACCESS_KEY", &self.secret_key)
            .env("AWS_DEFAULT_REGION", &self.region)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::UploadError(format!("failed to run aws s3 cp: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::io::copy(&mut body, &mut stdin).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::UploadError(format!(
                "upload to {} failed: {}",
                s3_url,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// A finished segment waiting to be relayed.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub path: PathBuf,
    pub started: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RelayPolicy {
    pub prefix: String,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl RelayPolicy {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff,
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// `[<prefix>/]YYYY-MM-DD/<basename>`
pub fn segment_key(prefix: &str, started: DateTime<Utc>, path: &Path) -> String {
    let basename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", started.format("%Y-%m-%d"), basename)
    } else {
        format!("{}/{}/{}", prefix, started.format("%Y-%m-%d"), basename)
    }
}

/// Per-camera upload queue served by a single worker, so one camera's
/// segments are relayed in order and never concurrently. The worker exits
/// once the queue is dropped and drained.
pub struct UploadQueue {
    tx: mpsc::UnboundedSender<PendingUpload>,
}

impl UploadQueue {
    pub fn spawn(
        camera: &str,
        uploader: Arc<dyn Uploader>,
        policy: RelayPolicy,
        tracker: &TaskTracker,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingUpload>();
        let camera = camera.to_string();

        tracker.spawn(async move {
            while let Some(pending) = rx.recv().await {
                relay(&camera, uploader.as_ref(), &policy, pending).await;
            }
            info!(camera = %camera, "Upload worker finished");
        });

        Self { tx }
    }

    pub fn enqueue(&self, pending: PendingUpload) -> Result<()> {
        self.tx
            .send(pending)
            .map_err(|e| CaptureError::UploadError(format!("upload worker is gone, keeping {}", e.0.path.display())))
    }
}

async fn relay(camera: &str, uploader: &dyn Uploader, policy: &RelayPolicy, pending: PendingUpload) {
    let key = segment_key(&policy.prefix, pending.started, &pending.path);

    for attempt in 1..=policy.max_attempts {
        match upload_once(uploader, &pending.path, &key).await {
            Ok(()) => {
                info!(camera = %camera, "Uploaded {} as {}", pending.path.display(), key);
                if let Err(e) = tokio::fs::remove_file(&pending.path).await {
                    warn!(camera = %camera, "Uploaded but could not delete {}: {}", pending.path.display(), e);
                }
                return;
            }
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    camera = %camera,
                    "Upload of {} failed (attempt {}/{}): {}; retrying in {:?}",
                    pending.path.display(),
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    camera = %camera,
                    "Upload error: giving up on {} after {} attempts, file kept: {}",
                    pending.path.display(),
                    attempt,
                    e
                );
            }
        }
    }
}

async fn upload_once(uploader: &dyn Uploader, path: &Path, key: &str) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    uploader.upload_file(Box::new(file), key).await
}
