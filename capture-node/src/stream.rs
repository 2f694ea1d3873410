//! One camera's pipeline: a demuxer feeding every attached writer.

use lookout_common::Still;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CaptureError, Result};
use crate::media::{CodecDescriptors, Demuxer, DemuxerFactory, Unit};
use crate::writer::Writer;

/// Stills buffered per stream. Slow subscribers skip the oldest.
pub const STILLS_CAPACITY: usize = 100;
const UNIT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Created,
    Opened,
    Running,
    Closing,
    Closed,
}

pub struct Stream {
    camera: String,
    url: String,
    state: Arc<watch::Sender<StreamState>>,
    demuxer: Option<Box<dyn Demuxer>>,
    descriptors: Option<CodecDescriptors>,
    writers: Vec<Box<dyn Writer>>,
    stills: Option<broadcast::Sender<Still>>,
    cancel: CancellationToken,
    lifecycle: Option<JoinHandle<()>>,
}

impl Stream {
    pub fn new(camera: &str, url: &str) -> Self {
        let (state, _) = watch::channel(StreamState::Created);
        let (stills, _) = broadcast::channel(STILLS_CAPACITY);

        Self {
            camera: camera.to_string(),
            url: url.to_string(),
            state: Arc::new(state),
            demuxer: None,
            descriptors: None,
            writers: Vec::new(),
            stills: Some(stills),
            cancel: CancellationToken::new(),
            lifecycle: None,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub fn descriptors(&self) -> Option<&CodecDescriptors> {
        self.descriptors.as_ref()
    }

    /// Sender side of the stills channel, for attaching a still writer.
    /// `None` once the stream has been cleaned up.
    pub fn stills_sender(&self) -> Option<broadcast::Sender<Still>> {
        self.stills.clone()
    }

    /// Subscribes to the stills channel. After cleanup the returned receiver
    /// is already closed.
    pub fn stills(&self) -> broadcast::Receiver<Still> {
        match &self.stills {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Connects to the source, then opens the writers added so far against
    /// its codec descriptors.
    pub async fn open(&mut self, factory: &dyn DemuxerFactory) -> Result<()> {
        if self.state() != StreamState::Created {
            return Err(CaptureError::InvalidState(format!(
                "{}: open in state {:?}",
                self.camera,
                self.state()
            )));
        }

        let mut demuxer = factory.create(&self.url)?;
        let descriptors = match demuxer.open(&self.url).await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                if let Err(close_err) = demuxer.close().await {
                    debug!(camera = %self.camera, "Closing failed demuxer: {}", close_err);
                }
                return Err(e);
            }
        };

        let pending = std::mem::take(&mut self.writers);
        for writer in pending {
            let opened = open_writer(&self.camera, writer, &descriptors).await;
            if let Some(writer) = opened {
                self.writers.push(writer);
            }
        }

        info!(
            camera = %self.camera,
            "Opened {} with {} writer(s)",
            self.url,
            self.writers.len()
        );
        self.demuxer = Some(demuxer);
        self.descriptors = Some(descriptors);
        self.state.send_replace(StreamState::Opened);
        Ok(())
    }

    /// Attaches a writer. Once the stream is open the writer is opened right
    /// away; if that fails it is dropped and the error returned.
    pub async fn add_writer(&mut self, writer: Box<dyn Writer>) -> Result<()> {
        match self.state() {
            StreamState::Created => {
                self.writers.push(writer);
                Ok(())
            }
            StreamState::Opened => {
                let descriptors = self
                    .descriptors
                    .clone()
                    .ok_or_else(|| CaptureError::InvalidState("opened without descriptors".to_string()))?;
                let name = writer.name().to_string();
                let opened = open_writer(&self.camera, writer, &descriptors).await;
                match opened {
                    Some(writer) => {
                        self.writers.push(writer);
                        Ok(())
                    }
                    None => Err(CaptureError::WriterError(format!(
                        "{}: {} writer failed to open",
                        self.camera, name
                    ))),
                }
            }
            state => Err(CaptureError::InvalidState(format!(
                "{}: cannot add a writer while {:?}",
                self.camera, state
            ))),
        }
    }

    /// Spawns the read, dispatch and lifecycle tasks.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != StreamState::Opened {
            return Err(CaptureError::InvalidState(format!(
                "{}: start in state {:?}",
                self.camera,
                self.state()
            )));
        }
        let demuxer = self
            .demuxer
            .take()
            .ok_or_else(|| CaptureError::InvalidState("no demuxer".to_string()))?;
        let writers = std::mem::take(&mut self.writers);

        let (unit_tx, unit_rx) = mpsc::channel(UNIT_CHANNEL_CAPACITY);
        let read = tokio::spawn(read_loop(
            self.camera.clone(),
            demuxer,
            unit_tx,
            self.cancel.clone(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(self.camera.clone(), writers, unit_rx));
        self.lifecycle = Some(tokio::spawn(run_lifecycle(
            self.camera.clone(),
            read,
            dispatch,
            self.state.clone(),
        )));

        self.state.send_replace(StreamState::Running);
        info!(camera = %self.camera, "Stream running");
        Ok(())
    }

    /// Stops ingestion and releases every writer and the demuxer. Calling it
    /// again, or after the source ended on its own, only waits for that
    /// shutdown to finish.
    pub async fn cleanup(&mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.lifecycle.take() {
            if let Err(e) = handle.await {
                error!(camera = %self.camera, "Stream lifecycle task failed: {}", e);
                self.state.send_replace(StreamState::Closed);
            }
        } else if self.state() != StreamState::Closed {
            self.state.send_replace(StreamState::Closing);
            close_writers(&self.camera, &mut self.writers).await;
            self.writers.clear();
            if let Some(mut demuxer) = self.demuxer.take() {
                if let Err(e) = demuxer.close().await {
                    warn!(camera = %self.camera, "Failed to close demuxer: {}", e);
                }
            }
            self.state.send_replace(StreamState::Closed);
        }

        if self.stills.take().is_some() {
            debug!(camera = %self.camera, "Stills channel released");
        }
    }

    /// Resolves once the stream has fully closed.
    pub async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == StreamState::Closed).await;
    }
}

async fn open_writer(
    camera: &str,
    mut writer: Box<dyn Writer>,
    descriptors: &CodecDescriptors,
) -> Option<Box<dyn Writer>> {
    match writer.open(descriptors).await {
        Ok(()) => Some(writer),
        Err(e) => {
            warn!(camera = %camera, writer = writer.name(), "Writer not attached: {}", e);
            None
        }
    }
}

async fn read_loop(
    camera: String,
    mut demuxer: Box<dyn Demuxer>,
    units: mpsc::Sender<Unit>,
    cancel: CancellationToken,
) -> Box<dyn Demuxer> {
    let mut count: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = demuxer.read_unit() => next,
        };

        match next {
            Ok(unit) => {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = units.send(unit) => sent,
                };
                if sent.is_err() {
                    warn!(camera = %camera, "Dispatch task is gone, stopping reads");
                    break;
                }
                count += 1;
            }
            Err(CaptureError::EndOfStream) => {
                info!(camera = %camera, "Source ended");
                break;
            }
            Err(e) => {
                error!(camera = %camera, "Read error: {}", e);
                break;
            }
        }
    }

    debug!(camera = %camera, "Read task finished after {} units", count);
    demuxer
}

async fn dispatch_loop(
    camera: String,
    mut writers: Vec<Box<dyn Writer>>,
    mut units: mpsc::Receiver<Unit>,
) -> Vec<Box<dyn Writer>> {
    while let Some(unit) = units.recv().await {
        for writer in writers.iter_mut() {
            if let Err(e) = writer.write(&unit).await {
                warn!(camera = %camera, writer = writer.name(), "Write failed: {}", e);
            }
        }
    }
    writers
}

async fn run_lifecycle(
    camera: String,
    read: JoinHandle<Box<dyn Demuxer>>,
    dispatch: JoinHandle<Vec<Box<dyn Writer>>>,
    state: Arc<watch::Sender<StreamState>>,
) {
    let demuxer = read.await;
    let writers = dispatch.await;
    state.send_replace(StreamState::Closing);

    match writers {
        Ok(mut writers) => close_writers(&camera, &mut writers).await,
        Err(e) => error!(camera = %camera, "Dispatch task failed: {}", e),
    }
    match demuxer {
        Ok(mut demuxer) => {
            if let Err(e) = demuxer.close().await {
                warn!(camera = %camera, "Failed to close demuxer: {}", e);
            }
        }
        Err(e) => error!(camera = %camera, "Read task failed: {}", e),
    }

    state.send_replace(StreamState::Closed);
    info!(camera = %camera, "Stream closed");
}

async fn close_writers(camera: &str, writers: &mut [Box<dyn Writer>]) {
    for writer in writers.iter_mut() {
        if let Err(e) = writer.close().await {
            warn!(camera = %camera, writer = writer.name(), "Failed to close writer: {}", e);
        }
    }
}
