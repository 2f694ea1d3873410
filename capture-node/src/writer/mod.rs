use async_trait::async_trait;

use crate::error::Result;
use crate::media::{CodecDescriptors, Unit};

pub mod local;
pub mod relay;
pub mod still;

pub use local::{ClosedSegment, LocalWriter};
pub use relay::CloudRelayWriter;
pub use still::StillWriter;

/// A consumer of a stream's units. Resources are acquired in `open` and
/// released in `close`; a writer is closed at most once.
#[async_trait]
pub trait Writer: Send {
    fn name(&self) -> &str;

    async fn open(&mut self, descriptors: &CodecDescriptors) -> Result<()>;

    async fn write(&mut self, unit: &Unit) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
