pub mod types;
pub mod utils;

pub use types::{CameraSummary, Still, StillSource};
