//! Pipeline and its builder

mod builder;
mod pipeline;

pub use builder::{ChatRelay, DEFAULT_MODEL, RelayBuilder};
pub use pipeline::{ChatPipeline, RelayOutput, RelayStream};
