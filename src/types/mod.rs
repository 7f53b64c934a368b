//! Public types for the relay API.

mod message;
mod request;
mod response;

pub use message::{Message, Role};
pub use request::{ChatRequest, GenerationParams};
pub use response::{CacheTier, ResponseEnvelope, Usage};
