use std::error::Error;

pub use crate::layers::encoder_block::{ConfigurationError, EncoderBlockError, InputShapeError};

/// Alias for boxed errors that can be sent across threads.
///
/// Used at the seams where modules are built through trait objects
/// (`BuildModule`, `BuildAttention`, `BuildAttentionScorer`).
pub type BoxedError = Box<dyn Error + Send + Sync>;
