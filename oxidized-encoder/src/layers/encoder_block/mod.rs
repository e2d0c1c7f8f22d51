//! Transformer encoder block.

mod block;
pub use block::{BuildState, EncoderBlock, EncoderBlockError, InputShapeError};

mod config;
pub use config::{ConfigurationError, EncoderBlockConfig};
