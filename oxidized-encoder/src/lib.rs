//! Transformer encoder block with lazy, shape-dependent parameter creation.
//!
//! The central type is [`layers::encoder_block::EncoderBlock`]: a
//! self-attention + feed-forward residual block whose parameters are
//! allocated on the first call, once the feature dimension of the input is
//! known. Blocks can be embedded in a [`models::SequentialModel`], whose
//! architecture and parameters are persisted to a directory artifact, and
//! their parameters can be checkpointed through
//! [`checkpoint::ParameterCheckpoint`].

pub mod checkpoint;
pub mod error;
pub mod layers;
pub mod models;
pub mod ops;
pub mod util;
