use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Configurations that build a shape-preserving or pointwise module.
///
/// Parameters, if any, are created through the variable builder, so the
/// builder's prefix determines their checkpoint paths.
pub trait BuildModule: Debug {
    /// Build a module.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT + Send + Sync>, BoxedError>;
}
