use candle_core::{Module, ModuleT, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Layer norm configuration.
#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    pub affine: bool,
    pub eps: f64,
    pub size: usize,
}

impl LayerNormConfig {
    /// Whether to use an affine transformation.
    ///
    /// Default: `true`
    pub fn affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    /// Epsilon value.
    ///
    /// Default: `1e-5`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Dimensionality of the layer.
    ///
    /// Default: `768`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            affine: true,
            eps: 1e-5,
            size: 768,
        }
    }
}

impl BuildModule for LayerNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT + Send + Sync>, BoxedError> {
        let affine = if self.affine {
            Some((
                vb.get_with_hints(self.size, "weight", Init::Const(1.))?,
                vb.get_with_hints(self.size, "bias", Init::Const(0.))?,
            ))
        } else {
            None
        };

        Ok(Box::new(LayerNorm {
            affine,
            eps: self.eps,
        }))
    }
}

/// Layer normalization.
///
/// Normalizes the last (feature) axis to zero mean and unit variance, then
/// applies an optional learned scale and shift.
///
/// See [Ba et al., 2016](https://arxiv.org/abs/1607.06450).
struct LayerNorm {
    affine: Option<(Tensor, Tensor)>,
    eps: f64,
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;

        match &self.affine {
            Some((weight, bias)) => normalized.broadcast_mul(weight)?.broadcast_add(bias),
            None => Ok(normalized),
        }
    }
}
