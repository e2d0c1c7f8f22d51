use std::fmt;
use std::str::FromStr;

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Activation functions.
///
/// Activations are identified by their snake-case name in serialized
/// configurations, e.g. `"relu"` or `"gelu_new"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Gausian Error Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    Gelu,

    /// Gausian Error Linear Unit, tanh approximation.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    GeluNew,

    /// Identity, `f(x) = x`.
    Linear,

    /// Rectified Linear Unit.
    ///
    /// See [Fukushima, 1969](https://ieeexplore.ieee.org/document/4082265).
    #[default]
    Relu,

    /// Logistic sigmoid.
    Sigmoid,

    /// Sigmoid Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    Silu,

    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Name of the activation as used in serialized configurations.
    pub fn name(&self) -> &'static str {
        use Activation::*;
        match self {
            Gelu => "gelu",
            GeluNew => "gelu_new",
            Linear => "linear",
            Relu => "relu",
            Sigmoid => "sigmoid",
            Silu => "silu",
            Tanh => "tanh",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Activation parsing errors.
#[derive(Debug, Snafu)]
pub enum ActivationError {
    #[snafu(display("Unknown activation function: {name}"))]
    UnknownActivation { name: String },
}

impl FromStr for Activation {
    type Err = ActivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Activation::*;
        Ok(match s {
            "gelu" => Gelu,
            "gelu_new" => GeluNew,
            "linear" => Linear,
            "relu" => Relu,
            "sigmoid" => Sigmoid,
            "silu" => Silu,
            "tanh" => Tanh,
            name => return UnknownActivationSnafu { name }.fail(),
        })
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        use Activation::*;
        match self {
            Gelu => xs.gelu_erf(),
            GeluNew => xs.gelu(),
            Linear => Ok(xs.clone()),
            Relu => xs.relu(),
            Sigmoid => sigmoid(xs),
            Silu => candle_nn::ops::silu(xs),
            Tanh => xs.tanh(),
        }
    }
}

impl BuildModule for Activation {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT + Send + Sync>, BoxedError> {
        Ok(Box::new(*self))
    }
}

// candle's fused sigmoid op has no backward pass.
fn sigmoid(xs: &Tensor) -> Result<Tensor, candle_core::Error> {
    xs.neg()
        .and_then(|xs| xs.exp())
        .and_then(|xs| xs + 1.0)
        .and_then(|xs| xs.recip())
}
