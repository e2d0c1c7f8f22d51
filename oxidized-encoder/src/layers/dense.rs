use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::layers::activation::Activation;
use crate::layers::initializer::Initializer;

/// Construct a linear layer with the given initializers.
///
/// The weight is stored as `weight` with shape `(output_width,
/// input_width)`, the bias (when used) as `bias` with shape
/// `(output_width,)`.
pub(crate) fn linear_with_init(
    input_width: usize,
    output_width: usize,
    use_bias: bool,
    kernel_initializer: Initializer,
    bias_initializer: Initializer,
    vb: VarBuilder,
) -> Result<Linear, candle_core::Error> {
    let weight = vb.get_with_hints(
        (output_width, input_width),
        "weight",
        kernel_initializer.init(input_width, output_width),
    )?;
    let bias = if use_bias {
        Some(vb.get_with_hints(
            output_width,
            "bias",
            bias_initializer.init(input_width, output_width),
        )?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

fn default_initializer() -> Initializer {
    Initializer::GlorotUniform
}

fn default_bias_initializer() -> Initializer {
    Initializer::Zeros
}

fn default_use_bias() -> bool {
    true
}

/// Densely-connected layer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenseConfig {
    units: usize,

    #[serde(default)]
    activation: Option<Activation>,

    #[serde(default = "default_initializer")]
    kernel_initializer: Initializer,

    #[serde(default = "default_bias_initializer")]
    bias_initializer: Initializer,

    #[serde(default = "default_use_bias")]
    use_bias: bool,
}

impl DenseConfig {
    /// Create a dense layer configuration with the given number of output
    /// units.
    pub fn new(units: usize) -> Self {
        Self {
            units,
            activation: None,
            kernel_initializer: default_initializer(),
            bias_initializer: default_bias_initializer(),
            use_bias: default_use_bias(),
        }
    }

    /// Activation applied to the output.
    ///
    /// Default: `None`
    pub fn activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    /// Initializer of the bias.
    ///
    /// Default: `Initializer::Zeros`
    pub fn bias_initializer(mut self, bias_initializer: Initializer) -> Self {
        self.bias_initializer = bias_initializer;
        self
    }

    /// Initializer of the weight matrix.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn kernel_initializer(mut self, kernel_initializer: Initializer) -> Self {
        self.kernel_initializer = kernel_initializer;
        self
    }

    /// Whether to add a bias.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Number of output units.
    pub fn units(&self) -> usize {
        self.units
    }

    /// Build the layer for inputs with the given width.
    pub fn build(&self, input_width: usize, vb: VarBuilder) -> Result<Dense, DenseError> {
        let linear = linear_with_init(
            input_width,
            self.units,
            self.use_bias,
            self.kernel_initializer,
            self.bias_initializer,
            vb,
        )
        .context(ConstructionSnafu)?;

        Ok(Dense {
            activation: self.activation,
            linear,
        })
    }
}

/// Dense layer errors.
#[derive(Debug, Snafu)]
pub enum DenseError {
    #[snafu(display("Cannot apply activation"))]
    Activation { source: candle_core::Error },

    #[snafu(display("Cannot construct dense layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot apply linear projection"))]
    Projection { source: candle_core::Error },
}

/// Densely-connected layer, `activation(xW^T + b)`.
///
/// Applied to the last axis, so sequence inputs of shape
/// `(batch_size, seq_len, width)` are projected per sequence element.
pub struct Dense {
    activation: Option<Activation>,
    linear: Linear,
}

impl Dense {
    /// Apply the layer.
    ///
    /// * `input` - Input.
    ///   *Shape:* `(batch_size, [seq_len,] input_width)`
    ///
    /// Returns the projected input.
    /// *Shape:* `(batch_size, [seq_len,] units)`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, DenseError> {
        let output = self.linear.forward(input).context(ProjectionSnafu)?;
        match &self.activation {
            Some(activation) => activation.forward(&output).context(ActivationSnafu),
            None => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::array;

    use super::DenseConfig;
    use crate::layers::activation::Activation;
    use crate::layers::initializer::Initializer;
    use crate::util::tests::{assert_tensor_eq, test_devices, PseudoRandom};

    #[test]
    fn dense_projects_last_axis() {
        for device in test_devices() {
            let var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let dense = DenseConfig::new(1)
                .activation(Some(Activation::Sigmoid))
                .build(6, vb.push_prefix("head"))
                .unwrap();

            let input = Tensor::pseudo_random((2, 4, 6), 1, &device);
            let output = dense.forward(&input).unwrap();
            assert_eq!(output.dims(), &[2, 4, 1]);

            let values: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
            assert!(values.iter().all(|v| *v > 0. && *v < 1.));

            let weight = var_map.data().lock().unwrap()["head.weight"].clone();
            assert_eq!(weight.dims(), &[1, 6]);
        }
    }

    #[test]
    fn dense_uses_initializers() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let dense = DenseConfig::new(2)
            .kernel_initializer(Initializer::Zeros)
            .bias_initializer(Initializer::Ones)
            .build(3, vb)
            .unwrap();
        let input = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu).unwrap();
        assert_tensor_eq!(dense.forward(&input).unwrap(), array![[1f32, 1.]]);
    }

    #[test]
    fn dense_without_bias() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        DenseConfig::new(2).use_bias(false).build(3, vb).unwrap();
        assert_eq!(var_map.all_vars().len(), 1);
    }

    #[test]
    fn dense_config_defaults_when_deserializing() {
        let config: DenseConfig = serde_json::from_str(r#"{"units": 1}"#).unwrap();
        assert_eq!(config, DenseConfig::new(1));
        assert!(serde_json::from_str::<DenseConfig>(r#"{"units": 1, "bogus": 2}"#).is_err());
    }
}
