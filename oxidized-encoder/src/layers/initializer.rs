use candle_nn::Init;
use serde::{Deserialize, Serialize};

/// Parameter initializers.
///
/// Initializers are identified by their snake-case name in serialized
/// configurations, e.g. `"glorot_uniform"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// Uniform in `[-l, l]` with `l = sqrt(6 / (fan_in + fan_out))`.
    ///
    /// See [Glorot and Bengio, 2010](https://proceedings.mlr.press/v9/glorot10a.html).
    GlorotUniform,

    /// Normal with `stddev = sqrt(2 / (fan_in + fan_out))`.
    GlorotNormal,

    /// Uniform in `[-l, l]` with `l = sqrt(6 / fan_in)`.
    ///
    /// See [He et al., 2015](https://arxiv.org/abs/1502.01852).
    HeUniform,

    /// Normal with `stddev = sqrt(2 / fan_in)`.
    HeNormal,

    /// All ones.
    Ones,

    /// All zeros.
    Zeros,
}

impl Initializer {
    /// Get the candle initialization for a parameter.
    ///
    /// * `fan_in` - Number of inputs of the layer.
    /// * `fan_out` - Number of outputs of the layer.
    pub fn init(&self, fan_in: usize, fan_out: usize) -> Init {
        use Initializer::*;
        let (fan_in, fan_out) = (fan_in.max(1) as f64, fan_out.max(1) as f64);
        match self {
            GlorotUniform => {
                let limit = (6. / (fan_in + fan_out)).sqrt();
                Init::Uniform {
                    lo: -limit,
                    up: limit,
                }
            }
            GlorotNormal => Init::Randn {
                mean: 0.,
                stdev: (2. / (fan_in + fan_out)).sqrt(),
            },
            HeUniform => {
                let limit = (6. / fan_in).sqrt();
                Init::Uniform {
                    lo: -limit,
                    up: limit,
                }
            }
            HeNormal => Init::Randn {
                mean: 0.,
                stdev: (2. / fan_in).sqrt(),
            },
            Ones => Init::Const(1.),
            Zeros => Init::Const(0.),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    use super::Initializer;

    #[test]
    fn glorot_uniform_stays_within_limit() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let weight = vb
            .get_with_hints((8, 4), "weight", Initializer::GlorotUniform.init(4, 8))
            .unwrap();
        let limit = (6f32 / 12.).sqrt();
        let values: Vec<f32> = weight.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() <= limit));
        assert!(values.iter().any(|&v| v != 0.));
    }

    #[test]
    fn constant_initializers() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let zeros = vb
            .get_with_hints(3, "zeros", Initializer::Zeros.init(3, 3))
            .unwrap();
        let ones = vb
            .get_with_hints(3, "ones", Initializer::Ones.init(3, 3))
            .unwrap();
        assert_eq!(zeros.to_vec1::<f32>().unwrap(), vec![0., 0., 0.]);
        assert_eq!(ones.to_vec1::<f32>().unwrap(), vec![1., 1., 1.]);
    }

    #[test]
    fn initializer_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&Initializer::GlorotUniform).unwrap(),
            "\"glorot_uniform\""
        );
        assert_eq!(
            serde_json::from_str::<Initializer>("\"he_normal\"").unwrap(),
            Initializer::HeNormal
        );
    }
}
