use candle_core::ModuleT;
use candle_nn::{Dropout, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;

/// Dropout configuration.
#[derive(Clone, Debug)]
pub struct DropoutConfig {
    p: f32,
}

impl DropoutConfig {
    /// Dropout probability.
    ///
    /// Default: `0.0`
    pub fn p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self { p: 0.0 }
    }
}

/// Dropout configuration errors.
#[derive(Debug, Snafu)]
pub enum DropoutError {
    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    Probability { p: f32 },
}

impl BuildModule for DropoutConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT + Send + Sync>, BoxedError> {
        let p = self.p;
        if !(0.0..1.0).contains(&p) {
            return ProbabilitySnafu { p }.fail().boxed();
        }
        if p == 0.0 {
            return Ok(Box::new(Identity));
        }
        Ok(Box::new(Dropout::new(p)))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::VarBuilder;

    use super::DropoutConfig;
    use crate::layers::build_module::BuildModule;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn dropout_is_identity_during_inference() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let dropout = DropoutConfig::default().p(0.5).build(vb).unwrap();
        let xs = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert_tensor_eq!(dropout.forward_t(&xs, false).unwrap(), &xs);
    }

    #[test]
    fn zero_dropout_is_identity_during_training() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let dropout = DropoutConfig::default().build(vb).unwrap();
        let xs = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert_tensor_eq!(dropout.forward_t(&xs, true).unwrap(), &xs);
    }

    #[test]
    fn invalid_probability_is_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(DropoutConfig::default().p(1.0).build(vb.clone()).is_err());
        assert!(DropoutConfig::default().p(-0.1).build(vb).is_err());
    }
}
