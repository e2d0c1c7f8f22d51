//! Parameter checkpoints.
//!
//! Checkpoints store the tensors of a [`VarMap`] in a safetensors file,
//! keyed by their parameter paths.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

/// Checkpoint errors.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot assign parameter '{name}'"))]
    AssignParameter {
        name: String,
        source: candle_core::Error,
    },

    #[snafu(display("Cannot convert parameter '{name}' from checkpoint"))]
    ConvertParameter {
        name: String,
        source: candle_core::Error,
    },

    #[snafu(display("Checkpoint contains no parameters"))]
    EmptyCheckpoint,

    #[snafu(display("Cannot read checkpoint: {path:?}"))]
    ReadCheckpoint {
        path: PathBuf,
        source: candle_core::Error,
    },

    #[snafu(display("Cannot lock variable store"))]
    LockVariables,

    #[snafu(display("Checkpoint is missing parameters: {}", names.join(", ")))]
    MissingParameters { names: Vec<String> },

    #[snafu(display(
        "Shape of parameter '{name}' in checkpoint {checkpoint:?} does not match {expected:?}"
    ))]
    ParameterShape {
        name: String,
        checkpoint: Vec<usize>,
        expected: Vec<usize>,
    },

    #[snafu(display("Checkpoint contains unknown parameters: {}", names.join(", ")))]
    UnknownParameters { names: Vec<String> },

    #[snafu(display("Cannot write checkpoint: {path:?}"))]
    WriteCheckpoint {
        path: PathBuf,
        source: candle_core::Error,
    },
}

/// Save and restore the parameters of a variable store.
pub trait ParameterCheckpoint {
    /// Write all parameters to a safetensors file.
    fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError>;

    /// Assign every parameter from a safetensors file.
    ///
    /// Tensors are converted to the data type and device of the parameter
    /// they are assigned to. Restoring is strict: the checkpoint must have
    /// a tensor with the right shape for every parameter and must not have
    /// tensors for parameters that the store lacks. Nothing is assigned
    /// when the checkpoint does not match.
    fn restore_checkpoint(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError>;
}

impl ParameterCheckpoint for VarMap {
    fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let data = self.data().lock().ok().context(LockVariablesSnafu)?;
        ensure!(!data.is_empty(), EmptyCheckpointSnafu);
        let tensors = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect::<HashMap<_, _>>();
        drop(data);

        candle_core::safetensors::save(&tensors, path).context(WriteCheckpointSnafu { path })?;
        tracing::debug!(path = %path.display(), n_tensors = tensors.len(), "Saved checkpoint");

        Ok(())
    }

    fn restore_checkpoint(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let mut tensors = read_tensors(path)?;

        let data = self.data().lock().ok().context(LockVariablesSnafu)?;

        let missing = data
            .keys()
            .filter(|name| !tensors.contains_key(*name))
            .cloned()
            .collect::<BTreeSet<_>>();
        ensure!(
            missing.is_empty(),
            MissingParametersSnafu {
                names: missing.into_iter().collect::<Vec<_>>()
            }
        );

        let unknown = tensors
            .keys()
            .filter(|name| !data.contains_key(*name))
            .cloned()
            .collect::<BTreeSet<_>>();
        ensure!(
            unknown.is_empty(),
            UnknownParametersSnafu {
                names: unknown.into_iter().collect::<Vec<_>>()
            }
        );

        // Validate and convert all tensors before assigning any of them.
        let mut converted = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            let tensor = tensors
                .remove(name)
                .context(MissingParametersSnafu {
                    names: vec![name.clone()],
                })?;
            ensure!(
                tensor.dims() == var.dims(),
                ParameterShapeSnafu {
                    name: name.clone(),
                    checkpoint: tensor.dims().to_vec(),
                    expected: var.dims().to_vec(),
                }
            );
            let tensor = tensor
                .to_dtype(var.dtype())
                .and_then(|tensor| tensor.to_device(var.device()))
                .context(ConvertParameterSnafu { name: name.clone() })?;
            converted.push((name, var, tensor));
        }

        for (name, var, tensor) in &converted {
            var.set(tensor)
                .context(AssignParameterSnafu { name: name.as_str() })?;
        }

        tracing::debug!(
            path = %path.display(),
            n_tensors = converted.len(),
            "Restored checkpoint"
        );

        Ok(())
    }
}

/// Names of the parameters stored in a checkpoint, in sorted order.
pub fn checkpoint_parameter_names(path: impl AsRef<Path>) -> Result<Vec<String>, CheckpointError> {
    let mut names = read_tensors(path.as_ref())?
        .into_keys()
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

fn read_tensors(path: &Path) -> Result<HashMap<String, Tensor>, CheckpointError> {
    candle_core::safetensors::load(path, &Device::Cpu).context(ReadCheckpointSnafu { path })
}
