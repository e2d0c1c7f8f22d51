//! Models that embed encoder blocks.

mod sequential;
pub use sequential::{
    InputShape, SequentialModel, SequentialModelConfig, SequentialModelError, CONFIG_FILENAME,
    FORMAT_VERSION, PARAMETERS_FILENAME,
};
