//! Errors that callers of the pipeline may want to match on.
use std::path::PathBuf;
use std::time::Duration;

use crate::submodel::SubModelKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{kind} needs {needed} bytes but the accelerator budget is {budget} bytes")]
    ExceedsBudget { kind: SubModelKind, needed: u64, budget: u64 },

    #[error("{kind} was moved to the host but accelerator memory did not drop after {waited:?}")]
    EvictionTimeout { kind: SubModelKind, waited: Duration },

    #[error("{kind}: {count} weights missing from the checkpoint, e.g. {examples:?}")]
    MissingWeights { kind: SubModelKind, count: usize, examples: Vec<String> },

    #[error("{kind}: shape mismatch for {name}, expected {expected:?} got {actual:?}")]
    ShapeMismatch { kind: SubModelKind, name: String, expected: Vec<i64>, actual: Vec<i64> },

    #[error("image {path:?} is too small, {width}x{height} rounds down to zero")]
    ImageTooSmall { path: PathBuf, width: u32, height: u32 },

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, Error>;
