//! Errors produced by form assembly.
//!
//! None of these errors are retried internally. They all indicate invalid input from the caller,
//! and once an error has been returned from an assembly call the numeric contents of the target
//! tensor are undefined: the tensor should be discarded rather than reused.
use thiserror::Error;

/// The result type used by all fallible assembly routines.
pub type AssemblyResult<T> = Result<T, AssemblyError>;

/// Structured error taxonomy for the assembly engine.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// The integral kind reported by the form compiler is not one of the recognized kinds.
    #[error("unsupported integral kind `{kind}`")]
    UnsupportedIntegralKind { kind: String },

    /// The requested sparsity format cannot represent the matrix.
    #[error(
        "sparsity format not supported for `{space}`: {reason}. \
         Use a non-block-sparse (scalar) matrix format instead"
    )]
    UnsupportedSparsityFormat { space: String, reason: String },

    /// A caller-supplied tensor cannot be used as the target of the assembly.
    #[error("invalid tensor target for form of rank {rank}: {reason}")]
    InvalidTensorTarget { rank: usize, reason: String },

    /// The index map of a coordinate field, coefficient or argument does not match the
    /// domain the kernel integrates over.
    #[error(
        "integral measure does not match measure of all coefficients/arguments \
         (kernel `{kernel}`, integral kind `{kind}`): {reason}"
    )]
    MapMismatch {
        kernel: String,
        kind: String,
        reason: String,
    },

    /// A boundary condition was defined on a full mixed space instead of one of its components.
    #[error(
        "cannot apply boundary condition to full mixed space `{space}` with {num_blocks} blocks. \
         Did you forget to index it?"
    )]
    AmbiguousBoundaryCondition { space: String, num_blocks: usize },

    /// The operation cannot be represented as a collected, replayable operation.
    #[error("not supported when collecting assembly operations: {reason}")]
    UnsupportedInCollectMode { reason: String },

    /// Incompatible or unrecognized assembly options.
    #[error("invalid assembly options: {0}")]
    InvalidOptions(String),

    /// The form itself is inconsistent (missing domains, coefficients, arguments, ...).
    #[error("invalid form of rank {rank}: {reason}")]
    InvalidForm { rank: usize, reason: String },

    /// A local kernel reported a failure.
    #[error("kernel `{kernel}` failed on entity {entity}: {report}")]
    KernelFailure {
        kernel: String,
        entity: usize,
        report: eyre::Report,
    },
}

impl AssemblyError {
    pub(crate) fn invalid_target(rank: usize, reason: impl Into<String>) -> Self {
        Self::InvalidTensorTarget {
            rank,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_form(rank: usize, reason: impl Into<String>) -> Self {
        Self::InvalidForm {
            rank,
            reason: reason.into(),
        }
    }

    pub(crate) fn collect_mode(reason: impl Into<String>) -> Self {
        Self::UnsupportedInCollectMode { reason: reason.into() }
    }
}
