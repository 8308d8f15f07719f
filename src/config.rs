//! Explicit configuration threaded through every assembly entry point.
use crate::error::AssemblyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage layout of an assembled matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MatType {
    /// A single matrix with one stored value per degree of freedom pair (`"aij"`).
    #[default]
    Monolithic,
    /// A single matrix whose sparsity is built on node blocks (`"baij"`).
    MonolithicBlock,
    /// One sub-matrix per pair of top-level mixed indices (`"nest"`).
    Nested,
    /// No matrix at all, only an implicit action (`"matfree"`).
    MatrixFree,
}

impl MatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatType::Monolithic => "aij",
            MatType::MonolithicBlock => "baij",
            MatType::Nested => "nest",
            MatType::MatrixFree => "matfree",
        }
    }
}

impl fmt::Display for MatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MatType {
    type Err = AssemblyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aij" => Ok(MatType::Monolithic),
            "baij" => Ok(MatType::MonolithicBlock),
            "nest" => Ok(MatType::Nested),
            "matfree" => Ok(MatType::MatrixFree),
            other => Err(AssemblyError::InvalidOptions(format!(
                "unrecognised matrix type `{other}`"
            ))),
        }
    }
}

/// Storage used *inside* each block of a nested matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubMatType {
    #[default]
    Scalar,
    Block,
}

impl FromStr for SubMatType {
    type Err = AssemblyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aij" => Ok(SubMatType::Scalar),
            "baij" => Ok(SubMatType::Block),
            other => Err(AssemblyError::InvalidOptions(format!(
                "invalid submatrix type `{other}` (not `aij` or `baij`)"
            ))),
        }
    }
}

/// Options recognized by [`assemble`](crate::assembly::assemble),
/// [`allocate`](crate::assembly::allocate) and
/// [`make_assembler`](crate::assembly::make_assembler).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssemblyOptions {
    pub mat_type: MatType,
    pub sub_mat_type: SubMatType,
    /// Assemble the inverse of every local element matrix instead of the matrix itself.
    pub inverse: bool,
    /// Label given to allocated matrices and sparsity patterns.
    pub name: Option<String>,
}

impl AssemblyOptions {
    pub fn with_mat_type(mut self, mat_type: MatType) -> Self {
        self.mat_type = mat_type;
        self
    }

    pub fn with_sub_mat_type(mut self, sub_mat_type: SubMatType) -> Self {
        self.sub_mat_type = sub_mat_type;
        self
    }

    pub fn with_inverse(mut self, inverse: bool) -> Self {
        self.inverse = inverse;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether matrices should be stored as one sub-matrix per block pair.
    pub fn is_nested(&self) -> bool {
        self.mat_type == MatType::Nested
    }

    /// Whether sparsity should be built on node blocks rather than individual degrees of freedom.
    pub fn is_block_sparse(&self) -> bool {
        match self.mat_type {
            MatType::Nested => self.sub_mat_type == SubMatType::Block,
            MatType::MonolithicBlock => true,
            MatType::Monolithic | MatType::MatrixFree => false,
        }
    }
}
