//! Assembly of compiled finite element forms into scalars, block vectors and sparse block
//! matrices.
//!
//! Forms are given as a list of compiled local kernels together with the argument spaces,
//! coefficients and integration domains they refer to. [`assemble`] runs every kernel over its
//! iteration set and accumulates the results into the target tensor, before applying boundary
//! conditions. [`make_assembler`] prepares the same work once so that it can be repeated, or
//! collected into a list of operations, for example once per nonlinear iteration.
use nalgebra::RealField;

pub mod assembler;
pub mod assembly;
pub mod bc;
pub mod config;
pub mod error;
pub mod form;
pub mod integral;
pub mod parloop;
pub mod procedural;
pub mod space;
pub mod sparsity;
pub mod tensor;
pub mod topology;

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

pub use assembly::{allocate, assemble, make_assembler};
pub use config::AssemblyOptions;
pub use error::{AssemblyError, AssemblyResult};

/// Scalar type used throughout assembly.
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}
