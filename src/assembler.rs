//! Deferred and repeated assembly of a form into one tensor.
use crate::assembly::AssemblyPlan;
use crate::bc::{self, DirichletBC};
use crate::config::AssemblyOptions;
use crate::error::{AssemblyError, AssemblyResult};
use crate::parloop::ParLoop;
use crate::tensor::Tensor;
use crate::Real;
use log::debug;
use std::sync::Arc;

/// Assembles a form into the tensor it owns, as many times as needed.
///
/// Every call to [`Assembler::assemble`] runs one full pass: zero, accumulate every kernel,
/// apply the *current* boundary conditions, finalize. Boundary conditions may therefore be
/// attached or swapped between passes, without rebuilding the sparsity or the prepared loops.
#[derive(Debug)]
pub struct Assembler<T: Real> {
    plan: AssemblyPlan<T>,
    tensor: Tensor<T>,
    /// Boundary conditions of a vector assembler. Matrices carry their own.
    vector_bcs: Vec<DirichletBC<T>>,
    options: AssemblyOptions,
    /// The tensor is freshly allocated and still zero.
    fresh: bool,
}

impl<T: Real> Assembler<T> {
    pub(crate) fn new(plan: AssemblyPlan<T>, tensor: Tensor<T>, options: AssemblyOptions, fresh: bool) -> Self {
        Self {
            plan,
            tensor,
            vector_bcs: Vec::new(),
            options,
            fresh,
        }
    }

    pub fn rank(&self) -> usize {
        self.plan.rank()
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    pub fn loops(&self) -> &[Arc<ParLoop<T>>] {
        self.plan.loops()
    }

    pub fn tensor(&self) -> &Tensor<T> {
        &self.tensor
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor<T> {
        &mut self.tensor
    }

    /// The boundary conditions applied at the end of each pass.
    pub fn bcs(&self) -> &[DirichletBC<T>] {
        match self.tensor {
            Tensor::Vector(_) => &self.vector_bcs,
            _ => self.tensor.bcs(),
        }
    }

    /// Replace the boundary conditions, effective from the next pass.
    ///
    /// For matrices the new set is attached to the tensor itself.
    pub fn set_bcs(&mut self, bcs: Vec<DirichletBC<T>>) -> AssemblyResult<()> {
        match self.tensor {
            Tensor::Vector(_) => {
                self.vector_bcs = bcs;
                Ok(())
            }
            _ => self.tensor.set_bcs(bcs),
        }
    }

    pub fn into_tensor(self) -> Tensor<T> {
        self.tensor
    }

    /// Run one full assembly pass and return the assembled tensor.
    pub fn assemble(&mut self) -> AssemblyResult<&Tensor<T>> {
        if let Tensor::Implicit(implicit) = &mut self.tensor {
            implicit.assemble();
            return Ok(&self.tensor);
        }

        // A freshly allocated tensor is already zero
        if !self.fresh {
            self.tensor.zero();
        }
        self.fresh = false;

        for parloop in self.plan.loops() {
            parloop.execute(&mut self.tensor)?;
        }

        let bcs = self.bcs().to_vec();
        if !bcs.is_empty() {
            debug!("Applying {} boundary conditions", bcs.len());
        }
        bc::apply(&mut self.tensor, &bcs)?;
        self.tensor.finalize();
        Ok(&self.tensor)
    }

    /// Collect the operations of one assembly pass without running them.
    ///
    /// The operations capture the prepared loops and the current boundary conditions, and can be replayed with [`execute_all`] on this or any tensor
    /// of the same layout. Coefficient values are read at execution time.
    pub fn collect(&self) -> AssemblyResult<Vec<AssemblyOperation<T>>> {
        if matches!(self.tensor, Tensor::Implicit(_)) {
            return Err(AssemblyError::InvalidOptions(
                "matrix-free operators cannot be assembled by collected operations".to_string(),
            ));
        }
        if self.options.inverse {
            return Err(AssemblyError::InvalidOptions(
                "inverse assembly cannot be combined with collecting operations".to_string(),
            ));
        }

        let bcs = self.bcs();
        if !bcs.is_empty() && self.rank() == 1 {
            return Err(AssemblyError::collect_mode(
                "boundary conditions on vectors cannot be collected",
            ));
        }
        for bc in bcs {
            bc.space().top_level_index()?;
            if !bc.is_resolved() {
                return Err(AssemblyError::collect_mode(format!(
                    "boundary condition on `{}` needs its nodes resolved before collecting",
                    bc.space().name()
                )));
            }
        }

        let mut operations = vec![AssemblyOperation::Zero];
        operations.extend(self.plan.loops().iter().cloned().map(AssemblyOperation::Accumulate));
        if !bcs.is_empty() {
            operations.push(AssemblyOperation::ApplyBcs(bcs.to_vec()));
        }
        operations.push(AssemblyOperation::Finalize);
        Ok(operations)
    }
}

/// A single step of an assembly pass.
#[derive(Debug, Clone)]
pub enum AssemblyOperation<T: Real> {
    Zero,
    Accumulate(Arc<ParLoop<T>>),
    ApplyBcs(Vec<DirichletBC<T>>),
    Finalize,
}

impl<T: Real> AssemblyOperation<T> {
    pub fn execute(&self, tensor: &mut Tensor<T>) -> AssemblyResult<()> {
        match self {
            AssemblyOperation::Zero => {
                tensor.zero();
                Ok(())
            }
            AssemblyOperation::Accumulate(parloop) => parloop.execute(tensor),
            AssemblyOperation::ApplyBcs(bcs) => bc::apply(tensor, bcs),
            AssemblyOperation::Finalize => {
                tensor.finalize();
                Ok(())
            }
        }
    }
}

/// Execute collected operations in order.
pub fn execute_all<T: Real>(operations: &[AssemblyOperation<T>], tensor: &mut Tensor<T>) -> AssemblyResult<()> {
    operations
        .iter()
        .try_for_each(|operation| operation.execute(tensor))
}
