//! The accumulation driver and the entry points of form assembly.
//!
//! Assembly runs in a fixed sequence: every kernel is classified and its loop prepared (which
//! surfaces unknown integral kinds and map mismatches before anything is allocated), the
//! target tensor is allocated or validated, the loops accumulate into it in kernel order, and
//! finally boundary conditions are applied and the tensor is finalized.
use crate::assembler::Assembler;
use crate::bc::DirichletBC;
use crate::config::{AssemblyOptions, MatType};
use crate::error::{AssemblyError, AssemblyResult};
use crate::form::{Form, SubdomainId};
use crate::integral::{classify, IntegralDescriptor, IntegralKind};
use crate::parloop::ParLoop;
use crate::space::FunctionSpace;
use crate::sparsity::{Sparsity, SparsityMaps};
use crate::tensor::{BlockMatrix, BlockVector, ImplicitMatrix, Tensor};
use crate::Real;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// The prepared loops of a form, one per kernel and in kernel order.
#[derive(Debug)]
pub struct AssemblyPlan<T: Real> {
    rank: usize,
    descriptors: Vec<IntegralDescriptor>,
    loops: Vec<Arc<ParLoop<T>>>,
}

impl<T: Real> AssemblyPlan<T> {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn descriptors(&self) -> &[IntegralDescriptor] {
        &self.descriptors
    }

    pub fn loops(&self) -> &[Arc<ParLoop<T>>] {
        &self.loops
    }
}

/// Classify every kernel of a form.
///
/// Fails on the first unrecognized integral kind, before any work is done.
fn classify_kernels<T: Real>(form: &Form<T>) -> AssemblyResult<Vec<IntegralDescriptor>> {
    form.kernels()
        .iter()
        .map(|kernel| classify(&kernel.info.integral_type))
        .collect()
}

/// Validate a form and prepare the loops of all its kernels.
pub fn plan<T: Real>(form: &Form<T>, inverse: bool) -> AssemblyResult<AssemblyPlan<T>> {
    form.validate()?;
    let descriptors = classify_kernels(form)?;

    // "otherwise" kernels visit everything not claimed by a tagged kernel of the same kind
    let mut explicit_tags: FxHashMap<IntegralKind, Vec<i32>> = FxHashMap::default();
    for (kernel, descriptor) in form.kernels().iter().zip(&descriptors) {
        if let SubdomainId::Tag(tag) = kernel.info.subdomain_id {
            explicit_tags.entry(descriptor.kind).or_default().push(tag);
        }
    }

    let mut loops = Vec::with_capacity(descriptors.len());
    for (kernel, descriptor) in form.kernels().iter().zip(&descriptors) {
        let topology = form.domains()[kernel.info.domain].topology();
        let tags = explicit_tags
            .get(&descriptor.kind)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let subset = form.subdomain_data(kernel.info.domain, &kernel.info.integral_type);
        let iteration_set = match subset {
            Some(entities) => topology.subset_set(descriptor.entity_set, descriptor.region, entities),
            None => topology.measure_set(descriptor.entity_set, descriptor.region, &kernel.info.subdomain_id, tags),
        };
        let iteration_set = iteration_set
            .map_err(|err| match err {
                AssemblyError::MapMismatch { reason, .. } => AssemblyError::MapMismatch {
                    kernel: kernel.name().to_string(),
                    kind: descriptor.kind.to_string(),
                    reason,
                },
                other => other,
            })?;
        debug!(
            "Kernel `{}` ({}, subdomain {}) iterates over {} items",
            kernel.name(),
            descriptor.kind,
            kernel.info.subdomain_id,
            iteration_set.len()
        );
        loops.push(Arc::new(ParLoop::new(form, kernel, *descriptor, iteration_set, inverse)?));
    }

    Ok(AssemblyPlan {
        rank: form.rank(),
        descriptors,
        loops,
    })
}

fn check_options(rank: usize, options: &AssemblyOptions) -> AssemblyResult<()> {
    if options.inverse && rank != 2 {
        return Err(AssemblyError::InvalidOptions(format!(
            "inverse assembly is only defined for bilinear forms, got a form of rank {rank}"
        )));
    }
    if options.inverse && options.mat_type == MatType::MatrixFree {
        return Err(AssemblyError::InvalidOptions(
            "inverse assembly cannot be combined with matrix-free matrices".to_string(),
        ));
    }
    Ok(())
}

fn bilinear_spaces<T: Real>(form: &Form<T>) -> AssemblyResult<(&FunctionSpace, &FunctionSpace)> {
    match form.arguments() {
        [test, trial] => Ok((&**test, &**trial)),
        arguments => Err(AssemblyError::invalid_target(
            arguments.len(),
            "only bilinear forms can be assembled into matrices",
        )),
    }
}

fn allocate_matrix<T: Real>(
    form: &Form<T>,
    descriptors: &[IntegralDescriptor],
    options: &AssemblyOptions,
) -> AssemblyResult<Tensor<T>> {
    let (test, trial) = bilinear_spaces(form)?;
    let name = options
        .name
        .clone()
        .unwrap_or_else(|| format!("{}_{}_matrix", test.name(), trial.name()));

    if options.mat_type == MatType::MatrixFree {
        return Ok(Tensor::Implicit(ImplicitMatrix::new(name, test, trial)));
    }

    if options.mat_type == MatType::MonolithicBlock {
        if let Some(mixed) = [test, trial].into_iter().find(|space| space.is_mixed()) {
            return Err(AssemblyError::UnsupportedSparsityFormat {
                space: mixed.name().to_string(),
                reason: "monolithic block sparse matrices are not supported for mixed spaces, \
                         use a nested matrix instead"
                    .to_string(),
            });
        }
    }

    let maps = SparsityMaps::from_integrals(descriptors);
    let layers = form.domains()[0].topology().layers();
    let sparsity = Sparsity::build(
        name,
        test,
        trial,
        &maps,
        layers,
        options.is_nested(),
        options.is_block_sparse(),
    )?;
    let matrix = BlockMatrix::new(Arc::new(sparsity));
    info!(
        "Allocated {} matrix `{}` of size {} x {} with {} stored entries",
        matrix.mat_type(),
        matrix.sparsity().name(),
        matrix.nrows(),
        matrix.ncols(),
        matrix.nnz()
    );
    Ok(Tensor::Matrix(matrix))
}

fn allocate_tensor<T: Real>(
    form: &Form<T>,
    descriptors: &[IntegralDescriptor],
    options: &AssemblyOptions,
) -> AssemblyResult<Tensor<T>> {
    match form.arguments() {
        [] => Ok(Tensor::Scalar(T::zero())),
        [test] => Ok(Tensor::Vector(BlockVector::zeros(test))),
        _ => allocate_matrix(form, descriptors, options),
    }
}

/// Check that a caller-supplied tensor can hold the result of assembling the form.
fn check_tensor<T: Real>(form: &Form<T>, tensor: &Tensor<T>, options: &AssemblyOptions) -> AssemblyResult<()> {
    let rank = form.rank();
    let mismatch = |what: &str, expected: &[usize], actual: &[usize]| {
        AssemblyError::invalid_target(
            rank,
            format!("{what} block sizes {actual:?} do not match the argument space sizes {expected:?}"),
        )
    };

    match (form.arguments(), tensor) {
        ([], _) => Err(AssemblyError::invalid_target(
            0,
            "cannot assemble a scalar into a supplied tensor; the value is returned instead",
        )),
        ([test], Tensor::Vector(vector)) => {
            let expected = test.block_dofs();
            if vector.block_lengths() != expected {
                return Err(mismatch("vector", expected.as_slice(), vector.block_lengths().as_slice()));
            }
            Ok(())
        }
        ([test, trial], Tensor::Implicit(implicit)) => {
            if options.mat_type != MatType::MatrixFree {
                return Err(AssemblyError::invalid_target(
                    rank,
                    format!(
                        "cannot assemble a {} matrix into a matrix-free operator",
                        options.mat_type
                    ),
                ));
            }
            if implicit.row_dofs() != test.block_dofs() {
                return Err(mismatch("row", test.block_dofs().as_slice(), implicit.row_dofs()));
            }
            if implicit.col_dofs() != trial.block_dofs() {
                return Err(mismatch("column", trial.block_dofs().as_slice(), implicit.col_dofs()));
            }
            Ok(())
        }
        ([test, trial], Tensor::Matrix(matrix)) => {
            if options.mat_type == MatType::MatrixFree {
                return Err(AssemblyError::invalid_target(
                    rank,
                    "matrix-free assembly requires a matrix-free operator as target",
                ));
            }
            let sparsity = matrix.sparsity();
            if sparsity.row_dofs() != test.block_dofs() {
                return Err(mismatch("row", test.block_dofs().as_slice(), sparsity.row_dofs()));
            }
            if sparsity.col_dofs() != trial.block_dofs() {
                return Err(mismatch("column", trial.block_dofs().as_slice(), sparsity.col_dofs()));
            }
            if matrix.mat_type() != options.mat_type {
                warn!(
                    "Requested matrix type {} differs from the type {} of the supplied matrix `{}`, \
                     which is kept",
                    options.mat_type,
                    matrix.mat_type(),
                    sparsity.name()
                );
            }
            Ok(())
        }
        (_, other) => Err(AssemblyError::invalid_target(
            rank,
            format!("a tensor of rank {} cannot hold a form of rank {}", other.rank(), rank),
        )),
    }
}

/// Check that the sparsity of a supplied matrix covers every entry the form accumulates into.
fn check_sparsity<T: Real>(
    form: &Form<T>,
    descriptors: &[IntegralDescriptor],
    matrix: &BlockMatrix<T>,
) -> AssemblyResult<()> {
    let (test, trial) = bilinear_spaces(form)?;
    let supplied = matrix.sparsity();
    let maps = SparsityMaps::from_integrals(descriptors);
    let layers = form.domains()[0].topology().layers();
    let required = Sparsity::build(supplied.name(), test, trial, &maps, layers, supplied.is_nested(), false)?;
    match supplied.first_uncovered(&required) {
        None => Ok(()),
        Some((i, j, row, col)) => Err(AssemblyError::invalid_target(
            2,
            format!(
                "the sparsity `{}` of the supplied matrix has no slot for entry ({row}, {col}) \
                 of block ({i}, {j})",
                supplied.name()
            ),
        )),
    }
}

/// Assemble a form once.
///
/// Allocates a new tensor unless one is supplied. `bcs` replaces any boundary conditions
/// attached to a supplied matrix, and `None` stands for the empty set. Boundary conditions are
/// ignored for rank 0 forms.
///
/// After an error, the contents of a supplied tensor are undefined.
pub fn assemble<T: Real>(
    form: &Form<T>,
    tensor: Option<Tensor<T>>,
    bcs: Option<&[DirichletBC<T>]>,
    options: &AssemblyOptions,
) -> AssemblyResult<Tensor<T>> {
    let mut assembler = make_assembler(form, tensor, bcs, options)?;
    assembler.assemble()?;
    Ok(assembler.into_tensor())
}

/// Allocate the matrix of a bilinear form without assembling it.
pub fn allocate<T: Real>(
    form: &Form<T>,
    bcs: Option<&[DirichletBC<T>]>,
    options: &AssemblyOptions,
) -> AssemblyResult<Tensor<T>> {
    bilinear_spaces(form)?;
    check_options(form.rank(), options)?;
    form.validate()?;
    let descriptors = classify_kernels(form)?;
    let mut tensor = allocate_matrix(form, &descriptors, options)?;
    if let Some(bcs) = bcs {
        tensor.set_bcs(bcs.to_vec())?;
    }
    Ok(tensor)
}

/// Prepare a reusable assembler bound to a tensor.
///
/// See [`assemble`] for the meaning of `bcs`. The assembler usually writes into a tensor
/// obtained from [`allocate`]. If `tensor` is `None`, a tensor is allocated here exactly as
/// [`assemble`] would, which is also how assemblers of scalars and vectors are created.
///
/// A supplied matrix must have a slot for every entry the kernels of the form can reach.
/// This is checked here, so that a too narrow sparsity never leaves a partially accumulated
/// matrix behind.
pub fn make_assembler<T: Real>(
    form: &Form<T>,
    tensor: Option<Tensor<T>>,
    bcs: Option<&[DirichletBC<T>]>,
    options: &AssemblyOptions,
) -> AssemblyResult<Assembler<T>> {
    let rank = form.rank();
    check_options(rank, options)?;
    let plan = plan(form, options.inverse)?;

    let (mut tensor, fresh) = match tensor {
        None => (allocate_tensor(form, plan.descriptors(), options)?, true),
        Some(tensor) => {
            check_tensor(form, &tensor, options)?;
            if let Tensor::Matrix(matrix) = &tensor {
                check_sparsity(form, plan.descriptors(), matrix)?;
            }
            (tensor, false)
        }
    };

    let bcs = bcs.unwrap_or_default().to_vec();
    let mut assembler = Assembler::new(plan, tensor, options.clone(), fresh);
    if rank == 0 {
        if !bcs.is_empty() {
            debug!("Ignoring {} boundary conditions for a form of rank 0", bcs.len());
        }
    } else {
        assembler.set_bcs(bcs)?;
    }
    Ok(assembler)
}
