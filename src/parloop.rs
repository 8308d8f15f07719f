//! Parallel loops: the execution of one kernel over one iteration set.
//!
//! Local kernels are evaluated in parallel, each thread gathering nodal data into its own
//! buffers. The resulting local tensors are then scattered into the target serially and in
//! iteration order, so the accumulated result does not depend on the number of threads.
use crate::error::{AssemblyError, AssemblyResult};
use crate::form::{CompiledKernel, Domain, Form, KernelArgs, LocalKernel};
use crate::integral::{ExtraArg, IntegralDescriptor, IntegralKind};
use crate::space::{Function, SpaceBlock};
use crate::tensor::Tensor;
use crate::topology::{EntityIndex, IndexMap, IterationRegion, IterationSet, MeshTopology};
use crate::Real;
use eyre::eyre;
use log::debug;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use thread_local::ThreadLocal;

/// The arguments of a kernel call, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopArg {
    Coordinates,
    Orientations,
    /// Block `block` of form coefficient `index`.
    Coefficient { index: usize, block: usize },
    LocalFacetNumber,
    CellFacets,
    LayerIndex,
}

impl From<ExtraArg> for LoopArg {
    fn from(arg: ExtraArg) -> Self {
        match arg {
            ExtraArg::LocalFacetNumber => LoopArg::LocalFacetNumber,
            ExtraArg::CellFacets => LoopArg::CellFacets,
        }
    }
}

/// Nodal data of one space block, reached through the map required by the integral kind.
#[derive(Debug, Clone)]
struct NodalField {
    map: IndexMap,
    block_size: usize,
}

impl NodalField {
    fn dofs(&self, output: &mut Vec<usize>, nodes: &mut Vec<usize>, index: EntityIndex, region: IterationRegion) {
        nodes.clear();
        self.map.extend_nodes(nodes, index, region);
        let bs = self.block_size;
        output.clear();
        output.extend(nodes.iter().flat_map(|node| (0..bs).map(move |c| bs * node + c)));
    }

    fn gather<T: Real>(
        &self,
        output: &mut Vec<T>,
        nodes: &mut Vec<usize>,
        values: &DVector<T>,
        index: EntityIndex,
        region: IterationRegion,
    ) {
        nodes.clear();
        self.map.extend_nodes(nodes, index, region);
        let bs = self.block_size;
        output.clear();
        output.extend(
            nodes
                .iter()
                .flat_map(|node| (0..bs).map(move |c| values[bs * node + c])),
        );
    }
}

#[derive(Debug)]
struct CoefficientArg<T> {
    function: Function<T>,
    blocks: Vec<NodalField>,
}

/// Per-thread gather buffers.
struct GatherWorkspace<T> {
    nodes: Vec<usize>,
    coordinates: Vec<T>,
    orientations: Vec<T>,
    coefficients: Vec<Vec<T>>,
}

impl<T> Default for GatherWorkspace<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            coordinates: Vec::new(),
            orientations: Vec::new(),
            coefficients: Vec::new(),
        }
    }
}

struct LocalTensor<T> {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: DMatrix<T>,
}

/// An accumulation of one kernel over one iteration set into one block of a tensor.
pub struct ParLoop<T: Real> {
    kernel: Arc<dyn LocalKernel<T>>,
    kind: IntegralKind,
    rank: usize,
    iteration_set: IterationSet,
    topology: Arc<MeshTopology>,
    domain: Arc<Domain<T>>,
    coordinates: NodalField,
    orientations: Option<NodalField>,
    coefficients: Vec<CoefficientArg<T>>,
    /// Target block index and the argument field providing its degrees of freedom, test first.
    targets: Vec<(usize, NodalField)>,
    args: Vec<LoopArg>,
    inverse: bool,
    workspace: ThreadLocal<RefCell<GatherWorkspace<T>>>,
}

impl<T: Real> fmt::Debug for ParLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParLoop")
            .field("kernel", &self.kernel.name())
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("iteration_set", &self.iteration_set)
            .field("targets", &self.targets.iter().map(|(i, _)| *i).collect::<Vec<_>>())
            .field("args", &self.args)
            .field("inverse", &self.inverse)
            .finish()
    }
}

impl<T: Real> ParLoop<T> {
    /// Prepare the loop of a kernel of the given form.
    ///
    /// Every index map the loop reads or writes through is checked against the iteration set
    /// here, so that mismatches are reported before anything is accumulated.
    pub fn new(
        form: &Form<T>,
        kernel: &CompiledKernel<T>,
        descriptor: IntegralDescriptor,
        iteration_set: IterationSet,
        inverse: bool,
    ) -> AssemblyResult<Self> {
        let info = &kernel.info;
        let rank = form.rank();
        let domain = form
            .domains()
            .get(info.domain)
            .cloned()
            .ok_or_else(|| AssemblyError::invalid_form(rank, format!("kernel `{}` has no domain", kernel.name())))?;
        let topology = Arc::clone(domain.topology());
        let check = MapCheck {
            kernel: kernel.name(),
            descriptor: &descriptor,
            topology: &topology,
        };

        let mut args = vec![LoopArg::Coordinates];
        let coordinates = check.single_block_field(domain.coordinates(), "coordinate field")?;

        let orientations = if info.needs_orientations {
            let orientations = domain.cell_orientations().ok_or_else(|| {
                AssemblyError::invalid_form(
                    rank,
                    format!("kernel `{}` needs cell orientations, but the domain has none", kernel.name()),
                )
            })?;
            args.push(LoopArg::Orientations);
            Some(check.single_block_field(orientations, "cell orientations")?)
        } else {
            None
        };

        let mut coefficients = Vec::with_capacity(info.coefficients.len());
        for &index in &info.coefficients {
            let function = form.coefficients().get(index).cloned().ok_or_else(|| {
                AssemblyError::invalid_form(
                    rank,
                    format!("kernel `{}` refers to missing coefficient {}", kernel.name(), index),
                )
            })?;
            let blocks = function
                .space()
                .blocks()
                .iter()
                .enumerate()
                .map(|(block, space_block)| {
                    args.push(LoopArg::Coefficient { index, block });
                    check.field(space_block, &format!("coefficient `{}`", function.name()))
                })
                .collect::<AssemblyResult<Vec<_>>>()?;
            coefficients.push(CoefficientArg {
                function,
                blocks,
            });
        }

        let targets = form
            .arguments()
            .iter()
            .zip(&kernel.indices)
            .map(|(space, &i)| {
                let block = space.blocks().get(i).ok_or_else(|| {
                    AssemblyError::invalid_form(
                        rank,
                        format!("kernel `{}` writes missing block {} of `{}`", kernel.name(), i, space.name()),
                    )
                })?;
                Ok((i, check.field(block, "argument")?))
            })
            .collect::<AssemblyResult<Vec<_>>>()?;

        for extra in descriptor.extra_args(info.needs_cell_facets) {
            if extra == ExtraArg::CellFacets && !topology.has_cell_facets() {
                return Err(AssemblyError::invalid_form(
                    rank,
                    format!(
                        "kernel `{}` needs cell facet connectivity, but the mesh provides none",
                        kernel.name()
                    ),
                ));
            }
            args.push(extra.into());
        }
        if info.pass_layer_arg && topology.is_extruded() {
            args.push(LoopArg::LayerIndex);
        }

        Ok(Self {
            kernel: Arc::clone(&kernel.kernel),
            kind: descriptor.kind,
            rank,
            iteration_set,
            topology,
            domain,
            coordinates,
            orientations,
            coefficients,
            targets,
            args,
            inverse,
            workspace: ThreadLocal::new(),
        })
    }

    pub fn kernel_name(&self) -> &str {
        self.kernel.name()
    }

    pub fn integral_kind(&self) -> IntegralKind {
        self.kind
    }

    pub fn iteration_set(&self) -> &IterationSet {
        &self.iteration_set
    }

    /// The block of the target tensor the loop accumulates into.
    pub fn target_block(&self) -> Vec<usize> {
        self.targets.iter().map(|(i, _)| *i).collect()
    }

    /// The kernel arguments, in call order.
    pub fn args(&self) -> &[LoopArg] {
        &self.args
    }

    /// Evaluate the kernel over the iteration set and add the result to `tensor`.
    pub fn execute(&self, tensor: &mut Tensor<T>) -> AssemblyResult<()> {
        debug!(
            "Accumulating kernel `{}` ({}) over {} {} into block {:?}",
            self.kernel.name(),
            self.kind,
            self.iteration_set.len(),
            self.iteration_set.kind(),
            self.target_block()
        );

        let coordinates = self.domain.coordinates().read();
        let orientations = match self.orientations {
            Some(_) => self.domain.cell_orientations().map(Function::read),
            None => None,
        };
        let coefficient_values: Vec<_> = self.coefficients.iter().map(|c| c.function.read()).collect();

        self.check_values(self.domain.coordinates(), &coordinates, std::slice::from_ref(&self.coordinates))?;
        if let (Some(values), Some(field), Some(function)) =
            (&orientations, &self.orientations, self.domain.cell_orientations())
        {
            self.check_values(function, values, std::slice::from_ref(field))?;
        }
        for (arg, values) in self.coefficients.iter().zip(&coefficient_values) {
            self.check_values(&arg.function, values, &arg.blocks)?;
        }

        let fields = GatheredFields {
            coordinates: &coordinates[0],
            orientations: orientations.as_deref().map(|values| &values[0]),
            coefficients: coefficient_values.iter().map(|values| values.as_slice()).collect(),
        };

        let items = self.iteration_set.items();
        let local_tensors = items
            .par_iter()
            .map(|&index| self.evaluate(index, &fields))
            .collect::<AssemblyResult<Vec<_>>>()?;

        for local in &local_tensors {
            self.scatter(tensor, local)?;
        }
        Ok(())
    }

    fn check_values(&self, function: &Function<T>, values: &[DVector<T>], fields: &[NodalField]) -> AssemblyResult<()> {
        let consistent = values.len() == fields.len()
            && values
                .iter()
                .zip(fields)
                .zip(function.space().blocks())
                .all(|((v, _), block)| v.len() == block.num_dofs());
        if consistent {
            Ok(())
        } else {
            Err(AssemblyError::invalid_form(
                self.rank,
                format!(
                    "values of `{}` do not match the layout of space `{}`",
                    function.name(),
                    function.space().name()
                ),
            ))
        }
    }

    fn evaluate(&self, index: EntityIndex, fields: &GatheredFields<'_, T>) -> AssemblyResult<LocalTensor<T>> {
        // The buffers are moved out of the cell while the kernel runs: a kernel that itself uses
        // rayon may have another item of this loop scheduled onto the same thread
        let cell = self.workspace.get_or_default();
        let mut ws = cell.take();
        let result = self.evaluate_with(&mut ws, index, fields);
        cell.replace(ws);
        result
    }

    fn evaluate_with(
        &self,
        ws: &mut GatherWorkspace<T>,
        index: EntityIndex,
        fields: &GatheredFields<'_, T>,
    ) -> AssemblyResult<LocalTensor<T>> {
        let region = self.iteration_set.region();

        self.coordinates
            .gather(&mut ws.coordinates, &mut ws.nodes, fields.coordinates, index, region);
        if let (Some(field), Some(values)) = (&self.orientations, fields.orientations) {
            field.gather(&mut ws.orientations, &mut ws.nodes, values, index, region);
        }

        let num_coefficient_blocks = self.coefficients.iter().map(|c| c.blocks.len()).sum();
        ws.coefficients.resize_with(num_coefficient_blocks, Vec::new);
        let mut buffers = ws.coefficients.iter_mut();
        for (arg, values) in self.coefficients.iter().zip(&fields.coefficients) {
            for (field, block_values) in arg.blocks.iter().zip(values.iter()) {
                if let Some(buffer) = buffers.next() {
                    field.gather(buffer, &mut ws.nodes, block_values, index, region);
                }
            }
        }

        let mut rows = Vec::new();
        let mut cols = Vec::new();
        if let Some((_, field)) = self.targets.first() {
            field.dofs(&mut rows, &mut ws.nodes, index, region);
        }
        if let Some((_, field)) = self.targets.get(1) {
            field.dofs(&mut cols, &mut ws.nodes, index, region);
        }
        let nrows = if self.rank >= 1 { rows.len() } else { 1 };
        let ncols = if self.rank == 2 { cols.len() } else { 1 };

        let entity_set = self.topology.entity_set(self.iteration_set.kind());
        let kernel_args = KernelArgs {
            entity: index.entity,
            layer: if self.args.contains(&LoopArg::LayerIndex) { index.layer } else { None },
            coordinates: &ws.coordinates,
            orientations: self.orientations.as_ref().map(|_| ws.orientations.as_slice()),
            coefficients: &ws.coefficients,
            local_facet_numbers: self
                .args
                .contains(&LoopArg::LocalFacetNumber)
                .then(|| entity_set.local_facet_numbers(index.entity)),
            cell_facets: self
                .args
                .contains(&LoopArg::CellFacets)
                .then(|| self.topology.cell_facets(index.entity)),
        };

        let mut values = DMatrix::zeros(nrows, ncols);
        self.kernel
            .evaluate(&mut values, &kernel_args)
            .map_err(|report| self.kernel_failure(index, report))?;

        if self.inverse {
            if !values.is_square() {
                return Err(self.kernel_failure(index, eyre!("cannot invert non-square local matrix")));
            }
            values = values
                .try_inverse()
                .ok_or_else(|| self.kernel_failure(index, eyre!("local matrix is singular")))?;
        }

        Ok(LocalTensor { rows, cols, values })
    }

    fn kernel_failure(&self, index: EntityIndex, report: eyre::Report) -> AssemblyError {
        AssemblyError::KernelFailure {
            kernel: self.kernel.name().to_string(),
            entity: index.entity,
            report,
        }
    }

    fn scatter(&self, tensor: &mut Tensor<T>, local: &LocalTensor<T>) -> AssemblyResult<()> {
        match (tensor, self.targets.as_slice()) {
            (Tensor::Scalar(value), []) => {
                *value += local.values[(0, 0)];
                Ok(())
            }
            (Tensor::Vector(vector), [(i, _)]) => vector.add_local(*i, &local.rows, &local.values),
            (Tensor::Matrix(matrix), [(i, _), (j, _)]) => {
                matrix.add_local(*i, *j, &local.rows, &local.cols, &local.values)
            }
            (other, _) => Err(AssemblyError::invalid_target(
                self.rank,
                format!("cannot accumulate into a tensor of rank {}", other.rank()),
            )),
        }
    }
}

/// Values of every field read by a loop, borrowed for the duration of one execution.
struct GatheredFields<'a, T> {
    coordinates: &'a DVector<T>,
    orientations: Option<&'a DVector<T>>,
    coefficients: Vec<&'a [DVector<T>]>,
}

struct MapCheck<'a> {
    kernel: &'a str,
    descriptor: &'a IntegralDescriptor,
    topology: &'a MeshTopology,
}

impl MapCheck<'_> {
    fn mismatch(&self, reason: String) -> AssemblyError {
        AssemblyError::MapMismatch {
            kernel: self.kernel.to_string(),
            kind: self.descriptor.kind.to_string(),
            reason,
        }
    }

    fn single_block_field<T>(&self, function: &Function<T>, what: &str) -> AssemblyResult<NodalField> {
        match function.space().blocks() {
            [block] => self.field(block, &format!("{} `{}`", what, function.name())),
            blocks => Err(self.mismatch(format!(
                "{} `{}` must live on a non-mixed space, but has {} blocks",
                what,
                function.name(),
                blocks.len()
            ))),
        }
    }

    fn field(&self, block: &SpaceBlock, what: &str) -> AssemblyResult<NodalField> {
        let kind = self.descriptor.map;
        let map = block
            .map(kind)
            .ok_or_else(|| self.mismatch(format!("{} on `{}` has no {:?} map", what, block.name(), kind)))?;

        let expected = self.topology.num_entities(self.descriptor.entity_set);
        if map.num_sources() != expected {
            return Err(self.mismatch(format!(
                "{:?} map of {} on `{}` has {} sources, but the domain has {} {}",
                kind,
                what,
                block.name(),
                map.num_sources(),
                expected,
                self.descriptor.entity_set
            )));
        }
        if map.is_extruded() != self.topology.is_extruded() {
            return Err(self.mismatch(format!(
                "{:?} map of {} on `{}` is {}extruded, but the domain is {}extruded",
                kind,
                what,
                block.name(),
                if map.is_extruded() { "" } else { "not " },
                if self.topology.is_extruded() { "" } else { "not " }
            )));
        }
        if let Some(node) = map
            .max_node(self.topology.layers())
            .filter(|&node| node >= block.num_nodes())
        {
            return Err(self.mismatch(format!(
                "{:?} map of {} reaches node {}, but `{}` has {} nodes",
                kind,
                what,
                node,
                block.name(),
                block.num_nodes()
            )));
        }

        Ok(NodalField {
            map: map.clone(),
            block_size: block.block_size(),
        })
    }
}
