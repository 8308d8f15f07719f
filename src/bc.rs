//! Dirichlet boundary conditions and their application to assembled tensors.
use crate::error::{AssemblyError, AssemblyResult};
use crate::space::{SpaceBlock, SpaceView};
use crate::tensor::{BlockMatrix, BlockVector, Tensor};
use crate::topology::{EntityIndex, EntitySetKind, IterationRegion, MeshTopology};
use crate::Real;
use nalgebra::DVector;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Prescribed values of a boundary condition.
#[derive(Debug, Clone, PartialEq)]
pub enum BcValue<T> {
    /// The same value for every constrained degree of freedom.
    Constant(T),
    /// One value per degree of freedom of the constrained block.
    Nodal(DVector<T>),
}

/// The nodes a boundary condition constrains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BcNodes {
    Explicit(Vec<usize>),
    /// All nodes on exterior facets carrying one of the given markers.
    ///
    /// Requires the space to provide a boundary node map.
    OnBoundary {
        topology: Arc<MeshTopology>,
        markers: Vec<i32>,
    },
}

/// A Dirichlet boundary condition on a (sub) space.
#[derive(Debug, Clone, PartialEq)]
pub struct DirichletBC<T> {
    space: SpaceView,
    value: BcValue<T>,
    nodes: BcNodes,
}

impl<T: Real> DirichletBC<T> {
    pub fn new(space: SpaceView, value: BcValue<T>, nodes: Vec<usize>) -> Self {
        Self {
            space,
            value,
            nodes: BcNodes::Explicit(nodes),
        }
    }

    /// A boundary condition with value zero on the given nodes.
    pub fn homogeneous(space: SpaceView, nodes: Vec<usize>) -> Self {
        Self::new(space, BcValue::Constant(T::zero()), nodes)
    }

    /// A boundary condition on all nodes of exterior facets with the given markers.
    pub fn on_boundary(space: SpaceView, value: BcValue<T>, topology: Arc<MeshTopology>, markers: Vec<i32>) -> Self {
        Self {
            space,
            value,
            nodes: BcNodes::OnBoundary { topology, markers },
        }
    }

    pub fn space(&self) -> &SpaceView {
        &self.space
    }

    pub fn value(&self) -> &BcValue<T> {
        &self.value
    }

    pub fn nodes(&self) -> &BcNodes {
        &self.nodes
    }

    /// Whether the constrained nodes are known without further computation.
    pub fn is_resolved(&self) -> bool {
        matches!(self.nodes, BcNodes::Explicit(_))
    }

    /// A copy of this boundary condition with marker-based nodes replaced by explicit nodes.
    pub fn resolve(&self) -> AssemblyResult<Self> {
        Ok(Self {
            space: self.space.clone(),
            value: self.value.clone(),
            nodes: BcNodes::Explicit(self.resolved_nodes()?),
        })
    }

    /// The sorted, unique nodes constrained by this boundary condition.
    pub fn resolved_nodes(&self) -> AssemblyResult<Vec<usize>> {
        let block = self.space.block()?;
        let nodes: BTreeSet<usize> = match &self.nodes {
            BcNodes::Explicit(nodes) => nodes.iter().copied().collect(),
            BcNodes::OnBoundary { topology, markers } => boundary_nodes(block, topology, markers)?,
        };
        if let Some(&node) = nodes.iter().find(|&&node| node >= block.num_nodes()) {
            return Err(AssemblyError::MapMismatch {
                kernel: format!("boundary condition on `{}`", self.space.name()),
                kind: EntitySetKind::ExteriorFacets.to_string(),
                reason: format!("node {} is out of bounds for {} nodes", node, block.num_nodes()),
            });
        }
        Ok(nodes.into_iter().collect())
    }

    /// The constrained degrees of freedom, local to the block of the top-level index.
    pub fn constrained_dofs(&self) -> AssemblyResult<Vec<usize>> {
        let bs = self.space.block()?.block_size();
        let nodes = self.resolved_nodes()?;
        let dofs = match self.space.component_index() {
            Some(c) => nodes.iter().map(|node| bs * node + c).collect(),
            None => nodes
                .iter()
                .flat_map(|node| (0..bs).map(move |c| bs * node + c))
                .collect(),
        };
        Ok(dofs)
    }

    fn value_at(&self, dof: usize) -> AssemblyResult<T> {
        match &self.value {
            BcValue::Constant(value) => Ok(*value),
            BcValue::Nodal(values) => values.get(dof).copied().ok_or_else(|| {
                AssemblyError::invalid_target(
                    1,
                    format!(
                        "boundary condition on `{}` has {} values, but constrains degree of freedom {}",
                        self.space.name(),
                        values.len(),
                        dof
                    ),
                )
            }),
        }
    }
}

fn boundary_nodes(block: &SpaceBlock, topology: &MeshTopology, markers: &[i32]) -> AssemblyResult<BTreeSet<usize>> {
    let map = block
        .boundary_node_map()
        .ok_or_else(|| AssemblyError::MapMismatch {
            kernel: format!("boundary condition on `{}`", block.name()),
            kind: EntitySetKind::ExteriorFacets.to_string(),
            reason: "the space has no boundary node map".to_string(),
        })?;
    let facets = topology.entity_set(EntitySetKind::ExteriorFacets);
    if map.num_sources() != facets.len() {
        return Err(AssemblyError::MapMismatch {
            kernel: format!("boundary condition on `{}`", block.name()),
            kind: EntitySetKind::ExteriorFacets.to_string(),
            reason: format!(
                "boundary node map has {} sources, but the mesh has {} exterior facets",
                map.num_sources(),
                facets.len()
            ),
        });
    }

    let layers: Vec<Option<usize>> = match (topology.layers(), map.is_extruded()) {
        (Some(layers), true) => (0..=layers).map(Some).collect(),
        _ => vec![None],
    };
    let mut nodes = Vec::new();
    for facet in (0..facets.len()).filter(|&f| facets.marker(f).map_or(false, |m| markers.contains(&m))) {
        for &layer in &layers {
            let index = EntityIndex { entity: facet, layer };
            map.extend_nodes(&mut nodes, index, IterationRegion::All);
        }
    }
    Ok(nodes.into_iter().collect())
}

/// Resolve the block and degrees of freedom of every boundary condition up front, so that
/// no tensor is modified when any of them is invalid.
fn constrained_blocks<T: Real>(bcs: &[DirichletBC<T>], num_blocks: usize) -> AssemblyResult<Vec<(usize, Vec<usize>)>> {
    bcs.iter()
        .map(|bc| {
            let k = bc.space().top_level_index()?;
            if k >= num_blocks {
                return Err(AssemblyError::invalid_target(
                    2,
                    format!(
                        "boundary condition on `{}` refers to block {} of a tensor with {} blocks",
                        bc.space().name(),
                        k,
                        num_blocks
                    ),
                ));
            }
            Ok((k, bc.constrained_dofs()?))
        })
        .collect()
}

/// Constrain a matrix: every constrained row and column of the diagonal block of the
/// condition's top-level index is zeroed, with one on the diagonal.
pub fn apply_to_matrix<T: Real>(matrix: &mut BlockMatrix<T>, bcs: &[DirichletBC<T>]) -> AssemblyResult<()> {
    let (nrow_blocks, ncol_blocks) = matrix.block_shape();
    for (k, dofs) in constrained_blocks(bcs, nrow_blocks.min(ncol_blocks))? {
        matrix.constrain_diagonal_block(k, &dofs, T::one())?;
    }
    Ok(())
}

/// Overwrite the constrained entries of a vector with their prescribed values.
pub fn apply_to_vector<T: Real>(vector: &mut BlockVector<T>, bcs: &[DirichletBC<T>]) -> AssemblyResult<()> {
    let constrained = constrained_blocks(bcs, vector.num_blocks())?;
    for ((k, dofs), bc) in constrained.iter().zip(bcs) {
        let len = vector.block(*k).len();
        if let Some(&dof) = dofs.iter().find(|&&dof| dof >= len) {
            return Err(AssemblyError::invalid_target(
                1,
                format!("constrained degree of freedom {dof} is out of bounds for vector block {k} of length {len}"),
            ));
        }
        let block = vector.block_mut(*k);
        for &dof in dofs {
            block[dof] = bc.value_at(dof)?;
        }
    }
    Ok(())
}

/// Apply boundary conditions to a tensor of any rank.
///
/// Scalars carry no boundary conditions, and matrix-free operators apply their own.
pub fn apply<T: Real>(tensor: &mut Tensor<T>, bcs: &[DirichletBC<T>]) -> AssemblyResult<()> {
    match tensor {
        Tensor::Matrix(matrix) => apply_to_matrix(matrix, bcs),
        Tensor::Vector(vector) => apply_to_vector(vector, bcs),
        Tensor::Scalar(_) | Tensor::Implicit(_) => Ok(()),
    }
}
