//! Function spaces, mixed spaces and coefficient functions.
use crate::error::{AssemblyError, AssemblyResult};
use crate::integral::MapKind;
use crate::topology::{EntitySetKind, IndexMap, MeshTopology};
use crate::Real;
use nalgebra::DVector;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// The degree-of-freedom layout of a single (non-mixed) space.
///
/// Each node carries `block_size` degrees of freedom, numbered `block_size * node + component`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceBlock {
    name: String,
    num_nodes: usize,
    block_size: usize,
    global: bool,
    cell_map: IndexMap,
    exterior_facet_map: Option<IndexMap>,
    interior_facet_map: Option<IndexMap>,
    boundary_node_map: Option<IndexMap>,
}

impl SpaceBlock {
    pub fn new(name: impl Into<String>, block_size: usize, cell_map: IndexMap) -> Self {
        assert!(block_size > 0, "Block size must be positive");
        assert_eq!(cell_map.source(), EntitySetKind::Cells);
        Self {
            name: name.into(),
            num_nodes: cell_map.num_targets(),
            block_size,
            global: false,
            cell_map,
            exterior_facet_map: None,
            interior_facet_map: None,
            boundary_node_map: None,
        }
    }

    /// A space of a single global degree of freedom shared by every entity ("R" space).
    ///
    /// Such spaces cannot be stored with block sparsity.
    pub fn real(name: impl Into<String>, topology: &MeshTopology) -> Self {
        let global_map = |kind| {
            let map = IndexMap::global(kind, topology.num_entities(kind));
            if topology.is_extruded() {
                map.with_layer_offsets(vec![0])
            } else {
                map
            }
        };
        let mut space = Self::new(name, 1, global_map(EntitySetKind::Cells))
            .with_exterior_facet_map(global_map(EntitySetKind::ExteriorFacets))
            .with_interior_facet_map(global_map(EntitySetKind::InteriorFacets));
        space.global = true;
        space
    }

    pub fn with_exterior_facet_map(mut self, map: IndexMap) -> Self {
        assert_eq!(map.source(), EntitySetKind::ExteriorFacets);
        assert_eq!(map.num_targets(), self.num_nodes, "Map must target the nodes of the space");
        self.exterior_facet_map = Some(map);
        self
    }

    pub fn with_interior_facet_map(mut self, map: IndexMap) -> Self {
        assert_eq!(map.source(), EntitySetKind::InteriorFacets);
        assert_eq!(map.num_targets(), self.num_nodes, "Map must target the nodes of the space");
        self.interior_facet_map = Some(map);
        self
    }

    /// Attach the map from exterior facets to the nodes lying on each facet.
    ///
    /// Used to resolve boundary conditions given by facet markers. On extruded meshes the map
    /// lists the bottom node(s) of each facet column, and is repeated for every node level.
    pub fn with_boundary_node_map(mut self, map: IndexMap) -> Self {
        assert_eq!(map.source(), EntitySetKind::ExteriorFacets);
        assert_eq!(map.num_targets(), self.num_nodes, "Map must target the nodes of the space");
        self.boundary_node_map = Some(map);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_dofs(&self) -> usize {
        self.num_nodes * self.block_size
    }

    /// Whether all nodes can be stored as uniform dense blocks.
    pub fn is_blockable(&self) -> bool {
        !self.global
    }

    pub fn map(&self, kind: MapKind) -> Option<&IndexMap> {
        match kind {
            MapKind::Cell => Some(&self.cell_map),
            MapKind::ExteriorFacet => self.exterior_facet_map.as_ref(),
            MapKind::InteriorFacet => self.interior_facet_map.as_ref(),
        }
    }

    pub fn boundary_node_map(&self) -> Option<&IndexMap> {
        self.boundary_node_map.as_ref()
    }
}

/// A function space, possibly mixed.
///
/// A non-mixed space has exactly one block. The blocks of a mixed space are identified by
/// their top-level index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpace {
    name: String,
    blocks: Vec<SpaceBlock>,
}

impl FunctionSpace {
    pub fn new(block: SpaceBlock) -> Self {
        Self {
            name: block.name().to_string(),
            blocks: vec![block],
        }
    }

    pub fn mixed(name: impl Into<String>, blocks: Vec<SpaceBlock>) -> Self {
        assert!(!blocks.is_empty(), "A mixed space needs at least one block");
        Self {
            name: name.into(),
            blocks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_mixed(&self) -> bool {
        self.blocks.len() > 1
    }

    pub fn block(&self, index: usize) -> &SpaceBlock {
        &self.blocks[index]
    }

    pub fn blocks(&self) -> &[SpaceBlock] {
        &self.blocks
    }

    /// Number of degrees of freedom in each block.
    pub fn block_dofs(&self) -> Vec<usize> {
        self.blocks.iter().map(SpaceBlock::num_dofs).collect()
    }

    pub fn num_dofs(&self) -> usize {
        self.blocks.iter().map(SpaceBlock::num_dofs).sum()
    }
}

/// A view of a function space used to define boundary conditions: the whole space, one
/// indexed block of a mixed space, or a single vector component of either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceView {
    space: Arc<FunctionSpace>,
    index: Option<usize>,
    component: Option<usize>,
}

impl SpaceView {
    pub fn whole(space: Arc<FunctionSpace>) -> Self {
        Self {
            space,
            index: None,
            component: None,
        }
    }

    /// The block with the given top-level index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn sub(space: Arc<FunctionSpace>, index: usize) -> Self {
        assert!(index < space.num_blocks(), "Sub space index out of bounds");
        Self {
            space,
            index: Some(index),
            component: None,
        }
    }

    /// Restrict the view to a single vector component of each node.
    ///
    /// # Panics
    ///
    /// Panics if the component exceeds the block size of the viewed block(s).
    pub fn component(mut self, component: usize) -> Self {
        let block_size = match self.index {
            Some(index) => self.space.block(index).block_size(),
            None => self.space.blocks().iter().map(SpaceBlock::block_size).max().unwrap_or(1),
        };
        assert!(component < block_size, "Component index out of bounds");
        self.component = Some(component);
        self
    }

    pub fn space(&self) -> &Arc<FunctionSpace> {
        &self.space
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn component_index(&self) -> Option<usize> {
        self.component
    }

    pub fn name(&self) -> String {
        match (self.index, self.component) {
            (None, None) => self.space.name().to_string(),
            (Some(i), None) => format!("{}[{}]", self.space.name(), i),
            (None, Some(c)) => format!("{}.sub({})", self.space.name(), c),
            (Some(i), Some(c)) => format!("{}[{}].sub({})", self.space.name(), i, c),
        }
    }

    /// The top-level mixed index this view belongs to.
    ///
    /// A component view resolves through its parent. An un-indexed view of a mixed space is
    /// ambiguous.
    pub fn top_level_index(&self) -> AssemblyResult<usize> {
        match self.index {
            Some(index) => Ok(index),
            None if self.space.is_mixed() => Err(AssemblyError::AmbiguousBoundaryCondition {
                space: self.space.name().to_string(),
                num_blocks: self.space.num_blocks(),
            }),
            None => Ok(0),
        }
    }

    pub fn block(&self) -> AssemblyResult<&SpaceBlock> {
        Ok(self.space.block(self.top_level_index()?))
    }
}

/// A discrete function: one coefficient vector per block of its space.
///
/// Cloning a `Function` yields a handle to the *same* values, so values updated through one
/// handle are seen by every form and assembler holding another.
#[derive(Debug, Clone)]
pub struct Function<T> {
    name: String,
    space: Arc<FunctionSpace>,
    component: Option<usize>,
    values: Arc<RwLock<Vec<DVector<T>>>>,
}

impl<T: Real> Function<T> {
    pub fn zeros(name: impl Into<String>, space: Arc<FunctionSpace>) -> Self {
        let values = space.blocks().iter().map(|b| DVector::zeros(b.num_dofs())).collect();
        Self {
            name: name.into(),
            space,
            component: None,
            values: Arc::new(RwLock::new(values)),
        }
    }

    /// Construct a function from the values of each block.
    ///
    /// # Panics
    ///
    /// Panics if the values do not match the layout of the space.
    pub fn from_blocks(name: impl Into<String>, space: Arc<FunctionSpace>, blocks: Vec<DVector<T>>) -> Self {
        assert_eq!(blocks.len(), space.num_blocks(), "Need one value vector per block");
        for (block, values) in space.blocks().iter().zip(&blocks) {
            assert_eq!(values.len(), block.num_dofs(), "Block values must match block dofs");
        }
        Self {
            name: name.into(),
            space,
            component: None,
            values: Arc::new(RwLock::new(blocks)),
        }
    }

    /// A handle to a single vector component of this function, sharing its values.
    pub fn sub_component(&self, component: usize) -> Self {
        Self {
            component: Some(component),
            ..self.clone()
        }
    }
}

impl<T> Function<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> &Arc<FunctionSpace> {
        &self.space
    }

    /// The vector component this function was subscripted with, if any.
    pub fn component(&self) -> Option<usize> {
        self.component
    }

    /// Shared access to the values of each block.
    ///
    /// Recursive, so the same function may be read as both coordinates and coefficient of one loop.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<DVector<T>>> {
        self.values.read_recursive()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<DVector<T>>> {
        self.values.write()
    }
}
