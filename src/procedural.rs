//! Procedural generation of interval meshes, possibly extruded, and of the low order spaces on
//! them.
//!
//! Exterior facets of the interval are numbered left to right and marked `1` (left) and `2`
//! (right). Interior facet `f` joins cells `f` and `f + 1`.
use crate::space::{Function, FunctionSpace, SpaceBlock};
use crate::topology::{EntitySetKind, IndexMap, MeshTopology};
use crate::Real;
use nalgebra::{convert, DVector};
use std::sync::Arc;

/// Marker of the left end of the interval.
pub const LEFT_MARKER: i32 = 1;
/// Marker of the right end of the interval.
pub const RIGHT_MARKER: i32 = 2;

/// The unit interval split into `cells` cells of equal size.
///
/// Each cell has two facets, and its cell facet connectivity records for each of them
/// whether it is interior (`1`) or exterior (`0`).
pub fn create_unit_interval_topology(cells: usize) -> MeshTopology {
    assert!(cells > 0, "Need at least one cell");
    let cell_facets = (0..cells)
        .flat_map(|c| [usize::from(c > 0), usize::from(c + 1 < cells)])
        .collect();
    MeshTopology::with_cells(cells)
        .with_exterior_facets(vec![0, 1])
        .with_interior_facets(vec![[1, 0]; cells - 1])
        .with_cell_facets(2, cell_facets)
        .with_markers(EntitySetKind::ExteriorFacets, vec![Some(LEFT_MARKER), Some(RIGHT_MARKER)])
}

/// The unit interval with `cells` cells, extruded into the unit square with `layers` layers.
pub fn create_extruded_unit_interval_topology(cells: usize, layers: usize) -> MeshTopology {
    create_unit_interval_topology(cells).extruded(layers)
}

/// Piecewise linear space with `block_size` components per node on an interval with `cells`
/// cells.
pub fn create_interval_p1_space(name: impl Into<String>, cells: usize, block_size: usize) -> SpaceBlock {
    let num_nodes = cells + 1;
    let cell_map = IndexMap::new(
        EntitySetKind::Cells,
        2,
        num_nodes,
        (0..cells).flat_map(|c| [c, c + 1]).collect(),
    );
    let exterior_facet_map = IndexMap::new(EntitySetKind::ExteriorFacets, 1, num_nodes, vec![0, cells]);
    let interior_facet_map = IndexMap::new(
        EntitySetKind::InteriorFacets,
        4,
        num_nodes,
        (0..cells - 1).flat_map(|f| [f, f + 1, f + 1, f + 2]).collect(),
    );
    SpaceBlock::new(name, block_size, cell_map)
        .with_exterior_facet_map(exterior_facet_map.clone())
        .with_interior_facet_map(interior_facet_map)
        .with_boundary_node_map(exterior_facet_map)
}

/// Bilinear space on an extruded interval.
///
/// The nodes of each vertex column are numbered consecutively from bottom to top. Cell nodes
/// are ordered bottom left, bottom right, top left, top right.
pub fn create_extruded_interval_q1_space(
    name: impl Into<String>,
    cells: usize,
    layers: usize,
    block_size: usize,
) -> SpaceBlock {
    let levels = layers + 1;
    let num_nodes = (cells + 1) * levels;
    let column = |vertex: usize| vertex * levels;

    let cell_nodes = |c: usize| [column(c), column(c + 1), column(c) + 1, column(c + 1) + 1];
    let cell_map = IndexMap::new(EntitySetKind::Cells, 4, num_nodes, (0..cells).flat_map(cell_nodes).collect())
        .with_layer_offsets(vec![1; 4]);
    let exterior_facet_map = IndexMap::new(
        EntitySetKind::ExteriorFacets,
        2,
        num_nodes,
        vec![column(0), column(0) + 1, column(cells), column(cells) + 1],
    )
    .with_layer_offsets(vec![1; 2]);
    let interior_facet_map = IndexMap::new(
        EntitySetKind::InteriorFacets,
        8,
        num_nodes,
        (0..cells - 1)
            .flat_map(|f| cell_nodes(f).into_iter().chain(cell_nodes(f + 1)))
            .collect(),
    )
    .with_layer_offsets(vec![1; 8]);
    let boundary_node_map = IndexMap::new(EntitySetKind::ExteriorFacets, 1, num_nodes, vec![column(0), column(cells)])
        .with_layer_offsets(vec![1]);

    SpaceBlock::new(name, block_size, cell_map)
        .with_exterior_facet_map(exterior_facet_map)
        .with_interior_facet_map(interior_facet_map)
        .with_boundary_node_map(boundary_node_map)
}

/// Coordinates of the uniform unit interval on a scalar P1 space.
pub fn create_unit_interval_coordinates<T: Real>(space: Arc<FunctionSpace>) -> Function<T> {
    let num_nodes = space.block(0).num_nodes();
    let cells = num_nodes - 1;
    let x = DVector::from_fn(num_nodes, |i, _| convert::<f64, T>(i as f64 / cells as f64));
    Function::from_blocks("coordinates", space, vec![x])
}

/// Coordinates of the uniform unit square on a two-component Q1 space of an extruded interval.
pub fn create_extruded_unit_interval_coordinates<T: Real>(space: Arc<FunctionSpace>, cells: usize) -> Function<T> {
    let num_nodes = space.block(0).num_nodes();
    let levels = num_nodes / (cells + 1);
    let layers = levels - 1;
    let mut values = DVector::zeros(2 * num_nodes);
    for node in 0..num_nodes {
        let (vertex, level) = (node / levels, node % levels);
        values[2 * node] = convert(vertex as f64 / cells as f64);
        values[2 * node + 1] = convert(level as f64 / layers as f64);
    }
    Function::from_blocks("coordinates", space, vec![values])
}
