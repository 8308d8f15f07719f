use ::proptest::collection::vec;
use ::proptest::prelude::*;
use ::proptest::sample::{select, subsequence};
use nalgebra::DVector;

/// Number of cells of a procedurally generated interval.
pub fn interval_cells(max_cells: usize) -> impl Strategy<Value = usize> {
    1..=max_cells.max(1)
}

/// One marker per entity, each drawn from the given tags.
pub fn subdomain_markers(num_entities: usize, tags: Vec<i32>) -> impl Strategy<Value = Vec<Option<i32>>> {
    vec(select(tags).prop_map(Some), num_entities)
}

/// Sorted subsets of the nodes `0 .. num_nodes`.
pub fn node_subset(num_nodes: usize) -> impl Strategy<Value = Vec<usize>> {
    subsequence((0..num_nodes).collect::<Vec<_>>(), 0..=num_nodes)
}

pub fn nodal_values(len: usize) -> impl Strategy<Value = DVector<f64>> {
    // Keep values in a modest range, so that sums over many entities stay well conditioned
    vec(-10.0..10.0, len).prop_map(DVector::from_vec)
}
