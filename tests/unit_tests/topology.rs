use fenris_assembly::form::SubdomainId;
use fenris_assembly::procedural::{
    create_extruded_interval_q1_space, create_extruded_unit_interval_topology, create_unit_interval_topology,
    LEFT_MARKER, RIGHT_MARKER,
};
use fenris_assembly::integral::MapKind;
use fenris_assembly::proptest::subdomain_markers;
use fenris_assembly::topology::{
    DecoratedMap, EntityIndex, EntitySetKind, IndexMap, IterationRegion, MeshTopology,
};
use fenris_assembly::AssemblyError;
use proptest::prelude::*;

fn marked_cells(markers: Vec<Option<i32>>) -> MeshTopology {
    MeshTopology::with_cells(markers.len()).with_markers(EntitySetKind::Cells, markers)
}

#[test]
fn unit_interval_topology_has_expected_entities() {
    let topology = create_unit_interval_topology(4);
    assert_eq!(topology.num_entities(EntitySetKind::Cells), 4);
    assert_eq!(topology.num_entities(EntitySetKind::ExteriorFacets), 2);
    assert_eq!(topology.num_entities(EntitySetKind::InteriorFacets), 3);
    assert!(!topology.is_extruded());
    assert!(topology.has_cell_facets());

    let exterior = topology.entity_set(EntitySetKind::ExteriorFacets);
    assert_eq!(exterior.marker(0), Some(LEFT_MARKER));
    assert_eq!(exterior.marker(1), Some(RIGHT_MARKER));
    assert_eq!(exterior.local_facet_numbers(0), &[0]);
    assert_eq!(exterior.local_facet_numbers(1), &[1]);

    let interior = topology.entity_set(EntitySetKind::InteriorFacets);
    assert_eq!(interior.local_facet_numbers(2), &[1, 0]);

    assert_eq!(topology.cell_facets(0), &[0, 1]);
    assert_eq!(topology.cell_facets(1), &[1, 1]);
    assert_eq!(topology.cell_facets(3), &[1, 0]);
}

#[test]
fn measure_set_everywhere_visits_all_entities() {
    let topology = marked_cells(vec![Some(1), None, Some(2)]);
    let set = topology
        .measure_set(EntitySetKind::Cells, IterationRegion::All, &SubdomainId::Everywhere, &[1, 2])
        .unwrap();
    assert_eq!(set.entities(), &[0, 1, 2]);
    assert_eq!(set.len(), 3);
}

#[test]
fn measure_set_tag_and_otherwise() {
    let topology = marked_cells(vec![Some(1), None, Some(2), Some(3), Some(1)]);
    let measure = |subdomain| {
        topology
            .measure_set(EntitySetKind::Cells, IterationRegion::All, &subdomain, &[1, 2])
            .unwrap()
            .entities()
            .to_vec()
    };
    assert_eq!(measure(SubdomainId::Tag(1)), vec![0, 4]);
    assert_eq!(measure(SubdomainId::Tag(2)), vec![2]);
    assert_eq!(measure(SubdomainId::Tag(7)), Vec::<usize>::new());
    // Unmarked entities and entities with tags nobody asked for
    assert_eq!(measure(SubdomainId::Otherwise), vec![1, 3]);
}

#[test]
fn measure_set_rejects_layer_restriction_on_flat_mesh() {
    let topology = create_unit_interval_topology(2);
    for region in [IterationRegion::Top, IterationRegion::Bottom, IterationRegion::InteriorFacets] {
        let result = topology.measure_set(EntitySetKind::Cells, region, &SubdomainId::Otherwise, &[]);
        assert!(matches!(result, Err(AssemblyError::MapMismatch { .. })), "{region:?}");
    }
}

#[test]
fn extruded_iteration_sets_visit_restricted_layers() {
    let topology = create_extruded_unit_interval_topology(2, 3);
    assert_eq!(topology.layers(), Some(3));
    let items = |region| {
        topology
            .measure_set(EntitySetKind::Cells, region, &SubdomainId::Otherwise, &[])
            .unwrap()
            .items()
            .into_iter()
            .map(|EntityIndex { entity, layer }| (entity, layer.unwrap()))
            .collect::<Vec<_>>()
    };
    assert_eq!(items(IterationRegion::All), vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    assert_eq!(items(IterationRegion::Top), vec![(0, 2), (1, 2)]);
    assert_eq!(items(IterationRegion::Bottom), vec![(0, 0), (1, 0)]);
    assert_eq!(items(IterationRegion::InteriorFacets), vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
}

#[test]
fn single_layer_has_no_horizontal_interior_facets() {
    let topology = create_extruded_unit_interval_topology(3, 1);
    let set = topology
        .measure_set(EntitySetKind::Cells, IterationRegion::InteriorFacets, &SubdomainId::Otherwise, &[])
        .unwrap();
    assert!(set.is_empty());
}

#[test]
fn index_map_extends_nodes_per_layer() {
    let map = IndexMap::new(EntitySetKind::Cells, 2, 6, vec![0, 3]).with_layer_offsets(vec![1, 1]);
    let mut nodes = Vec::new();
    let index = EntityIndex { entity: 0, layer: Some(1) };
    map.extend_nodes(&mut nodes, index, IterationRegion::All);
    assert_eq!(nodes, vec![1, 4]);

    nodes.clear();
    map.extend_nodes(&mut nodes, index, IterationRegion::InteriorFacets);
    // Nodes of the cell below, followed by those of the cell above
    assert_eq!(nodes, vec![1, 4, 2, 5]);
    assert_eq!(map.local_arity(IterationRegion::InteriorFacets), 4);
    assert_eq!(map.local_arity(IterationRegion::Top), 2);
}

#[test]
fn index_map_max_node_accounts_for_layers() {
    let map = IndexMap::new(EntitySetKind::Cells, 2, 8, vec![0, 4]).with_layer_offsets(vec![1, 1]);
    assert_eq!(map.max_node(None), Some(4));
    assert_eq!(map.max_node(Some(3)), Some(6));

    let flat = IndexMap::new(EntitySetKind::Cells, 2, 3, vec![0, 1, 1, 2]);
    assert_eq!(flat.max_node(None), Some(2));
    let empty = IndexMap::new(EntitySetKind::InteriorFacets, 0, 3, vec![]);
    assert_eq!(empty.max_node(None), None);
}

#[test]
fn global_map_targets_a_single_node() {
    let map = IndexMap::global(EntitySetKind::Cells, 4);
    assert_eq!(map.num_sources(), 4);
    assert_eq!(map.num_targets(), 1);
    assert!((0..4).all(|e| map.base_nodes(e) == [0]));
}

#[test]
fn decorated_map_items_only_cover_requested_regions() {
    let space = create_extruded_interval_q1_space("Q", 2, 3, 1);
    let map = space.map(MapKind::Cell).unwrap();
    let regions = [IterationRegion::Top, IterationRegion::Bottom];
    let items = DecoratedMap::new(map, &regions).items(Some(3));
    let layers: Vec<_> = items.iter().map(|(index, region)| (index.entity, index.layer, *region)).collect();
    assert_eq!(
        layers,
        vec![
            (0, Some(2), IterationRegion::Top),
            (0, Some(0), IterationRegion::Bottom),
            (1, Some(2), IterationRegion::Top),
            (1, Some(0), IterationRegion::Bottom),
        ]
    );
}

proptest! {
    #[test]
    fn tagged_and_otherwise_subdomains_partition_entities(markers in subdomain_markers(12, vec![1, 2, 3])) {
        let topology = marked_cells(markers);
        let explicit = [1, 3];
        let mut visited: Vec<usize> = explicit
            .iter()
            .map(|&tag| SubdomainId::Tag(tag))
            .chain([SubdomainId::Otherwise])
            .flat_map(|subdomain| {
                topology
                    .measure_set(EntitySetKind::Cells, IterationRegion::All, &subdomain, &explicit)
                    .unwrap()
                    .entities()
                    .to_vec()
            })
            .collect();
        visited.sort_unstable();
        prop_assert_eq!(visited, (0..12).collect::<Vec<_>>());
    }
}
