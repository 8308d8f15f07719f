//! Mesh topology data consumed by assembly: entity sets, subdomain markers, local facet numbers,
//! extruded layers and entity-to-node index maps.
use crate::error::{AssemblyError, AssemblyResult};
use crate::form::SubdomainId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of mesh entities a kernel can be iterated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntitySetKind {
    Cells,
    ExteriorFacets,
    InteriorFacets,
}

impl fmt::Display for EntitySetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntitySetKind::Cells => "cells",
            EntitySetKind::ExteriorFacets => "exterior facets",
            EntitySetKind::InteriorFacets => "interior facets",
        };
        write!(f, "{name}")
    }
}

/// Restriction of the layers visited on an extruded mesh.
///
/// On a non-extruded mesh only [`IterationRegion::All`] is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IterationRegion {
    /// Every layer.
    All,
    /// Only the top layer.
    Top,
    /// Only the bottom layer.
    Bottom,
    /// The horizontal facets between consecutive layers.
    InteriorFacets,
}

/// A single item of an iteration set: a base entity and, on extruded meshes, a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityIndex {
    pub entity: usize,
    pub layer: Option<usize>,
}

/// A set of mesh entities of one kind, with optional subdomain markers and local facet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySet {
    kind: EntitySetKind,
    markers: Vec<Option<i32>>,
    local_facet_arity: usize,
    local_facets: Vec<usize>,
}

impl EntitySet {
    fn unmarked(kind: EntitySetKind, len: usize) -> Self {
        Self {
            kind,
            markers: vec![None; len],
            local_facet_arity: 0,
            local_facets: Vec::new(),
        }
    }

    pub fn kind(&self) -> EntitySetKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn marker(&self, entity: usize) -> Option<i32> {
        self.markers[entity]
    }

    /// Local facet number(s) of the facet in its adjacent cell(s).
    ///
    /// Empty for cells. Exterior facets have one local number, interior facets two.
    pub fn local_facet_numbers(&self, entity: usize) -> &[usize] {
        let n = self.local_facet_arity;
        &self.local_facets[n * entity..n * (entity + 1)]
    }
}

/// Topology of a (possibly extruded) mesh, as seen by the assembly engine.
///
/// Entities are identified by their index within their entity set. On an extruded mesh,
/// every base entity is repeated once per layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshTopology {
    cells: EntitySet,
    exterior_facets: EntitySet,
    interior_facets: EntitySet,
    facets_per_cell: usize,
    cell_facets: Vec<usize>,
    layers: Option<usize>,
}

impl MeshTopology {
    /// A topology with the given number of cells and no facets.
    pub fn with_cells(num_cells: usize) -> Self {
        Self {
            cells: EntitySet::unmarked(EntitySetKind::Cells, num_cells),
            exterior_facets: EntitySet::unmarked(EntitySetKind::ExteriorFacets, 0),
            interior_facets: EntitySet::unmarked(EntitySetKind::InteriorFacets, 0),
            facets_per_cell: 0,
            cell_facets: Vec::new(),
            layers: None,
        }
    }

    /// Attach exterior facets, given the local facet number of each facet in its cell.
    pub fn with_exterior_facets(mut self, local_facet_numbers: Vec<usize>) -> Self {
        let n = local_facet_numbers.len();
        self.exterior_facets = EntitySet {
            kind: EntitySetKind::ExteriorFacets,
            markers: vec![None; n],
            local_facet_arity: 1,
            local_facets: local_facet_numbers,
        };
        self
    }

    /// Attach interior facets, given the local facet numbers in the two adjacent cells.
    pub fn with_interior_facets(mut self, local_facet_numbers: Vec<[usize; 2]>) -> Self {
        let n = local_facet_numbers.len();
        self.interior_facets = EntitySet {
            kind: EntitySetKind::InteriorFacets,
            markers: vec![None; n],
            local_facet_arity: 2,
            local_facets: local_facet_numbers.into_iter().flatten().collect(),
        };
        self
    }

    /// Attach cell-to-facet connectivity, `facets_per_cell` entries per cell.
    pub fn with_cell_facets(mut self, facets_per_cell: usize, cell_facets: Vec<usize>) -> Self {
        assert_eq!(
            cell_facets.len(),
            facets_per_cell * self.cells.len(),
            "Cell facet connectivity must have facets_per_cell entries per cell"
        );
        self.facets_per_cell = facets_per_cell;
        self.cell_facets = cell_facets;
        self
    }

    /// Set subdomain markers for the entities of the given kind.
    ///
    /// # Panics
    ///
    /// Panics if the number of markers does not match the number of entities.
    pub fn with_markers(mut self, kind: EntitySetKind, markers: Vec<Option<i32>>) -> Self {
        let set = self.entity_set_mut(kind);
        assert_eq!(markers.len(), set.len(), "Need exactly one marker per entity");
        set.markers = markers;
        self
    }

    /// Extrude the topology with the given number of cell layers.
    pub fn extruded(mut self, layers: usize) -> Self {
        assert!(layers > 0, "An extruded mesh needs at least one layer");
        self.layers = Some(layers);
        self
    }

    pub fn entity_set(&self, kind: EntitySetKind) -> &EntitySet {
        match kind {
            EntitySetKind::Cells => &self.cells,
            EntitySetKind::ExteriorFacets => &self.exterior_facets,
            EntitySetKind::InteriorFacets => &self.interior_facets,
        }
    }

    fn entity_set_mut(&mut self, kind: EntitySetKind) -> &mut EntitySet {
        match kind {
            EntitySetKind::Cells => &mut self.cells,
            EntitySetKind::ExteriorFacets => &mut self.exterior_facets,
            EntitySetKind::InteriorFacets => &mut self.interior_facets,
        }
    }

    pub fn num_entities(&self, kind: EntitySetKind) -> usize {
        self.entity_set(kind).len()
    }

    pub fn layers(&self) -> Option<usize> {
        self.layers
    }

    pub fn is_extruded(&self) -> bool {
        self.layers.is_some()
    }

    pub fn has_cell_facets(&self) -> bool {
        self.facets_per_cell > 0
    }

    pub fn cell_facets(&self, cell: usize) -> &[usize] {
        let n = self.facets_per_cell;
        &self.cell_facets[n * cell..n * (cell + 1)]
    }

    /// Build the set of entities a kernel with the given subdomain iterates over.
    ///
    /// `explicit_tags` lists every integer subdomain tag used by kernels of the same integral
    /// kind in the form, and is used to interpret [`SubdomainId::Otherwise`].
    pub fn measure_set(
        &self,
        kind: EntitySetKind,
        region: IterationRegion,
        subdomain: &SubdomainId,
        explicit_tags: &[i32],
    ) -> AssemblyResult<IterationSet> {
        let set = self.entity_set(kind);
        let entities = (0..set.len())
            .filter(|&e| match subdomain {
                SubdomainId::Everywhere => true,
                SubdomainId::Tag(tag) => set.marker(e) == Some(*tag),
                SubdomainId::Otherwise => set
                    .marker(e)
                    .map(|marker| !explicit_tags.contains(&marker))
                    .unwrap_or(true),
            })
            .collect();
        self.iteration_set(kind, region, entities)
    }

    /// The set visiting exactly the given entities, in place of those selected by markers.
    pub fn subset_set(
        &self,
        kind: EntitySetKind,
        region: IterationRegion,
        entities: &[usize],
    ) -> AssemblyResult<IterationSet> {
        let len = self.num_entities(kind);
        if let Some(&entity) = entities.iter().find(|&&entity| entity >= len) {
            return Err(AssemblyError::MapMismatch {
                kernel: String::new(),
                kind: kind.to_string(),
                reason: format!("subset entity {entity} is out of bounds for {len} {kind}"),
            });
        }
        self.iteration_set(kind, region, entities.to_vec())
    }

    fn iteration_set(
        &self,
        kind: EntitySetKind,
        region: IterationRegion,
        entities: Vec<usize>,
    ) -> AssemblyResult<IterationSet> {
        let layers = match (self.layers, region) {
            (None, IterationRegion::All) => None,
            (None, region) => {
                return Err(AssemblyError::MapMismatch {
                    kernel: String::new(),
                    kind: format!("{region:?}"),
                    reason: "layer restricted iteration requires an extruded mesh".to_string(),
                })
            }
            (Some(layers), _) => Some(layers),
        };

        Ok(IterationSet {
            kind,
            region,
            entities,
            layers,
        })
    }
}

/// The entities (and layers) a single kernel accumulation iterates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationSet {
    kind: EntitySetKind,
    region: IterationRegion,
    entities: Vec<usize>,
    layers: Option<usize>,
}

impl IterationSet {
    pub fn kind(&self) -> EntitySetKind {
        self.kind
    }

    pub fn region(&self) -> IterationRegion {
        self.region
    }

    pub fn entities(&self) -> &[usize] {
        &self.entities
    }

    /// The layers visited for each base entity.
    fn layer_range(&self) -> Option<std::ops::Range<usize>> {
        self.layers.map(|layers| layer_range(layers, self.region))
    }

    pub fn len(&self) -> usize {
        match self.layer_range() {
            Some(range) => range.len() * self.entities.len(),
            None => self.entities.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All iteration items, entity-major and layer-minor.
    pub fn items(&self) -> Vec<EntityIndex> {
        match self.layer_range() {
            None => self
                .entities
                .iter()
                .map(|&entity| EntityIndex { entity, layer: None })
                .collect(),
            Some(range) => self
                .entities
                .iter()
                .flat_map(|&entity| {
                    range.clone().map(move |layer| EntityIndex {
                        entity,
                        layer: Some(layer),
                    })
                })
                .collect(),
        }
    }
}

fn layer_range(layers: usize, region: IterationRegion) -> std::ops::Range<usize> {
    match region {
        IterationRegion::All => 0..layers,
        IterationRegion::Top => layers - 1..layers,
        IterationRegion::Bottom => 0..1,
        IterationRegion::InteriorFacets => 0..layers - 1,
    }
}

/// A map from mesh entities to the (global, block-local) nodes they touch.
///
/// Maps over extruded meshes carry one offset per local node: the nodes of layer `l` are the
/// base nodes shifted by `l * offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMap {
    source: EntitySetKind,
    num_sources: usize,
    num_targets: usize,
    arity: usize,
    values: Vec<usize>,
    layer_offsets: Option<Vec<usize>>,
}

impl IndexMap {
    /// Construct a map from `num_sources` entities of the given kind, `arity` nodes per entity.
    ///
    /// # Panics
    ///
    /// Panics if the number of values is not `arity * num_sources`, or any value is out of
    /// bounds.
    pub fn new(source: EntitySetKind, arity: usize, num_targets: usize, values: Vec<usize>) -> Self {
        assert!(arity > 0 || values.is_empty());
        let num_sources = if arity == 0 { 0 } else { values.len() / arity };
        assert_eq!(values.len(), arity * num_sources, "Map values must be a multiple of the arity");
        assert!(
            values.iter().all(|&v| v < num_targets),
            "Map values must be smaller than the number of targets"
        );
        Self {
            source,
            num_sources,
            num_targets,
            arity,
            values,
            layer_offsets: None,
        }
    }

    /// A map where every entity maps to the single global node `0`.
    pub fn global(source: EntitySetKind, num_sources: usize) -> Self {
        Self::new(source, 1, 1, vec![0; num_sources])
    }

    /// Attach per-node layer offsets, making this a map over an extruded mesh.
    pub fn with_layer_offsets(mut self, offsets: Vec<usize>) -> Self {
        assert_eq!(offsets.len(), self.arity, "Need one layer offset per local node");
        self.layer_offsets = Some(offsets);
        self
    }

    pub fn source(&self) -> EntitySetKind {
        self.source
    }

    pub fn num_sources(&self) -> usize {
        self.num_sources
    }

    pub fn num_targets(&self) -> usize {
        self.num_targets
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn is_extruded(&self) -> bool {
        self.layer_offsets.is_some()
    }

    /// Number of nodes produced per iteration item for the given region.
    pub fn local_arity(&self, region: IterationRegion) -> usize {
        match (region, self.is_extruded()) {
            (IterationRegion::InteriorFacets, true) => 2 * self.arity,
            _ => self.arity,
        }
    }

    pub fn layer_offsets(&self) -> Option<&[usize]> {
        self.layer_offsets.as_deref()
    }

    /// The largest node reached when iterating over the given number of cell layers.
    pub fn max_node(&self, layers: Option<usize>) -> Option<usize> {
        if self.arity == 0 {
            return None;
        }
        match (&self.layer_offsets, layers) {
            (Some(offsets), Some(layers)) => {
                let top = layers.saturating_sub(1);
                self.values
                    .chunks(self.arity)
                    .flat_map(|base| base.iter().zip(offsets).map(move |(n, o)| n + top * o))
                    .max()
            }
            _ => self.values.iter().copied().max(),
        }
    }

    pub fn base_nodes(&self, entity: usize) -> &[usize] {
        &self.values[self.arity * entity..self.arity * (entity + 1)]
    }

    /// Append the nodes of the given iteration item to `output`.
    ///
    /// For [`IterationRegion::InteriorFacets`], the nodes of the cell below the facet are
    /// followed by the nodes of the cell above it.
    pub fn extend_nodes(&self, output: &mut Vec<usize>, index: EntityIndex, region: IterationRegion) {
        let base = self.base_nodes(index.entity);
        match &self.layer_offsets {
            None => output.extend_from_slice(base),
            Some(offsets) => {
                let layer = index.layer.unwrap_or(0);
                let shifted = |l: usize| base.iter().zip(offsets).map(move |(n, o)| n + l * o);
                output.extend(shifted(layer));
                if region == IterationRegion::InteriorFacets {
                    output.extend(shifted(layer + 1));
                }
            }
        }
    }
}

/// An index map restricted to a set of extruded iteration regions.
///
/// Decoration only narrows which entities contribute to a sparsity pattern, it never changes
/// the number of nodes reachable through the map.
#[derive(Debug, Clone, Copy)]
pub struct DecoratedMap<'a> {
    pub map: &'a IndexMap,
    pub regions: &'a [IterationRegion],
}

impl<'a> DecoratedMap<'a> {
    pub fn new(map: &'a IndexMap, regions: &'a [IterationRegion]) -> Self {
        Self { map, regions }
    }

    /// All iteration items of the decorated map, paired with the region they belong to.
    pub fn items(&self, layers: Option<usize>) -> Vec<(EntityIndex, IterationRegion)> {
        let mut items = Vec::new();
        for entity in 0..self.map.num_sources() {
            match (layers, self.map.is_extruded()) {
                (Some(layers), true) => {
                    for &region in self.regions {
                        for layer in layer_range(layers, region) {
                            let index = EntityIndex {
                                entity,
                                layer: Some(layer),
                            };
                            items.push((index, region));
                        }
                    }
                }
                _ => items.push((EntityIndex { entity, layer: None }, IterationRegion::All)),
            }
        }
        items
    }
}
