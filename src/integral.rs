//! Classification of integral kinds.
//!
//! Every integral kind resolves to a small descriptor: which entity set to iterate, which index
//! map of each space to use, which extra per-entity arguments to pass to the kernel, and which
//! extruded region the iteration (and the sparsity contribution) is restricted to.
use crate::error::{AssemblyError, AssemblyResult};
use crate::topology::{EntitySetKind, IterationRegion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The integral kinds produced by the form compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntegralKind {
    Cell,
    ExteriorFacet,
    InteriorFacet,
    ExteriorFacetTop,
    ExteriorFacetBottom,
    ExteriorFacetVert,
    InteriorFacetHoriz,
    InteriorFacetVert,
}

impl IntegralKind {
    pub const ALL: [IntegralKind; 8] = [
        IntegralKind::Cell,
        IntegralKind::ExteriorFacet,
        IntegralKind::InteriorFacet,
        IntegralKind::ExteriorFacetTop,
        IntegralKind::ExteriorFacetBottom,
        IntegralKind::ExteriorFacetVert,
        IntegralKind::InteriorFacetHoriz,
        IntegralKind::InteriorFacetVert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegralKind::Cell => "cell",
            IntegralKind::ExteriorFacet => "exterior_facet",
            IntegralKind::InteriorFacet => "interior_facet",
            IntegralKind::ExteriorFacetTop => "exterior_facet_top",
            IntegralKind::ExteriorFacetBottom => "exterior_facet_bottom",
            IntegralKind::ExteriorFacetVert => "exterior_facet_vert",
            IntegralKind::InteriorFacetHoriz => "interior_facet_horiz",
            IntegralKind::InteriorFacetVert => "interior_facet_vert",
        }
    }

    /// The descriptor driving iteration and argument construction for this kind.
    pub fn descriptor(&self) -> IntegralDescriptor {
        use EntitySetKind::{Cells, ExteriorFacets, InteriorFacets};
        use IterationRegion::{All, Bottom, Top};
        let (entity_set, map, region, local_facets) = match self {
            IntegralKind::Cell => (Cells, MapKind::Cell, All, false),
            IntegralKind::ExteriorFacet => (ExteriorFacets, MapKind::ExteriorFacet, All, true),
            IntegralKind::ExteriorFacetVert => (ExteriorFacets, MapKind::ExteriorFacet, All, true),
            IntegralKind::InteriorFacet => (InteriorFacets, MapKind::InteriorFacet, All, true),
            IntegralKind::InteriorFacetVert => (InteriorFacets, MapKind::InteriorFacet, All, true),
            // Horizontal facets of extruded meshes are reached through the cells of the base mesh
            IntegralKind::ExteriorFacetTop => (Cells, MapKind::Cell, Top, false),
            IntegralKind::ExteriorFacetBottom => (Cells, MapKind::Cell, Bottom, false),
            IntegralKind::InteriorFacetHoriz => (Cells, MapKind::Cell, IterationRegion::InteriorFacets, false),
        };
        IntegralDescriptor {
            kind: *self,
            entity_set,
            map,
            region,
            local_facet_numbers: local_facets,
        }
    }
}

impl fmt::Display for IntegralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntegralKind {
    type Err = AssemblyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntegralKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AssemblyError::UnsupportedIntegralKind { kind: s.to_string() })
    }
}

/// Which of a space's index maps a kernel reads and writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MapKind {
    Cell,
    ExteriorFacet,
    InteriorFacet,
}

impl MapKind {
    /// The entity set the map is defined on.
    pub fn source(&self) -> EntitySetKind {
        match self {
            MapKind::Cell => EntitySetKind::Cells,
            MapKind::ExteriorFacet => EntitySetKind::ExteriorFacets,
            MapKind::InteriorFacet => EntitySetKind::InteriorFacets,
        }
    }
}

/// Extra, read-only per-entity arguments appended after coordinate and coefficient data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtraArg {
    /// Local number of the facet within its adjacent cell(s).
    LocalFacetNumber,
    /// The full cell-to-facet connectivity of the cell.
    CellFacets,
}

/// Closure-free description of how a kernel of a given integral kind is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegralDescriptor {
    pub kind: IntegralKind,
    pub entity_set: EntitySetKind,
    pub map: MapKind,
    pub region: IterationRegion,
    local_facet_numbers: bool,
}

impl IntegralDescriptor {
    /// The extra arguments for a kernel of this kind, in call order.
    ///
    /// Cell facet connectivity is only meaningful for cell integrals and is ignored otherwise.
    pub fn extra_args(&self, needs_cell_facets: bool) -> Vec<ExtraArg> {
        let mut args = Vec::new();
        if self.local_facet_numbers {
            args.push(ExtraArg::LocalFacetNumber);
        }
        if needs_cell_facets && self.kind == IntegralKind::Cell {
            args.push(ExtraArg::CellFacets);
        }
        args
    }

    /// Whether iteration is restricted to a subset of the layers of an extruded mesh.
    pub fn is_layer_restricted(&self) -> bool {
        self.region != IterationRegion::All
    }
}

/// Resolve an integral kind string reported by the form compiler.
pub fn classify(kind: &str) -> AssemblyResult<IntegralDescriptor> {
    Ok(kind.parse::<IntegralKind>()?.descriptor())
}
