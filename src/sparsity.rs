//! Construction of sparsity patterns for (block) matrices.
use crate::error::{AssemblyError, AssemblyResult};
use crate::integral::{IntegralDescriptor, MapKind};
use crate::space::{FunctionSpace, SpaceBlock};
use crate::topology::{DecoratedMap, IterationRegion};
use log::trace;
use nalgebra_sparse::pattern::SparsityPattern;
use std::collections::{BTreeMap, BTreeSet};

/// The index maps (and extruded regions) that contribute to a sparsity pattern.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SparsityMaps {
    maps: BTreeMap<MapKind, Vec<IterationRegion>>,
}

impl SparsityMaps {
    /// Collect the required maps for the integrals of a form.
    pub fn from_integrals<'a>(descriptors: impl IntoIterator<Item = &'a IntegralDescriptor>) -> Self {
        let mut maps: BTreeMap<MapKind, Vec<IterationRegion>> = BTreeMap::new();
        for descriptor in descriptors {
            let regions = maps.entry(descriptor.map).or_default();
            if !regions.contains(&descriptor.region) {
                regions.push(descriptor.region);
            }
        }
        Self { maps }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MapKind, &[IterationRegion])> {
        self.maps.iter().map(|(kind, regions)| (*kind, regions.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// Sparsity of a single block of a block matrix.
///
/// The pattern is stored on nodes. Every nonzero node pair corresponds to a dense
/// `row_block_size x col_block_size` block of degrees of freedom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityBlock {
    row_block_size: usize,
    col_block_size: usize,
    node_pattern: SparsityPattern,
}

impl SparsityBlock {
    pub fn row_block_size(&self) -> usize {
        self.row_block_size
    }

    pub fn col_block_size(&self) -> usize {
        self.col_block_size
    }

    pub fn node_pattern(&self) -> &SparsityPattern {
        &self.node_pattern
    }

    pub fn nrows(&self) -> usize {
        self.row_block_size * self.node_pattern.major_dim()
    }

    pub fn ncols(&self) -> usize {
        self.col_block_size * self.node_pattern.minor_dim()
    }

    /// The pattern on individual degrees of freedom.
    pub fn dof_pattern(&self) -> SparsityPattern {
        let (rbs, cbs) = (self.row_block_size, self.col_block_size);
        let mut offsets = Vec::with_capacity(self.nrows() + 1);
        let mut column_indices = Vec::new();
        offsets.push(0);
        for node_row in 0..self.node_pattern.major_dim() {
            let node_cols = self.node_pattern.lane(node_row);
            for _ in 0..rbs {
                for &node_col in node_cols {
                    column_indices.extend((0..cbs).map(|b| cbs * node_col + b));
                }
                offsets.push(column_indices.len());
            }
        }
        SparsityPattern::try_from_offsets_and_indices(self.nrows(), self.ncols(), offsets, column_indices)
            .expect("Expanding a valid node pattern always gives a valid pattern")
    }
}

/// Sparsity of a (possibly mixed) matrix: one block per pair of top-level indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sparsity {
    name: String,
    nested: bool,
    block_sparse: bool,
    row_dofs: Vec<usize>,
    col_dofs: Vec<usize>,
    blocks: Vec<SparsityBlock>,
}

impl Sparsity {
    /// Build the sparsity for the given test and trial spaces.
    ///
    /// Every block pair is built, including pairs no kernel contributes to, so that the full
    /// block matrix can be allocated once. `layers` is the number of layers of the mesh if it is
    /// extruded: decorated regions then restrict which layers contribute.
    pub fn build(
        name: impl Into<String>,
        test: &FunctionSpace,
        trial: &FunctionSpace,
        maps: &SparsityMaps,
        layers: Option<usize>,
        nested: bool,
        block_sparse: bool,
    ) -> AssemblyResult<Self> {
        let name = name.into();
        if block_sparse {
            for block in test.blocks().iter().chain(trial.blocks()) {
                if !block.is_blockable() {
                    return Err(AssemblyError::UnsupportedSparsityFormat {
                        space: block.name().to_string(),
                        reason: "block sparsity is not supported for spaces with global (R) degrees of freedom"
                            .to_string(),
                    });
                }
            }
        }

        let mut blocks = Vec::with_capacity(test.num_blocks() * trial.num_blocks());
        for (i, test_block) in test.blocks().iter().enumerate() {
            for (j, trial_block) in trial.blocks().iter().enumerate() {
                let node_pattern = build_node_pattern(test_block, trial_block, maps, layers, i == j)?;
                trace!(
                    "Built sparsity block ({}, {}) of `{}`: {} x {} nodes, {} nonzeros",
                    i,
                    j,
                    name,
                    node_pattern.major_dim(),
                    node_pattern.minor_dim(),
                    node_pattern.nnz()
                );
                blocks.push(SparsityBlock {
                    row_block_size: test_block.block_size(),
                    col_block_size: trial_block.block_size(),
                    node_pattern,
                });
            }
        }

        Ok(Self {
            name,
            nested,
            block_sparse,
            row_dofs: test.block_dofs(),
            col_dofs: trial.block_dofs(),
            blocks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn is_block_sparse(&self) -> bool {
        self.block_sparse
    }

    pub fn block_shape(&self) -> (usize, usize) {
        (self.row_dofs.len(), self.col_dofs.len())
    }

    pub fn row_dofs(&self) -> &[usize] {
        &self.row_dofs
    }

    pub fn col_dofs(&self) -> &[usize] {
        &self.col_dofs
    }

    pub fn nrows(&self) -> usize {
        self.row_dofs.iter().sum()
    }

    pub fn ncols(&self) -> usize {
        self.col_dofs.iter().sum()
    }

    pub fn block(&self, i: usize, j: usize) -> &SparsityBlock {
        let (_, ncols) = self.block_shape();
        &self.blocks[i * ncols + j]
    }

    /// Offset of the first row of each row block in the monolithic numbering.
    pub fn row_offsets(&self) -> Vec<usize> {
        prefix_offsets(&self.row_dofs)
    }

    /// Offset of the first column of each column block in the monolithic numbering.
    pub fn col_offsets(&self) -> Vec<usize> {
        prefix_offsets(&self.col_dofs)
    }

    /// The first entry of `required` that has no slot in this sparsity, as block row, block
    /// column and the row and column of the degree of freedom within the block.
    ///
    /// Sparsities with different block shapes or sizes have no entries in common, and the first
    /// entry of the first block is reported.
    pub fn first_uncovered(&self, required: &Sparsity) -> Option<(usize, usize, usize, usize)> {
        if self.row_dofs != required.row_dofs || self.col_dofs != required.col_dofs {
            return Some((0, 0, 0, 0));
        }
        let (nrow_blocks, ncol_blocks) = self.block_shape();
        for i in 0..nrow_blocks {
            for j in 0..ncol_blocks {
                let (ours, theirs) = (self.block(i, j), required.block(i, j));
                let uncovered = if ours.row_block_size == theirs.row_block_size
                    && ours.col_block_size == theirs.col_block_size
                {
                    first_uncovered_entry(&ours.node_pattern, &theirs.node_pattern)
                        .map(|(row, col)| (row * ours.row_block_size, col * ours.col_block_size))
                } else {
                    first_uncovered_entry(&ours.dof_pattern(), &theirs.dof_pattern())
                };
                if let Some((row, col)) = uncovered {
                    return Some((i, j, row, col));
                }
            }
        }
        None
    }

    /// The pattern of the whole block matrix in monolithic numbering.
    pub fn monolithic_pattern(&self) -> SparsityPattern {
        let (nrow_blocks, ncol_blocks) = self.block_shape();
        let col_offsets = self.col_offsets();
        let dof_patterns: Vec<_> = self.blocks.iter().map(SparsityBlock::dof_pattern).collect();

        let mut offsets = Vec::with_capacity(self.nrows() + 1);
        let mut column_indices = Vec::new();
        offsets.push(0);
        for i in 0..nrow_blocks {
            for row in 0..self.row_dofs[i] {
                for j in 0..ncol_blocks {
                    let lane = dof_patterns[i * ncol_blocks + j].lane(row);
                    column_indices.extend(lane.iter().map(|col| col_offsets[j] + col));
                }
                offsets.push(column_indices.len());
            }
        }
        SparsityPattern::try_from_offsets_and_indices(self.nrows(), self.ncols(), offsets, column_indices)
            .expect("Concatenating valid block patterns always gives a valid pattern")
    }
}

fn first_uncovered_entry(pattern: &SparsityPattern, required: &SparsityPattern) -> Option<(usize, usize)> {
    (0..required.major_dim()).find_map(|row| {
        let lane = pattern.lane(row);
        required
            .lane(row)
            .iter()
            .find(|&&col| lane.binary_search(&col).is_err())
            .map(|&col| (row, col))
    })
}

fn prefix_offsets(sizes: &[usize]) -> Vec<usize> {
    sizes
        .iter()
        .scan(0, |acc, &size| {
            let offset = *acc;
            *acc += size;
            Some(offset)
        })
        .collect()
}

fn build_node_pattern(
    test: &SpaceBlock,
    trial: &SpaceBlock,
    maps: &SparsityMaps,
    layers: Option<usize>,
    diagonal_block: bool,
) -> AssemblyResult<SparsityPattern> {
    // As in the CSR assembler, we collect into a BTreeSet so that each entry is stored
    // exactly once, regardless of how many entities touch it
    let mut entries = BTreeSet::new();
    let mut row_nodes = Vec::new();
    let mut col_nodes = Vec::new();

    for (kind, regions) in maps.iter() {
        let (test_map, trial_map) = match (test.map(kind), trial.map(kind)) {
            (Some(test_map), Some(trial_map)) => (test_map, trial_map),
            // Missing maps are reported when the kernel needing them is executed
            _ => continue,
        };
        if test_map.num_sources() != trial_map.num_sources() {
            return Err(AssemblyError::MapMismatch {
                kernel: "sparsity".to_string(),
                kind: format!("{kind:?}"),
                reason: format!(
                    "test map of `{}` has {} sources, trial map of `{}` has {}",
                    test.name(),
                    test_map.num_sources(),
                    trial.name(),
                    trial_map.num_sources()
                ),
            });
        }

        let decorated = DecoratedMap::new(test_map, regions);
        for (index, region) in decorated.items(layers) {
            row_nodes.clear();
            col_nodes.clear();
            test_map.extend_nodes(&mut row_nodes, index, region);
            trial_map.extend_nodes(&mut col_nodes, index, region);
            let out_of_bounds = row_nodes.iter().any(|&r| r >= test.num_nodes())
                || col_nodes.iter().any(|&c| c >= trial.num_nodes());
            if out_of_bounds {
                return Err(AssemblyError::MapMismatch {
                    kernel: "sparsity".to_string(),
                    kind: format!("{kind:?}"),
                    reason: format!(
                        "entity {} in layer {:?} maps outside the nodes of `{}` or `{}`",
                        index.entity,
                        index.layer,
                        test.name(),
                        trial.name()
                    ),
                });
            }
            for &r in &row_nodes {
                for &c in &col_nodes {
                    entries.insert((r, c));
                }
            }
        }
    }

    let num_rows = test.num_nodes();
    let num_cols = trial.num_nodes();
    if diagonal_block && num_rows == num_cols && test.block_size() == trial.block_size() {
        entries.extend((0..num_rows).map(|n| (n, n)));
    }

    let mut offsets = Vec::with_capacity(num_rows + 1);
    let mut column_indices = Vec::with_capacity(entries.len());
    offsets.push(0);
    for (i, j) in entries {
        while i + 1 > offsets.len() {
            // Run in a loop to correctly handle consecutive empty rows
            offsets.push(column_indices.len());
        }
        column_indices.push(j);
    }
    while offsets.len() < num_rows + 1 {
        offsets.push(column_indices.len());
    }

    Ok(SparsityPattern::try_from_offsets_and_indices(num_rows, num_cols, offsets, column_indices)
        .expect("Sorted, unique entries always form a valid pattern"))
}
