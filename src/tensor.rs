//! Target tensors of assembly: scalars, block vectors and sparse block matrices.
use crate::bc::DirichletBC;
use crate::config::MatType;
use crate::error::{AssemblyError, AssemblyResult};
use crate::space::FunctionSpace;
use crate::sparsity::Sparsity;
use crate::Real;
use itertools::iproduct;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use std::ops::Range;
use std::sync::Arc;

/// The result (and target) of assembling a form.
#[derive(Debug, Clone)]
pub enum Tensor<T> {
    /// Accumulator for a rank 0 form.
    Scalar(T),
    /// One vector block per top-level index of the test space.
    Vector(BlockVector<T>),
    /// One matrix block per pair of top-level test and trial indices.
    Matrix(BlockMatrix<T>),
    /// A matrix that is never stored, only its action.
    Implicit(ImplicitMatrix<T>),
}

impl<T: Real> Tensor<T> {
    /// The rank of the forms this tensor can hold.
    pub fn rank(&self) -> usize {
        match self {
            Tensor::Scalar(_) => 0,
            Tensor::Vector(_) => 1,
            Tensor::Matrix(_) | Tensor::Implicit(_) => 2,
        }
    }

    pub fn zero(&mut self) {
        match self {
            Tensor::Scalar(value) => *value = T::zero(),
            Tensor::Vector(vector) => vector.zero(),
            Tensor::Matrix(matrix) => matrix.zero(),
            Tensor::Implicit(_) => {}
        }
    }

    /// The boundary conditions currently attached to the tensor.
    ///
    /// Only matrices carry boundary conditions. Those of a vector are given per assembly.
    pub fn bcs(&self) -> &[DirichletBC<T>] {
        match self {
            Tensor::Scalar(_) | Tensor::Vector(_) => &[],
            Tensor::Matrix(matrix) => matrix.bcs(),
            Tensor::Implicit(implicit) => implicit.bcs(),
        }
    }

    /// Replace the boundary conditions attached to the tensor.
    ///
    /// The sparsity of a matrix does not depend on which degrees of freedom are constrained,
    /// so the new set fully replaces the old one. Scalars and vectors cannot carry boundary
    /// conditions.
    pub fn set_bcs(&mut self, bcs: Vec<DirichletBC<T>>) -> AssemblyResult<()> {
        match self {
            Tensor::Scalar(_) | Tensor::Vector(_) if bcs.is_empty() => Ok(()),
            Tensor::Scalar(_) => Err(AssemblyError::invalid_target(
                0,
                "boundary conditions cannot be attached to a scalar",
            )),
            Tensor::Vector(_) => Err(AssemblyError::invalid_target(
                1,
                "boundary conditions are not attached to vectors, they are applied per assembly",
            )),
            Tensor::Matrix(matrix) => {
                matrix.set_bcs(bcs);
                Ok(())
            }
            Tensor::Implicit(implicit) => {
                implicit.set_bcs(bcs);
                Ok(())
            }
        }
    }

    /// Complete the assembly of the tensor, making it usable by solvers.
    pub fn finalize(&mut self) {
        match self {
            Tensor::Scalar(_) | Tensor::Vector(_) => {}
            Tensor::Matrix(matrix) => matrix.finalize(),
            Tensor::Implicit(implicit) => implicit.assemble(),
        }
    }

    pub fn as_scalar(&self) -> Option<T> {
        match self {
            Tensor::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&BlockVector<T>> {
        match self {
            Tensor::Vector(vector) => Some(vector),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&BlockMatrix<T>> {
        match self {
            Tensor::Matrix(matrix) => Some(matrix),
            _ => None,
        }
    }

    pub fn as_implicit(&self) -> Option<&ImplicitMatrix<T>> {
        match self {
            Tensor::Implicit(implicit) => Some(implicit),
            _ => None,
        }
    }

    pub fn into_vector(self) -> Option<BlockVector<T>> {
        match self {
            Tensor::Vector(vector) => Some(vector),
            _ => None,
        }
    }

    pub fn into_matrix(self) -> Option<BlockMatrix<T>> {
        match self {
            Tensor::Matrix(matrix) => Some(matrix),
            _ => None,
        }
    }
}

/// A vector with one block per top-level index of a (mixed) space.
#[derive(Debug, Clone)]
pub struct BlockVector<T> {
    blocks: Vec<DVector<T>>,
}

impl<T: Real> BlockVector<T> {
    pub fn zeros(space: &FunctionSpace) -> Self {
        Self::from_blocks(space.block_dofs().into_iter().map(DVector::zeros).collect())
    }

    pub fn from_blocks(blocks: Vec<DVector<T>>) -> Self {
        Self { blocks }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, index: usize) -> &DVector<T> {
        &self.blocks[index]
    }

    pub fn block_mut(&mut self, index: usize) -> &mut DVector<T> {
        &mut self.blocks[index]
    }

    pub fn blocks(&self) -> &[DVector<T>] {
        &self.blocks
    }

    pub fn block_lengths(&self) -> Vec<usize> {
        self.blocks.iter().map(DVector::len).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().map(DVector::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All blocks concatenated in block order.
    pub fn to_vector(&self) -> DVector<T> {
        DVector::from_iterator(self.len(), self.blocks.iter().flat_map(|b| b.iter().copied()))
    }

    pub fn zero(&mut self) {
        for block in &mut self.blocks {
            block.fill(T::zero());
        }
    }

    pub(crate) fn add_local(&mut self, block: usize, dofs: &[usize], local: &DMatrix<T>) -> AssemblyResult<()> {
        let len = self.blocks[block].len();
        if let Some(&dof) = dofs.iter().find(|&&dof| dof >= len) {
            return Err(AssemblyError::invalid_target(
                1,
                format!("degree of freedom {dof} is out of bounds for vector block {block} of length {len}"),
            ));
        }
        let values = &mut self.blocks[block];
        for (local_row, &dof) in dofs.iter().enumerate() {
            values[dof] += local[(local_row, 0)];
        }
        Ok(())
    }
}

/// Storage of the values of a block matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixStorage<T> {
    /// A single CSR matrix in monolithic numbering.
    Monolithic(CsrMatrix<T>),
    /// One CSR matrix per block, stored row-major.
    Nested(Vec<CsrMatrix<T>>),
}

/// A sparse matrix with one block per pair of top-level test and trial indices.
///
/// The sparsity is fixed at allocation. Accumulating into an entry that has no slot in the
/// sparsity is an error, never a reallocation.
#[derive(Debug, Clone)]
pub struct BlockMatrix<T> {
    sparsity: Arc<Sparsity>,
    storage: MatrixStorage<T>,
    bcs: Vec<DirichletBC<T>>,
    assembled: bool,
}

impl<T: Real> BlockMatrix<T> {
    /// Allocate a zero matrix with the given sparsity.
    pub fn new(sparsity: Arc<Sparsity>) -> Self {
        let storage = if sparsity.is_nested() {
            let (nrows, ncols) = sparsity.block_shape();
            let blocks = iproduct!(0..nrows, 0..ncols)
                .map(|(i, j)| zero_csr(sparsity.block(i, j).dof_pattern()))
                .collect();
            MatrixStorage::Nested(blocks)
        } else {
            MatrixStorage::Monolithic(zero_csr(sparsity.monolithic_pattern()))
        };
        Self {
            sparsity,
            storage,
            bcs: Vec::new(),
            assembled: false,
        }
    }

    pub fn sparsity(&self) -> &Arc<Sparsity> {
        &self.sparsity
    }

    pub fn storage(&self) -> &MatrixStorage<T> {
        &self.storage
    }

    /// The layout the matrix was allocated with.
    pub fn mat_type(&self) -> MatType {
        match (self.sparsity.is_nested(), self.sparsity.is_block_sparse()) {
            (true, _) => MatType::Nested,
            (false, true) => MatType::MonolithicBlock,
            (false, false) => MatType::Monolithic,
        }
    }

    pub fn block_shape(&self) -> (usize, usize) {
        self.sparsity.block_shape()
    }

    pub fn nrows(&self) -> usize {
        self.sparsity.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.sparsity.ncols()
    }

    pub fn nnz(&self) -> usize {
        match &self.storage {
            MatrixStorage::Monolithic(csr) => csr.nnz(),
            MatrixStorage::Nested(blocks) => blocks.iter().map(CsrMatrix::nnz).sum(),
        }
    }

    pub fn bcs(&self) -> &[DirichletBC<T>] {
        &self.bcs
    }

    pub fn set_bcs(&mut self, bcs: Vec<DirichletBC<T>>) {
        self.bcs = bcs;
    }

    /// Whether the matrix has been finalized since it was last modified.
    pub fn is_assembled(&self) -> bool {
        self.assembled
    }

    pub fn zero(&mut self) {
        match &mut self.storage {
            MatrixStorage::Monolithic(csr) => csr.values_mut().fill(T::zero()),
            MatrixStorage::Nested(blocks) => {
                for block in blocks {
                    block.values_mut().fill(T::zero());
                }
            }
        }
        self.assembled = false;
    }

    pub fn finalize(&mut self) {
        self.assembled = true;
    }

    /// The CSR matrix of block `(i, j)` together with the ranges of its rows and columns in the
    /// stored matrix.
    fn block_csr_mut(&mut self, i: usize, j: usize) -> (&mut CsrMatrix<T>, Range<usize>, Range<usize>) {
        let row_range = block_range(self.sparsity.row_dofs(), i);
        let col_range = block_range(self.sparsity.col_dofs(), j);
        let (_, ncol_blocks) = self.sparsity.block_shape();
        match &mut self.storage {
            MatrixStorage::Monolithic(csr) => (csr, row_range, col_range),
            MatrixStorage::Nested(blocks) => (
                &mut blocks[i * ncol_blocks + j],
                0..row_range.len(),
                0..col_range.len(),
            ),
        }
    }

    /// The stored CSR matrix of block `(i, j)` of a nested matrix.
    pub fn nested_block(&self, i: usize, j: usize) -> Option<&CsrMatrix<T>> {
        let (_, ncol_blocks) = self.sparsity.block_shape();
        match &self.storage {
            MatrixStorage::Monolithic(_) => None,
            MatrixStorage::Nested(blocks) => blocks.get(i * ncol_blocks + j),
        }
    }

    /// The stored CSR matrix of a monolithic matrix.
    pub fn as_csr(&self) -> Option<&CsrMatrix<T>> {
        match &self.storage {
            MatrixStorage::Monolithic(csr) => Some(csr),
            MatrixStorage::Nested(_) => None,
        }
    }

    /// Add a local matrix into block `(i, j)`.
    ///
    /// `rows` and `cols` are degrees of freedom local to the block.
    pub(crate) fn add_local(
        &mut self,
        i: usize,
        j: usize,
        rows: &[usize],
        cols: &[usize],
        local: &DMatrix<T>,
    ) -> AssemblyResult<()> {
        debug_assert_eq!(local.shape(), (rows.len(), cols.len()));
        let (csr, row_range, col_range) = self.block_csr_mut(i, j);
        for (local_row, &row) in rows.iter().enumerate() {
            if row >= row_range.len() {
                return Err(missing_slot(i, j, row, None));
            }
            let mut csr_row = csr.row_mut(row_range.start + row);
            let (columns, values) = csr_row.cols_and_values_mut();
            for (local_col, &col) in cols.iter().enumerate() {
                if col >= col_range.len() {
                    return Err(missing_slot(i, j, row, Some(col)));
                }
                // Columns in each row are sorted, so a binary search finds the slot
                let idx = columns
                    .binary_search(&(col_range.start + col))
                    .map_err(|_| missing_slot(i, j, row, Some(col)))?;
                values[idx] += local[(local_row, local_col)];
            }
        }
        self.assembled = false;
        Ok(())
    }

    /// Zero the rows and columns of the given degrees of freedom of diagonal block `(k, k)`
    /// and put `diagonal` on their diagonal entries.
    ///
    /// No other block is touched.
    pub(crate) fn constrain_diagonal_block(&mut self, k: usize, dofs: &[usize], diagonal: T) -> AssemblyResult<()> {
        let (csr, row_range, col_range) = self.block_csr_mut(k, k);
        if let Some(&dof) = dofs
            .iter()
            .find(|&&dof| dof >= row_range.len() || dof >= col_range.len())
        {
            return Err(AssemblyError::invalid_target(
                2,
                format!("constrained degree of freedom {dof} is out of bounds for block ({k}, {k})"),
            ));
        }

        let mut membership = vec![false; col_range.len()];
        for &dof in dofs {
            membership[dof] = true;
        }

        // Visit every row of the block: the pattern of the block need not be symmetric, so we
        // cannot restrict column zeroing to the rows reached from constrained rows
        for row in 0..row_range.len() {
            let row_is_constrained = membership.get(row).copied().unwrap_or(false);
            let mut csr_row = csr.row_mut(row_range.start + row);
            let (columns, values) = csr_row.cols_and_values_mut();
            for (&global_col, value) in columns.iter().zip(values) {
                if !col_range.contains(&global_col) {
                    continue;
                }
                let col = global_col - col_range.start;
                if row_is_constrained && col == row {
                    *value = diagonal;
                } else if row_is_constrained || membership[col] {
                    *value = T::zero();
                }
            }
        }
        self.assembled = false;
        Ok(())
    }

    /// Dense copy of the whole matrix in monolithic numbering.
    pub fn to_dense(&self) -> DMatrix<T> {
        match &self.storage {
            MatrixStorage::Monolithic(csr) => DMatrix::from(csr),
            MatrixStorage::Nested(_) => {
                let mut dense = DMatrix::zeros(self.nrows(), self.ncols());
                let (nrow_blocks, ncol_blocks) = self.block_shape();
                let row_offsets = self.sparsity.row_offsets();
                let col_offsets = self.sparsity.col_offsets();
                for i in 0..nrow_blocks {
                    for j in 0..ncol_blocks {
                        let block = self.block_to_dense(i, j);
                        dense
                            .view_mut((row_offsets[i], col_offsets[j]), block.shape())
                            .copy_from(&block);
                    }
                }
                dense
            }
        }
    }

    /// Dense copy of block `(i, j)`.
    pub fn block_to_dense(&self, i: usize, j: usize) -> DMatrix<T> {
        match &self.storage {
            MatrixStorage::Nested(blocks) => {
                let (_, ncol_blocks) = self.block_shape();
                DMatrix::from(&blocks[i * ncol_blocks + j])
            }
            MatrixStorage::Monolithic(csr) => {
                let row_range = block_range(self.sparsity.row_dofs(), i);
                let col_range = block_range(self.sparsity.col_dofs(), j);
                let mut dense = DMatrix::zeros(row_range.len(), col_range.len());
                for (row, global_row) in row_range.enumerate() {
                    let csr_row = csr.row(global_row);
                    for (&global_col, &value) in csr_row.col_indices().iter().zip(csr_row.values()) {
                        if col_range.contains(&global_col) {
                            dense[(row, global_col - col_range.start)] = value;
                        }
                    }
                }
                dense
            }
        }
    }
}

/// A matrix-free operator.
///
/// Holds only the shape and boundary conditions of the operator. Applying its action is the
/// responsibility of the caller, assembly merely marks it as assembled.
#[derive(Debug, Clone)]
pub struct ImplicitMatrix<T> {
    name: String,
    row_dofs: Vec<usize>,
    col_dofs: Vec<usize>,
    bcs: Vec<DirichletBC<T>>,
    assembled: bool,
}

impl<T> ImplicitMatrix<T> {
    pub fn new(name: impl Into<String>, test: &FunctionSpace, trial: &FunctionSpace) -> Self {
        Self {
            name: name.into(),
            row_dofs: test.block_dofs(),
            col_dofs: trial.block_dofs(),
            bcs: Vec::new(),
            assembled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_dofs(&self) -> &[usize] {
        &self.row_dofs
    }

    pub fn col_dofs(&self) -> &[usize] {
        &self.col_dofs
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.row_dofs.iter().sum(), self.col_dofs.iter().sum())
    }

    pub fn bcs(&self) -> &[DirichletBC<T>] {
        &self.bcs
    }

    pub fn set_bcs(&mut self, bcs: Vec<DirichletBC<T>>) {
        self.bcs = bcs;
        self.assembled = false;
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled
    }

    pub fn assemble(&mut self) {
        self.assembled = true;
    }
}

fn zero_csr<T: Real>(pattern: nalgebra_sparse::pattern::SparsityPattern) -> CsrMatrix<T> {
    let values = vec![T::zero(); pattern.nnz()];
    CsrMatrix::try_from_pattern_and_values(pattern, values)
        .expect("Number of values always matches the pattern")
}

fn block_range(sizes: &[usize], index: usize) -> Range<usize> {
    let start: usize = sizes[..index].iter().sum();
    start..start + sizes[index]
}

fn missing_slot(i: usize, j: usize, row: usize, col: Option<usize>) -> AssemblyError {
    let entry = match col {
        Some(col) => format!("({row}, {col})"),
        None => format!("row {row}"),
    };
    AssemblyError::invalid_target(
        2,
        format!("the sparsity of block ({i}, {j}) has no slot for entry {entry}"),
    )
}
