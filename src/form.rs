//! Forms and the compiled kernels they consist of.
//!
//! Kernels are produced by an external form compiler. This module only describes the metadata
//! the assembly engine needs to execute them.
use crate::error::{AssemblyError, AssemblyResult};
use crate::space::{Function, FunctionSpace};
use crate::topology::{EntitySetKind, MeshTopology};
use crate::Real;
use nalgebra::DMatrix;
use std::fmt;
use std::sync::Arc;

/// The subdomain a kernel integrates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubdomainId {
    /// Every entity of the integral kind.
    Everywhere,
    /// Every entity whose marker is not claimed by another kernel of the same integral kind.
    Otherwise,
    /// Entities carrying the given marker.
    Tag(i32),
}

impl fmt::Display for SubdomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubdomainId::Everywhere => write!(f, "everywhere"),
            SubdomainId::Otherwise => write!(f, "otherwise"),
            SubdomainId::Tag(tag) => write!(f, "{tag}"),
        }
    }
}

/// Metadata reported by the form compiler for a single kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub integral_type: String,
    pub subdomain_id: SubdomainId,
    /// Index of the integration domain in the form.
    pub domain: usize,
    /// Indices of the form coefficients the kernel reads, in call order.
    pub coefficients: Vec<usize>,
    pub needs_orientations: bool,
    pub needs_cell_facets: bool,
    pub pass_layer_arg: bool,
}

impl KernelInfo {
    pub fn new(integral_type: impl Into<String>) -> Self {
        Self {
            integral_type: integral_type.into(),
            subdomain_id: SubdomainId::Otherwise,
            domain: 0,
            coefficients: Vec::new(),
            needs_orientations: false,
            needs_cell_facets: false,
            pass_layer_arg: false,
        }
    }

    pub fn with_subdomain(mut self, subdomain_id: SubdomainId) -> Self {
        self.subdomain_id = subdomain_id;
        self
    }

    pub fn with_domain(mut self, domain: usize) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_coefficients(mut self, coefficients: Vec<usize>) -> Self {
        self.coefficients = coefficients;
        self
    }

    pub fn with_orientations(mut self) -> Self {
        self.needs_orientations = true;
        self
    }

    pub fn with_cell_facets(mut self) -> Self {
        self.needs_cell_facets = true;
        self
    }

    pub fn with_layer_arg(mut self) -> Self {
        self.pass_layer_arg = true;
        self
    }
}

/// Data gathered for one iteration item and handed to a local kernel.
///
/// Nodal data is laid out node-major: the values of local node `i` are stored contiguously,
/// one per component of the space's block size.
#[derive(Debug)]
pub struct KernelArgs<'a, T> {
    pub entity: usize,
    /// Layer index on extruded meshes, only provided when the kernel asks for it.
    pub layer: Option<usize>,
    pub coordinates: &'a [T],
    pub orientations: Option<&'a [T]>,
    /// One entry per coefficient block, in the order declared by the kernel.
    pub coefficients: &'a [Vec<T>],
    pub local_facet_numbers: Option<&'a [usize]>,
    pub cell_facets: Option<&'a [usize]>,
}

/// A compiled local kernel.
///
/// The output matrix has been sized and zeroed before the call: `rows x cols` local degrees of
/// freedom for rank 2 forms, `rows x 1` for rank 1 and `1 x 1` for rank 0. The kernel must
/// *add* its contribution.
pub trait LocalKernel<T>: Send + Sync {
    fn name(&self) -> &str {
        "kernel"
    }

    fn evaluate(&self, output: &mut DMatrix<T>, args: &KernelArgs<T>) -> eyre::Result<()>;
}

/// A kernel together with its metadata and the block of the target tensor it contributes to.
#[derive(Clone)]
pub struct CompiledKernel<T> {
    /// Block indices: two for rank 2 forms, one for rank 1 and none for rank 0.
    pub indices: Vec<usize>,
    pub info: KernelInfo,
    pub kernel: Arc<dyn LocalKernel<T>>,
}

impl<T> CompiledKernel<T> {
    pub fn new(indices: Vec<usize>, info: KernelInfo, kernel: Arc<dyn LocalKernel<T>>) -> Self {
        Self { indices, info, kernel }
    }

    pub fn name(&self) -> &str {
        self.kernel.name()
    }
}

impl<T> fmt::Debug for CompiledKernel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.kernel.name())
            .field("indices", &self.indices)
            .field("info", &self.info)
            .finish()
    }
}

/// An integration domain: a mesh topology with its coordinate field.
#[derive(Debug, Clone)]
pub struct Domain<T> {
    topology: Arc<MeshTopology>,
    coordinates: Function<T>,
    orientations: Option<Function<T>>,
}

impl<T: Real> Domain<T> {
    pub fn new(topology: Arc<MeshTopology>, coordinates: Function<T>) -> Self {
        Self {
            topology,
            coordinates,
            orientations: None,
        }
    }

    pub fn with_cell_orientations(mut self, orientations: Function<T>) -> Self {
        self.orientations = Some(orientations);
        self
    }

    pub fn topology(&self) -> &Arc<MeshTopology> {
        &self.topology
    }

    pub fn coordinates(&self) -> &Function<T> {
        &self.coordinates
    }

    pub fn cell_orientations(&self) -> Option<&Function<T>> {
        self.orientations.as_ref()
    }
}

/// Entities supplied by the caller as the iteration set of the kernels of one integral type on
/// one domain, in place of the set derived from subdomain markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdomainData {
    pub domain: usize,
    pub integral_type: String,
    pub entities: Vec<usize>,
}

/// A discretized form of rank 0, 1 or 2.
#[derive(Debug, Clone)]
pub struct Form<T> {
    arguments: Vec<Arc<FunctionSpace>>,
    coefficients: Vec<Function<T>>,
    domains: Vec<Arc<Domain<T>>>,
    kernels: Vec<CompiledKernel<T>>,
    subdomain_data: Vec<SubdomainData>,
}

impl<T: Real> Form<T> {
    /// A form with the given argument spaces (test first, then trial) over the given domain.
    pub fn new(arguments: Vec<Arc<FunctionSpace>>, domain: Arc<Domain<T>>) -> Self {
        Self {
            arguments,
            coefficients: Vec::new(),
            domains: vec![domain],
            kernels: Vec::new(),
            subdomain_data: Vec::new(),
        }
    }

    pub fn with_domain(mut self, domain: Arc<Domain<T>>) -> Self {
        self.domains.push(domain);
        self
    }

    pub fn with_coefficient(mut self, coefficient: Function<T>) -> Self {
        self.coefficients.push(coefficient);
        self
    }

    pub fn with_kernel(mut self, kernel: CompiledKernel<T>) -> Self {
        self.kernels.push(kernel);
        self
    }

    /// Let the kernels of the given integral type on the given domain iterate over exactly
    /// `entities`, replacing any previous data for the same pair.
    ///
    /// Only cell integrals support subdomain data.
    pub fn with_subdomain_data(
        mut self,
        domain: usize,
        integral_type: impl Into<String>,
        mut entities: Vec<usize>,
    ) -> Self {
        let integral_type = integral_type.into();
        entities.sort_unstable();
        entities.dedup();
        self.subdomain_data
            .retain(|data| data.domain != domain || data.integral_type != integral_type);
        self.subdomain_data.push(SubdomainData {
            domain,
            integral_type,
            entities,
        });
        self
    }

    /// The subdomain data of the given domain and integral type, if any.
    pub fn subdomain_data(&self, domain: usize, integral_type: &str) -> Option<&[usize]> {
        self.subdomain_data
            .iter()
            .find(|data| data.domain == domain && data.integral_type == integral_type)
            .map(|data| data.entities.as_slice())
    }

    pub fn rank(&self) -> usize {
        self.arguments.len()
    }

    pub fn arguments(&self) -> &[Arc<FunctionSpace>] {
        &self.arguments
    }

    pub fn test_space(&self) -> Option<&Arc<FunctionSpace>> {
        self.arguments.first()
    }

    pub fn trial_space(&self) -> Option<&Arc<FunctionSpace>> {
        self.arguments.get(1)
    }

    pub fn coefficients(&self) -> &[Function<T>] {
        &self.coefficients
    }

    pub fn domains(&self) -> &[Arc<Domain<T>>] {
        &self.domains
    }

    pub fn kernels(&self) -> &[CompiledKernel<T>] {
        &self.kernels
    }

    /// Check the form-level preconditions of assembly once, before anything is allocated.
    pub fn validate(&self) -> AssemblyResult<()> {
        let rank = self.rank();
        if rank > 2 {
            return Err(AssemblyError::invalid_form(rank, "forms must have at most two arguments"));
        }

        let topology = self.domains[0].topology();
        if self
            .domains
            .iter()
            .any(|d| !Arc::ptr_eq(d.topology(), topology) && d.topology() != topology)
        {
            return Err(AssemblyError::invalid_form(
                rank,
                "all integration domains must share a mesh topology",
            ));
        }

        if let Some(c) = self.coefficients.iter().find(|c| c.component().is_some()) {
            return Err(AssemblyError::invalid_target(
                rank,
                format!(
                    "integration of subscripted vector function space coefficient `{}` is not supported",
                    c.name()
                ),
            ));
        }

        for kernel in &self.kernels {
            let info = &kernel.info;
            if kernel.indices.len() != rank {
                return Err(AssemblyError::invalid_form(
                    rank,
                    format!(
                        "kernel `{}` has {} block indices, expected {}",
                        kernel.name(),
                        kernel.indices.len(),
                        rank
                    ),
                ));
            }
            for (argument, &index) in self.arguments.iter().zip(&kernel.indices) {
                if index >= argument.num_blocks() {
                    return Err(AssemblyError::invalid_form(
                        rank,
                        format!(
                            "kernel `{}` writes block {} of space `{}` which has {} blocks",
                            kernel.name(),
                            index,
                            argument.name(),
                            argument.num_blocks()
                        ),
                    ));
                }
            }
            if info.domain >= self.domains.len() {
                return Err(AssemblyError::invalid_form(
                    rank,
                    format!("kernel `{}` refers to missing domain {}", kernel.name(), info.domain),
                ));
            }
            if let Some(&n) = info.coefficients.iter().find(|&&n| n >= self.coefficients.len()) {
                return Err(AssemblyError::invalid_form(
                    rank,
                    format!("kernel `{}` refers to missing coefficient {}", kernel.name(), n),
                ));
            }
            if let Some(entities) = self.subdomain_data(info.domain, &info.integral_type) {
                self.validate_subdomain_data(kernel, entities)?;
            }
        }
        Ok(())
    }

    fn validate_subdomain_data(&self, kernel: &CompiledKernel<T>, entities: &[usize]) -> AssemblyResult<()> {
        let rank = self.rank();
        let info = &kernel.info;
        if info.integral_type != "cell" {
            return Err(AssemblyError::invalid_form(
                rank,
                format!(
                    "kernel `{}`: subdomain data is only supported with cell integrals, not `{}`",
                    kernel.name(),
                    info.integral_type
                ),
            ));
        }
        if let SubdomainId::Tag(tag) = info.subdomain_id {
            return Err(AssemblyError::invalid_form(
                rank,
                format!(
                    "kernel `{}` cannot use both subdomain data and subdomain id {}",
                    kernel.name(),
                    tag
                ),
            ));
        }
        let num_cells = self.domains[info.domain]
            .topology()
            .num_entities(EntitySetKind::Cells);
        if let Some(&cell) = entities.iter().find(|&&cell| cell >= num_cells) {
            return Err(AssemblyError::invalid_form(
                rank,
                format!("subdomain data refers to cell {cell}, but the mesh has {num_cells} cells"),
            ));
        }
        Ok(())
    }
}
