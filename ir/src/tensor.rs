//! Tensor views: named handles pairing a [`TensorDomain`] with storage and
//! distribution attributes.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::TensorDomain;
use crate::types::{DType, DeviceMesh, MemoryType};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A tensor as seen by scheduling and lowering analyses.
///
/// The domain sits behind a `RefCell`: scheduling rewrites loop structure in
/// place, and compilation is single-threaded by construction.
#[derive(Debug)]
pub struct TensorView {
    id: u64,
    name: String,
    dtype: DType,
    memory: MemoryType,
    domain: RefCell<TensorDomain>,
    mesh: RefCell<Option<DeviceMesh>>,
    /// Zero-dimensional host-resident scalar; exempt from sharding checks.
    cpu_scalar: bool,
}

impl TensorView {
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        memory: MemoryType,
        domain: TensorDomain,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            dtype,
            memory,
            domain: RefCell::new(domain),
            mesh: RefCell::new(None),
            cpu_scalar: false,
        })
    }

    pub fn cpu_scalar(name: impl Into<String>, dtype: DType) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            dtype,
            memory: MemoryType::Global,
            domain: RefCell::new(TensorDomain::new_contiguous(Vec::new())),
            mesh: RefCell::new(None),
            cpu_scalar: true,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    pub fn domain(&self) -> Ref<'_, TensorDomain> {
        self.domain.borrow()
    }

    pub fn domain_mut(&self) -> RefMut<'_, TensorDomain> {
        self.domain.borrow_mut()
    }

    pub fn mesh(&self) -> Option<DeviceMesh> {
        self.mesh.borrow().clone()
    }

    pub fn set_mesh(&self, mesh: DeviceMesh) {
        *self.mesh.borrow_mut() = Some(mesh);
    }

    pub fn has_mesh(&self) -> bool {
        self.mesh.borrow().is_some()
    }

    pub fn is_cpu_scalar(&self) -> bool {
        self.cpu_scalar
    }

    pub fn ndims(&self) -> usize {
        self.domain.borrow().ndims()
    }
}

impl fmt::Display for TensorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.id)
    }
}

/// Id-keyed handle for hash maps and sets of tensor views.
#[derive(Debug, Clone)]
pub struct TvKey(pub Arc<TensorView>);

impl TvKey {
    pub fn of(tv: &Arc<TensorView>) -> Self {
        TvKey(tv.clone())
    }
}

impl PartialEq for TvKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

impl Eq for TvKey {}

impl Hash for TvKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id().hash(state);
    }
}
