//! Iteration domains: the single-axis building block every analysis reasons
//! about.
//!
//! An [`IterDomain`] is immutable apart from its parallel binding, which the
//! scheduler rebinds in place. Identity is a process-unique `u64`; [`IdKey`]
//! wraps an `Arc<IterDomain>` with id-based hashing for map keys.

use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::scalar::Extent;
use crate::transform::{Transform, TransformKind};
use crate::types::{IterKind, ParallelType, Swizzle2DKind, SwizzleKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct IterDomain {
    id: u64,
    extent: Extent,
    /// Broadcast domains expanded against a concrete size keep the original
    /// unit extent and record the expansion here.
    expanded_extent: Option<Extent>,
    kind: IterKind,
    parallel: Cell<ParallelType>,
    /// Produced by a transformation that defines the allocation position
    /// (rfactor); such domains must replay exactly.
    is_rfactor: bool,
}

impl IterDomain {
    fn make(extent: Extent, kind: IterKind, is_rfactor: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            extent,
            expanded_extent: None,
            kind,
            parallel: Cell::new(ParallelType::Serial),
            is_rfactor,
        })
    }

    pub fn iteration(extent: Extent) -> Arc<Self> {
        Self::make(extent, IterKind::Iteration, false)
    }

    pub fn reduction(extent: Extent) -> Arc<Self> {
        Self::make(extent, IterKind::Reduction, false)
    }

    pub fn broadcast() -> Arc<Self> {
        Self::make(Extent::Const(1), IterKind::Broadcast, false)
    }

    /// Broadcast carrying the size it will be expanded to.
    pub fn expanded_broadcast(expanded: Extent) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            extent: Extent::Const(1),
            expanded_extent: Some(expanded),
            kind: IterKind::Broadcast,
            parallel: Cell::new(ParallelType::Serial),
            is_rfactor: false,
        })
    }

    pub fn with_kind(extent: Extent, kind: IterKind) -> Arc<Self> {
        Self::make(extent, kind, false)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn expanded_extent(&self) -> Option<&Extent> {
        self.expanded_extent.as_ref()
    }

    pub fn kind(&self) -> IterKind {
        self.kind
    }

    pub fn parallel(&self) -> ParallelType {
        self.parallel.get()
    }

    pub fn parallelize(&self, pt: ParallelType) {
        self.parallel.set(pt);
    }

    pub fn is_rfactor(&self) -> bool {
        self.is_rfactor
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind == IterKind::Broadcast
    }

    pub fn is_reduction(&self) -> bool {
        self.kind == IterKind::Reduction
    }

    pub fn is_iteration(&self) -> bool {
        self.kind == IterKind::Iteration
    }

    pub fn is_device_dim(&self) -> bool {
        self.parallel().is_device_dim()
    }

    pub fn is_thread_dim(&self) -> bool {
        self.parallel().is_thread_dim()
    }

    pub fn is_parallelized(&self) -> bool {
        self.parallel() != ParallelType::Serial
    }

    /// Same extent, kind and rfactor tagging; identity is ignored.
    pub fn same_as(&self, other: &IterDomain) -> bool {
        self.kind == other.kind
            && self.extent == other.extent
            && self.expanded_extent == other.expanded_extent
            && self.is_rfactor == other.is_rfactor
    }

    /// Split `input` by `factor`. `inner_split` picks which output carries
    /// the factor; the other side gets the ceil-divided extent.
    pub fn split(
        input: &Arc<IterDomain>,
        factor: Extent,
        inner_split: bool,
        rfactor: bool,
    ) -> (Arc<IterDomain>, Arc<IterDomain>, Arc<Transform>) {
        let quotient = input.extent().ceil_div(&factor);
        let (outer_extent, inner_extent) = if inner_split {
            (quotient, factor.clone())
        } else {
            (factor.clone(), quotient)
        };
        let outer = Self::make(outer_extent, input.kind(), rfactor);
        let inner = Self::make(inner_extent, input.kind(), rfactor);
        let t = Transform::new(TransformKind::Split {
            input: input.clone(),
            outer: outer.clone(),
            inner: inner.clone(),
            factor,
            inner_split,
        });
        (outer, inner, t)
    }

    /// Merge `outer` and `inner` into one domain of the product extent.
    pub fn merge(
        outer: &Arc<IterDomain>,
        inner: &Arc<IterDomain>,
        rfactor: bool,
    ) -> (Arc<IterDomain>, Arc<Transform>) {
        let extent = outer.extent().mul(inner.extent());
        let kind = if outer.is_broadcast() && inner.is_broadcast() {
            IterKind::Broadcast
        } else if outer.is_reduction() && inner.is_reduction() {
            IterKind::Reduction
        } else if outer.is_iteration() || inner.is_iteration() {
            IterKind::Iteration
        } else {
            outer.kind()
        };
        let out = Self::make(extent, kind, rfactor);
        let t = Transform::new(TransformKind::Merge {
            outer: outer.clone(),
            inner: inner.clone(),
            output: out.clone(),
        });
        (out, t)
    }

    /// Pairwise element swizzle; outputs mirror the inputs' extents.
    pub fn swizzle(
        kind: SwizzleKind,
        in_x: &Arc<IterDomain>,
        in_y: &Arc<IterDomain>,
    ) -> (Arc<IterDomain>, Arc<IterDomain>, Arc<Transform>) {
        let out_x = Self::make(in_x.extent().clone(), in_x.kind(), in_x.is_rfactor());
        let out_y = Self::make(in_y.extent().clone(), in_y.kind(), in_y.is_rfactor());
        let t = Transform::new(TransformKind::Swizzle {
            kind,
            in_x: in_x.clone(),
            in_y: in_y.clone(),
            out_x: out_x.clone(),
            out_y: out_y.clone(),
        });
        (out_x, out_y, t)
    }

    pub fn swizzle_2d(
        kind: Swizzle2DKind,
        in_x: &Arc<IterDomain>,
        in_y: &Arc<IterDomain>,
    ) -> (Arc<IterDomain>, Arc<IterDomain>, Arc<Transform>) {
        let out_x = Self::make(in_x.extent().clone(), in_x.kind(), in_x.is_rfactor());
        let out_y = Self::make(in_y.extent().clone(), in_y.kind(), in_y.is_rfactor());
        let t = Transform::new(TransformKind::Swizzle2D {
            kind,
            in_x: in_x.clone(),
            in_y: in_y.clone(),
            out_x: out_x.clone(),
            out_y: out_y.clone(),
        });
        (out_x, out_y, t)
    }

    /// Grow (or shrink, with negative amounts) a domain at both ends.
    pub fn resize(
        input: &Arc<IterDomain>,
        left: i64,
        right: i64,
        rfactor: bool,
    ) -> (Arc<IterDomain>, Arc<Transform>) {
        let out = Self::make(input.extent().add_const(left + right), input.kind(), rfactor);
        let t = Transform::new(TransformKind::Resize {
            input: input.clone(),
            output: out.clone(),
            left,
            right,
        });
        (out, t)
    }
}

impl fmt::Display for IterDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = match self.kind {
            IterKind::Iteration => 'i',
            IterKind::Reduction => 'r',
            IterKind::Broadcast => 'b',
            IterKind::GatherScatter => 'g',
            IterKind::Stride => 's',
        };
        write!(f, "{k}{}{{{}}}", self.id, self.extent)?;
        if self.parallel() != ParallelType::Serial {
            write!(f, "@{}", self.parallel())?;
        }
        Ok(())
    }
}

/// Id-keyed handle for hash maps and sets of iteration domains.
#[derive(Debug, Clone)]
pub struct IdKey(pub Arc<IterDomain>);

impl IdKey {
    pub fn of(id: &Arc<IterDomain>) -> Self {
        IdKey(id.clone())
    }
}

impl PartialEq for IdKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

impl Eq for IdKey {}

impl Hash for IdKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id().hash(state);
    }
}

impl PartialOrd for IdKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id().cmp(&other.0.id())
    }
}
