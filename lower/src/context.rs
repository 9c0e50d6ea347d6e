//! The per-compilation lowering context.
//!
//! Analyses that need fusion-wide facts (divisible splits, broadcast
//! concretization, launch geometry) read them from an explicit [`LowerCtx`]
//! handed down the call tree. At most one context may be live per thread;
//! entering a second one is an error, not a silent shadowing.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fusor_ir::error::{Error, Result};
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::scalar::Extent;
use fusor_ir::transform::{TransformKey, TransformKind};
use fusor_ir::types::ParallelType;
use fusor_ir::Fusion;

thread_local! {
    static CTX_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Which broadcast domains get concretized to real extents downstream, and
/// whether that concretization is unique.
#[derive(Debug, Default, Clone)]
pub struct ConcretizedBroadcasts {
    concretized: HashSet<IdKey>,
    multiple_extents: HashSet<IdKey>,
}

impl ConcretizedBroadcasts {
    pub fn mark_concretized(&mut self, id: &Arc<IterDomain>, unique: bool) {
        self.concretized.insert(IdKey::of(id));
        if !unique {
            self.multiple_extents.insert(IdKey::of(id));
        }
    }

    pub fn is_concretized(&self, id: &Arc<IterDomain>) -> bool {
        self.concretized.contains(&IdKey::of(id))
    }

    pub fn is_uniquely_concretized(&self, id: &Arc<IterDomain>) -> bool {
        self.is_concretized(id) && !self.multiple_extents.contains(&IdKey::of(id))
    }
}

/// Launch extent of each parallel dimension, plus whether every use of the
/// dimension exactly fills it.
#[derive(Debug, Default, Clone)]
pub struct ParallelDimExtents {
    dims: HashMap<ParallelType, ParallelDim>,
}

#[derive(Debug, Clone)]
pub struct ParallelDim {
    pub extent: Extent,
    pub exact: bool,
}

impl ParallelDimExtents {
    pub fn set(&mut self, pt: ParallelType, extent: Extent, exact: bool) {
        self.dims.insert(pt, ParallelDim { extent, exact });
    }

    pub fn get(&self, pt: ParallelType) -> Option<&ParallelDim> {
        self.dims.get(&pt)
    }

    /// Unregistered dimensions are treated as exact (extent inferred from the
    /// single use binding them).
    pub fn is_exact(&self, pt: ParallelType) -> bool {
        self.dims.get(&pt).is_none_or(|d| d.exact)
    }

    /// True when the launch extent of `id`'s parallel type is provably larger
    /// than `id`'s own extent, i.e. some threads fall outside the axis.
    pub fn is_oversubscribed(&self, id: &IterDomain) -> bool {
        let Some(dim) = self.dims.get(&id.parallel()) else {
            return false;
        };
        match (dim.extent.as_const(), id.extent().as_const()) {
            (Some(launch), Some(axis)) => launch > axis,
            // Unknown extents: assume oversubscribed unless marked exact.
            _ => !dim.exact,
        }
    }
}

/// Splits provably divisible from constant extents alone: the factor is a
/// constant that evenly divides the constant extent of the split input. A
/// factor of one divides anything, symbolic extents are never assumed to.
pub fn divisible_splits_of(fusion: &Fusion) -> HashSet<TransformKey> {
    let mut divisible = HashSet::new();
    for tv in fusion.tensors() {
        for t in tv.domain().transforms() {
            let TransformKind::Split { input, factor, .. } = &t.kind else {
                continue;
            };
            let splits_evenly = match (factor.as_const(), input.extent().as_const()) {
                (Some(1), _) => true,
                (Some(f), Some(extent)) => f != 0 && extent % f == 0,
                _ => false,
            };
            if splits_evenly {
                divisible.insert(TransformKey::of(t));
            }
        }
    }
    divisible
}

/// Explicit lowering context; replaces any notion of a process-global
/// "current lowering".
#[derive(Debug)]
pub struct LowerCtx<'f> {
    fusion: &'f Fusion,
    divisible_splits: HashSet<TransformKey>,
    concretized: ConcretizedBroadcasts,
    parallel_extents: ParallelDimExtents,
}

impl<'f> LowerCtx<'f> {
    /// Claim the thread's lowering slot. Fails if a context is already live.
    pub fn enter(fusion: &'f Fusion) -> Result<Self> {
        let already = CTX_ACTIVE.with(|flag| flag.replace(true));
        if already {
            return Err(Error::NestedLoweringContext);
        }
        Ok(Self {
            fusion,
            divisible_splits: divisible_splits_of(fusion),
            concretized: ConcretizedBroadcasts::default(),
            parallel_extents: ParallelDimExtents::default(),
        })
    }

    pub fn fusion(&self) -> &'f Fusion {
        self.fusion
    }

    /// Add splits known divisible beyond what the constant-extent derivation
    /// finds, e.g. from runtime shape information.
    pub fn register_divisible_splits(&mut self, splits: impl IntoIterator<Item = TransformKey>) {
        self.divisible_splits.extend(splits);
    }

    pub fn divisible_splits(&self) -> &HashSet<TransformKey> {
        &self.divisible_splits
    }

    pub fn set_concretized(&mut self, info: ConcretizedBroadcasts) {
        self.concretized = info;
    }

    pub fn concretized(&self) -> &ConcretizedBroadcasts {
        &self.concretized
    }

    pub fn set_parallel_extents(&mut self, extents: ParallelDimExtents) {
        self.parallel_extents = extents;
    }

    pub fn parallel_extents(&self) -> &ParallelDimExtents {
        &self.parallel_extents
    }
}

impl Drop for LowerCtx<'_> {
    fn drop(&mut self) {
        CTX_ACTIVE.with(|flag| flag.set(false));
    }
}
