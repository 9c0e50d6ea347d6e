//! The closed union of iteration-domain transformations.
//!
//! Every rewrite of a tensor's loop structure is one of five expression
//! shapes. Analyses dispatch by matching on [`TransformKind`]; there is no
//! dynamic casting and no open extension point.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::iter_domain::IterDomain;
use crate::scalar::Extent;
use crate::types::{Swizzle2DKind, SwizzleKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct Transform {
    id: u64,
    pub kind: TransformKind,
}

#[derive(Debug, Clone)]
pub enum TransformKind {
    /// One domain into an (outer, inner) pair. `factor` sizes the side picked
    /// by `inner_split`; the other side is the ceil-divided quotient.
    Split {
        input: Arc<IterDomain>,
        outer: Arc<IterDomain>,
        inner: Arc<IterDomain>,
        factor: Extent,
        inner_split: bool,
    },
    /// (outer, inner) pair into one domain of the product extent.
    Merge {
        outer: Arc<IterDomain>,
        inner: Arc<IterDomain>,
        output: Arc<IterDomain>,
    },
    /// Element swizzle over a pair of domains; extents are preserved.
    Swizzle {
        kind: SwizzleKind,
        in_x: Arc<IterDomain>,
        in_y: Arc<IterDomain>,
        out_x: Arc<IterDomain>,
        out_y: Arc<IterDomain>,
    },
    /// Tile swizzle over a pair of domains; extents are preserved.
    Swizzle2D {
        kind: Swizzle2DKind,
        in_x: Arc<IterDomain>,
        in_y: Arc<IterDomain>,
        out_x: Arc<IterDomain>,
        out_y: Arc<IterDomain>,
    },
    /// Extent change by `left`/`right` elements at the boundaries.
    Resize {
        input: Arc<IterDomain>,
        output: Arc<IterDomain>,
        left: i64,
        right: i64,
    },
}

impl Transform {
    pub fn new(kind: TransformKind) -> Arc<Self> {
        Arc::new(Self { id: NEXT_ID.fetch_add(1, Ordering::Relaxed), kind })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inputs(&self) -> SmallVec<[Arc<IterDomain>; 2]> {
        match &self.kind {
            TransformKind::Split { input, .. } => smallvec![input.clone()],
            TransformKind::Merge { outer, inner, .. } => {
                smallvec![outer.clone(), inner.clone()]
            }
            TransformKind::Swizzle { in_x, in_y, .. }
            | TransformKind::Swizzle2D { in_x, in_y, .. } => {
                smallvec![in_x.clone(), in_y.clone()]
            }
            TransformKind::Resize { input, .. } => smallvec![input.clone()],
        }
    }

    pub fn outputs(&self) -> SmallVec<[Arc<IterDomain>; 2]> {
        match &self.kind {
            TransformKind::Split { outer, inner, .. } => {
                smallvec![outer.clone(), inner.clone()]
            }
            TransformKind::Merge { output, .. } => smallvec![output.clone()],
            TransformKind::Swizzle { out_x, out_y, .. }
            | TransformKind::Swizzle2D { out_x, out_y, .. } => {
                smallvec![out_x.clone(), out_y.clone()]
            }
            TransformKind::Resize { output, .. } => smallvec![output.clone()],
        }
    }

    pub fn is_split(&self) -> bool {
        matches!(self.kind, TransformKind::Split { .. })
    }

    pub fn is_merge(&self) -> bool {
        matches!(self.kind, TransformKind::Merge { .. })
    }

    pub fn is_resize(&self) -> bool {
        matches!(self.kind, TransformKind::Resize { .. })
    }

    pub fn is_swizzle(&self) -> bool {
        matches!(
            self.kind,
            TransformKind::Swizzle { .. } | TransformKind::Swizzle2D { .. }
        )
    }

    /// Identity swizzles propagate like no-ops in ordering analyses.
    pub fn is_noop_swizzle(&self) -> bool {
        matches!(
            self.kind,
            TransformKind::Swizzle { kind: SwizzleKind::NoSwizzle, .. }
                | TransformKind::Swizzle2D { kind: Swizzle2DKind::NoSwizzle, .. }
        )
    }

    /// Any output defines an allocation position.
    pub fn produces_rfactor(&self) -> bool {
        self.outputs().iter().any(|id| id.is_rfactor())
    }

    /// Same shape and attributes; input/output identities are not compared.
    /// Two merges always match, splits compare factor and orientation,
    /// swizzles their kind, resizes their expansion amounts.
    pub fn matches(&self, other: &Transform) -> bool {
        match (&self.kind, &other.kind) {
            (
                TransformKind::Split { factor: fa, inner_split: ia, .. },
                TransformKind::Split { factor: fb, inner_split: ib, .. },
            ) => fa == fb && ia == ib,
            (TransformKind::Merge { .. }, TransformKind::Merge { .. }) => true,
            (
                TransformKind::Swizzle { kind: ka, .. },
                TransformKind::Swizzle { kind: kb, .. },
            ) => ka == kb,
            (
                TransformKind::Swizzle2D { kind: ka, .. },
                TransformKind::Swizzle2D { kind: kb, .. },
            ) => ka == kb,
            (
                TransformKind::Resize { left: la, right: ra, .. },
                TransformKind::Resize { left: lb, right: rb, .. },
            ) => la == lb && ra == rb,
            _ => false,
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TransformKind::Split { input, outer, inner, factor, inner_split } => write!(
                f,
                "split({input}, {factor}, {}) -> ({outer}, {inner})",
                if *inner_split { "inner" } else { "outer" }
            ),
            TransformKind::Merge { outer, inner, output } => {
                write!(f, "merge({outer}, {inner}) -> {output}")
            }
            TransformKind::Swizzle { kind, in_x, in_y, out_x, out_y } => {
                write!(f, "swizzle[{kind}]({in_x}, {in_y}) -> ({out_x}, {out_y})")
            }
            TransformKind::Swizzle2D { kind, in_x, in_y, out_x, out_y } => {
                write!(f, "swizzle2d[{kind}]({in_x}, {in_y}) -> ({out_x}, {out_y})")
            }
            TransformKind::Resize { input, output, left, right } => {
                write!(f, "resize({input}, {left}, {right}) -> {output}")
            }
        }
    }
}

/// Id-keyed handle for hash maps and sets of transformations.
#[derive(Debug, Clone)]
pub struct TransformKey(pub Arc<Transform>);

impl TransformKey {
    pub fn of(t: &Arc<Transform>) -> Self {
        TransformKey(t.clone())
    }
}

impl PartialEq for TransformKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

impl Eq for TransformKey {}

impl Hash for TransformKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id().hash(state);
    }
}
