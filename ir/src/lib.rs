//! Iteration-domain IR for tensor-program lowering analyses.
//!
//! This crate defines the value-level representation the lowering analyses
//! operate on: per-axis iteration domains, the closed union of domain
//! transformations, tensor domains/views/ops, and the traversal and symbolic
//! scalar machinery they share.
//!
//! # Module Organization
//!
//! - [`types`] - Fundamental enums (iteration kinds, parallel types, dtypes)
//! - [`scalar`] - Symbolic integer expressions and the range-aware simplifier
//! - [`iter_domain`] - Single-axis iteration domains
//! - [`transform`] - Split/Merge/Swizzle/Resize transformation union
//! - [`domain`] - Per-tensor root/logical/allocation/loop domains
//! - [`tensor`] - Tensor views
//! - [`ops`] - Tensor-level operation union
//! - [`fusion`] - The compilation-unit container
//! - [`traversal`] - Dependency walks over transformation histories
//! - [`disjoint`] - Union-find
//! - [`error`] - Error taxonomy and result alias

pub mod disjoint;
pub mod domain;
pub mod error;
pub mod fusion;
pub mod iter_domain;
pub mod ops;
pub mod scalar;
pub mod tensor;
pub mod transform;
pub mod traversal;
pub mod types;

pub use disjoint::DisjointSets;
pub use domain::{no_broadcasts, no_reductions, TensorDomain};
pub use error::{Error, Result};
pub use fusion::Fusion;
pub use iter_domain::{IdKey, IterDomain};
pub use ops::{OpInput, OpKind, TensorOp, WelfordTriplet};
pub use scalar::{bounds_of, prove_equal, simplify, substitute, Extent, ScalarExpr};
pub use tensor::{TensorView, TvKey};
pub use transform::{Transform, TransformKey, TransformKind};
pub use traversal::DependencyGraph;
pub use types::{
    BinaryOpKind, ConstValue, DType, DeviceMesh, IterKind, LoadStoreKind, MemoryType,
    ParallelType, ReduceOpKind, Swizzle2DKind, SwizzleKind, UnaryOpKind,
};

#[cfg(test)]
pub mod test;
