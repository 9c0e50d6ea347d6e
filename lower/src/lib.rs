//! Lowering analyses over the iteration-domain IR.
//!
//! Everything here consumes a scheduled [`fusor_ir::Fusion`] and answers
//! questions code generation needs: how one tensor's loop structure replays
//! onto another, which allocation axes can be indexed as one contiguous run,
//! which expressions need inline bounds predicates, and whether
//! producer/consumer pairs agree on device sharding.
//!
//! # Module Organization
//!
//! - [`context`] - The explicit per-compilation lowering context
//! - [`replay`] - Exact transformation replay
//! - [`best_effort`] - Best-effort matching of two transformation histories
//! - [`logical_map`] - Pairwise producer/consumer logical-domain mapping
//! - [`ordered`] - Consistent-ordering and exclusivity tracking
//! - [`contiguity`] - Contiguous-merge indexing and non-divisible splits
//! - [`predicate`] - Predicate elimination
//! - [`sharding`] - Multi-device sharding consistency

pub mod best_effort;
pub mod context;
pub mod contiguity;
pub mod logical_map;
pub mod ordered;
pub mod predicate;
pub mod replay;
pub mod sharding;

pub use fusor_ir::error::{Error, Result};

pub use best_effort::{BestEffortReplay, ForwardingInfo};
pub use context::{ConcretizedBroadcasts, LowerCtx, ParallelDimExtents};
pub use contiguity::{ContigIds, NonDivisibleSplits};
pub use ordered::OrderedIdInformation;
pub use predicate::PredicateElimination;
pub use replay::ReplayTransformations;
pub use sharding::{
    have_different_shardings, is_inner_resharding, is_resharding, is_sharded,
    num_device_dims, sharded_logical_axis, sharding_changes, unsharded_extents,
    ShardingChanges,
};

#[cfg(test)]
pub mod test;
