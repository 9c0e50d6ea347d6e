//! Sharding consistency across device meshes.
//!
//! A tensor axis bound to a device dimension (`DIDx`/`DIDy`/`DIDz`) is split
//! across the mesh instead of iterated. An expression whose producer and
//! consumer disagree on which data lands on which device cannot lower to a
//! local kernel; it needs communication first. The core question here is
//! therefore: given a device id on both sides, does it select the same slice
//! of the shared data?
//!
//! The check is symbolic. Every logical axis feeding a device dimension gets
//! a fresh bounded variable, split and merge arithmetic is traced down to the
//! loop ids, and the producer and consumer index expressions are compared
//! with [`prove_equal`]. An unprovable equality is treated as resharding,
//! which errs on the side of inserting communication.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use snafu::ensure;
use tracing::trace;

use fusor_ir::error::{Error, Result, UnsupportedTransformSnafu};
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::ops::TensorOp;
use fusor_ir::scalar::{prove_equal, simplify, Extent, ScalarExpr};
use fusor_ir::tensor::TensorView;
use fusor_ir::transform::TransformKind;
use fusor_ir::traversal::DependencyGraph;
use fusor_ir::types::ParallelType;

use crate::logical_map::PairwiseLogicalMap;

/// Symbolic index carried by an iteration domain while tracing device
/// parallelization back to the data.
///
/// `mapped` records whether the index speaks about axes the producer and
/// consumer share; an index over a one-sided axis (a sharded reduction, say)
/// says nothing about data placement on the other side.
#[derive(Debug, Clone)]
struct ShardIndex {
    expr: Arc<ScalarExpr>,
    mapped: bool,
}

/// The single id in `domain` bound to `pt`, if any.
fn unique_device_id(
    tv: &Arc<TensorView>,
    domain: &[Arc<IterDomain>],
    pt: ParallelType,
) -> Result<Option<Arc<IterDomain>>> {
    domain
        .iter()
        .filter(|id| id.parallel() == pt)
        .at_most_one()
        .map(|found| found.cloned())
        .map_err(|_| Error::AmbiguousShardingAttribution {
            tv: tv.to_string(),
            parallel: pt,
            reason: "more than one axis is bound to this device dimension".into(),
        })
}

/// Backward closure of `target` truncated at `domain`: the ids of `domain`
/// (or undefined ids) that `target` is derived from.
fn sources_within(
    graph: &DependencyGraph,
    target: &Arc<IterDomain>,
    domain: &[Arc<IterDomain>],
) -> Vec<Arc<IterDomain>> {
    let domain_set: HashSet<IdKey> = domain.iter().map(IdKey::of).collect();
    let mut seen: HashSet<IdKey> = HashSet::new();
    let mut sources = Vec::new();
    let mut stack = vec![target.clone()];
    while let Some(id) = stack.pop() {
        if !seen.insert(IdKey::of(&id)) {
            continue;
        }
        if domain_set.contains(&IdKey::of(&id)) {
            sources.push(id);
            continue;
        }
        match graph.definition(&id) {
            Some(def) => {
                let mut inputs = def.inputs();
                inputs.reverse();
                stack.extend(inputs);
            }
            None => sources.push(id),
        }
    }
    sources
}

/// Propagate recorded source indices forward to `target` through its
/// transformation history. Splits divide and take the remainder against the
/// inner extent, merges recombine; anything else cannot carry a device index.
fn loop_index(
    graph: &DependencyGraph,
    target: &Arc<IterDomain>,
    indices: &mut HashMap<IdKey, ShardIndex>,
) -> Result<Option<ShardIndex>> {
    if let Some(idx) = indices.get(&IdKey::of(target)) {
        return Ok(Some(idx.clone()));
    }
    let stop: HashSet<IdKey> = indices.keys().cloned().collect();
    for t in graph.exprs_to_stopping_at(std::slice::from_ref(target), &stop) {
        if t.outputs().iter().all(|out| indices.contains_key(&IdKey::of(out))) {
            continue;
        }
        let input_index = |indices: &HashMap<IdKey, ShardIndex>,
                           id: &Arc<IterDomain>|
         -> Result<ShardIndex> {
            indices.get(&IdKey::of(id)).cloned().ok_or_else(|| {
                Error::UnsupportedTransform {
                    reason: format!("no device index recorded for {id}, an input of {t}"),
                }
            })
        };
        match &t.kind {
            TransformKind::Split { input, outer, inner, .. } => {
                let in_idx = input_index(indices, input)?;
                let inner_extent = inner.extent().to_scalar();
                indices.insert(
                    IdKey::of(outer),
                    ShardIndex {
                        expr: simplify(&ScalarExpr::div(
                            in_idx.expr.clone(),
                            inner_extent.clone(),
                        )),
                        mapped: in_idx.mapped,
                    },
                );
                indices.insert(
                    IdKey::of(inner),
                    ShardIndex {
                        expr: simplify(&ScalarExpr::modulo(in_idx.expr, inner_extent)),
                        mapped: in_idx.mapped,
                    },
                );
            }
            TransformKind::Merge { outer, inner, output } => {
                let outer_idx = input_index(indices, outer)?;
                let inner_idx = input_index(indices, inner)?;
                let expr = simplify(&ScalarExpr::add(
                    ScalarExpr::mul(outer_idx.expr, inner.extent().to_scalar()),
                    inner_idx.expr,
                ));
                indices.insert(
                    IdKey::of(output),
                    ShardIndex { expr, mapped: outer_idx.mapped || inner_idx.mapped },
                );
            }
            _ => {
                return Err(Error::UnsupportedTransform {
                    reason: format!("cannot trace a device index through {t}"),
                });
            }
        }
    }
    Ok(indices.get(&IdKey::of(target)).cloned())
}

/// Whether `producer` and `consumer` place mapped data on different devices.
///
/// CPU scalars and fully unmeshed pairs never reshard; differing meshes
/// always do. Otherwise each device dimension's loop index is derived
/// symbolically on both sides, with consumer root axes reusing the variable
/// of the producer axis they map to, and the two expressions must be provably
/// equal. A device dimension over an unmapped axis contributes no index and
/// matches only an equally absent index on the other side.
pub fn have_different_shardings(
    op: &Arc<TensorOp>,
    producer: &Arc<TensorView>,
    consumer: &Arc<TensorView>,
) -> Result<bool> {
    if producer.is_cpu_scalar() || consumer.is_cpu_scalar() {
        return Ok(false);
    }
    if !producer.has_mesh() && !consumer.has_mesh() {
        return Ok(false);
    }
    if producer.mesh() != consumer.mesh() {
        trace!(%producer, %consumer, "meshes differ");
        return Ok(true);
    }

    let p_domain = producer.domain();
    let c_domain = consumer.domain();
    let p_graph = DependencyGraph::new(p_domain.transforms())?;
    let c_graph = DependencyGraph::new(c_domain.transforms())?;

    // Broadcast axes replicate rather than shard; they never witness a
    // placement difference.
    let c2p: HashMap<IdKey, Arc<IterDomain>> = PairwiseLogicalMap::new(op, producer, consumer)
        .map_consumer_to_producer(None)
        .into_iter()
        .filter(|(c, p)| !c.0.is_broadcast() && !p.is_broadcast())
        .collect();
    let mapped_p_logical: HashSet<IdKey> = c2p.values().map(IdKey::of).collect();

    let mut indices: HashMap<IdKey, ShardIndex> = HashMap::new();
    for pt in ParallelType::DEVICE {
        if let Some(p_loop) = unique_device_id(producer, p_domain.loop_domain(), pt)? {
            for src in sources_within(&p_graph, &p_loop, p_domain.logical()) {
                indices.entry(IdKey::of(&src)).or_insert_with(|| ShardIndex {
                    expr: ScalarExpr::var(src.extent().clone()),
                    mapped: mapped_p_logical.contains(&IdKey::of(&src)),
                });
            }
        }
        if let Some(c_loop) = unique_device_id(consumer, c_domain.loop_domain(), pt)? {
            for src in sources_within(&c_graph, &c_loop, c_domain.root()) {
                if indices.contains_key(&IdKey::of(&src)) {
                    continue;
                }
                let idx = match c2p.get(&IdKey::of(&src)) {
                    Some(p_id) => match indices.get(&IdKey::of(p_id)) {
                        Some(p_idx) => ShardIndex { expr: p_idx.expr.clone(), mapped: true },
                        None => {
                            let fresh = ShardIndex {
                                expr: ScalarExpr::var(src.extent().clone()),
                                mapped: true,
                            };
                            indices.insert(IdKey::of(p_id), fresh.clone());
                            fresh
                        }
                    },
                    None => ShardIndex {
                        expr: ScalarExpr::var(src.extent().clone()),
                        mapped: false,
                    },
                };
                indices.insert(IdKey::of(&src), idx);
            }
        }
    }

    for pt in ParallelType::DEVICE {
        let p_index = match unique_device_id(producer, p_domain.loop_domain(), pt)? {
            Some(p_loop) => loop_index(&p_graph, &p_loop, &mut indices)?,
            None => None,
        };
        let c_index = match unique_device_id(consumer, c_domain.loop_domain(), pt)? {
            Some(c_loop) => loop_index(&c_graph, &c_loop, &mut indices)?,
            None => None,
        };
        let p_expr = p_index.filter(|idx| idx.mapped).map(|idx| idx.expr);
        let c_expr = c_index.filter(|idx| idx.mapped).map(|idx| idx.expr);
        match (p_expr, c_expr) {
            (None, None) => {}
            (Some(p), Some(c)) => {
                if !prove_equal(&p, &c) {
                    trace!(%producer, %consumer, %pt, "device indices not provably equal");
                    return Ok(true);
                }
            }
            _ => {
                trace!(%producer, %consumer, %pt, "device dimension on one side only");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Whether any producer/consumer pair of `op` requires communication.
pub fn is_resharding(op: &Arc<TensorOp>) -> Result<bool> {
    for input in op.inputs() {
        for output in op.outputs() {
            if have_different_shardings(op, &input, &output)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Per-axis sharding difference between one producer/consumer pair.
///
/// `deletions` are producer axes that stop being device parallel; `additions`
/// are consumer axes that become device parallel. A mapped pair that is
/// device parallel on both sides must agree on the device dimension.
#[derive(Debug, Default)]
pub struct ShardingChanges {
    pub additions: Vec<Arc<IterDomain>>,
    pub deletions: Vec<Arc<IterDomain>>,
}

pub fn sharding_changes(
    op: &Arc<TensorOp>,
    producer: &Arc<TensorView>,
    consumer: &Arc<TensorView>,
) -> Result<ShardingChanges> {
    let mut changes = ShardingChanges::default();
    let c2p = PairwiseLogicalMap::new(op, producer, consumer).map_consumer_to_producer(None);
    for (c_key, p_id) in &c2p {
        let c_id = &c_key.0;
        if p_id.is_device_dim() && c_id.is_device_dim() {
            ensure!(
                p_id.parallel() == c_id.parallel(),
                UnsupportedTransformSnafu {
                    reason: format!(
                        "{producer} and {consumer} bind a mapped axis to different \
                         device dimensions ({} vs {})",
                        p_id.parallel(),
                        c_id.parallel()
                    ),
                }
            );
            continue;
        }
        if p_id.is_device_dim() && !p_id.is_broadcast() && !c_id.is_reduction() {
            changes.deletions.push(p_id.clone());
        } else if c_id.is_device_dim() && !c_id.is_broadcast() {
            changes.additions.push(c_id.clone());
        }
    }
    Ok(changes)
}

/// Position of `target` in `tv`'s loop domain counting only materialized
/// axes, skipping device, reduction and broadcast dimensions.
fn allocation_index(tv: &Arc<TensorView>, target: &Arc<IterDomain>) -> Option<usize> {
    let domain = tv.domain();
    let mut index = 0;
    for id in domain.loop_domain() {
        if id.id() == target.id() {
            return Some(index);
        }
        if !id.is_device_dim() && !id.is_reduction() && !id.is_broadcast() {
            index += 1;
        }
    }
    None
}

/// Whether `op` reshards an axis that is not outermost in its allocation.
///
/// Communication over a non-outermost axis moves strided slices; the lowering
/// inserts a relayout first, so callers need to know. At most one axis may
/// change sharding per producer/consumer pair.
pub fn is_inner_resharding(op: &Arc<TensorOp>) -> Result<bool> {
    for input in op.inputs() {
        for output in op.outputs() {
            let changes = sharding_changes(op, &input, &output)?;
            ensure!(
                changes.additions.len() + changes.deletions.len() <= 1,
                UnsupportedTransformSnafu {
                    reason: format!("{op} changes the sharding of more than one axis"),
                }
            );
            if let Some(id) = changes.deletions.first() {
                if allocation_index(&input, id).is_some_and(|i| i > 0) {
                    return Ok(true);
                }
            }
            if let Some(id) = changes.additions.first() {
                if allocation_index(&output, id).is_some_and(|i| i > 0) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Whether `tv` has a device-parallel allocation axis. At most one axis may
/// be device parallel per tensor.
pub fn is_sharded(tv: &Arc<TensorView>) -> Result<bool> {
    let domain = tv.domain();
    let mut seen = false;
    for id in domain.maybe_allocation() {
        if !id.is_device_dim() {
            continue;
        }
        if seen {
            return Err(Error::AmbiguousShardingAttribution {
                tv: tv.to_string(),
                parallel: id.parallel(),
                reason: "more than one allocation axis is device parallel".into(),
            });
        }
        seen = true;
    }
    Ok(seen)
}

/// Number of device-parallel loop axes of `tv`.
pub fn num_device_dims(tv: &Arc<TensorView>) -> usize {
    tv.domain().loop_domain().iter().filter(|id| id.is_device_dim()).count()
}

/// The logical tensor axis sharded by `pt`, as an index into the materialized
/// axes (reductions excluded), or `None` when `pt` is unused.
///
/// The device-parallel allocation axis is attributed backward through its
/// history. Only the outer output of a split attributes cleanly; a device
/// dimension on an inner split output or downstream of a merge has no single
/// logical axis to blame.
pub fn sharded_logical_axis(
    tv: &Arc<TensorView>,
    pt: ParallelType,
) -> Result<Option<usize>> {
    let domain = tv.domain();
    let Some(alloc_id) = unique_device_id(tv, domain.maybe_allocation(), pt)? else {
        return Ok(None);
    };
    let graph = DependencyGraph::new(domain.transforms())?;

    let mut logical_axes: HashMap<IdKey, usize> = HashMap::new();
    let mut axis = 0usize;
    for id in domain.logical() {
        if id.is_reduction() {
            continue;
        }
        logical_axes.insert(IdKey::of(id), axis);
        axis += 1;
    }

    let mut id = alloc_id;
    loop {
        if let Some(axis) = logical_axes.get(&IdKey::of(&id)) {
            return Ok(Some(*axis));
        }
        let Some(def) = graph.definition(&id).cloned() else {
            return Err(Error::AmbiguousShardingAttribution {
                tv: tv.to_string(),
                parallel: pt,
                reason: format!("{id} is not derived from the logical domain"),
            });
        };
        match &def.kind {
            TransformKind::Split { input, outer, .. } => {
                if id.id() != outer.id() {
                    return Err(Error::AmbiguousShardingAttribution {
                        tv: tv.to_string(),
                        parallel: pt,
                        reason: "device parallelization on the inner output of a split"
                            .into(),
                    });
                }
                id = input.clone();
            }
            TransformKind::Merge { .. } => {
                return Err(Error::AmbiguousShardingAttribution {
                    tv: tv.to_string(),
                    parallel: pt,
                    reason: "a merge hides which logical axis is sharded".into(),
                });
            }
            _ => {
                return Err(Error::AmbiguousShardingAttribution {
                    tv: tv.to_string(),
                    parallel: pt,
                    reason: format!("cannot attribute device parallelization through {def}"),
                });
            }
        }
    }
}

/// Extents of `tv`'s materialized axes as if it were not sharded: each
/// device-parallel axis is scaled back up by the mesh size.
pub fn unsharded_extents(tv: &Arc<TensorView>) -> Result<Vec<Extent>> {
    let domain = tv.domain();
    let mut extents: Vec<Extent> = domain
        .logical()
        .iter()
        .filter(|id| !id.is_reduction())
        .map(|id| id.expanded_extent().unwrap_or_else(|| id.extent()).clone())
        .collect();
    let Some(mesh) = tv.mesh() else {
        return Ok(extents);
    };
    drop(domain);
    for pt in ParallelType::DEVICE {
        if let Some(axis) = sharded_logical_axis(tv, pt)? {
            extents[axis] = extents[axis].mul(&Extent::Const(mesh.size()));
        }
    }
    Ok(extents)
}
