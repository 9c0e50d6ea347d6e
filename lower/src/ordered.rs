//! Which iteration domains are built from consistently ordered allocation
//! domains.
//!
//! The analysis walks a tensor's transformations from the allocation domain
//! toward the loop domain, tracking for every produced id which allocation
//! ids it covers and whether those are consumed in their original relative
//! order. Consumed slots in `active_ids` are tombstoned rather than removed:
//! with `[i0, i1, i2, i3]` and `merge(0, 2)` the frontier becomes
//! `[i0*i2, i1, None, i3]`, so a later `merge(1)` correctly reads as
//! out-of-order. Removing the slot outright would hide that.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fusor_ir::error::{Error, Result};
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::transform::{Transform, TransformKind};
use fusor_ir::traversal::DependencyGraph;

use crate::context::ConcretizedBroadcasts;

/// Transformations on dependency paths from `from` to `to`, producers before
/// consumers. Unreachable targets contribute nothing; unlike
/// [`DependencyGraph::exprs_between`] this never fails.
pub(crate) fn transforms_between(
    graph: &DependencyGraph,
    from: &[Arc<IterDomain>],
    to: &[Arc<IterDomain>],
) -> Vec<Arc<Transform>> {
    let from_set: HashSet<IdKey> = from.iter().map(IdKey::of).collect();
    let closure = graph.exprs_to_stopping_at(to, &from_set);

    let mut dependent = from_set;
    let mut kept = Vec::new();
    for t in closure {
        if t.inputs().iter().any(|inp| dependent.contains(&IdKey::of(inp))) {
            for out in t.outputs() {
                dependent.insert(IdKey::of(&out));
            }
            kept.push(t);
        }
    }
    kept
}

#[derive(Debug)]
pub struct OrderedIdInformation {
    /// Positional frontier over the allocation domain; `None` marks a slot
    /// consumed by an out-of-order merge.
    active_ids: Vec<Option<Arc<IterDomain>>>,
    consistently_ordered: HashSet<IdKey>,
    /// Allocation ids covered by each id, in first-coverage order without
    /// duplicates.
    id_to_alloc_ids: HashMap<IdKey, Vec<Arc<IterDomain>>>,
    exclusively_consumes_allocs: HashSet<IdKey>,
    concretized: ConcretizedBroadcasts,
}

impl OrderedIdInformation {
    /// Analyze the history producing `ids` from `alloc_domain`, drawn from
    /// `transforms`.
    pub fn new(
        ids: &[Arc<IterDomain>],
        alloc_domain: &[Arc<IterDomain>],
        transforms: &[Arc<Transform>],
        concretized: &ConcretizedBroadcasts,
    ) -> Result<Self> {
        let mut info = Self {
            active_ids: alloc_domain.iter().cloned().map(Some).collect(),
            consistently_ordered: alloc_domain.iter().map(IdKey::of).collect(),
            id_to_alloc_ids: alloc_domain
                .iter()
                .map(|id| (IdKey::of(id), vec![id.clone()]))
                .collect(),
            exclusively_consumes_allocs: alloc_domain.iter().map(IdKey::of).collect(),
            concretized: concretized.clone(),
        };
        if alloc_domain.is_empty() {
            return Ok(info);
        }

        let graph = DependencyGraph::new(transforms)?;
        for t in transforms_between(&graph, alloc_domain, ids) {
            info.dispatch(&t)?;
        }
        Ok(info)
    }

    pub fn is_consistently_ordered(&self, id: &Arc<IterDomain>) -> bool {
        self.consistently_ordered.contains(&IdKey::of(id))
    }

    pub fn exclusively_consumes_allocs(&self, id: &Arc<IterDomain>) -> bool {
        self.exclusively_consumes_allocs.contains(&IdKey::of(id))
    }

    pub fn alloc_ids_of(&self, id: &Arc<IterDomain>) -> Option<&[Arc<IterDomain>]> {
        self.id_to_alloc_ids.get(&IdKey::of(id)).map(Vec::as_slice)
    }

    fn active_pos(&self, id: &Arc<IterDomain>) -> Option<usize> {
        self.active_ids
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|a| a.id() == id.id()))
    }

    fn alloc_ids(&self, id: &Arc<IterDomain>) -> Result<Vec<Arc<IterDomain>>> {
        self.id_to_alloc_ids.get(&IdKey::of(id)).cloned().ok_or_else(|| {
            Error::UnsupportedTransform {
                reason: format!("ordering analysis lost track of the allocations behind {id}"),
            }
        })
    }

    /// Whether `id` is the only active id covering its allocation ids.
    fn check_exclusively_consumes_allocs(&self, id: &Arc<IterDomain>) -> Result<bool> {
        let alloc_ids: HashSet<IdKey> =
            self.alloc_ids(id)?.iter().map(IdKey::of).collect();
        for other in self.active_ids.iter().flatten() {
            if other.id() == id.id() {
                continue;
            }
            let other_allocs = self.alloc_ids(other)?;
            if other_allocs.iter().any(|a| alloc_ids.contains(&IdKey::of(a))) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn union_alloc_ids(
        a: &[Arc<IterDomain>],
        b: &[Arc<IterDomain>],
    ) -> Vec<Arc<IterDomain>> {
        let mut seen: HashSet<IdKey> = a.iter().map(IdKey::of).collect();
        let mut out = a.to_vec();
        for id in b {
            if seen.insert(IdKey::of(id)) {
                out.push(id.clone());
            }
        }
        out
    }

    fn dispatch(&mut self, t: &Arc<Transform>) -> Result<()> {
        match &t.kind {
            TransformKind::Split { input, outer, inner, .. } => {
                self.handle_split(input, outer, inner)
            }
            TransformKind::Merge { outer, inner, output } => {
                self.handle_merge(outer, inner, output)
            }
            TransformKind::Swizzle { in_x, in_y, out_x, out_y, .. }
            | TransformKind::Swizzle2D { in_x, in_y, out_x, out_y, .. } => {
                self.handle_swizzle(t, in_x, in_y, out_x, out_y)
            }
            TransformKind::Resize { input, output, .. } => {
                self.handle_resize(input, output)
            }
        }
    }

    fn handle_split(
        &mut self,
        input: &Arc<IterDomain>,
        outer: &Arc<IterDomain>,
        inner: &Arc<IterDomain>,
    ) -> Result<()> {
        // An inactive input means ordering was already lost upstream.
        let Some(in_pos) = self.active_pos(input) else {
            return Ok(());
        };

        let in_ordered = self.is_consistently_ordered(input);
        let in_alloc_ids = self.alloc_ids(input)?;

        self.active_ids[in_pos] = Some(outer.clone());
        self.active_ids.insert(in_pos + 1, Some(inner.clone()));

        // Splitting cannot reorder anything.
        if in_ordered {
            self.consistently_ordered.insert(IdKey::of(outer));
            self.consistently_ordered.insert(IdKey::of(inner));
        }

        self.id_to_alloc_ids.insert(IdKey::of(outer), in_alloc_ids.clone());
        self.id_to_alloc_ids.insert(IdKey::of(inner), in_alloc_ids);
        Ok(())
    }

    fn handle_merge(
        &mut self,
        outer: &Arc<IterDomain>,
        inner: &Arc<IterDomain>,
        output: &Arc<IterDomain>,
    ) -> Result<()> {
        let (Some(outer_pos), Some(inner_pos)) =
            (self.active_pos(outer), self.active_pos(inner))
        else {
            return Ok(());
        };

        let inner_ordered = self.is_consistently_ordered(inner);
        let outer_ordered = self.is_consistently_ordered(outer);
        let inner_alloc_ids = self.alloc_ids(inner)?;
        let outer_alloc_ids = self.alloc_ids(outer)?;

        // Where inner would have to sit to count as adjacent: directly after
        // outer, skipping reductions and unconcretized broadcasts (their
        // relative position carries no addressable data).
        let mut pos_after_outer = outer_pos + 1;
        while pos_after_outer < self.active_ids.len() {
            match &self.active_ids[pos_after_outer] {
                None => break,
                Some(between) => {
                    if between.is_reduction()
                        || (between.is_broadcast()
                            && !self.concretized.is_concretized(between))
                    {
                        pos_after_outer += 1;
                        continue;
                    }
                    break;
                }
            }
        }

        let mut out_ordered = inner_ordered
            && outer_ordered
            && inner_pos > outer_pos
            && inner_pos <= pos_after_outer;

        // A concretized broadcast operand means the merged extent depends on
        // which concretization applies; the output cannot be treated as
        // linearly ordered.
        let outer_concretized_bcast =
            outer.is_broadcast() && self.concretized.is_concretized(outer);
        let inner_concretized_bcast =
            inner.is_broadcast() && self.concretized.is_concretized(inner);
        out_ordered = out_ordered && !outer_concretized_bcast && !inner_concretized_bcast;

        if out_ordered {
            self.consistently_ordered.insert(IdKey::of(output));
        }

        self.active_ids[outer_pos] = Some(output.clone());
        if out_ordered {
            self.active_ids.remove(inner_pos);
            // Skipped broadcasts between outer and inner can never merge in
            // order anywhere else; drop them too.
            for _ in outer_pos + 1..inner_pos {
                self.active_ids.remove(outer_pos + 1);
            }
        } else {
            // Tombstone so later adjacency checks still see the gap.
            self.active_ids[inner_pos] = None;
        }

        let alloc_ids = Self::union_alloc_ids(&inner_alloc_ids, &outer_alloc_ids);
        self.id_to_alloc_ids.insert(IdKey::of(output), alloc_ids);

        if self.check_exclusively_consumes_allocs(output)? {
            self.exclusively_consumes_allocs.insert(IdKey::of(output));
        }
        Ok(())
    }

    /// Real swizzles scramble addressing across the pair, so ordering is
    /// dropped and both outputs cover the union of allocations. Identity
    /// swizzles forward each lane independently.
    fn handle_swizzle(
        &mut self,
        t: &Arc<Transform>,
        in_x: &Arc<IterDomain>,
        in_y: &Arc<IterDomain>,
        out_x: &Arc<IterDomain>,
        out_y: &Arc<IterDomain>,
    ) -> Result<()> {
        let (Some(x_pos), Some(y_pos)) = (self.active_pos(in_x), self.active_pos(in_y))
        else {
            return Ok(());
        };

        let x_ordered = self.is_consistently_ordered(in_x);
        let y_ordered = self.is_consistently_ordered(in_y);
        let x_alloc_ids = self.alloc_ids(in_x)?;
        let y_alloc_ids = self.alloc_ids(in_y)?;

        self.active_ids[x_pos] = Some(out_x.clone());
        self.active_ids[y_pos] = Some(out_y.clone());

        if t.is_noop_swizzle() {
            if x_ordered {
                self.consistently_ordered.insert(IdKey::of(out_x));
            }
            if self.exclusively_consumes_allocs(in_x) {
                self.exclusively_consumes_allocs.insert(IdKey::of(out_x));
            }
            if y_ordered {
                self.consistently_ordered.insert(IdKey::of(out_y));
            }
            if self.exclusively_consumes_allocs(in_y) {
                self.exclusively_consumes_allocs.insert(IdKey::of(out_y));
            }
            self.id_to_alloc_ids.insert(IdKey::of(out_x), x_alloc_ids);
            self.id_to_alloc_ids.insert(IdKey::of(out_y), y_alloc_ids);
        } else {
            let alloc_ids = Self::union_alloc_ids(&x_alloc_ids, &y_alloc_ids);
            self.id_to_alloc_ids.insert(IdKey::of(out_x), alloc_ids.clone());
            self.id_to_alloc_ids.insert(IdKey::of(out_y), alloc_ids);
        }
        Ok(())
    }

    fn handle_resize(
        &mut self,
        input: &Arc<IterDomain>,
        output: &Arc<IterDomain>,
    ) -> Result<()> {
        let Some(in_pos) = self.active_pos(input) else {
            return Ok(());
        };

        let in_alloc_ids = self.alloc_ids(input)?;
        self.active_ids[in_pos] = Some(output.clone());

        if self.is_consistently_ordered(input) {
            self.consistently_ordered.insert(IdKey::of(output));
        }
        if self.exclusively_consumes_allocs(input) {
            self.exclusively_consumes_allocs.insert(IdKey::of(output));
        }
        self.id_to_alloc_ids.insert(IdKey::of(output), in_alloc_ids);
        Ok(())
    }
}
