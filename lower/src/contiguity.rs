//! Contiguously indexable iteration domains.
//!
//! A merge output can be indexed with a single linear index (instead of one
//! index per operand) only when its operands cover adjacent, contiguous
//! allocation domains in order, nothing else consumes those allocations, and
//! no non-divisible split or resize sits in its history. `ContigIds` finds
//! the largest such merge outputs; everything underneath them indexes for
//! free.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use fusor_ir::error::{Error, Result};
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::transform::{Transform, TransformKey, TransformKind};
use fusor_ir::traversal::DependencyGraph;
use fusor_ir::types::IterKind;

use crate::context::ConcretizedBroadcasts;
use crate::ordered::{transforms_between, OrderedIdInformation};

/// Which iteration domains transitively depend on a split whose factor does
/// not divide its input extent.
///
/// Such splits pad the outer dimension, so any descendant covers more
/// elements than its extent claims and must keep a per-operand predicate.
#[derive(Debug, Default)]
pub struct NonDivisibleSplits {
    tainted: HashSet<IdKey>,
}

impl NonDivisibleSplits {
    pub fn new(
        ids: &[Arc<IterDomain>],
        alloc_domain: &[Arc<IterDomain>],
        transforms: &[Arc<Transform>],
        divisible_splits: &HashSet<TransformKey>,
    ) -> Result<Self> {
        let mut info = Self::default();
        if ids.is_empty() || alloc_domain.is_empty() {
            return Ok(info);
        }

        let alloc_set: HashSet<IdKey> = alloc_domain.iter().map(IdKey::of).collect();
        let graph = DependencyGraph::new(transforms)?;
        for t in transforms_between(&graph, alloc_domain, ids) {
            // Allocation ids start clean even if something upstream of the
            // allocation domain produced them.
            for input in t.inputs() {
                if alloc_set.contains(&IdKey::of(&input)) {
                    info.tainted.remove(&IdKey::of(&input));
                }
            }

            let inputs_tainted = t
                .inputs()
                .iter()
                .any(|input| info.tainted.contains(&IdKey::of(input)));
            if inputs_tainted {
                for out in t.outputs() {
                    info.tainted.insert(IdKey::of(&out));
                }
                continue;
            }

            if t.is_split() && !divisible_splits.contains(&TransformKey::of(&t)) {
                for out in t.outputs() {
                    info.tainted.insert(IdKey::of(&out));
                }
            }
        }
        Ok(info)
    }

    pub fn depends_on_non_divisible_split(&self, id: &Arc<IterDomain>) -> bool {
        self.tainted.contains(&IdKey::of(id))
    }
}

#[derive(Debug)]
pub struct ContigIds {
    contig_ids: HashSet<IdKey>,
    is_contig_alloc: HashMap<IdKey, bool>,
    /// For each allocation id, the deepest contiguously indexable id covering
    /// it (itself when nothing subsumed it).
    alloc_to_indexed_id: HashMap<IdKey, Arc<IterDomain>>,
    /// Ids subsumed by each contig id; they need no index of their own.
    within_contig_ids: HashMap<IdKey, HashSet<IdKey>>,
    resize_deps: HashSet<IdKey>,
    non_divisible: NonDivisibleSplits,
}

#[bon::bon]
impl ContigIds {
    /// Find the contiguously indexable ids among the history producing `ids`
    /// from `alloc_domain`.
    ///
    /// - `indexed_ids`: ids an index expression is known for, closed over
    ///   exact equivalence by the caller; merges whose output is absent
    ///   cannot be contiguous unless `ignore_indexability`.
    /// - `p2c_id_map`: producer-to-consumer substitution applied before the
    ///   `indexed_ids` lookup, for producer-side indexing passes.
    /// - `ignore_consistent_ordering`: predicate passes don't care about the
    ///   stride order of allocations, only about coverage.
    #[builder]
    pub fn new(
        ids: &[Arc<IterDomain>],
        alloc_domain: &[Arc<IterDomain>],
        alloc_contiguity: &[Option<bool>],
        transforms: &[Arc<Transform>],
        #[builder(default)] final_ids: HashSet<IdKey>,
        #[builder(default)] indexed_ids: HashSet<IdKey>,
        #[builder(default)] divisible_splits: HashSet<TransformKey>,
        #[builder(default)] concretized: ConcretizedBroadcasts,
        #[builder(default)] p2c_id_map: HashMap<IdKey, Arc<IterDomain>>,
        #[builder(default = false)] ignore_indexability: bool,
        #[builder(default = false)] ignore_consistent_ordering: bool,
    ) -> Result<Self> {
        let non_divisible =
            NonDivisibleSplits::new(ids, alloc_domain, transforms, &divisible_splits)?;
        let mut contig = Self {
            contig_ids: HashSet::new(),
            is_contig_alloc: HashMap::new(),
            alloc_to_indexed_id: HashMap::new(),
            within_contig_ids: HashMap::new(),
            resize_deps: HashSet::new(),
            non_divisible,
        };
        if ids.is_empty() || alloc_domain.is_empty() {
            return Ok(contig);
        }

        if alloc_domain.len() != alloc_contiguity.len() {
            return Err(Error::ContiguityLengthMismatch {
                expected: alloc_domain.len(),
                found: alloc_contiguity.len(),
            });
        }

        for (axis, (alloc_id, flag)) in
            alloc_domain.iter().zip(alloc_contiguity).enumerate()
        {
            if alloc_id.is_broadcast() {
                if flag.is_some() {
                    return Err(Error::ContiguityOnBroadcast { axis });
                }
                continue;
            }
            contig.alloc_to_indexed_id.insert(IdKey::of(alloc_id), alloc_id.clone());
            contig.is_contig_alloc.insert(IdKey::of(alloc_id), false);
            // Merged reduction indices always coalesce, so a flagless
            // reduction slot counts as contiguous.
            if flag.unwrap_or(true) && alloc_id.kind() != IterKind::GatherScatter {
                contig.contig_ids.insert(IdKey::of(alloc_id));
                contig.is_contig_alloc.insert(IdKey::of(alloc_id), true);
                contig.within_contig_ids.insert(IdKey::of(alloc_id), HashSet::new());
            }
        }

        if contig.contig_ids.is_empty() {
            return Ok(contig);
        }

        let ordered =
            OrderedIdInformation::new(ids, alloc_domain, transforms, &concretized)?;
        let graph = DependencyGraph::new(transforms)?;

        for t in transforms_between(&graph, alloc_domain, ids) {
            if let TransformKind::Resize { output, .. } = &t.kind {
                contig.resize_deps.insert(IdKey::of(output));
            } else if t
                .inputs()
                .iter()
                .any(|input| contig.resize_deps.contains(&IdKey::of(input)))
            {
                for out in t.outputs() {
                    contig.resize_deps.insert(IdKey::of(&out));
                }
            }

            if let TransformKind::Merge { outer, inner, output } = &t.kind {
                contig.handle_merge(
                    &graph,
                    &ordered,
                    alloc_domain,
                    alloc_contiguity,
                    &final_ids,
                    &indexed_ids,
                    &p2c_id_map,
                    ignore_indexability,
                    ignore_consistent_ordering,
                    outer,
                    inner,
                    output,
                )?;
            }
        }
        Ok(contig)
    }
}

impl ContigIds {
    #[allow(clippy::too_many_arguments)]
    fn handle_merge(
        &mut self,
        graph: &DependencyGraph,
        ordered: &OrderedIdInformation,
        alloc_domain: &[Arc<IterDomain>],
        alloc_contiguity: &[Option<bool>],
        final_ids: &HashSet<IdKey>,
        indexed_ids: &HashSet<IdKey>,
        p2c_id_map: &HashMap<IdKey, Arc<IterDomain>>,
        ignore_indexability: bool,
        ignore_consistent_ordering: bool,
        outer: &Arc<IterDomain>,
        inner: &Arc<IterDomain>,
        output: &Arc<IterDomain>,
    ) -> Result<()> {
        if !ignore_consistent_ordering && !ordered.is_consistently_ordered(output) {
            return Ok(());
        }
        if !ordered.exclusively_consumes_allocs(output) {
            return Ok(());
        }
        if !ignore_indexability && !self.is_indexable(output, indexed_ids, p2c_id_map) {
            return Ok(());
        }
        if final_ids.contains(&IdKey::of(outer)) || final_ids.contains(&IdKey::of(inner)) {
            return Ok(());
        }

        let Some(covered_allocs) = ordered.alloc_ids_of(output) else {
            return Err(Error::UnsupportedTransform {
                reason: format!("no allocation coverage recorded for merge output {output}"),
            });
        };
        let covered: HashSet<IdKey> = covered_allocs.iter().map(IdKey::of).collect();

        // Indexing passes need real stride contiguity: a non-contiguous
        // covered allocation is only tolerable when it is the last one, since
        // the index can then be scaled by that allocation's stride. Predicate
        // passes (ignore_consistent_ordering) skip this entirely.
        let is_indexing_pass = !ignore_consistent_ordering;
        let mut remaining = covered.len();
        let mut last_alloc = None;
        for (alloc_id, flag) in alloc_domain.iter().zip(alloc_contiguity) {
            if alloc_id.is_broadcast() || !covered.contains(&IdKey::of(alloc_id)) {
                continue;
            }
            remaining -= 1;
            if !flag.unwrap_or(true) && is_indexing_pass && remaining > 0 {
                return Ok(());
            }
            last_alloc = Some(alloc_id.clone());
        }

        if self.non_divisible.depends_on_non_divisible_split(output) {
            return Ok(());
        }
        // Indexing must stop at resize outputs; past one, the merged index no
        // longer addresses the original allocation linearly.
        if self.resize_deps.contains(&IdKey::of(output)) {
            return Ok(());
        }
        // Everything covered was broadcast.
        if last_alloc.is_none() {
            return Ok(());
        }

        debug!(id = %output, "contiguously indexable merge");

        for alloc_id in covered_allocs {
            self.alloc_to_indexed_id.insert(IdKey::of(alloc_id), output.clone());
        }

        let within = graph.ids_between(alloc_domain, std::slice::from_ref(output));
        let mut within_set: HashSet<IdKey> = within.iter().map(IdKey::of).collect();
        within_set.remove(&IdKey::of(output));
        for id in &within_set {
            self.contig_ids.remove(id);
        }
        self.within_contig_ids.insert(IdKey::of(output), within_set);
        self.contig_ids.insert(IdKey::of(output));
        Ok(())
    }

    fn is_indexable(
        &self,
        id: &Arc<IterDomain>,
        indexed_ids: &HashSet<IdKey>,
        p2c_id_map: &HashMap<IdKey, Arc<IterDomain>>,
    ) -> bool {
        let mapped = p2c_id_map.get(&IdKey::of(id)).unwrap_or(id);
        indexed_ids.contains(&IdKey::of(mapped))
    }

    pub fn contig_ids(&self) -> &HashSet<IdKey> {
        &self.contig_ids
    }

    pub fn is_contig_alloc(&self, id: &Arc<IterDomain>) -> bool {
        self.is_contig_alloc.get(&IdKey::of(id)).copied().unwrap_or(false)
    }

    pub fn alloc_to_indexed_id(&self) -> &HashMap<IdKey, Arc<IterDomain>> {
        &self.alloc_to_indexed_id
    }

    pub fn within_contig_ids(&self, id: &Arc<IterDomain>) -> Option<&HashSet<IdKey>> {
        self.within_contig_ids.get(&IdKey::of(id))
    }

    pub fn depends_on_non_divisible_split(&self, id: &Arc<IterDomain>) -> bool {
        self.non_divisible.depends_on_non_divisible_split(id)
    }
}
