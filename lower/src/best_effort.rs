//! Best-effort matching of one transformation history against another.
//!
//! Unlike [`crate::replay::ReplayTransformations`], nothing new is created
//! here: the target's history is walked in dependency order and each target
//! transformation is matched against the transformation the corresponding
//! replay-side ids already flow into. Matching stops silently where the
//! histories diverge, except that a divergence touching allocation-defining
//! (rfactor) ids is a hard error.
//!
//! Broadcast and squeeze ops make the two sides structurally different; the
//! forwarding maps from [`ForwardingInfo`] let a merge with an
//! unmatched-broadcast operand be stepped over as if the merge never
//! happened, with the dropped side tracked as a "compliment" so its loop ids
//! can be restored afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use fusor_ir::disjoint::DisjointSets;
use fusor_ir::domain::{no_reductions, TensorDomain};
use fusor_ir::error::{Error, Result};
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::ops::{OpKind, TensorOp};
use fusor_ir::tensor::TensorView;
use fusor_ir::transform::{Transform, TransformKind};
use fusor_ir::traversal::DependencyGraph;

/// Forwarding information for broadcast/squeeze ops between a producer and
/// consumer.
///
/// The "active" side is the tensor with axes the other side lacks (the
/// consumer of a broadcast, the producer of a squeeze). When the active
/// side's schedule merges such an axis into a real one, the real input can be
/// forwarded straight to the merge output; the dropped axis is its
/// compliment.
#[derive(Debug, Default)]
pub struct ForwardingInfo {
    pub producer_forwarding: HashMap<IdKey, Arc<IterDomain>>,
    pub consumer_forwarding: HashMap<IdKey, Arc<IterDomain>>,
    pub producer_compliment: HashMap<IdKey, Vec<Arc<IterDomain>>>,
    pub consumer_compliment: HashMap<IdKey, Vec<Arc<IterDomain>>>,
}

impl ForwardingInfo {
    pub fn new(
        op: &Arc<TensorOp>,
        producer: &Arc<TensorView>,
        consumer: &Arc<TensorView>,
    ) -> Result<Self> {
        let mut info = Self::default();

        // Flags over the active side's axes, true where the inactive side has
        // no counterpart.
        let (active_tv, flags, producer_active) = match &op.kind {
            OpKind::Broadcast { flags, .. } => (consumer, flags.clone(), false),
            OpKind::Squeeze { flags, .. } => (producer, flags.clone(), true),
            _ => return Ok(info),
        };

        let active_domain = active_tv.domain();
        let active_logical = if producer_active {
            no_reductions(active_domain.logical())
        } else {
            active_domain.logical().to_vec()
        };
        if active_logical.len() != flags.len() {
            return Err(Error::UnsupportedTransform {
                reason: format!(
                    "broadcast/squeeze flag count {} does not match domain rank {}",
                    flags.len(),
                    active_logical.len()
                ),
            });
        }

        let mut forwarded: HashSet<IdKey> = active_logical
            .iter()
            .zip(&flags)
            .filter(|(_, flagged)| **flagged)
            .map(|(id, _)| IdKey::of(id))
            .collect();

        let (forwarding, compliment) = if producer_active {
            (&mut info.producer_forwarding, &mut info.producer_compliment)
        } else {
            (&mut info.consumer_forwarding, &mut info.consumer_compliment)
        };

        let graph = DependencyGraph::new(active_domain.transforms())?;
        for t in graph.exprs_to(active_domain.loop_domain()) {
            let inputs = t.inputs();
            let in_set = |id: &Arc<IterDomain>| forwarded.contains(&IdKey::of(id));

            if inputs.iter().all(in_set) {
                // Built entirely from active-only axes: outputs are too.
                for out in t.outputs() {
                    forwarded.insert(IdKey::of(&out));
                }
            } else if t.is_merge() && inputs.iter().any(in_set) {
                let mut forwarded_id = None;
                let mut compliment_id = None;
                for input in &inputs {
                    if in_set(input) {
                        compliment_id = Some(input.clone());
                    } else {
                        forwarded_id = Some(input.clone());
                    }
                }
                if let (Some(fwd), Some(comp), TransformKind::Merge { output, .. }) =
                    (forwarded_id, compliment_id, &t.kind)
                {
                    forwarding.insert(IdKey::of(&fwd), output.clone());
                    compliment.insert(IdKey::of(&fwd), vec![comp]);
                }
            }
        }

        Ok(info)
    }
}

#[derive(Debug)]
pub struct BestEffortReplay {
    target2replay: HashMap<IdKey, Arc<IterDomain>>,
    replay_forward: HashMap<IdKey, Arc<IterDomain>>,
    target_forward: HashMap<IdKey, Arc<IterDomain>>,
    skipped_resize: HashMap<IdKey, Arc<IterDomain>>,
    forwarded_ids: Vec<Arc<IterDomain>>,
    loop_ids: HashMap<IdKey, usize>,
    counter: usize,
    skip_replay_swizzle: bool,
    skip_target_swizzle: bool,
    error_on_failure: bool,
}

#[bon::bon]
impl BestEffortReplay {
    #[builder]
    pub fn new(
        replay_domain: &[Arc<IterDomain>],
        target_domain: &[Arc<IterDomain>],
        replay_transforms: &[Arc<Transform>],
        target_transforms: &[Arc<Transform>],
        target2replay_map: HashMap<IdKey, Arc<IterDomain>>,
        #[builder(default)] replay_forward_map: HashMap<IdKey, Arc<IterDomain>>,
        #[builder(default)] target_forward_map: HashMap<IdKey, Arc<IterDomain>>,
        #[builder(default = false)] skip_replay_swizzle: bool,
        #[builder(default = false)] skip_target_swizzle: bool,
        #[builder(default = false)] skip_resize: bool,
        #[builder(default = true)] error_on_failure: bool,
    ) -> Result<Self> {
        let mut ber = Self {
            target2replay: target2replay_map,
            replay_forward: replay_forward_map,
            target_forward: target_forward_map,
            skipped_resize: HashMap::new(),
            forwarded_ids: Vec::new(),
            loop_ids: HashMap::new(),
            counter: 0,
            skip_replay_swizzle,
            skip_target_swizzle,
            error_on_failure,
        };
        ber.run(
            replay_domain,
            target_domain,
            replay_transforms,
            target_transforms,
            skip_resize,
        )?;
        Ok(ber)
    }
}

/// Target/replay transformations match when they are the same shape with the
/// same attributes. Tile-swizzle parameters are ignored while swizzles are
/// being skipped.
fn exprs_match(target: &Transform, replay: &Transform, check_swizzle_params: bool) -> bool {
    if !check_swizzle_params {
        if let (TransformKind::Swizzle2D { .. }, TransformKind::Swizzle2D { .. }) =
            (&target.kind, &replay.kind)
        {
            return true;
        }
    }
    target.matches(replay)
}

impl BestEffortReplay {
    fn next_counter(&mut self) -> usize {
        let c = self.counter;
        self.counter += 1;
        c
    }

    /// A divergence that touches allocation-defining ids cannot be ignored.
    fn check_rfactor(&self, ok: bool) -> Result<()> {
        if self.error_on_failure && !ok {
            return Err(Error::UnsupportedTransform {
                reason: "a transformation conflicts with an allocation-defining rewrite"
                    .into(),
            });
        }
        Ok(())
    }

    /// Follow the replay forwarding chain to its end.
    fn replay_forwarded(&self, id: &Arc<IterDomain>) -> Arc<IterDomain> {
        let mut current = id.clone();
        while let Some(next) = self.replay_forward.get(&IdKey::of(&current)) {
            current = next.clone();
        }
        current
    }

    /// One-use map from ids to the transformation consuming them.
    fn id_to_use_map(
        transforms: &[Arc<Transform>],
    ) -> Result<HashMap<IdKey, Arc<Transform>>> {
        let mut map = HashMap::new();
        for t in transforms {
            for input in t.inputs() {
                if map.insert(IdKey::of(&input), t.clone()).is_some() {
                    return Err(Error::DoubleMapping { id: input.to_string() });
                }
            }
        }
        Ok(map)
    }

    fn run(
        &mut self,
        replay_domain: &[Arc<IterDomain>],
        target_domain: &[Arc<IterDomain>],
        replay_transforms: &[Arc<Transform>],
        target_transforms: &[Arc<Transform>],
        skip_resize: bool,
    ) -> Result<()> {
        // Seed the frontier with every mapped replay id, in target-id order
        // for determinism.
        let mut seeds: Vec<(IdKey, Arc<IterDomain>)> =
            self.target2replay.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        seeds.sort_by_key(|(k, _)| k.0.id());
        for (_, replay_id) in seeds {
            let c = self.next_counter();
            self.loop_ids.insert(IdKey::of(&replay_id), c);
        }

        let replay_graph = DependencyGraph::new(replay_transforms)?;
        let target_graph = DependencyGraph::new(target_transforms)?;
        let replay_exprs = replay_graph.exprs_to(replay_domain);
        let target_exprs = target_graph.exprs_to(target_domain);

        let replay_id2expr = Self::id_to_use_map(&replay_exprs)?;
        let target_id2expr = Self::id_to_use_map(&target_exprs)?;

        // Ids feeding an allocation-defining transformation must replay
        // exactly; track them.
        let mut replay_logical_ids: HashSet<IdKey> = HashSet::new();
        for t in &replay_exprs {
            if t.produces_rfactor() {
                for input in t.inputs() {
                    replay_logical_ids.insert(IdKey::of(&input));
                }
            }
        }

        if self.skip_target_swizzle || self.skip_replay_swizzle {
            self.skip_swizzles(&target_id2expr, &replay_id2expr);
        }
        if skip_resize {
            self.skip_resizes(&target_graph, &replay_graph, &target_exprs, &replay_exprs);
        }

        let mut any_target_broadcast = false;

        for target_expr in &target_exprs {
            let target_inputs = target_expr.inputs();

            // A forwarded input means this target expr is a stepped-over
            // merge; move the mapping to the forwarded id and move on.
            if target_inputs
                .iter()
                .any(|id| self.target_forward.contains_key(&IdKey::of(id)))
            {
                for input in &target_inputs {
                    let Some(fwd) = self.target_forward.get(&IdKey::of(input)).cloned()
                    else {
                        continue;
                    };
                    if let Some(mapped) = self.target2replay.remove(&IdKey::of(input)) {
                        self.target2replay.insert(IdKey::of(&fwd), mapped);
                    }
                }
                continue;
            }

            let has_broadcast = target_inputs.iter().any(|id| id.is_broadcast());
            any_target_broadcast = any_target_broadcast || has_broadcast;

            // Map the target inputs onto the replay side.
            let mut missing_input = false;
            let replay_inputs: Vec<Option<Arc<IterDomain>>> = target_inputs
                .iter()
                .map(|t_in| match self.target2replay.get(&IdKey::of(t_in)) {
                    Some(r) => Some(self.replay_forwarded(r)),
                    None => {
                        missing_input = true;
                        None
                    }
                })
                .collect();

            let has_logical_input = replay_inputs.iter().flatten().any(|id| {
                id.is_rfactor() && replay_logical_ids.contains(&IdKey::of(id))
            });

            if self.error_on_failure && has_logical_input {
                // Broadcast axes added after an allocation-defining reshape
                // may legitimately be absent on the replay side.
                let no_missing_exprs = replay_inputs
                    .iter()
                    .all(|id| match id {
                        Some(id) => replay_id2expr.contains_key(&IdKey::of(id)),
                        None => true,
                    });
                self.check_rfactor(no_missing_exprs || any_target_broadcast)?;
            }

            if missing_input {
                self.check_rfactor(!has_logical_input || any_target_broadcast)?;
                continue;
            }

            // All inputs must flow into one and the same replay expr.
            let mut replay_expr: Option<Arc<Transform>> = None;
            let mut mismatched = false;
            for r_in in replay_inputs.iter().flatten() {
                match replay_id2expr.get(&IdKey::of(r_in)) {
                    Some(expr) => match &replay_expr {
                        None => replay_expr = Some(expr.clone()),
                        Some(prev) => {
                            mismatched = mismatched || prev.id() != expr.id();
                        }
                    },
                    None => mismatched = true,
                }
            }
            let Some(replay_expr) = replay_expr else {
                self.check_rfactor(!has_logical_input)?;
                continue;
            };
            if mismatched {
                self.check_rfactor(!has_logical_input)?;
                continue;
            }

            // Inputs must line up positionally.
            let expr_inputs = replay_expr.inputs();
            let positions_match = expr_inputs.len() == replay_inputs.len()
                && expr_inputs.iter().zip(&replay_inputs).all(|(a, b)| {
                    b.as_ref().is_some_and(|b| a.id() == b.id())
                });
            if !positions_match {
                self.check_rfactor(!has_logical_input)?;
                continue;
            }

            let check_swizzle_params =
                !(self.skip_replay_swizzle || self.skip_target_swizzle);
            if !exprs_match(target_expr, &replay_expr, check_swizzle_params) {
                self.check_rfactor(!has_logical_input)?;
                continue;
            }

            trace!(target = %target_expr, replay = %replay_expr, "matched");

            // Consume the replay inputs.
            for (t_in, r_in) in target_inputs.iter().zip(&replay_inputs) {
                let Some(orig) = self.target2replay.get(&IdKey::of(t_in)).cloned() else {
                    continue;
                };
                self.loop_ids.remove(&IdKey::of(&orig));
                if let Some(r_in) = r_in {
                    if orig.id() != r_in.id() {
                        self.forwarded_ids.push(orig);
                    }
                }
            }

            // Map the outputs pairwise.
            let target_outputs = target_expr.outputs();
            let replay_outputs = replay_expr.outputs();
            for (t_out, r_out) in target_outputs.iter().zip(replay_outputs.iter()) {
                self.target2replay.insert(IdKey::of(t_out), r_out.clone());
                let c = self.next_counter();
                self.loop_ids.insert(IdKey::of(r_out), c);
            }

            if self.skip_target_swizzle || self.skip_replay_swizzle {
                self.skip_swizzles(&target_id2expr, &replay_id2expr);
            }
            if skip_resize {
                self.skip_resizes(&target_graph, &replay_graph, &target_exprs, &replay_exprs);
            }
        }

        Ok(())
    }

    /// Advance every map entry past tile swizzles on whichever sides are
    /// being skipped.
    fn skip_swizzles(
        &mut self,
        target_id2expr: &HashMap<IdKey, Arc<Transform>>,
        replay_id2expr: &HashMap<IdKey, Arc<Transform>>,
    ) {
        let final_output =
            |mut id: Arc<IterDomain>, id2expr: &HashMap<IdKey, Arc<Transform>>| loop {
                let Some(expr) = id2expr.get(&IdKey::of(&id)) else {
                    return id;
                };
                let TransformKind::Swizzle2D { in_x, out_x, out_y, .. } = &expr.kind else {
                    return id;
                };
                id = if id.id() == in_x.id() { out_x.clone() } else { out_y.clone() };
            };
        let is_swizzle_input = |id: &Arc<IterDomain>, id2expr: &HashMap<IdKey, Arc<Transform>>| {
            id2expr
                .get(&IdKey::of(id))
                .is_some_and(|t| matches!(t.kind, TransformKind::Swizzle2D { .. }))
        };

        loop {
            let hit = self.target2replay.iter().find_map(|(t_key, r_id)| {
                let t_hit = self.skip_target_swizzle && is_swizzle_input(&t_key.0, target_id2expr);
                let r_hit = self.skip_replay_swizzle && is_swizzle_input(r_id, replay_id2expr);
                (t_hit || r_hit).then(|| (t_key.clone(), r_id.clone()))
            });
            let Some((t_key, r_id)) = hit else {
                return;
            };

            let new_target = if self.skip_target_swizzle {
                final_output(t_key.0.clone(), target_id2expr)
            } else {
                t_key.0.clone()
            };
            let new_replay = if self.skip_replay_swizzle {
                final_output(r_id.clone(), replay_id2expr)
            } else {
                r_id.clone()
            };

            self.target2replay.remove(&t_key);
            self.target2replay.insert(IdKey::of(&new_target), new_replay.clone());
            if r_id.id() != new_replay.id() {
                if self.loop_ids.remove(&IdKey::of(&r_id)).is_some() {
                    let c = self.next_counter();
                    self.loop_ids.insert(IdKey::of(&new_replay), c);
                }
            }
        }
    }

    /// Advance every map entry past resizes on both sides.
    fn skip_resizes(
        &mut self,
        target_graph: &DependencyGraph,
        replay_graph: &DependencyGraph,
        target_exprs: &[Arc<Transform>],
        replay_exprs: &[Arc<Transform>],
    ) {
        let in_history = |t: &Arc<Transform>, exprs: &[Arc<Transform>]| {
            exprs.iter().any(|e| e.id() == t.id())
        };
        let resize_output = |id: &Arc<IterDomain>,
                             graph: &DependencyGraph,
                             exprs: &[Arc<Transform>]| {
            graph.uses(id).iter().find_map(|t| {
                if !in_history(t, exprs) {
                    return None;
                }
                match &t.kind {
                    TransformKind::Resize { output, .. } => Some(output.clone()),
                    _ => None,
                }
            })
        };

        loop {
            let mut update = None;
            for (t_key, r_id) in &self.target2replay {
                let new_target = resize_output(&t_key.0, target_graph, target_exprs);
                let new_replay = resize_output(r_id, replay_graph, replay_exprs);
                if new_target.is_none() && new_replay.is_none() {
                    continue;
                }
                update = Some((t_key.clone(), r_id.clone(), new_target, new_replay));
                break;
            }
            let Some((t_key, r_id, new_target, new_replay)) = update else {
                return;
            };

            if let Some(nt) = &new_target {
                self.skipped_resize.insert(t_key.clone(), nt.clone());
            }
            if let Some(nr) = &new_replay {
                self.skipped_resize.insert(IdKey::of(&r_id), nr.clone());
            }

            let new_target = new_target.unwrap_or_else(|| t_key.0.clone());
            let new_replay = new_replay.unwrap_or_else(|| r_id.clone());

            self.target2replay.remove(&t_key);
            self.target2replay.insert(IdKey::of(&new_target), new_replay.clone());
            if r_id.id() != new_replay.id() {
                if self.loop_ids.remove(&IdKey::of(&r_id)).is_some() {
                    let c = self.next_counter();
                    self.loop_ids.insert(IdKey::of(&new_replay), c);
                }
            }
        }
    }

    /// Restore the loop ids hidden behind forwarded (stepped-over) merges:
    /// every compliment of a forwarded id re-enters the frontier.
    pub fn add_compliment_loop_ids(
        &mut self,
        forwarding_map: &HashMap<IdKey, Arc<IterDomain>>,
        compliment_map: &HashMap<IdKey, Vec<Arc<IterDomain>>>,
        active_transforms: &[Arc<Transform>],
    ) -> Result<()> {
        // Expand chains: an id may forward through several merges.
        let mut expanded = Vec::new();
        for id in &self.forwarded_ids {
            let mut current = id.clone();
            while forwarding_map.contains_key(&IdKey::of(&current)) {
                expanded.push(current.clone());
                let Some(next) = forwarding_map.get(&IdKey::of(&current)) else {
                    break;
                };
                current = next.clone();
            }
        }

        let mut compliments: Vec<Arc<IterDomain>> = Vec::new();
        for id in &expanded {
            let Some(comps) = compliment_map.get(&IdKey::of(id)) else {
                return Err(Error::UnsupportedTransform {
                    reason: format!("lost track of forwarded broadcast merge at {id}"),
                });
            };
            compliments.extend(comps.iter().cloned());
        }

        let graph = DependencyGraph::new(active_transforms)?;
        let compliment_exprs = graph.exprs_to(&compliments);

        let mut new_loop_ids: HashMap<IdKey, usize> = HashMap::new();
        let compliment_set: HashSet<IdKey> = compliments.iter().map(IdKey::of).collect();
        for t in &compliment_exprs {
            for input in t.inputs() {
                new_loop_ids.remove(&IdKey::of(&input));
            }
            for out in t.outputs() {
                if !compliment_set.contains(&IdKey::of(&out)) {
                    let c = self.next_counter();
                    new_loop_ids.insert(IdKey::of(&out), c);
                }
            }
        }
        self.loop_ids.extend(new_loop_ids);
        Ok(())
    }

    /// Final target-to-replay map.
    pub fn replay_map(&self) -> &HashMap<IdKey, Arc<IterDomain>> {
        &self.target2replay
    }

    /// Replay-side frontier ordered by creation.
    pub fn loop_ids(&self) -> Vec<Arc<IterDomain>> {
        let mut entries: Vec<(&IdKey, &usize)> = self.loop_ids.iter().collect();
        entries.sort_by_key(|(_, c)| **c);
        entries.into_iter().map(|(k, _)| k.0.clone()).collect()
    }

    /// Exact-equivalence classes over every id the match touched.
    pub fn iter_domain_equivalence(&self) -> DisjointSets<IdKey> {
        let mut result = DisjointSets::new();
        for map in [
            &self.target2replay,
            &self.replay_forward,
            &self.target_forward,
            &self.skipped_resize,
        ] {
            let mut keys: Vec<&IdKey> = map.keys().collect();
            keys.sort_by_key(|k| k.0.id());
            for key in keys {
                if let Some(value) = map.get(key) {
                    result.union(key.clone(), IdKey::of(value));
                }
            }
        }
        result
    }

    /// Matched replay for producer-as-consumer: replay the producer's loop
    /// structure up to `consumer_compute_at_axis` of the consumer.
    pub fn replay_pas_c(
        producer: &Arc<TensorView>,
        consumer: &Arc<TensorView>,
        op: &Arc<TensorOp>,
        consumer_compute_at_axis: i64,
        skip_producer_swizzle: bool,
        skip_consumer_swizzle: bool,
        skip_resize: bool,
    ) -> Result<Self> {
        let c_domain = consumer.domain();
        let axis = normalize_axis(consumer_compute_at_axis, c_domain.ndims())?;
        let consumer_ca_ids: Vec<Arc<IterDomain>> =
            c_domain.loop_domain()[..axis].to_vec();

        let consumer_graph = DependencyGraph::new(c_domain.transforms())?;
        let ca_root_ids: HashSet<IdKey> = consumer_graph
            .inputs_of(&consumer_ca_ids)
            .iter()
            .map(IdKey::of)
            .collect();

        let c2p = crate::logical_map::PairwiseLogicalMap::new(op, producer, consumer)
            .map_consumer_to_producer(Some(&ca_root_ids));

        let forwarding = ForwardingInfo::new(op, producer, consumer)?;

        let p_domain = producer.domain();
        let mut ber = BestEffortReplay::builder()
            .replay_domain(p_domain.loop_domain())
            .target_domain(&consumer_ca_ids)
            .replay_transforms(p_domain.transforms())
            .target_transforms(c_domain.transforms())
            .target2replay_map(c2p)
            .replay_forward_map(forwarding.producer_forwarding.clone())
            .target_forward_map(forwarding.consumer_forwarding.clone())
            .skip_replay_swizzle(skip_producer_swizzle)
            .skip_target_swizzle(skip_consumer_swizzle)
            .skip_resize(skip_resize)
            .build()?;

        ber.add_compliment_loop_ids(
            &forwarding.producer_forwarding,
            &forwarding.producer_compliment,
            p_domain.transforms(),
        )?;
        Ok(ber)
    }

    /// Matched replay for consumer-as-producer: replay the consumer's loop
    /// structure up to `producer_compute_at_axis` of the producer.
    pub fn replay_cas_p(
        consumer: &Arc<TensorView>,
        producer: &Arc<TensorView>,
        op: &Arc<TensorOp>,
        producer_compute_at_axis: i64,
        skip_consumer_swizzle: bool,
        skip_producer_swizzle: bool,
        skip_resize: bool,
    ) -> Result<Self> {
        let p_domain = producer.domain();
        let axis = normalize_axis(producer_compute_at_axis, p_domain.ndims())?;
        let producer_ca_ids = no_reductions(&p_domain.loop_domain()[..axis]);

        // Minimal logical ids feeding the compute-at set.
        let producer_graph = DependencyGraph::new(p_domain.transforms())?;
        let deps = producer_graph.ids_between(p_domain.logical(), &producer_ca_ids);
        let dep_set: HashSet<IdKey> = deps.iter().map(IdKey::of).collect();
        let ca_root_ids: HashSet<IdKey> = p_domain
            .logical()
            .iter()
            .filter(|id| dep_set.contains(&IdKey::of(id)))
            .map(IdKey::of)
            .collect();

        let p2c = crate::logical_map::PairwiseLogicalMap::new(op, producer, consumer)
            .map_producer_to_consumer(Some(&ca_root_ids));

        let forwarding = ForwardingInfo::new(op, producer, consumer)?;

        let c_domain = consumer.domain();
        let mut ber = BestEffortReplay::builder()
            .replay_domain(c_domain.loop_domain())
            .target_domain(&producer_ca_ids)
            .replay_transforms(c_domain.transforms())
            .target_transforms(p_domain.transforms())
            .target2replay_map(p2c)
            .replay_forward_map(forwarding.consumer_forwarding.clone())
            .target_forward_map(forwarding.producer_forwarding.clone())
            .skip_replay_swizzle(skip_consumer_swizzle)
            .skip_target_swizzle(skip_producer_swizzle)
            .skip_resize(skip_resize)
            .build()?;

        ber.add_compliment_loop_ids(
            &forwarding.consumer_forwarding,
            &forwarding.consumer_compliment,
            c_domain.transforms(),
        )?;
        Ok(ber)
    }

    /// First loop position where the two domains stop being equivalent.
    pub fn find_first_mismatched_id(td1: &TensorDomain, td2: &TensorDomain) -> Result<usize> {
        let mut id_map: HashMap<IdKey, Arc<IterDomain>> = HashMap::new();
        let mut unclaimed: Vec<Arc<IterDomain>> = td2.root().to_vec();
        for rd1 in td1.root() {
            if let Some(pos) = unclaimed.iter().position(|rd2| rd1.same_as(rd2)) {
                id_map.insert(IdKey::of(rd1), unclaimed.swap_remove(pos));
            }
        }

        let ber = BestEffortReplay::builder()
            .replay_domain(td2.loop_domain())
            .target_domain(td1.loop_domain())
            .replay_transforms(td2.transforms())
            .target_transforms(td1.transforms())
            .target2replay_map(id_map)
            .error_on_failure(false)
            .build()?;

        let common = td1.ndims().min(td2.ndims());
        for i in 0..common {
            let td1_axis = td1.axis(i)?;
            let td2_axis = td2.axis(i)?;
            match ber.replay_map().get(&IdKey::of(td1_axis)) {
                Some(mapped) if mapped.id() == td2_axis.id() => {}
                _ => return Ok(i),
            }
        }
        Ok(common)
    }
}

fn normalize_axis(axis: i64, ndims: usize) -> Result<usize> {
    let adjusted = if axis < 0 { axis + ndims as i64 + 1 } else { axis };
    if adjusted < 0 || adjusted > ndims as i64 {
        return Err(Error::AxisOutOfBounds { axis: adjusted.unsigned_abs() as usize, ndims });
    }
    Ok(adjusted as usize)
}
