//! Exact replay of one domain's transformation history onto mapped
//! counterparts.
//!
//! Given a target loop domain and a map from target-side ids to replay-side
//! ids, walk the target's history in dependency order and re-apply each
//! transformation to the mapped ids. The replay-side frontier (`loop_ids`) is
//! keyed by a monotonically increasing creation counter, which makes
//! [`ReplayTransformations::loop_domain`] deterministic regardless of hash
//! map iteration order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use fusor_ir::error::{Error, Result};
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::transform::{Transform, TransformKind};
use fusor_ir::traversal::DependencyGraph;

#[derive(Debug)]
pub struct ReplayTransformations {
    id_map: HashMap<IdKey, Arc<IterDomain>>,
    loop_ids: HashMap<IdKey, usize>,
    counter: usize,
    error_on_failure: bool,
    replay_swizzle: bool,
    replay_resize: bool,
    replay_rfactor: bool,
    replayed: Vec<Arc<Transform>>,
}

#[bon::bon]
impl ReplayTransformations {
    /// Replay the history of `target_domain` (drawn from
    /// `target_transforms`) onto the ids `id_map` points at.
    ///
    /// - `error_on_failure` (default true): unmapped inputs and unreplayed
    ///   targets are errors instead of silent skips.
    /// - `replay_swizzle` / `replay_resize` (default false): when off, the
    ///   transformation is not re-created; its input's mapped id is forwarded
    ///   to the output position.
    /// - `replay_rfactor` (default false): whether replayed outputs inherit
    ///   the target's allocation-defining tag.
    #[builder]
    pub fn new(
        target_domain: Vec<Arc<IterDomain>>,
        target_transforms: &[Arc<Transform>],
        id_map: HashMap<IdKey, Arc<IterDomain>>,
        #[builder(default = true)] error_on_failure: bool,
        #[builder(default = false)] replay_swizzle: bool,
        #[builder(default = false)] replay_resize: bool,
        #[builder(default = false)] replay_rfactor: bool,
    ) -> Result<Self> {
        let mut replay = Self {
            id_map,
            loop_ids: HashMap::new(),
            counter: 0,
            error_on_failure,
            replay_swizzle,
            replay_resize,
            replay_rfactor,
            replayed: Vec::new(),
        };

        // Every mapped id starts out as a frontier id. Seed counters in
        // target-id order for determinism.
        let mut seeds: Vec<&IdKey> = replay.id_map.keys().collect();
        seeds.sort_by_key(|k| k.0.id());
        let seeded: Vec<Arc<IterDomain>> =
            seeds.into_iter().filter_map(|k| replay.id_map.get(k).cloned()).collect();
        for mapped in seeded {
            let c = replay.next_counter();
            replay.loop_ids.insert(IdKey::of(&mapped), c);
        }

        replay.run(&target_domain, target_transforms)?;
        Ok(replay)
    }
}

impl ReplayTransformations {
    fn next_counter(&mut self) -> usize {
        let c = self.counter;
        self.counter += 1;
        c
    }

    fn fail(&self, reason: &str) -> Result<()> {
        if self.error_on_failure {
            return Err(Error::ReplayFailed { reason: reason.into() });
        }
        Ok(())
    }

    fn mapped(&self, target: &Arc<IterDomain>) -> Option<Arc<IterDomain>> {
        self.id_map.get(&IdKey::of(target)).cloned()
    }

    fn take_frontier(&mut self, id: &Arc<IterDomain>) -> Result<()> {
        if self.loop_ids.remove(&IdKey::of(id)).is_none() {
            // A mapped id with generated uses can never be transformed again.
            return Err(Error::ReplayFailed {
                reason: format!("{id} was modified but is not a frontier id"),
            });
        }
        Ok(())
    }

    fn add_frontier(&mut self, id: &Arc<IterDomain>) {
        let c = self.next_counter();
        self.loop_ids.insert(IdKey::of(id), c);
    }

    fn run(
        &mut self,
        target_domain: &[Arc<IterDomain>],
        target_transforms: &[Arc<Transform>],
    ) -> Result<()> {
        let graph = DependencyGraph::new(target_transforms)?;

        if self.error_on_failure {
            for input in graph.inputs_of(target_domain) {
                if self.mapped(&input).is_none() {
                    return Err(Error::ReplayFailed {
                        reason: format!("required input {input} missing from id map"),
                    });
                }
            }
        }

        if target_domain.is_empty() || self.id_map.is_empty() {
            return Ok(());
        }

        for t in graph.exprs_to(target_domain) {
            trace!(transform = %t, "replaying");
            self.dispatch(&t)?;
        }

        if self.error_on_failure && self.loop_ids.len() < target_domain.len() {
            return Err(Error::ReplayFailed {
                reason: "did not produce enough frontier ids".into(),
            });
        }

        for target in target_domain {
            match self.mapped(target) {
                None => self.fail(&format!("no replayed id for target {target}"))?,
                Some(replayed) => {
                    if !self.loop_ids.contains_key(&IdKey::of(&replayed)) {
                        return Err(Error::ReplayFailed {
                            reason: format!("replayed id for {target} is not a frontier id"),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, t: &Arc<Transform>) -> Result<()> {
        match &t.kind {
            TransformKind::Split { input, outer, inner, factor, inner_split } => {
                let Some(mapped) = self.mapped(input) else {
                    return self.fail("split input not mapped");
                };
                self.take_frontier(&mapped)?;
                let rfactor = self.replay_rfactor && outer.is_rfactor();
                let (r_outer, r_inner, r_t) =
                    IterDomain::split(&mapped, factor.clone(), *inner_split, rfactor);
                self.add_frontier(&r_outer);
                self.add_frontier(&r_inner);
                self.id_map.insert(IdKey::of(outer), r_outer);
                self.id_map.insert(IdKey::of(inner), r_inner);
                self.replayed.push(r_t);
                Ok(())
            }
            TransformKind::Merge { outer, inner, output } => {
                let mapped_outer = self.mapped(outer);
                let mapped_inner = self.mapped(inner);

                // When only one side maps and the missing side is a target
                // broadcast, the merge degenerates: forward the mapped side.
                match (&mapped_outer, &mapped_inner) {
                    (Some(m), None) if inner.is_broadcast() => {
                        self.id_map.insert(IdKey::of(output), m.clone());
                        return Ok(());
                    }
                    (None, Some(m)) if outer.is_broadcast() => {
                        self.id_map.insert(IdKey::of(output), m.clone());
                        return Ok(());
                    }
                    (Some(_), Some(_)) => {}
                    _ => return self.fail("merge inputs not mapped"),
                }

                let (Some(mapped_outer), Some(mapped_inner)) = (mapped_outer, mapped_inner)
                else {
                    return self.fail("merge inputs not mapped");
                };
                self.take_frontier(&mapped_outer)?;
                self.take_frontier(&mapped_inner)?;
                let rfactor = self.replay_rfactor && output.is_rfactor();
                let (r_out, r_t) = IterDomain::merge(&mapped_outer, &mapped_inner, rfactor);
                self.add_frontier(&r_out);
                self.id_map.insert(IdKey::of(output), r_out);
                self.replayed.push(r_t);
                Ok(())
            }
            TransformKind::Swizzle { kind, in_x, in_y, out_x, out_y } => {
                let (Some(mapped_x), Some(mapped_y)) = (self.mapped(in_x), self.mapped(in_y))
                else {
                    return self.fail("swizzle inputs not mapped");
                };
                self.take_frontier(&mapped_x)?;
                self.take_frontier(&mapped_y)?;
                let (r_x, r_y, r_t) = IterDomain::swizzle(*kind, &mapped_x, &mapped_y);
                self.add_frontier(&r_x);
                self.add_frontier(&r_y);
                self.id_map.insert(IdKey::of(out_x), r_x);
                self.id_map.insert(IdKey::of(out_y), r_y);
                self.replayed.push(r_t);
                Ok(())
            }
            TransformKind::Swizzle2D { kind, in_x, in_y, out_x, out_y } => {
                let (Some(mapped_x), Some(mapped_y)) = (self.mapped(in_x), self.mapped(in_y))
                else {
                    return self.fail("swizzle inputs not mapped");
                };
                if self.replay_swizzle {
                    self.take_frontier(&mapped_x)?;
                    self.take_frontier(&mapped_y)?;
                    let (r_x, r_y, r_t) = IterDomain::swizzle_2d(*kind, &mapped_x, &mapped_y);
                    self.add_frontier(&r_x);
                    self.add_frontier(&r_y);
                    self.id_map.insert(IdKey::of(out_x), r_x);
                    self.id_map.insert(IdKey::of(out_y), r_y);
                    self.replayed.push(r_t);
                } else {
                    // Forward the pair through; they stay frontier ids with
                    // refreshed counters.
                    self.loop_ids.remove(&IdKey::of(&mapped_x));
                    self.loop_ids.remove(&IdKey::of(&mapped_y));
                    self.add_frontier(&mapped_x);
                    self.add_frontier(&mapped_y);
                    self.id_map.insert(IdKey::of(out_x), mapped_x);
                    self.id_map.insert(IdKey::of(out_y), mapped_y);
                }
                Ok(())
            }
            TransformKind::Resize { input, output, left, right } => {
                let Some(mapped) = self.mapped(input) else {
                    return self.fail("resize input not mapped");
                };
                self.take_frontier(&mapped)?;
                let out = if self.replay_resize {
                    let rfactor = self.replay_rfactor && output.is_rfactor();
                    let (r_out, r_t) = IterDomain::resize(&mapped, *left, *right, rfactor);
                    self.replayed.push(r_t);
                    r_out
                } else {
                    mapped
                };
                self.add_frontier(&out);
                self.id_map.insert(IdKey::of(output), out);
                Ok(())
            }
        }
    }

    /// Final target-to-replay id map.
    pub fn replay_map(&self) -> &HashMap<IdKey, Arc<IterDomain>> {
        &self.id_map
    }

    /// Replay-side frontier, ordered by creation.
    pub fn loop_domain(&self) -> Vec<Arc<IterDomain>> {
        let mut entries: Vec<(&IdKey, &usize)> = self.loop_ids.iter().collect();
        entries.sort_by_key(|(_, c)| **c);
        entries.into_iter().map(|(k, _)| k.0.clone()).collect()
    }

    /// Transformations created on the replay side, in application order.
    pub fn replayed_transforms(&self) -> &[Arc<Transform>] {
        &self.replayed
    }
}
