//! Dependency traversal over transformation histories.
//!
//! All walks are iterative with explicit stacks; transformation chains can be
//! deep enough that recursion is a liability.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::iter_domain::{IdKey, IterDomain};
use crate::transform::{Transform, TransformKey};

/// Definition and use maps over one set of transformations.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    def: HashMap<IdKey, Arc<Transform>>,
    uses: HashMap<IdKey, Vec<Arc<Transform>>>,
}

impl DependencyGraph {
    pub fn new(transforms: &[Arc<Transform>]) -> Result<Self> {
        let mut graph = Self::default();
        for t in transforms {
            for out in t.outputs() {
                if graph.def.insert(IdKey::of(&out), t.clone()).is_some() {
                    return Err(Error::MultipleDefinitions { id: out.to_string() });
                }
            }
            for inp in t.inputs() {
                graph.uses.entry(IdKey::of(&inp)).or_default().push(t.clone());
            }
        }
        Ok(graph)
    }

    pub fn definition(&self, id: &Arc<IterDomain>) -> Option<&Arc<Transform>> {
        self.def.get(&IdKey::of(id))
    }

    pub fn uses(&self, id: &Arc<IterDomain>) -> &[Arc<Transform>] {
        self.uses.get(&IdKey::of(id)).map_or(&[], Vec::as_slice)
    }

    /// Every transformation producing `targets`, producers before consumers.
    /// Traversal stops at ids in `stop_at` (in addition to undefined ids).
    pub fn exprs_to_stopping_at(
        &self,
        targets: &[Arc<IterDomain>],
        stop_at: &HashSet<IdKey>,
    ) -> Vec<Arc<Transform>> {
        enum Visit {
            Enter(Arc<Transform>),
            Exit(Arc<Transform>),
        }

        let mut entered: HashSet<TransformKey> = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<Visit> = Vec::new();

        for target in targets {
            if stop_at.contains(&IdKey::of(target)) {
                continue;
            }
            if let Some(def) = self.definition(target) {
                stack.push(Visit::Enter(def.clone()));
            }
        }

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(t) => {
                    if !entered.insert(TransformKey::of(&t)) {
                        continue;
                    }
                    stack.push(Visit::Exit(t.clone()));
                    for inp in t.inputs() {
                        if stop_at.contains(&IdKey::of(&inp)) {
                            continue;
                        }
                        if let Some(def) = self.definition(&inp) {
                            stack.push(Visit::Enter(def.clone()));
                        }
                    }
                }
                Visit::Exit(t) => order.push(t),
            }
        }

        order
    }

    pub fn exprs_to(&self, targets: &[Arc<IterDomain>]) -> Vec<Arc<Transform>> {
        self.exprs_to_stopping_at(targets, &HashSet::new())
    }

    /// Transformations on dependency paths from `from` to `to`, producers
    /// before consumers. Fails when some target neither is in `from` nor
    /// depends on it.
    pub fn exprs_between(
        &self,
        from: &[Arc<IterDomain>],
        to: &[Arc<IterDomain>],
    ) -> Result<Vec<Arc<Transform>>> {
        let from_set: HashSet<IdKey> = from.iter().map(IdKey::of).collect();
        let closure = self.exprs_to_stopping_at(to, &from_set);

        let mut dependent: HashSet<IdKey> = from_set.clone();
        let mut kept = Vec::new();
        for t in closure {
            if t.inputs().iter().any(|inp| dependent.contains(&IdKey::of(inp))) {
                for out in t.outputs() {
                    dependent.insert(IdKey::of(&out));
                }
                kept.push(t);
            }
        }

        let unreached: Vec<String> = to
            .iter()
            .filter(|id| !dependent.contains(&IdKey::of(id)))
            .map(|id| id.to_string())
            .collect();
        if !unreached.is_empty() {
            return Err(Error::TraversalFailure { unreached });
        }

        Ok(kept)
    }

    /// Every id on some dependency path from `from` to `to`, dependency
    /// ordered starting with the used `from` ids. Unreachable targets simply
    /// contribute nothing.
    pub fn ids_between(
        &self,
        from: &[Arc<IterDomain>],
        to: &[Arc<IterDomain>],
    ) -> Vec<Arc<IterDomain>> {
        let from_set: HashSet<IdKey> = from.iter().map(IdKey::of).collect();
        let closure = self.exprs_to_stopping_at(to, &from_set);

        let mut dependent: HashSet<IdKey> = HashSet::new();
        let mut order: Vec<Arc<IterDomain>> = Vec::new();
        for id in from {
            if dependent.insert(IdKey::of(id)) {
                order.push(id.clone());
            }
        }
        for t in closure {
            if t.inputs().iter().any(|inp| dependent.contains(&IdKey::of(inp))) {
                for out in t.outputs() {
                    if dependent.insert(IdKey::of(&out)) {
                        order.push(out);
                    }
                }
            }
        }

        // Keep only ids that lie on a path to a target: walk backward from
        // the targets over the kept set.
        let mut on_path: HashSet<IdKey> = HashSet::new();
        let mut stack: Vec<Arc<IterDomain>> = to
            .iter()
            .filter(|id| dependent.contains(&IdKey::of(id)))
            .cloned()
            .collect();
        while let Some(id) = stack.pop() {
            if !on_path.insert(IdKey::of(&id)) {
                continue;
            }
            if from_set.contains(&IdKey::of(&id)) {
                continue;
            }
            if let Some(def) = self.definition(&id) {
                for inp in def.inputs() {
                    if dependent.contains(&IdKey::of(&inp)) {
                        stack.push(inp);
                    }
                }
            }
        }

        order.retain(|id| on_path.contains(&IdKey::of(id)));
        order
    }

    /// Terminal inputs (ids without a definition) reachable backward from
    /// `targets`, in first-visit order.
    pub fn inputs_of(&self, targets: &[Arc<IterDomain>]) -> Vec<Arc<IterDomain>> {
        let mut seen: HashSet<IdKey> = HashSet::new();
        let mut result = Vec::new();
        let mut stack: Vec<Arc<IterDomain>> = targets.iter().rev().cloned().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(IdKey::of(&id)) {
                continue;
            }
            match self.definition(&id) {
                Some(def) => {
                    let mut inputs = def.inputs();
                    inputs.reverse();
                    stack.extend(inputs);
                }
                None => result.push(id),
            }
        }
        result
    }
}
