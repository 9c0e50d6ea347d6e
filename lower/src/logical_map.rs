//! Positional mapping between a producer's logical domain and a consumer's
//! root domain across one tensor op.
//!
//! Producer reduction axes never map (they are gone by the time the consumer
//! reads). Broadcast ops insert consumer-only axes and squeeze ops drop
//! producer-only axes; both are skipped when pairing. Everything else pairs
//! the remaining axes in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fusor_ir::domain::no_reductions;
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::ops::{OpKind, TensorOp};
use fusor_ir::tensor::TensorView;

#[derive(Debug)]
pub struct PairwiseLogicalMap<'a> {
    op: &'a Arc<TensorOp>,
    producer: &'a Arc<TensorView>,
    consumer: &'a Arc<TensorView>,
}

impl<'a> PairwiseLogicalMap<'a> {
    pub fn new(
        op: &'a Arc<TensorOp>,
        producer: &'a Arc<TensorView>,
        consumer: &'a Arc<TensorView>,
    ) -> Self {
        Self { op, producer, consumer }
    }

    /// Aligned (producer logical id, consumer root id) pairs.
    fn pairs(&self) -> Vec<(Arc<IterDomain>, Arc<IterDomain>)> {
        let p_domain = self.producer.domain();
        let c_domain = self.consumer.domain();
        let p_logical = no_reductions(p_domain.logical());
        let c_root = c_domain.root();

        match &self.op.kind {
            OpKind::Broadcast { flags, .. } => {
                let mut p_it = p_logical.into_iter();
                let mut out = Vec::new();
                for (c_id, is_new) in c_root.iter().zip(flags) {
                    if *is_new {
                        continue;
                    }
                    if let Some(p_id) = p_it.next() {
                        out.push((p_id, c_id.clone()));
                    }
                }
                out
            }
            OpKind::Squeeze { flags, .. } => {
                let mut c_it = c_root.iter();
                let mut out = Vec::new();
                for (p_id, dropped) in p_logical.into_iter().zip(flags) {
                    if *dropped {
                        continue;
                    }
                    if let Some(c_id) = c_it.next() {
                        out.push((p_id, c_id.clone()));
                    }
                }
                out
            }
            _ => p_logical.into_iter().zip(c_root.iter().cloned()).collect(),
        }
    }

    /// Producer logical -> consumer root. With `filter`, only producer ids in
    /// the set contribute entries.
    pub fn map_producer_to_consumer(
        &self,
        filter: Option<&HashSet<IdKey>>,
    ) -> HashMap<IdKey, Arc<IterDomain>> {
        self.pairs()
            .into_iter()
            .filter(|(p, _)| filter.is_none_or(|f| f.contains(&IdKey::of(p))))
            .map(|(p, c)| (IdKey::of(&p), c))
            .collect()
    }

    /// Consumer root -> producer logical. With `filter`, only consumer ids in
    /// the set contribute entries.
    pub fn map_consumer_to_producer(
        &self,
        filter: Option<&HashSet<IdKey>>,
    ) -> HashMap<IdKey, Arc<IterDomain>> {
        self.pairs()
            .into_iter()
            .filter(|(_, c)| filter.is_none_or(|f| f.contains(&IdKey::of(c))))
            .map(|(p, c)| (IdKey::of(&c), p))
            .collect()
    }
}
