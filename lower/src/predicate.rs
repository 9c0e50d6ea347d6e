//! Predicate elimination.
//!
//! Every tensor op is guarded by an out-of-bounds predicate unless this
//! analysis proves the guard unnecessary. The forward pass admits an op only
//! when no rule requires a predicate, then records which inputs must be
//! initialized so the admitted op never reads garbage: reductions push their
//! init value onto unpredicated inputs, everything else gets the default
//! zero fill.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use fusor_ir::error::{Error, Result};
use fusor_ir::iter_domain::{IdKey, IterDomain};
use fusor_ir::ops::{OpKind, TensorOp};
use fusor_ir::tensor::{TensorView, TvKey};
use fusor_ir::transform::TransformKind;
use fusor_ir::traversal::DependencyGraph;
use fusor_ir::types::{
    ConstValue, DType, LoadStoreKind, MemoryType, ParallelType, ReduceOpKind,
};
use fusor_ir::Fusion;

use crate::best_effort::BestEffortReplay;
use crate::context::LowerCtx;
use crate::contiguity::NonDivisibleSplits;
use crate::logical_map::PairwiseLogicalMap;
use crate::ordered::transforms_between;

/// Whether threads bound to `pt` all see the same address range of `mem`.
fn memory_shared_across(mem: MemoryType, pt: ParallelType) -> bool {
    match mem {
        MemoryType::Global => pt.is_parallel_dim(),
        MemoryType::Shared => pt.is_thread_dim(),
        MemoryType::Local => false,
    }
}

/// Whether each unit of `pt` owns a disjoint slice of `mem`, making the axis
/// implicit in the address (a "zero loop" for indexing).
fn memory_partitioned_across(mem: MemoryType, pt: ParallelType) -> bool {
    match mem {
        MemoryType::Global => pt.is_device_dim(),
        MemoryType::Shared => pt.is_block_dim() || pt.is_device_dim(),
        MemoryType::Local => pt.is_parallel_dim() || pt.is_device_dim(),
    }
}

fn is_shared_memory(tv: &Arc<TensorView>) -> bool {
    tv.memory() == MemoryType::Shared
}

fn is_tma_load(op: &TensorOp) -> bool {
    matches!(op.kind, OpKind::LoadStore { kind: LoadStoreKind::TmaLoad, .. })
}

fn zero_of(dtype: DType) -> ConstValue {
    match dtype {
        DType::Bool => ConstValue::Bool(false),
        DType::Int32 | DType::Int64 => ConstValue::Int(0),
        DType::Float32 | DType::Float64 | DType::BFloat16 => ConstValue::Float(0.0),
    }
}

/// The init value `tv` is written with by its own (reduction-like)
/// definition, when it has one. Used to check that chained reductions agree.
fn reduction_init_of(def: &TensorOp, tv: &Arc<TensorView>) -> Option<ConstValue> {
    match &def.kind {
        OpKind::Reduction { init, .. } | OpKind::Mma { init, .. } => Some(*init),
        OpKind::GroupedReduction { inits, outputs, .. } => outputs
            .iter()
            .position(|o| o.id() == tv.id())
            .map(|i| inits[i]),
        OpKind::Welford { inits, output, .. } => output
            .views()
            .iter()
            .position(|o| o.id() == tv.id())
            .map(|i| inits[i]),
        OpKind::GroupedWelford { inits, outputs, .. } => outputs.iter().zip(inits).find_map(
            |(triplet, channel_inits)| {
                triplet
                    .views()
                    .iter()
                    .position(|o| o.id() == tv.id())
                    .map(|i| channel_inits[i])
            },
        ),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct PredicateElimination {
    non_predicated: HashSet<u64>,
    /// `None` means "default zero fill"; a recorded value comes from a
    /// reduction consuming the tensor unpredicated.
    init_value_map: HashMap<TvKey, Option<ConstValue>>,
}

impl PredicateElimination {
    pub fn new(ctx: &LowerCtx) -> Result<Self> {
        let mut elim = Self::default();
        for op in ctx.fusion().exprs() {
            elim.dispatch(ctx, op)?;
        }
        Ok(elim)
    }

    fn dispatch(&mut self, ctx: &LowerCtx, op: &Arc<TensorOp>) -> Result<()> {
        if self.needs_predicate(ctx, op)? {
            assert_on_warp_ops(ctx.fusion(), op)?;
            return Ok(());
        }

        debug!(op = %op, "predicate eliminated");
        self.non_predicated.insert(op.id());

        // Every input of an unpredicated op must hold a defined value in its
        // out-of-bounds region.
        for (i, input) in op.inputs().iter().enumerate() {
            let Some(input_def) = ctx.fusion().definition(input) else {
                // Fusion inputs live in global memory, which is never
                // unpredicated (TMA loads initialize in hardware).
                continue;
            };
            // Reduction outputs are fully initialized by their own op.
            if input_def.is_reduction_like() {
                continue;
            }
            match &op.kind {
                OpKind::Reduction { init, .. } | OpKind::Mma { init, .. } => {
                    self.set_reduction_init(input, *init)?;
                }
                OpKind::GroupedReduction { inits, .. } => {
                    self.set_reduction_init(input, inits[i])?;
                }
                OpKind::Welford { inits, .. } => {
                    self.set_reduction_init(input, inits[0])?;
                }
                OpKind::GroupedWelford { inits, .. } => {
                    self.set_reduction_init(input, inits[i][0])?;
                }
                _ => {
                    if !self.non_predicated.contains(&input_def.id()) {
                        self.set_default_init(input);
                    }
                }
            }
        }
        Ok(())
    }

    /// Disjunction of every rule that forces a guard around `op`.
    pub fn needs_predicate(&self, ctx: &LowerCtx, op: &Arc<TensorOp>) -> Result<bool> {
        Ok(predicate_rng(op)
            || predicate_int_div(op)
            || self.predicate_shared_mem_access(ctx, op)
            || predicate_producer_consumer(ctx, op)?
            || predicate_non_divisible_logical(op)?
            || predicate_non_divisible_split(ctx, op)?
            || predicate_expand_reduce(op)
            || self.predicate_reduction_inputs(ctx.fusion(), op)?)
    }

    fn predicate_shared_mem_access(&self, ctx: &LowerCtx, op: &Arc<TensorOp>) -> bool {
        for consumer in op.outputs() {
            for producer in op.inputs() {
                if (is_shared_memory(&producer) || is_shared_memory(&consumer))
                    && need_shared_mem_predicate(ctx, &producer, &consumer, op)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Chained-reduction rules: an unpredicated reduction may read an
    /// unpredicated input only if that input is initialized to this
    /// reduction's init value.
    fn predicate_reduction_inputs(&self, fusion: &Fusion, op: &Arc<TensorOp>) -> Result<bool> {
        match &op.kind {
            OpKind::Reduction { op: reduce_op, init, input, .. } => {
                self.check_reduction_input(fusion, input, *init, Some(*reduce_op))
            }
            OpKind::GroupedReduction { ops, inits, inputs, .. } => {
                for ((input, init), reduce_op) in inputs.iter().zip(inits).zip(ops) {
                    if self.check_reduction_input(fusion, input, *init, Some(*reduce_op))? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            OpKind::Welford { input, inits, .. } => {
                self.check_welford_input(fusion, input, inits[0])
            }
            OpKind::GroupedWelford { inputs, inits, .. } => {
                for (input, channel_inits) in inputs.iter().zip(inits) {
                    if self.check_welford_input(fusion, input, channel_inits[0])? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            OpKind::Mma { a, b, init, .. } => {
                for input in [a, b] {
                    let Some(input_def) = fusion.definition(input) else {
                        return Ok(true);
                    };
                    if let Some(input_init) = reduction_init_of(input_def, input) {
                        if input_init != *init {
                            return Ok(true);
                        }
                    }
                    if self.non_predicated.contains(&input_def.id()) {
                        // An unpredicated producer feeding the matrix unit
                        // must be initialized to exactly the accumulator
                        // init.
                        if let Some(Some(recorded)) =
                            self.init_value_map.get(&TvKey::of(input))
                        {
                            if recorded != init {
                                return Ok(true);
                            }
                        }
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn check_reduction_input(
        &self,
        fusion: &Fusion,
        input: &Arc<TensorView>,
        init: ConstValue,
        reduce_op: Option<ReduceOpKind>,
    ) -> Result<bool> {
        let Some(input_def) = fusion.definition(input) else {
            return Ok(true);
        };
        if let Some(input_init) = reduction_init_of(input_def, input) {
            if input_init != init {
                return Ok(true);
            }
        }
        // An unpredicated non-reduction producer may hold garbage out of
        // bounds. A preceding reduction of the same kind is fine: its input
        // was initialized to the shared init value.
        let unpredicated = self.non_predicated.contains(&input_def.id());
        let compatible_chain = match &input_def.kind {
            OpKind::Reduction { op: prev, .. } => Some(*prev) == reduce_op,
            _ => false,
        };
        Ok(unpredicated && !compatible_chain)
    }

    fn check_welford_input(
        &self,
        fusion: &Fusion,
        input: &Arc<TensorView>,
        avg_init: ConstValue,
    ) -> Result<bool> {
        let Some(input_def) = fusion.definition(input) else {
            return Ok(true);
        };
        if let Some(input_init) = reduction_init_of(input_def, input) {
            if input_init != avg_init {
                return Ok(true);
            }
        }
        let welford_chain = matches!(
            input_def.kind,
            OpKind::Welford { .. } | OpKind::GroupedWelford { .. }
        );
        Ok(!welford_chain && self.non_predicated.contains(&input_def.id()))
    }

    fn set_default_init(&mut self, tv: &Arc<TensorView>) {
        // A prior reduction-init entry is stricter; keep it.
        self.init_value_map.entry(TvKey::of(tv)).or_insert(None);
    }

    fn set_reduction_init(&mut self, tv: &Arc<TensorView>, init: ConstValue) -> Result<()> {
        match self.init_value_map.get(&TvKey::of(tv)) {
            None | Some(None) => {
                self.init_value_map.insert(TvKey::of(tv), Some(init));
                Ok(())
            }
            Some(Some(existing)) if *existing == init => Ok(()),
            Some(Some(existing)) => Err(Error::InconsistentInitialization {
                tv: tv.to_string(),
                prior: existing.to_string(),
                new_value: init.to_string(),
            }),
        }
    }

    pub fn can_omit_predicate(&self, ctx: &LowerCtx, op: &Arc<TensorOp>) -> Result<bool> {
        // Scalar fills of non-global buffers need no guard: every element is
        // written the same value.
        if let OpKind::Full { output, .. } = &op.kind {
            match output.memory() {
                MemoryType::Local => return Ok(true),
                MemoryType::Shared => {
                    return Ok(is_exact_parallel_shared_mem_access(ctx, output));
                }
                MemoryType::Global => {}
            }
        }
        if self.non_predicated.contains(&op.id()) {
            return Ok(true);
        }
        assert_on_warp_ops(ctx.fusion(), op)?;
        Ok(false)
    }

    /// Copy elimination status when `to` replaces `from` in the fusion.
    pub fn propagate_removal_info(&mut self, from: &Arc<TensorOp>, to: &Arc<TensorOp>) {
        if self.non_predicated.contains(&from.id()) {
            self.non_predicated.insert(to.id());
        }
    }

    /// Value `tv` must be initialized to before its unpredicated consumers
    /// run; `None` when no initialization is required at all.
    pub fn get_init_value(&self, tv: &Arc<TensorView>) -> Option<ConstValue> {
        match self.init_value_map.get(&TvKey::of(tv)) {
            None => None,
            Some(Some(v)) => Some(*v),
            Some(None) => Some(zero_of(tv.dtype())),
        }
    }

    pub fn is_non_predicated(&self, op: &Arc<TensorOp>) -> bool {
        self.non_predicated.contains(&op.id())
    }
}

/// Warp-collective ops cannot carry an inline predicate; reaching one that
/// still needs a guard means the schedule is invalid.
pub fn assert_on_warp_ops(fusion: &Fusion, op: &Arc<TensorOp>) -> Result<()> {
    if let OpKind::Mma { .. } = op.kind {
        return Err(Error::UnsupportedTransform {
            reason: format!("cannot predicate matrix pipeline op {op}, tiling is invalid"),
        });
    }
    if let OpKind::LoadStore { kind: LoadStoreKind::LdMatrix, input, output } = &op.kind {
        let fed_by_tma = fusion.definition(input).is_some_and(|def| is_tma_load(def));
        let feeds_mma = fusion
            .uses(output)
            .iter()
            .any(|u| matches!(u.kind, OpKind::Mma { .. }));
        if fed_by_tma && feeds_mma {
            return Err(Error::UnsupportedTransform {
                reason: format!(
                    "cannot predicate {op} in a matrix main loop, use exact parallel dims"
                ),
            });
        }
    }
    Ok(())
}

/// RNG ops are always guarded: generating values for out-of-bounds elements
/// perturbs the stream.
fn predicate_rng(op: &TensorOp) -> bool {
    matches!(op.kind, OpKind::Rng { .. })
}

/// Integer division-like ops trap on garbage operands, so out-of-bounds
/// lanes must not execute them.
fn predicate_int_div(op: &TensorOp) -> bool {
    match &op.kind {
        OpKind::Binary { op: bop, output, .. } => {
            output.dtype().is_integer() && bop.is_division_like()
        }
        _ => false,
    }
}

/// Reducing an expanded broadcast without a guard would fold the same value
/// once per expansion copy.
fn predicate_expand_reduce(op: &Arc<TensorOp>) -> bool {
    if !op.is_reduction_like() {
        return false;
    }
    let inputs = op.inputs();
    let outputs = op.outputs();
    for (input, output) in inputs.iter().zip(outputs.iter().cycle()) {
        let p2c = PairwiseLogicalMap::new(op, input, output).map_producer_to_consumer(None);
        for (p_key, c_id) in &p2c {
            if p_key.0.expanded_extent().is_some() && c_id.is_reduction() {
                return true;
            }
        }
    }
    false
}

fn is_exact_parallel_shared_mem_access(ctx: &LowerCtx, tv: &Arc<TensorView>) -> bool {
    tv.domain()
        .loop_domain()
        .iter()
        .all(|id| !id.is_thread_dim() || !ctx.parallel_extents().is_oversubscribed(id))
}

fn need_shared_mem_predicate(
    ctx: &LowerCtx,
    producer: &Arc<TensorView>,
    consumer: &Arc<TensorView>,
    op: &Arc<TensorOp>,
) -> bool {
    // Out-of-bound threads of an oversubscribed block must not touch the
    // shared buffer.
    if !is_exact_parallel_shared_mem_access(ctx, consumer) {
        return true;
    }

    // A shared producer that itself reads shared memory: removing the guard
    // forces an initialization that defeats buffer reuse.
    if producer.memory() == MemoryType::Shared {
        if let Some(producer_def) = ctx.fusion().definition(producer) {
            if producer_def.inputs().iter().any(is_shared_memory) {
                return true;
            }
        }
    }

    // Unroll/unswitch hoisting and shared-memory initialization do not
    // compose.
    if consumer.domain().loop_domain().iter().any(|id| {
        matches!(id.parallel(), ParallelType::Unroll | ParallelType::Unswitch)
    }) {
        return true;
    }

    // Reductions reading shared memory keep their guard; their init handling
    // is special-cased elsewhere.
    if op.is_reduction_like() && producer.memory() == MemoryType::Shared {
        return true;
    }

    false
}

fn predicate_producer_consumer(ctx: &LowerCtx, op: &Arc<TensorOp>) -> Result<bool> {
    // TMA transfers clamp out-of-bound accesses in hardware.
    if is_tma_load(op) {
        return Ok(false);
    }
    for consumer in op.outputs() {
        for producer in op.inputs() {
            if pair_needs_predicate(ctx, &producer, &consumer, op)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Consumer-local buffers are sized by their loop domain, so a consumer
/// access is always in bounds. Producers are indexed through the consumer's
/// loops though, and an unmapped consumer loop id can push a producer index
/// past its allocation.
fn pair_needs_predicate(
    ctx: &LowerCtx,
    producer: &Arc<TensorView>,
    consumer: &Arc<TensorView>,
    op: &Arc<TensorOp>,
) -> Result<bool> {
    // Global allocations are sized by logical domains; always guard them.
    if producer.memory() == MemoryType::Global || consumer.memory() == MemoryType::Global {
        return Ok(true);
    }

    let c2p = BestEffortReplay::replay_pas_c(producer, consumer, op, -1, false, false, false)?;

    let consumer_domain = consumer.domain();
    let graph = DependencyGraph::new(consumer_domain.transforms())?;
    let analyzer = PairAnalyzer { ctx, graph: &graph, c2p: c2p.replay_map() };

    for id in consumer_domain.loop_domain() {
        if analyzer.needs_predicate(id) {
            return Ok(true);
        }
    }
    Ok(false)
}

struct PairAnalyzer<'a> {
    ctx: &'a LowerCtx<'a>,
    graph: &'a DependencyGraph,
    /// Best-effort map from consumer ids to producer ids.
    c2p: &'a HashMap<IdKey, Arc<IterDomain>>,
}

impl PairAnalyzer<'_> {
    fn needs_predicate(&self, consumer_id: &Arc<IterDomain>) -> bool {
        if consumer_id.is_broadcast() {
            return false;
        }

        // An oversubscribed thread axis reads with thread indices past the
        // axis extent; safe only when the producer is parallelized the same
        // way.
        if consumer_id.is_thread_dim()
            && self.ctx.parallel_extents().is_oversubscribed(consumer_id)
        {
            match self.c2p.get(&IdKey::of(consumer_id)) {
                Some(p_id) if p_id.parallel() == consumer_id.parallel() => {}
                _ => return true,
            }
        }

        if self.c2p.contains_key(&IdKey::of(consumer_id)) {
            return false;
        }

        let Some(def) = self.graph.definition(consumer_id) else {
            return false;
        };
        match &def.kind {
            TransformKind::Split { input, factor, .. } => {
                let Some(factor) = factor.as_const() else {
                    return true;
                };
                if factor == 1 {
                    return false;
                }
                match input.extent().as_const() {
                    Some(extent) if extent % factor == 0 => self.needs_predicate(input),
                    _ => true,
                }
            }
            TransformKind::Merge { outer, inner, .. } => {
                self.needs_predicate(inner) || self.needs_predicate(outer)
            }
            TransformKind::Resize { input, .. } => self.needs_predicate(input),
            // Swizzle outputs mirror their inputs' extents.
            TransformKind::Swizzle { .. } | TransformKind::Swizzle2D { .. } => false,
        }
    }
}

/// A split logical domain whose pieces all survive into addressed (non-zero)
/// loops can index past the logical extent; see the ceil-division in
/// `IterDomain::split`.
fn predicate_non_divisible_logical(op: &Arc<TensorOp>) -> Result<bool> {
    if is_tma_load(op) {
        return Ok(false);
    }
    for output in op.outputs() {
        let domain = output.domain();
        let graph = DependencyGraph::new(domain.transforms())?;
        let history =
            transforms_between(&graph, domain.logical(), domain.loop_domain());
        let history_ids: HashSet<u64> = history.iter().map(|t| t.id()).collect();

        let split_logical: Vec<Arc<IterDomain>> = domain
            .logical()
            .iter()
            .filter(|id| {
                !id.is_broadcast()
                    && graph
                        .uses(id)
                        .iter()
                        .find(|t| history_ids.contains(&t.id()))
                        .is_some_and(|t| t.is_split())
            })
            .cloned()
            .collect();
        if split_logical.is_empty() {
            continue;
        }

        let zero_loop_ids = zero_loop_ids(&output, domain.loop_domain());
        if zero_loop_ids.is_empty() {
            return Ok(true);
        }
        let reaching = graph.ids_between(&split_logical, &zero_loop_ids);
        let reaching: HashSet<IdKey> = reaching.iter().map(IdKey::of).collect();
        if split_logical.iter().any(|id| !reaching.contains(&IdKey::of(id))) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Loop ids whose index contributes zero to the tensor's address: axes the
/// memory is partitioned across, plus matrix-unit axes that are implicit in
/// the hardware instruction.
fn zero_loop_ids(
    tv: &Arc<TensorView>,
    loop_domain: &[Arc<IterDomain>],
) -> Vec<Arc<IterDomain>> {
    loop_domain
        .iter()
        .filter(|id| {
            let pt = id.parallel();
            if memory_shared_across(tv.memory(), pt) {
                return false;
            }
            memory_partitioned_across(tv.memory(), pt) || pt == ParallelType::Mma
        })
        .cloned()
        .collect()
}

fn predicate_non_divisible_split(ctx: &LowerCtx, op: &Arc<TensorOp>) -> Result<bool> {
    if is_tma_load(op) {
        return Ok(false);
    }
    for output in op.outputs() {
        let domain = output.domain();
        let info = NonDivisibleSplits::new(
            domain.loop_domain(),
            domain.logical(),
            domain.transforms(),
            ctx.divisible_splits(),
        )?;
        if domain
            .loop_domain()
            .iter()
            .any(|id| info.depends_on_non_divisible_split(id))
        {
            return Ok(true);
        }
    }
    Ok(false)
}
