//! Tensor-level operations, as a closed union over the shapes the lowering
//! analyses inspect.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::tensor::TensorView;
use crate::types::{
    BinaryOpKind, ConstValue, LoadStoreKind, ReduceOpKind, UnaryOpKind,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A binary operand: either a tensor or a constant scalar.
#[derive(Debug, Clone)]
pub enum OpInput {
    Tensor(Arc<TensorView>),
    Scalar(ConstValue),
}

impl OpInput {
    pub fn as_tensor(&self) -> Option<&Arc<TensorView>> {
        match self {
            OpInput::Tensor(tv) => Some(tv),
            OpInput::Scalar(_) => None,
        }
    }
}

impl From<Arc<TensorView>> for OpInput {
    fn from(tv: Arc<TensorView>) -> Self {
        OpInput::Tensor(tv)
    }
}

impl From<ConstValue> for OpInput {
    fn from(v: ConstValue) -> Self {
        OpInput::Scalar(v)
    }
}

/// One Welford channel: running average, variance sum, and count.
#[derive(Debug, Clone)]
pub struct WelfordTriplet {
    pub avg: Arc<TensorView>,
    pub var_sum: Arc<TensorView>,
    pub n: Arc<TensorView>,
}

impl WelfordTriplet {
    pub fn views(&self) -> [&Arc<TensorView>; 3] {
        [&self.avg, &self.var_sum, &self.n]
    }
}

#[derive(Debug)]
pub struct TensorOp {
    id: u64,
    pub kind: OpKind,
}

#[derive(Debug)]
pub enum OpKind {
    Unary {
        op: UnaryOpKind,
        input: Arc<TensorView>,
        output: Arc<TensorView>,
    },
    Binary {
        op: BinaryOpKind,
        lhs: OpInput,
        rhs: OpInput,
        output: Arc<TensorView>,
    },
    /// Random fill; every element must be generated exactly once.
    Rng {
        output: Arc<TensorView>,
    },
    /// Fill with a scalar.
    Full {
        value: ConstValue,
        output: Arc<TensorView>,
    },
    Reduction {
        op: ReduceOpKind,
        init: ConstValue,
        input: Arc<TensorView>,
        output: Arc<TensorView>,
    },
    /// Horizontally grouped reductions sharing one loop nest.
    GroupedReduction {
        ops: SmallVec<[ReduceOpKind; 2]>,
        inits: SmallVec<[ConstValue; 2]>,
        inputs: SmallVec<[Arc<TensorView>; 2]>,
        outputs: SmallVec<[Arc<TensorView>; 2]>,
    },
    Welford {
        input: Arc<TensorView>,
        /// Init values for (avg, var_sum, n).
        inits: [ConstValue; 3],
        output: WelfordTriplet,
    },
    GroupedWelford {
        inputs: SmallVec<[Arc<TensorView>; 2]>,
        inits: SmallVec<[[ConstValue; 3]; 2]>,
        outputs: SmallVec<[WelfordTriplet; 2]>,
    },
    Mma {
        a: Arc<TensorView>,
        b: Arc<TensorView>,
        init: ConstValue,
        output: Arc<TensorView>,
    },
    /// Insert broadcast axes; `flags[i]` is true where the output gained an
    /// axis the input does not have.
    Broadcast {
        input: Arc<TensorView>,
        output: Arc<TensorView>,
        flags: Vec<bool>,
    },
    /// Remove broadcast axes; `flags[i]` is true where the input axis is
    /// dropped.
    Squeeze {
        input: Arc<TensorView>,
        output: Arc<TensorView>,
        flags: Vec<bool>,
    },
    /// Materialize broadcast axes to concrete extents.
    Expand {
        input: Arc<TensorView>,
        output: Arc<TensorView>,
    },
    LoadStore {
        kind: LoadStoreKind,
        input: Arc<TensorView>,
        output: Arc<TensorView>,
    },
}

impl TensorOp {
    pub fn new(kind: OpKind) -> Arc<Self> {
        Arc::new(Self { id: NEXT_ID.fetch_add(1, Ordering::Relaxed), kind })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inputs(&self) -> SmallVec<[Arc<TensorView>; 2]> {
        match &self.kind {
            OpKind::Unary { input, .. }
            | OpKind::Reduction { input, .. }
            | OpKind::Welford { input, .. }
            | OpKind::Broadcast { input, .. }
            | OpKind::Squeeze { input, .. }
            | OpKind::Expand { input, .. }
            | OpKind::LoadStore { input, .. } => smallvec![input.clone()],
            OpKind::Binary { lhs, rhs, .. } => {
                let mut out = SmallVec::new();
                if let OpInput::Tensor(tv) = lhs {
                    out.push(tv.clone());
                }
                if let OpInput::Tensor(tv) = rhs {
                    out.push(tv.clone());
                }
                out
            }
            OpKind::Rng { .. } | OpKind::Full { .. } => SmallVec::new(),
            OpKind::GroupedReduction { inputs, .. }
            | OpKind::GroupedWelford { inputs, .. } => inputs.clone(),
            OpKind::Mma { a, b, .. } => smallvec![a.clone(), b.clone()],
        }
    }

    pub fn outputs(&self) -> SmallVec<[Arc<TensorView>; 2]> {
        match &self.kind {
            OpKind::Unary { output, .. }
            | OpKind::Binary { output, .. }
            | OpKind::Rng { output }
            | OpKind::Full { output, .. }
            | OpKind::Reduction { output, .. }
            | OpKind::Mma { output, .. }
            | OpKind::Broadcast { output, .. }
            | OpKind::Squeeze { output, .. }
            | OpKind::Expand { output, .. }
            | OpKind::LoadStore { output, .. } => smallvec![output.clone()],
            OpKind::GroupedReduction { outputs, .. } => outputs.clone(),
            OpKind::Welford { output, .. } => {
                output.views().iter().map(|tv| (*tv).clone()).collect()
            }
            OpKind::GroupedWelford { outputs, .. } => outputs
                .iter()
                .flat_map(|t| t.views().into_iter().cloned())
                .collect(),
        }
    }

    pub fn is_reduction_like(&self) -> bool {
        matches!(
            self.kind,
            OpKind::Reduction { .. }
                | OpKind::GroupedReduction { .. }
                | OpKind::Welford { .. }
                | OpKind::GroupedWelford { .. }
                | OpKind::Mma { .. }
        )
    }
}

impl fmt::Display for TensorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.kind {
            OpKind::Unary { .. } => "unary",
            OpKind::Binary { .. } => "binary",
            OpKind::Rng { .. } => "rng",
            OpKind::Full { .. } => "full",
            OpKind::Reduction { .. } => "reduction",
            OpKind::GroupedReduction { .. } => "grouped_reduction",
            OpKind::Welford { .. } => "welford",
            OpKind::GroupedWelford { .. } => "grouped_welford",
            OpKind::Mma { .. } => "mma",
            OpKind::Broadcast { .. } => "broadcast",
            OpKind::Squeeze { .. } => "squeeze",
            OpKind::Expand { .. } => "expand",
            OpKind::LoadStore { .. } => "load_store",
        };
        write!(f, "{name}#{}", self.id)
    }
}
