//! Fundamental enums and small value types shared across the IR.

use std::fmt;

/// What an iteration domain ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum IterKind {
    /// A regular data-parallel axis.
    Iteration,
    /// An axis reduced away by the expression producing the tensor.
    Reduction,
    /// A size-1 axis that may be expanded against other tensors.
    Broadcast,
    /// An axis driven by gather/scatter index tensors.
    GatherScatter,
    /// An axis materialized only for stride bookkeeping.
    Stride,
}

/// Hardware (or mesh) binding of an iteration domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum ParallelType {
    Serial,
    DIDx,
    DIDy,
    DIDz,
    BIDx,
    BIDy,
    BIDz,
    TIDx,
    TIDy,
    TIDz,
    Vectorize,
    Unroll,
    Unswitch,
    Mma,
    Group,
}

impl ParallelType {
    /// Device-mesh parallel types, in the order sharding analyses visit them.
    pub const DEVICE: [ParallelType; 3] =
        [ParallelType::DIDx, ParallelType::DIDy, ParallelType::DIDz];

    /// Block-scoped thread dimensions.
    pub const THREAD: [ParallelType; 3] =
        [ParallelType::TIDx, ParallelType::TIDy, ParallelType::TIDz];

    pub fn is_device_dim(self) -> bool {
        matches!(self, ParallelType::DIDx | ParallelType::DIDy | ParallelType::DIDz)
    }

    pub fn is_block_dim(self) -> bool {
        matches!(self, ParallelType::BIDx | ParallelType::BIDy | ParallelType::BIDz)
    }

    pub fn is_thread_dim(self) -> bool {
        matches!(self, ParallelType::TIDx | ParallelType::TIDy | ParallelType::TIDz)
    }

    /// Anything that binds the axis to launch geometry (blocks or threads).
    pub fn is_parallel_dim(self) -> bool {
        self.is_block_dim() || self.is_thread_dim()
    }
}

/// Element-wise swizzle applied to a pair of domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SwizzleKind {
    NoSwizzle,
    Xor,
    CyclicShift,
}

/// Two-dimensional tile swizzle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Swizzle2DKind {
    NoSwizzle,
    ZShape,
    Xor,
    CyclicShift,
}

/// Where a tensor's backing storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MemoryType {
    Global,
    Shared,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    BFloat16,
}

impl DType {
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Int32 | DType::Int64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOpKind {
    Neg,
    Abs,
    Cast,
    Exp,
    Log,
    Sqrt,
    Reciprocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rem,
    CeilDiv,
    Max,
    Min,
}

impl BinaryOpKind {
    /// Division-like ops trap on garbage integer inputs, so their consumers
    /// cannot run unpredicated over out-of-bounds elements.
    pub fn is_division_like(self) -> bool {
        matches!(
            self,
            BinaryOpKind::Div | BinaryOpKind::Mod | BinaryOpKind::Rem | BinaryOpKind::CeilDiv
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOpKind {
    Add,
    Mul,
    Max,
    Min,
}

/// Specialized lowering of a `Set`-like data movement op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStoreKind {
    Set,
    LdMatrix,
    TmaLoad,
}

impl LoadStoreKind {
    /// Warp-collective loads cannot tolerate a surviving inline predicate.
    pub fn is_warp_collective(self) -> bool {
        matches!(self, LoadStoreKind::LdMatrix | LoadStoreKind::TmaLoad)
    }
}

/// A compile-time constant scalar, used for reduction init values and scalar
/// operands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ConstValue {
    pub fn is_zero(&self) -> bool {
        match self {
            ConstValue::Bool(b) => !*b,
            ConstValue::Int(i) => *i == 0,
            ConstValue::Float(f) => *f == 0.0,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::Int(i) => write!(f, "{i}"),
            ConstValue::Float(x) => write!(f, "{x}"),
        }
    }
}

/// The set of devices a tensor is laid out over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceMesh {
    devices: Vec<i64>,
}

impl DeviceMesh {
    pub fn new(devices: Vec<i64>) -> Self {
        Self { devices }
    }

    /// Mesh of `n` consecutive devices starting at 0.
    pub fn linear(n: i64) -> Self {
        Self { devices: (0..n).collect() }
    }

    pub fn size(&self) -> i64 {
        self.devices.len() as i64
    }

    pub fn devices(&self) -> &[i64] {
        &self.devices
    }
}
