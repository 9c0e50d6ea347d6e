use snafu::Snafu;

use crate::types::ParallelType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy shared by the IR and the lowering analyses.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Dependency traversal could not reach every requested target.
    #[snafu(display("traversal failure: could not reach {unreached:?} from the given inputs"))]
    TraversalFailure { unreached: Vec<String> },

    /// An iteration domain is consumed by more than one transformation in a
    /// single domain's history.
    #[snafu(display("double mapping: {id} is used by more than one transformation"))]
    DoubleMapping { id: String },

    /// A transformation history defines the same iteration domain twice.
    #[snafu(display("multiple definitions of iteration domain {id}"))]
    MultipleDefinitions { id: String },

    /// The analysis cannot handle this transformation arrangement.
    #[snafu(display("unsupported transformation: {reason}"))]
    UnsupportedTransform { reason: String },

    /// Replay could not map a required input of a transformation.
    #[snafu(display("replay failure: {reason}"))]
    ReplayFailed { reason: String },

    /// Two expressions writing the same buffer disagree on its initial value.
    #[snafu(display(
        "inconsistent initialization of {tv}: previously {prior}, now {new_value}"
    ))]
    InconsistentInitialization { tv: String, prior: String, new_value: String },

    /// A device-parallel loop axis cannot be attributed to a single logical
    /// axis.
    #[snafu(display("ambiguous sharding attribution for {tv} on {parallel}: {reason}"))]
    AmbiguousShardingAttribution { tv: String, parallel: ParallelType, reason: String },

    /// A lowering context was entered while another one was live on the same
    /// thread.
    #[snafu(display("a lowering context is already active on this thread"))]
    NestedLoweringContext,

    /// Axis index out of range for a tensor domain operation.
    #[snafu(display("axis {axis} out of bounds: domain has {ndims} dimensions"))]
    AxisOutOfBounds { axis: usize, ndims: usize },

    /// Contiguity flags must align one-to-one with the allocation domain.
    #[snafu(display("contiguity length mismatch: {found} flags for {expected} domains"))]
    ContiguityLengthMismatch { expected: usize, found: usize },

    /// Broadcast domains carry no contiguity information.
    #[snafu(display("contiguity flag set on broadcast axis {axis}"))]
    ContiguityOnBroadcast { axis: usize },
}
