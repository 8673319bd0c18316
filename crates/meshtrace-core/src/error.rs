//! Error types for meshtrace.

use thiserror::Error;

/// Precondition and state errors detected before any GPU work is issued.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The mesh has no vertices or no triangles.
    #[error("mesh is empty ({vertices} vertices, {indices} indices)")]
    EmptyMesh { vertices: usize, indices: usize },

    /// The index count is not a multiple of three.
    #[error("index count {0} is not a multiple of 3")]
    IndexCountNotTriangles(usize),

    /// An index references a vertex that does not exist.
    #[error("index {index} at position {position} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        position: usize,
        index: u32,
        vertex_count: usize,
    },

    /// The mesh contains zero-area triangles and the policy rejects them.
    #[error("mesh contains {count} degenerate triangles (first at triangle {first})")]
    DegenerateTriangles { count: usize, first: usize },

    /// A geometry descriptor is malformed.
    #[error("invalid geometry {geometry}: {reason}")]
    InvalidGeometry { geometry: usize, reason: String },

    /// A handle was used after it was destroyed, or never existed.
    #[error("stale {kind} handle {index}:{generation}")]
    StaleHandle {
        kind: &'static str,
        index: u32,
        generation: u32,
    },

    /// A resource cannot be destroyed because other live objects depend on it.
    #[error("{kind} {index} is still referenced by {dependents} live object(s)")]
    InUse {
        kind: &'static str,
        index: u32,
        dependents: u32,
    },

    /// An instance references a bottom-level structure that does not exist.
    #[error("instance {instance} references BLAS {blas}, but only {blas_count} exist")]
    BlasIndexOutOfRange {
        instance: usize,
        blas: u32,
        blas_count: usize,
    },

    /// A top-level build references a bottom-level structure that is not built.
    #[error("instance {instance} references BLAS {blas} which is {state}")]
    BlasNotBuilt {
        instance: usize,
        blas: u32,
        state: &'static str,
    },

    /// A structure was asked to move to a state it cannot reach.
    #[error("acceleration structure cannot go from {from} to {to}")]
    InvalidBuildTransition {
        from: &'static str,
        to: &'static str,
    },

    /// An instance field does not fit into its packed bit width.
    #[error("instance {instance}: {field} value {value:#x} does not fit in 24 bits")]
    InstanceFieldOverflow {
        instance: usize,
        field: &'static str,
        value: u32,
    },

    /// A top-level build was requested with no instances.
    #[error("top-level build requires at least one instance")]
    NoInstances,

    /// A buffer is not in the state an operation requires.
    #[error("buffer {index} is {state}, expected {expected}")]
    BufferNotReady {
        index: u32,
        state: &'static str,
        expected: &'static str,
    },

    /// A buffer lacks a usage capability required by an operation.
    #[error("buffer {index} lacks usage {missing}")]
    MissingUsage { index: u32, missing: String },

    /// The requested usage/visibility combination is not allowed.
    #[error("unsupported buffer request: {0}")]
    UnsupportedCombination(String),

    /// Host access was requested on a buffer that is not host-visible.
    #[error("buffer {0} is not host-visible")]
    NotHostVisible(u32),

    /// Host access was requested before the device writes were made visible.
    #[error("buffer {index} read before its write-to-host barrier completed ({state})")]
    ReadBeforeBarrier { index: u32, state: &'static str },

    /// A barrier was recorded for a buffer with no pending device write.
    #[error("buffer {index} has no device write pending in sequence {sequence}")]
    NoPendingWrite { index: u32, sequence: u64 },

    /// Host access was requested while the buffer is already mapped.
    #[error("buffer {0} is already mapped")]
    AlreadyMapped(u32),

    /// A second command sequence was started while one is outstanding.
    #[error("command sequence {outstanding} is still outstanding")]
    SequenceOutstanding { outstanding: u64 },

    /// A sequence id was completed out of order or twice.
    #[error("sequence {0} is not the outstanding sequence")]
    UnknownSequence(u64),

    /// Staging memory from a previous sequence was not released.
    #[error("staging memory from sequence {held} must be finalized before uploading in sequence {requested}")]
    StagingNotReleased { held: u64, requested: u64 },

    /// Staging memory was released while its sequence is still in flight.
    #[error("staging memory from sequence {0} is still in flight")]
    StagingInFlight(u64),

    /// A binding layout declaration is malformed.
    #[error("invalid binding layout: {0}")]
    InvalidLayout(String),

    /// A slot was bound that the layout does not declare.
    #[error("slot {0} is not declared in the binding layout")]
    UnknownSlot(u32),

    /// A resource of the wrong kind was bound to a slot.
    #[error("slot {slot} expects {expected}, got {actual}")]
    SlotKindMismatch {
        slot: u32,
        expected: &'static str,
        actual: &'static str,
    },

    /// A declared slot has no resource bound.
    #[error("slot {0} is declared but not bound")]
    SlotUnbound(u32),

    /// A binding set was modified after its first use.
    #[error("slot {0} cannot be rebound after the binding set was used")]
    RebindAfterUse(u32),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A specialized Result type for meshtrace core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
