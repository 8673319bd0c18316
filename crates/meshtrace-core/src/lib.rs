//! Core model for meshtrace.
//!
//! This crate holds everything about the ray tracing pipeline that does not
//! need a device:
//! - [`Mesh`] validation and the CPU [`ReferenceTracer`]
//! - generational [`HandleTable`]s and the [`SequenceTracker`]
//! - buffer residency / host-visibility state machines and the [`StagingLedger`]
//! - acceleration structure build states and the packed [`InstanceRecord`]
//! - binding layout declaration and [`BindingSetState`] validation
//! - [`DispatchGrid`] math and [`RenderConfig`]

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
// Accessors return plain values which don't need must_use
#![allow(clippy::must_use_candidate)]
// Vulkan-shaped descriptors carry their own prefixes
#![allow(clippy::struct_field_names)]
#![allow(clippy::module_name_repetitions)]

pub mod accel;
pub mod binding;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod mesh;
pub mod reference;
pub mod sequence;

pub use accel::{
    validate_geometries, validate_geometry_sizes, validate_instances, BlasIndex, BuildFlags,
    BuildState, InstanceDesc, InstanceFlags, InstanceRecord, TriangleGeometry, INDEX_SIZE,
    TRANSFORM_SIZE, VERTEX_SIZE,
};
pub use binding::{
    BindingSetState, BoundResource, LayoutDecl, ResourceKind, ShaderStages, SlotDecl,
    INDEX_SLOT, OUTPUT_SLOT, TLAS_SLOT, VERTEX_SLOT,
};
pub use buffer::{
    BufferDesc, BufferRecord, BufferUsage, HostAccess, MemoryVisibility, Residency, StagingLedger,
};
pub use config::{CameraConfig, ContextConfig, DegeneratePolicy, RenderConfig, ShadingMode};
pub use dispatch::{DispatchGrid, TileSize};
pub use error::{CoreError, Result};
pub use handle::{BufferId, BufferKind, Handle, HandleKind, HandleTable, TlasId, TlasKind};
pub use mesh::Mesh;
pub use reference::{Hit, ReferenceTracer};
pub use sequence::{SequenceId, SequenceTracker};

// Re-export glam types for convenience
pub use glam::{Affine3A, Vec3};
