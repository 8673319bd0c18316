//! Vulkan backend for meshtrace.
//!
//! This crate drives a ray-query capable device through one render:
//! - device bootstrap ([`GpuContext`]) and one-shot command sequences
//! - buffer allocation, staged uploads, mapping and readback
//! - bottom- and top-level acceleration structure builds
//! - descriptor layouts, binding sets and compute dispatch
//!
//! All state checks live in `meshtrace-core`; this crate translates them
//! into device calls.

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
// Vulkan sizes are u64 but host slices are usize; the device limits both.
#![allow(clippy::cast_possible_truncation)]

pub mod accel;
pub mod binding;
pub mod buffer;
pub mod command;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod program;

pub use accel::{align_up, AccelerationStructureBuilder, BlasAddress};
pub use binding::{BindingLayer, BindingLayout, BindingSet};
pub use buffer::{BufferManager, MappedBuffer};
pub use command::{CommandExecutor, OneShot};
pub use context::GpuContext;
pub use dispatch::{dispatch, insert_write_to_host_barrier};
pub use error::{RenderError, RenderResult};
pub use program::{ComputeProgram, PushConstants, RAYTRACE_SPV};
