//! Error type for the meshtrace facade.

use std::path::PathBuf;

use meshtrace_core::CoreError;
use meshtrace_render::RenderError;
use thiserror::Error;

/// Anything that can stop a render from a mesh file to an image file.
#[derive(Error, Debug)]
pub enum MeshtraceError {
    /// Device, driver or pipeline state failure.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Precondition violation detected on the host.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The mesh file could not be parsed.
    #[error("failed to load {path}: {source}")]
    ObjLoad {
        path: PathBuf,
        #[source]
        source: tobj::LoadError,
    },

    /// Image encoding failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// The output path has an extension no encoder is available for.
    #[error("unsupported output format '{0}' (expected .hdr or .exr)")]
    UnsupportedFormat(String),

    /// Radiance data does not match the stated image size.
    #[error("radiance buffer holds {actual} floats, {width}x{height} RGB needs {expected}")]
    ImageSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for meshtrace operations.
pub type Result<T> = std::result::Result<T, MeshtraceError>;

impl MeshtraceError {
    /// Whether the failure means no usable ray tracing device exists, as
    /// opposed to a failure while using one.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(
            self,
            MeshtraceError::Render(
                RenderError::LoaderUnavailable(_) | RenderError::NoSuitableDevice(_)
            )
        )
    }
}
