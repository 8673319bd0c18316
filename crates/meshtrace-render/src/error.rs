//! Rendering error types.

use ash::vk;
use meshtrace_core::{CoreError, SequenceId};
use thiserror::Error;

/// Errors that can occur while driving the device.
#[derive(Error, Debug)]
pub enum RenderError {
    /// The Vulkan loader could not be found or loaded.
    #[error("Vulkan loader unavailable: {0}")]
    LoaderUnavailable(String),

    /// No physical device supports hardware ray queries.
    #[error("no device supports ray queries: {0}")]
    NoSuitableDevice(String),

    /// A Vulkan call failed.
    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },

    /// Device or host memory was exhausted.
    #[error("{op} ran out of memory allocating {size} bytes for {usage}")]
    OutOfMemory {
        op: &'static str,
        size: u64,
        usage: String,
    },

    /// No memory type satisfies the requested properties.
    #[error("no memory type for {usage} with {properties:?}")]
    NoSuitableMemoryType {
        usage: String,
        properties: vk::MemoryPropertyFlags,
    },

    /// The compute program could not be loaded.
    #[error("invalid shader: {0}")]
    InvalidShader(String),

    /// A sequence was handed to an executor that did not begin it.
    #[error("sequence {0} was begun by another executor")]
    ForeignSequence(SequenceId),

    /// Some output words still hold the poison value after readback.
    #[error("{count} output values were not written by the dispatch")]
    OutputNotOverwritten { count: usize },

    /// A precondition was violated.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A specialized Result type for rendering operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// Attaches the failing operation to a raw Vulkan result.
pub(crate) trait VkResultExt<T> {
    fn op(self, op: &'static str) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn op(self, op: &'static str) -> RenderResult<T> {
        self.map_err(|result| RenderError::Vulkan { op, result })
    }
}

/// Maps allocation failures to [`RenderError::OutOfMemory`].
pub(crate) fn allocation_error(
    op: &'static str,
    size: u64,
    usage: impl std::fmt::Debug,
    result: vk::Result,
) -> RenderError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            RenderError::OutOfMemory {
                op,
                size,
                usage: format!("{usage:?}"),
            }
        }
        result => RenderError::Vulkan { op, result },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_error_classification() {
        let oom = allocation_error(
            "vkAllocateMemory",
            64,
            "storage",
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        );
        assert!(matches!(oom, RenderError::OutOfMemory { size: 64, .. }));

        let other = allocation_error("vkAllocateMemory", 64, "storage", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(
            other,
            RenderError::Vulkan {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            }
        ));
    }

    #[test]
    fn test_vulkan_error_names_operation() {
        let err: RenderResult<()> = Err(vk::Result::ERROR_INITIALIZATION_FAILED).op("vkCreateDevice");
        let message = err.unwrap_err().to_string();
        assert!(message.starts_with("vkCreateDevice failed"));
    }
}
