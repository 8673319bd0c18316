//! Workgroup grid math for the per-pixel dispatch.

use serde::{Deserialize, Serialize};

/// Workgroup footprint in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileSize {
    pub width: u32,
    pub height: u32,
}

impl TileSize {
    /// The footprint the built-in shader is compiled with.
    pub const SHADER: TileSize = TileSize {
        width: 16,
        height: 8,
    };
}

impl Default for TileSize {
    fn default() -> Self {
        Self::SHADER
    }
}

/// Number of workgroups launched along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchGrid {
    pub groups_x: u32,
    pub groups_y: u32,
    pub tile: TileSize,
}

impl DispatchGrid {
    /// The smallest grid covering a `width` x `height` image.
    ///
    /// Invocations past the image edge must be discarded by the shader.
    pub fn covering(width: u32, height: u32, tile: TileSize) -> Self {
        Self {
            groups_x: width.div_ceil(tile.width),
            groups_y: height.div_ceil(tile.height),
            tile,
        }
    }

    /// Total invocations launched, including discarded edge invocations.
    pub fn invocation_count(&self) -> u64 {
        u64::from(self.groups_x)
            * u64::from(self.tile.width)
            * u64::from(self.groups_y)
            * u64::from(self.tile.height)
    }

    /// The pixel an invocation shades, or `None` if it falls outside the image.
    pub fn pixel_for_invocation(
        &self,
        group: (u32, u32),
        local: (u32, u32),
        width: u32,
        height: u32,
    ) -> Option<(u32, u32)> {
        let x = group.0 * self.tile.width + local.0;
        let y = group.1 * self.tile.height + local.1;
        (x < width && y < height).then_some((x, y))
    }
}

impl std::fmt::Display for DispatchGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} groups of {}x{}",
            self.groups_x, self.groups_y, self.tile.width, self.tile.height
        )
    }
}
