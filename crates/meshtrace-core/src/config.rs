//! Render and device configuration.

use std::path::{Path, PathBuf};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::accel::BuildFlags;
use crate::dispatch::TileSize;
use crate::error::{CoreError, Result};
use crate::mesh::Mesh;

/// Configuration of one offscreen render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Image width in pixels.
    pub width: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Workgroup footprint. Must match the compute program.
    pub tile: TileSize,

    /// Pinhole camera.
    pub camera: CameraConfig,

    /// Colour written where no triangle is hit.
    pub background: Vec3,

    /// How hits are coloured.
    pub shading: ShadingMode,

    /// Build preference for both acceleration structure levels.
    pub build_flags: BuildFlags,

    /// What to do with zero-area triangles.
    pub degenerate_policy: DegeneratePolicy,

    /// Fill the output with NaN before dispatch and verify every word was written.
    pub poison_output: bool,

    /// SPIR-V file to use instead of the built-in program.
    pub shader_path: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            tile: TileSize::SHADER,
            camera: CameraConfig::default(),
            background: Vec3::ZERO,
            shading: ShadingMode::Barycentric,
            build_flags: BuildFlags::PreferFastTrace,
            degenerate_policy: DegeneratePolicy::Warn,
            poison_output: cfg!(debug_assertions),
            shader_path: None,
        }
    }
}

impl RenderConfig {
    /// Loads a configuration from JSON; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot render.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "image size {}x{} has a zero dimension",
                self.width, self.height
            )));
        }
        if self.tile != TileSize::SHADER {
            return Err(CoreError::InvalidConfig(format!(
                "tile {}x{} does not match the compute program's {}x{} workgroup",
                self.tile.width,
                self.tile.height,
                TileSize::SHADER.width,
                TileSize::SHADER.height
            )));
        }
        if !self.camera.vertical_slope.is_finite() || self.camera.vertical_slope <= 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "camera vertical slope {} must be positive",
                self.camera.vertical_slope
            )));
        }
        Ok(())
    }

    /// Number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of the RGB f32 output buffer in bytes.
    pub fn output_size(&self) -> u64 {
        self.pixel_count() as u64 * 3 * std::mem::size_of::<f32>() as u64
    }
}

/// Pinhole camera looking down -Z.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Eye position.
    pub origin: Vec3,
    /// Half the vertical extent of the image plane at unit distance.
    pub vertical_slope: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            origin: Vec3::new(-0.001, 1.0, 6.0),
            vertical_slope: 0.2,
        }
    }
}

impl CameraConfig {
    /// Direction of the ray through the centre of pixel `(x, y)`.
    ///
    /// Not normalized; the z component is always -1.
    #[allow(clippy::cast_precision_loss)]
    pub fn ray_direction(&self, x: u32, y: u32, width: u32, height: u32) -> Vec3 {
        let (w, h) = (width as f32, height as f32);
        let u = (2.0 * x as f32 + 1.0 - w) / h;
        let v = -(2.0 * y as f32 + 1.0 - h) / h;
        Vec3::new(self.vertical_slope * u, self.vertical_slope * v, -1.0)
    }
}

/// Hit colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShadingMode {
    /// `(1 - u - v, u, v)` of the committed hit.
    #[default]
    Barycentric,
    /// Geometric normal remapped to `[0, 1]`.
    GeometricNormal,
}

impl ShadingMode {
    /// Value passed to the compute program.
    pub fn shader_value(self) -> u32 {
        match self {
            ShadingMode::Barycentric => 0,
            ShadingMode::GeometricNormal => 1,
        }
    }
}

/// Handling of zero-area triangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DegeneratePolicy {
    /// Log a warning and build anyway.
    #[default]
    Warn,
    /// Refuse to build.
    Reject,
}

impl DegeneratePolicy {
    /// Applies the policy to `mesh`, returning the number of degenerate triangles.
    pub fn apply(self, mesh: &Mesh) -> Result<usize> {
        let degenerate = mesh.degenerate_triangles();
        let Some(&first) = degenerate.first() else {
            return Ok(0);
        };
        match self {
            DegeneratePolicy::Warn => {
                log::warn!(
                    "mesh has {} degenerate triangle(s) (first: {first}); building anyway",
                    degenerate.len()
                );
                Ok(degenerate.len())
            }
            DegeneratePolicy::Reject => Err(CoreError::DegenerateTriangles {
                count: degenerate.len(),
                first,
            }),
        }
    }
}

/// Device bootstrap options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Reported to the driver.
    pub application_name: String,
    /// Enable the Khronos validation layer if it is installed.
    pub validation: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: "meshtrace".to_string(),
            validation: cfg!(debug_assertions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RenderConfig::default();
        assert_eq!((config.width, config.height), (800, 600));
        assert_eq!(config.tile, TileSize { width: 16, height: 8 });
        assert_eq!(config.camera.origin, Vec3::new(-0.001, 1.0, 6.0));
        assert_eq!(config.output_size(), 800 * 600 * 12);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: RenderConfig =
            serde_json::from_str(r#"{ "width": 64, "shading": "GeometricNormal" }"#).unwrap();
        assert_eq!(config.width, 64);
        assert_eq!(config.height, 600);
        assert_eq!(config.shading, ShadingMode::GeometricNormal);
        assert_eq!(config.camera, CameraConfig::default());
    }

    #[test]
    fn test_json_round_trip() {
        let config = RenderConfig {
            background: Vec3::new(0.1, 0.2, 0.3),
            degenerate_policy: DegeneratePolicy::Reject,
            ..RenderConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: RenderConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validate_rejects() {
        let zero = RenderConfig {
            width: 0,
            ..RenderConfig::default()
        };
        assert!(matches!(zero.validate(), Err(CoreError::InvalidConfig(_))));

        let tile = RenderConfig {
            tile: TileSize { width: 8, height: 8 },
            ..RenderConfig::default()
        };
        assert!(tile.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "width": 32, "height": 16 }}"#).unwrap();
        let config = RenderConfig::from_json_file(file.path()).unwrap();
        assert_eq!((config.width, config.height), (32, 16));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{ "height": 0 }}"#).unwrap();
        assert!(RenderConfig::from_json_file(bad.path()).is_err());
    }

    #[test]
    fn test_center_ray_points_down_negative_z() {
        let camera = CameraConfig::default();
        let d = camera.ray_direction(400, 300, 800, 600);
        assert_eq!(d.z, -1.0);
        assert!(d.x.abs() < 1e-3 && d.y.abs() < 1e-3);
        // Left column looks left, top row looks up.
        assert!(camera.ray_direction(0, 0, 800, 600).x < 0.0);
        assert!(camera.ray_direction(0, 0, 800, 600).y > 0.0);
    }

    #[test]
    fn test_degenerate_policy() {
        let mesh = Mesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(2.0, 0.0, 0.0)],
            vec![0, 1, 2, 0, 1, 3],
        )
        .unwrap();
        assert_eq!(DegeneratePolicy::Warn.apply(&mesh).unwrap(), 1);
        assert!(matches!(
            DegeneratePolicy::Reject.apply(&mesh),
            Err(CoreError::DegenerateTriangles { count: 1, first: 1 })
        ));
    }
}
