//! Acceleration structure descriptions, build states and packed instances.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Affine3A;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::handle::BufferId;
use crate::mesh::Mesh;
use crate::sequence::SequenceId;

/// Largest value representable in the 24-bit instance fields.
pub const INSTANCE_FIELD_MAX: u32 = (1 << 24) - 1;

/// Size in bytes of one vertex in the only supported format (`R32G32B32_SFLOAT`).
pub const VERTEX_SIZE: u64 = 12;

/// Size in bytes of one `u32` index.
pub const INDEX_SIZE: u64 = 4;

/// Size in bytes of a 3x4 row-major `f32` transform.
pub const TRANSFORM_SIZE: u64 = 48;

/// Build preference for an acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildFlags {
    /// Spend build time for faster traversal.
    #[default]
    PreferFastTrace,
    /// Build quickly at the cost of traversal speed.
    PreferFastBuild,
}

bitflags! {
    /// Per-instance traversal flags, bit-compatible with the Vulkan values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 0x1;
        const TRIANGLE_FLIP_FACING = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NO_OPAQUE = 0x8;
    }
}

/// Index of a bottom-level structure within its builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlasIndex(pub u32);

/// Lifecycle of one acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Created, nothing recorded yet.
    Unbuilt,
    /// Build recorded in this sequence.
    Building(SequenceId),
    /// Build executed; the structure is immutable.
    Built,
    /// Released.
    Destroyed,
}

impl BuildState {
    /// Short state name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            BuildState::Unbuilt => "unbuilt",
            BuildState::Building(_) => "building",
            BuildState::Built => "built",
            BuildState::Destroyed => "destroyed",
        }
    }

    /// `Unbuilt -> Building(seq)`.
    pub fn begin(&mut self, seq: SequenceId) -> Result<()> {
        match *self {
            BuildState::Unbuilt => {
                *self = BuildState::Building(seq);
                Ok(())
            }
            other => Err(CoreError::InvalidBuildTransition {
                from: other.name(),
                to: "building",
            }),
        }
    }

    /// `Building -> Built`.
    pub fn finish(&mut self) -> Result<()> {
        match *self {
            BuildState::Building(_) => {
                *self = BuildState::Built;
                Ok(())
            }
            other => Err(CoreError::InvalidBuildTransition {
                from: other.name(),
                to: "built",
            }),
        }
    }

    /// Any state except `Destroyed` may be released.
    pub fn destroy(&mut self) -> Result<()> {
        if *self == BuildState::Destroyed {
            return Err(CoreError::InvalidBuildTransition {
                from: "destroyed",
                to: "destroyed",
            });
        }
        *self = BuildState::Destroyed;
        Ok(())
    }

    /// Whether the structure can be traced against or referenced.
    pub fn is_built(self) -> bool {
        self == BuildState::Built
    }
}

/// A triangle geometry of a bottom-level structure.
///
/// Vertices are tightly or loosely packed `R32G32B32_SFLOAT`; indices are
/// `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    /// Optional buffer holding one 3x4 row-major transform.
    pub transform_buffer: Option<BufferId>,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub index_count: u32,
    pub opaque: bool,
}

impl TriangleGeometry {
    /// Describes an opaque mesh uploaded into `vertex_buffer` / `index_buffer`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_mesh(mesh: &Mesh, vertex_buffer: BufferId, index_buffer: BufferId) -> Self {
        Self {
            vertex_buffer,
            index_buffer,
            transform_buffer: None,
            vertex_count: mesh.vertex_count() as u32,
            vertex_stride: VERTEX_SIZE,
            index_count: mesh.index_count() as u32,
            opaque: true,
        }
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    /// Highest vertex index the build may touch.
    pub fn max_vertex(&self) -> u32 {
        self.vertex_count.saturating_sub(1)
    }

    fn validate(&self, geometry: usize) -> Result<()> {
        let invalid = |reason: String| CoreError::InvalidGeometry { geometry, reason };
        if self.vertex_count == 0 {
            return Err(invalid("vertex count is zero".into()));
        }
        if self.index_count == 0 {
            return Err(invalid("index count is zero".into()));
        }
        if self.index_count % 3 != 0 {
            return Err(invalid(format!(
                "index count {} is not a multiple of 3",
                self.index_count
            )));
        }
        if self.vertex_stride < VERTEX_SIZE || self.vertex_stride % 4 != 0 {
            return Err(invalid(format!(
                "vertex stride {} is not a 4-byte multiple of at least {VERTEX_SIZE}",
                self.vertex_stride
            )));
        }
        Ok(())
    }

    /// Bytes of the vertex buffer the build reads.
    pub fn vertex_span(&self) -> u64 {
        u64::from(self.max_vertex()) * self.vertex_stride + VERTEX_SIZE
    }

    /// Bytes of the index buffer the build reads.
    pub fn index_span(&self) -> u64 {
        u64::from(self.index_count) * INDEX_SIZE
    }

    /// Checks the declared counts against the sizes of the buffers they
    /// read from.
    pub fn check_buffer_sizes(
        &self,
        geometry: usize,
        vertex_size: u64,
        index_size: u64,
        transform_size: Option<u64>,
    ) -> Result<()> {
        let too_small = |what: &str, needed: u64, size: u64| CoreError::InvalidGeometry {
            geometry,
            reason: format!("{what} buffer holds {size} bytes, the geometry reads {needed}"),
        };
        if self.vertex_span() > vertex_size {
            return Err(too_small("vertex", self.vertex_span(), vertex_size));
        }
        if self.index_span() > index_size {
            return Err(too_small("index", self.index_span(), index_size));
        }
        match (self.transform_buffer, transform_size) {
            (Some(_), Some(size)) if size < TRANSFORM_SIZE => {
                Err(too_small("transform", TRANSFORM_SIZE, size))
            }
            (Some(_), None) => Err(CoreError::InvalidGeometry {
                geometry,
                reason: "transform buffer size unknown".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Checks every geometry's counts against the sizes `size_of` reports for
/// its buffers.
pub fn validate_geometry_sizes<E: From<CoreError>>(
    geometries: &[TriangleGeometry],
    mut size_of: impl FnMut(BufferId) -> std::result::Result<u64, E>,
) -> std::result::Result<(), E> {
    for (i, g) in geometries.iter().enumerate() {
        let vertex_size = size_of(g.vertex_buffer)?;
        let index_size = size_of(g.index_buffer)?;
        let transform_size = g.transform_buffer.map(&mut size_of).transpose()?;
        g.check_buffer_sizes(i, vertex_size, index_size, transform_size)?;
    }
    Ok(())
}

/// Checks a bottom-level build request before any device work.
pub fn validate_geometries(geometries: &[TriangleGeometry]) -> Result<()> {
    if geometries.is_empty() {
        return Err(CoreError::InvalidGeometry {
            geometry: 0,
            reason: "a bottom-level build needs at least one geometry".into(),
        });
    }
    geometries
        .iter()
        .enumerate()
        .try_for_each(|(i, g)| g.validate(i))
}

/// One placement of a bottom-level structure in a top-level structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceDesc {
    pub blas: BlasIndex,
    pub transform: Affine3A,
    /// 24-bit value visible to shaders.
    pub custom_index: u32,
    /// Visibility mask tested against the ray's cull mask.
    pub mask: u8,
    /// 24-bit shader binding table record offset.
    pub sbt_offset: u32,
    pub flags: InstanceFlags,
}

impl InstanceDesc {
    /// An identity-placed, fully visible, double-sided instance.
    pub fn new(blas: BlasIndex) -> Self {
        Self {
            blas,
            transform: Affine3A::IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            sbt_offset: 0,
            flags: InstanceFlags::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    /// Replaces the transform.
    #[must_use]
    pub fn with_transform(mut self, transform: Affine3A) -> Self {
        self.transform = transform;
        self
    }

    /// Replaces the custom index.
    #[must_use]
    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    /// Replaces the visibility mask.
    #[must_use]
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }
}

/// Checks a top-level build request against the builder's bottom-level states.
///
/// `blas_states[i]` is the state of `BlasIndex(i)`.
pub fn validate_instances(instances: &[InstanceDesc], blas_states: &[BuildState]) -> Result<()> {
    if instances.is_empty() {
        return Err(CoreError::NoInstances);
    }
    for (instance, desc) in instances.iter().enumerate() {
        let state = blas_states.get(desc.blas.0 as usize).ok_or(
            CoreError::BlasIndexOutOfRange {
                instance,
                blas: desc.blas.0,
                blas_count: blas_states.len(),
            },
        )?;
        if !state.is_built() {
            return Err(CoreError::BlasNotBuilt {
                instance,
                blas: desc.blas.0,
                state: state.name(),
            });
        }
        check_field(instance, "custom index", desc.custom_index)?;
        check_field(instance, "SBT record offset", desc.sbt_offset)?;
    }
    Ok(())
}

fn check_field(instance: usize, field: &'static str, value: u32) -> Result<()> {
    if value > INSTANCE_FIELD_MAX {
        return Err(CoreError::InstanceFieldOverflow {
            instance,
            field,
            value,
        });
    }
    Ok(())
}

/// Device layout of one instance (`VkAccelerationStructureInstanceKHR`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, mask in the high 8.
    pub custom_index_and_mask: u32,
    /// SBT record offset in the low 24 bits, flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced bottom-level structure.
    pub blas_reference: u64,
}

impl InstanceRecord {
    /// Packs an instance, rejecting fields that do not fit.
    pub fn pack(instance: usize, desc: &InstanceDesc, blas_reference: u64) -> Result<Self> {
        check_field(instance, "custom index", desc.custom_index)?;
        check_field(instance, "SBT record offset", desc.sbt_offset)?;
        Ok(Self {
            transform: row_major_3x4(&desc.transform),
            custom_index_and_mask: desc.custom_index | (u32::from(desc.mask) << 24),
            sbt_offset_and_flags: desc.sbt_offset | (u32::from(desc.flags.bits()) << 24),
            blas_reference,
        })
    }

    /// The 24-bit custom index.
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & INSTANCE_FIELD_MAX
    }

    /// The 8-bit visibility mask.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    /// The 24-bit SBT record offset.
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & INSTANCE_FIELD_MAX
    }

    /// The instance flags.
    #[allow(clippy::cast_possible_truncation)]
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_retain((self.sbt_offset_and_flags >> 24) as u8)
    }
}

/// Flattens an affine transform into three rows of `[x, y, z, translation]`.
pub fn row_major_3x4(transform: &Affine3A) -> [f32; 12] {
    let m = transform.matrix3;
    let t = transform.translation;
    [
        m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x, //
        m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y, //
        m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTable;
    use glam::Vec3;

    fn geometry() -> TriangleGeometry {
        let mut buffers: HandleTable<crate::handle::BufferKind, ()> = HandleTable::new();
        let vb = buffers.insert(());
        let ib = buffers.insert(());
        let mesh = Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2]).unwrap();
        TriangleGeometry::from_mesh(&mesh, vb, ib)
    }

    #[test]
    fn test_instance_record_layout() {
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
        assert_eq!(std::mem::align_of::<InstanceRecord>(), 8);
    }

    #[test]
    fn test_pack_identity_instance() {
        let desc = InstanceDesc::new(BlasIndex(0));
        let record = InstanceRecord::pack(0, &desc, 0xdead_beef_0000).unwrap();
        assert_eq!(
            record.transform,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
        assert_eq!(record.custom_index_and_mask, 0xFF00_0000);
        assert_eq!(record.sbt_offset_and_flags, 0x0100_0000);
        assert_eq!(record.mask(), 0xFF);
        assert_eq!(record.custom_index(), 0);
        assert_eq!(record.flags(), InstanceFlags::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(record.blas_reference, 0xdead_beef_0000);
    }

    #[test]
    fn test_pack_translation_is_last_column() {
        let desc = InstanceDesc::new(BlasIndex(0))
            .with_transform(Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0)))
            .with_custom_index(INSTANCE_FIELD_MAX)
            .with_mask(0x0F);
        let record = InstanceRecord::pack(0, &desc, 0).unwrap();
        assert_eq!(record.transform[3], 1.0);
        assert_eq!(record.transform[7], 2.0);
        assert_eq!(record.transform[11], 3.0);
        assert_eq!(record.custom_index(), INSTANCE_FIELD_MAX);
        assert_eq!(record.mask(), 0x0F);
    }

    #[test]
    fn test_pack_rejects_wide_fields() {
        let desc = InstanceDesc::new(BlasIndex(0)).with_custom_index(1 << 24);
        assert!(matches!(
            InstanceRecord::pack(4, &desc, 0),
            Err(CoreError::InstanceFieldOverflow {
                instance: 4,
                field: "custom index",
                ..
            })
        ));
    }

    #[test]
    fn test_blas_index_out_of_range_is_not_clamped() {
        let states = [BuildState::Built];
        let instances = [InstanceDesc::new(BlasIndex(0)), InstanceDesc::new(BlasIndex(1))];
        assert!(matches!(
            validate_instances(&instances, &states),
            Err(CoreError::BlasIndexOutOfRange {
                instance: 1,
                blas: 1,
                blas_count: 1
            })
        ));
    }

    #[test]
    fn test_unbuilt_blas_is_rejected() {
        let states = [BuildState::Building(SequenceId(3))];
        assert!(matches!(
            validate_instances(&[InstanceDesc::new(BlasIndex(0))], &states),
            Err(CoreError::BlasNotBuilt {
                state: "building",
                ..
            })
        ));
        assert!(matches!(
            validate_instances(&[], &states),
            Err(CoreError::NoInstances)
        ));
    }

    #[test]
    fn test_build_state_transitions() {
        let mut state = BuildState::Unbuilt;
        assert!(state.finish().is_err());
        state.begin(SequenceId(0)).unwrap();
        assert!(state.begin(SequenceId(1)).is_err());
        state.finish().unwrap();
        assert!(state.is_built());
        assert!(state.begin(SequenceId(2)).is_err());
        state.destroy().unwrap();
        assert!(state.destroy().is_err());
    }

    #[test]
    fn test_geometry_validation() {
        let good = geometry();
        assert_eq!(good.triangle_count(), 1);
        validate_geometries(&[good]).unwrap();
        assert!(validate_geometries(&[]).is_err());

        let partial = TriangleGeometry {
            index_count: 4,
            ..good
        };
        assert!(matches!(
            validate_geometries(&[good, partial]),
            Err(CoreError::InvalidGeometry { geometry: 1, .. })
        ));

        let no_vertices = TriangleGeometry {
            vertex_count: 0,
            ..good
        };
        assert!(validate_geometries(&[no_vertices]).is_err());

        let narrow = TriangleGeometry {
            vertex_stride: 8,
            ..good
        };
        assert!(validate_geometries(&[narrow]).is_err());
    }

    #[test]
    fn test_counts_must_fit_buffers() {
        let good = geometry();
        assert_eq!(good.vertex_span(), 36);
        assert_eq!(good.index_span(), 12);
        good.check_buffer_sizes(0, 36, 12, None).unwrap();

        let overrun = TriangleGeometry {
            index_count: 3000,
            vertex_count: 1_000_000,
            ..good
        };
        validate_geometries(&[overrun]).unwrap();
        assert!(matches!(
            overrun.check_buffer_sizes(2, 36, 12, None),
            Err(CoreError::InvalidGeometry { geometry: 2, .. })
        ));

        let extra_indices = TriangleGeometry {
            index_count: 6,
            ..good
        };
        let err = extra_indices.check_buffer_sizes(0, 36, 12, None).unwrap_err();
        assert!(err.to_string().contains("index buffer"));

        let strided = TriangleGeometry {
            vertex_stride: 16,
            ..good
        };
        assert!(strided.check_buffer_sizes(0, 36, 12, None).is_err());
        strided.check_buffer_sizes(0, 44, 12, None).unwrap();
    }

    #[test]
    fn test_transform_buffer_size() {
        let good = geometry();
        let transformed = TriangleGeometry {
            transform_buffer: Some(good.index_buffer),
            ..good
        };
        transformed.check_buffer_sizes(0, 36, 12, Some(48)).unwrap();
        assert!(transformed.check_buffer_sizes(0, 36, 12, Some(47)).is_err());

        let sizes = |id: BufferId| -> Result<u64> {
            Ok(if id == good.vertex_buffer { 36 } else { 12 })
        };
        assert!(validate_geometry_sizes(&[good], sizes).is_ok());
        assert!(matches!(
            validate_geometry_sizes(&[transformed], sizes),
            Err(CoreError::InvalidGeometry { .. })
        ));
    }
}
