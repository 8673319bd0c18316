//! Triangle meshes as handed over by the mesh loader.

use glam::Vec3;

use crate::error::{CoreError, Result};

/// Triangles whose doubled area falls below this are considered degenerate.
pub const DEGENERATE_AREA_EPSILON: f32 = 1e-12;

/// An indexed triangle mesh.
///
/// Construction validates the mesh, so every `Mesh` satisfies:
/// - at least one vertex and one triangle,
/// - `indices.len() % 3 == 0`,
/// - every index is smaller than the vertex count.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    vertices: Vec<Vec3>,
    indices: Vec<u32>,
}

impl Mesh {
    /// Creates a mesh from positions and a flat triangle index list.
    pub fn new(vertices: Vec<Vec3>, indices: Vec<u32>) -> Result<Self> {
        validate_triangles(vertices.len(), &indices)?;
        Ok(Self { vertices, indices })
    }

    /// Creates a mesh from flat `x, y, z` floats.
    pub fn from_flat(positions: &[f32], indices: Vec<u32>) -> Result<Self> {
        if positions.len() % 3 != 0 {
            return Err(CoreError::InvalidGeometry {
                geometry: 0,
                reason: format!("{} position floats is not a multiple of 3", positions.len()),
            });
        }
        let vertices = positions
            .chunks_exact(3)
            .map(|p| Vec3::new(p[0], p[1], p[2]))
            .collect();
        Self::new(vertices, indices)
    }

    /// The vertex positions.
    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    /// The flat triangle index list.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of indices (three per triangle).
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// The three corner positions of triangle `t`.
    pub fn triangle(&self, t: usize) -> [Vec3; 3] {
        let i = &self.indices[3 * t..3 * t + 3];
        [
            self.vertices[i[0] as usize],
            self.vertices[i[1] as usize],
            self.vertices[i[2] as usize],
        ]
    }

    /// Vertex data as raw bytes, tightly packed `R32G32B32` floats.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index data as raw bytes.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Indices of triangles with (near) zero area.
    pub fn degenerate_triangles(&self) -> Vec<usize> {
        (0..self.triangle_count())
            .filter(|&t| {
                let [a, b, c] = self.triangle(t);
                (b - a).cross(c - a).length_squared() <= DEGENERATE_AREA_EPSILON
            })
            .collect()
    }

    /// Axis-aligned bounds as `(min, max)`.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        self.vertices.iter().fold(
            (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
            |(lo, hi), &v| (lo.min(v), hi.max(v)),
        )
    }
}

/// Checks the triangle-list invariants against a vertex count.
///
/// Returns the triangle count.
pub fn validate_triangles(vertex_count: usize, indices: &[u32]) -> Result<usize> {
    if vertex_count == 0 || indices.is_empty() {
        return Err(CoreError::EmptyMesh {
            vertices: vertex_count,
            indices: indices.len(),
        });
    }
    if indices.len() % 3 != 0 {
        return Err(CoreError::IndexCountNotTriangles(indices.len()));
    }
    if let Some((position, &index)) = indices
        .iter()
        .enumerate()
        .find(|(_, &i)| i as usize >= vertex_count)
    {
        return Err(CoreError::IndexOutOfRange {
            position,
            index,
            vertex_count,
        });
    }
    Ok(indices.len() / 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unit_triangle() -> Mesh {
        Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2]).unwrap()
    }

    #[test]
    fn test_single_triangle() {
        let mesh = unit_triangle();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.triangle_count(), 1);
        assert_eq!(mesh.vertex_bytes().len(), 36);
        assert_eq!(mesh.index_bytes().len(), 12);
        assert_eq!(mesh.bounds(), (Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0)));
        assert!(mesh.degenerate_triangles().is_empty());
    }

    #[test]
    fn test_rejects_partial_triangle() {
        let err = Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1]).unwrap_err();
        assert!(matches!(err, CoreError::IndexCountNotTriangles(2)));
    }

    #[test]
    fn test_rejects_dangling_index() {
        let err = Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 3]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::IndexOutOfRange {
                position: 2,
                index: 3,
                vertex_count: 3
            }
        ));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            Mesh::new(vec![], vec![]).unwrap_err(),
            CoreError::EmptyMesh { .. }
        ));
    }

    #[test]
    fn test_from_flat() {
        let mesh = Mesh::from_flat(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![0, 1, 2])
            .unwrap();
        assert_eq!(mesh, unit_triangle());
        assert!(Mesh::from_flat(&[0.0, 1.0], vec![0, 0, 0]).is_err());
    }

    #[test]
    fn test_degenerate_detection() {
        let mesh = Mesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(2.0, 0.0, 0.0)],
            vec![0, 1, 2, 0, 1, 3],
        )
        .unwrap();
        assert_eq!(mesh.degenerate_triangles(), vec![1]);
    }

    proptest! {
        #[test]
        fn prop_triangle_count_matches_indices(
            vertex_count in 1usize..64,
            raw in proptest::collection::vec(0u32..1000, 0..200),
        ) {
            let indices: Vec<u32> = raw.iter().map(|i| i % vertex_count as u32).collect();
            let vertices = vec![Vec3::ZERO; vertex_count];
            match Mesh::new(vertices, indices.clone()) {
                Ok(mesh) => {
                    prop_assert_eq!(indices.len() % 3, 0);
                    prop_assert_eq!(mesh.triangle_count(), indices.len() / 3);
                }
                Err(CoreError::IndexCountNotTriangles(n)) => prop_assert_ne!(n % 3, 0),
                Err(CoreError::EmptyMesh { .. }) => prop_assert!(indices.is_empty()),
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }

        #[test]
        fn prop_out_of_range_index_rejected(vertex_count in 1usize..32, extra in 0u32..8) {
            let mut indices = vec![0u32; 3];
            indices[1] = vertex_count as u32 + extra;
            let result = validate_triangles(vertex_count, &indices);
            let is_out_of_range = matches!(result, Err(CoreError::IndexOutOfRange { position: 1, .. }));
            prop_assert!(is_out_of_range);
        }
    }
}
