//! Wavefront OBJ input.

use std::path::Path;

use meshtrace_core::Mesh;

use crate::error::{MeshtraceError, Result};

/// Loads every model in an OBJ file into one triangle mesh.
///
/// Faces are triangulated and models are concatenated, with each model's
/// indices offset past the vertices of the models before it. Materials,
/// normals and texture coordinates are ignored.
pub fn load_obj(path: impl AsRef<Path>) -> Result<Mesh> {
    let path = path.as_ref();
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ignore_points: true,
            ignore_lines: true,
            ..Default::default()
        },
    )
    .map_err(|source| MeshtraceError::ObjLoad {
        path: path.to_path_buf(),
        source,
    })?;

    let mut positions = Vec::new();
    let mut indices = Vec::new();
    for model in &models {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (positions.len() / 3) as u32;
        positions.extend_from_slice(&model.mesh.positions);
        indices.extend(model.mesh.indices.iter().map(|i| i + offset));
    }

    let mesh = Mesh::from_flat(&positions, indices)?;
    log::info!(
        "{}: {} model(s), {} vertices, {} triangles",
        path.display(),
        models.len(),
        mesh.vertex_count(),
        mesh.triangle_count()
    );
    Ok(mesh)
}
