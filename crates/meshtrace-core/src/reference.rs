//! CPU reference implementation of the ray tracing program.
//!
//! Uses the same camera, ray extent and shading as the compute shader, so a
//! GPU render can be compared pixel by pixel, and the pipeline's expected
//! output can be checked on machines without a ray tracing device.

use glam::{Affine3A, Vec3};

use crate::accel::InstanceDesc;
use crate::config::{RenderConfig, ShadingMode};
use crate::mesh::Mesh;

/// Ray extent used by the compute program.
pub const T_MIN: f32 = 0.0;
/// Ray extent used by the compute program.
pub const T_MAX: f32 = 10_000.0;
/// Cull mask used by the compute program.
pub const CULL_MASK: u8 = 0xFF;

/// Closest committed triangle hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub t: f32,
    /// Barycentric weight of the second vertex.
    pub u: f32,
    /// Barycentric weight of the third vertex.
    pub v: f32,
    pub instance: usize,
    pub primitive: usize,
}

impl Hit {
    /// The three barycentric weights; they sum to one.
    pub fn barycentrics(&self) -> Vec3 {
        Vec3::new(1.0 - self.u - self.v, self.u, self.v)
    }
}

struct Placement {
    to_world: Affine3A,
    mask: u8,
}

/// Brute-force tracer over a mesh and its instances.
pub struct ReferenceTracer<'a> {
    mesh: &'a Mesh,
    placements: Vec<Placement>,
    config: &'a RenderConfig,
}

impl<'a> ReferenceTracer<'a> {
    /// Traces `mesh` placed once per instance. The instances' BLAS indices are
    /// ignored; every instance refers to `mesh`.
    pub fn new(mesh: &'a Mesh, instances: &[InstanceDesc], config: &'a RenderConfig) -> Self {
        let placements = instances
            .iter()
            .map(|i| Placement {
                to_world: i.transform,
                mask: i.mask,
            })
            .collect();
        Self {
            mesh,
            placements,
            config,
        }
    }

    /// Closest hit along `origin + t * direction` for `t` in `[T_MIN, T_MAX]`.
    pub fn trace(&self, origin: Vec3, direction: Vec3) -> Option<Hit> {
        let mut best: Option<Hit> = None;
        for (instance, placement) in self.placements.iter().enumerate() {
            if placement.mask & CULL_MASK == 0 {
                continue;
            }
            for primitive in 0..self.mesh.triangle_count() {
                let [a, b, c] = self
                    .mesh
                    .triangle(primitive)
                    .map(|p| placement.to_world.transform_point3(p));
                let Some((t, u, v)) = intersect_triangle(origin, direction, a, b, c) else {
                    continue;
                };
                if t < T_MIN || t > T_MAX || best.is_some_and(|h| h.t <= t) {
                    continue;
                }
                best = Some(Hit {
                    t,
                    u,
                    v,
                    instance,
                    primitive,
                });
            }
        }
        best
    }

    /// Colour of pixel `(x, y)`.
    pub fn shade_pixel(&self, x: u32, y: u32) -> Vec3 {
        let cfg = self.config;
        let direction = cfg.camera.ray_direction(x, y, cfg.width, cfg.height);
        match self.trace(cfg.camera.origin, direction) {
            None => cfg.background,
            Some(hit) => match cfg.shading {
                ShadingMode::Barycentric => hit.barycentrics(),
                ShadingMode::GeometricNormal => {
                    let [a, b, c] = self.mesh.triangle(hit.primitive);
                    0.5 * (b - a).cross(c - a).normalize_or_zero() + 0.5
                }
            },
        }
    }

    /// The whole image as row-major RGB floats.
    pub fn render(&self) -> Vec<f32> {
        let cfg = self.config;
        let mut out = Vec::with_capacity(cfg.pixel_count() * 3);
        for y in 0..cfg.height {
            for x in 0..cfg.width {
                out.extend_from_slice(&self.shade_pixel(x, y).to_array());
            }
        }
        out
    }
}

/// Möller–Trumbore with back-face culling disabled.
///
/// Returns `(t, u, v)` where `u` and `v` weight `b` and `c`.
pub fn intersect_triangle(
    origin: Vec3,
    direction: Vec3,
    a: Vec3,
    b: Vec3,
    c: Vec3,
) -> Option<(f32, f32, f32)> {
    const EPSILON: f32 = 1e-8;
    let e1 = b - a;
    let e2 = c - a;
    let p = direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - a;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    Some((e2.dot(q) * inv_det, u, v))
}
