//! Per-frame scene description handed to the renderer.

use glam::{Mat4, Vec3, Vec4};

use crate::resources::MeshHandle;
use crate::types::{
    CameraUniform, GpuDirectionalLight, GpuPointLight, LightsUniform, MAX_DIRECTIONAL_LIGHTS,
    MAX_POINT_LIGHTS,
};

/// Perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    /// World-space camera transform; view matrix is its inverse.
    pub transform: Mat4,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn uniform(&self, aspect: f32) -> CameraUniform {
        let view = self.transform.inverse();
        let proj = Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far);
        CameraUniform {
            view,
            proj,
            view_proj: proj * view,
            position: self.transform.col(3),
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            fov_y: std::f32::consts::FRAC_PI_3,
            near: 0.1,
            far: 1000.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PointLight {
    pub position: Vec3,
    pub radius: f32,
    pub color: Vec3,
    pub intensity: f32,
}

#[derive(Debug, Clone)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

/// One mesh to draw this frame.
#[derive(Debug, Clone)]
pub struct MeshInstance {
    pub mesh: MeshHandle,
    pub transform: Mat4,
    pub base_color: Vec4,
}

/// Everything the renderer needs to draw one frame.
///
/// Built fresh each frame by the caller; the renderer reads it during
/// [`crate::renderer::Renderer::render`] and keeps nothing afterwards.
#[derive(Debug, Clone, Default)]
pub struct RenderInfo {
    pub camera: Camera,
    pub point_lights: Vec<PointLight>,
    pub directional_lights: Vec<DirectionalLight>,
    pub instances: Vec<MeshInstance>,
}

impl RenderInfo {
    /// Pack the frame's lights into their GPU layout. Lights beyond the
    /// fixed capacities are dropped.
    pub fn lights_uniform(&self) -> LightsUniform {
        let mut uniform = LightsUniform {
            point: [GpuPointLight {
                position: Vec4::ZERO,
                color: Vec4::ZERO,
            }; MAX_POINT_LIGHTS],
            directional: [GpuDirectionalLight {
                direction: Vec4::ZERO,
                color: Vec4::ZERO,
            }; MAX_DIRECTIONAL_LIGHTS],
            counts: glam::UVec4::ZERO,
        };

        let point_count = self.point_lights.len().min(MAX_POINT_LIGHTS);
        for (slot, light) in uniform.point.iter_mut().zip(&self.point_lights) {
            *slot = GpuPointLight {
                position: light.position.extend(light.radius),
                color: light.color.extend(light.intensity),
            };
        }

        let directional_count = self.directional_lights.len().min(MAX_DIRECTIONAL_LIGHTS);
        for (slot, light) in uniform.directional.iter_mut().zip(&self.directional_lights) {
            *slot = GpuDirectionalLight {
                direction: light.direction.normalize_or_zero().extend(0.0),
                color: light.color.extend(light.intensity),
            };
        }

        uniform.counts = glam::UVec4::new(point_count as u32, directional_count as u32, 0, 0);
        uniform
    }
}
