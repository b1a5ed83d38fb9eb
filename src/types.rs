//! Common GPU resource types shared across the crate.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec4, Vec2, Vec3, Vec4};

/// Which hardware queue a command list records for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Main graphics queue: draws, dispatches, barriers, presentation.
    Graphics,
    /// Copy queue: staging-to-resident transfers.
    Copy,
}

/// Texture format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Texture usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    /// Buffer usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const CONSTANT = 1 << 4;
        const STORAGE = 1 << 5;
        /// CPU-writable memory in the upload heap.
        const UPLOAD = 1 << 6;
    }
}

/// Clear value for render-target and depth attachments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

/// The state a texture resource is in, for transition barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    DepthWrite,
    ShaderResource,
    UnorderedAccess,
    CopySrc,
    CopyDst,
}

/// Texture descriptor.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub clear: Option<ClearValue>,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            width,
            height,
            format,
            usage,
            clear: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_clear(mut self, clear: ClearValue) -> Self {
        self.clear = Some(clear);
        self
    }

    /// Total byte size of the level-0 surface.
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }
}

/// Buffer descriptor.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Standard vertex with position, normal, UV, and tangent.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

/// Camera constants uploaded once per frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniform {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub position: Vec4, // w unused
}

/// Maximum point lights in a single frame's light constants.
pub const MAX_POINT_LIGHTS: usize = 4;
/// Maximum directional lights in a single frame's light constants.
pub const MAX_DIRECTIONAL_LIGHTS: usize = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuPointLight {
    /// xyz = position, w = radius.
    pub position: Vec4,
    /// rgb = color, a = intensity.
    pub color: Vec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuDirectionalLight {
    /// xyz = direction, w unused.
    pub direction: Vec4,
    /// rgb = color, a = intensity.
    pub color: Vec4,
}

/// Light constants uploaded once per frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightsUniform {
    pub point: [GpuPointLight; MAX_POINT_LIGHTS],
    pub directional: [GpuDirectionalLight; MAX_DIRECTIONAL_LIGHTS],
    /// x = point count, y = directional count, zw unused.
    pub counts: UVec4,
}

/// Per-instance object constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectUniform {
    pub model: Mat4,
    pub base_color: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TextureFormat::Rgba8Unorm, 4)]
    #[case(TextureFormat::Bgra8Unorm, 4)]
    #[case(TextureFormat::R32Float, 4)]
    #[case(TextureFormat::Depth32Float, 4)]
    #[case(TextureFormat::Rgba16Float, 8)]
    #[case(TextureFormat::Rgba32Float, 16)]
    fn test_format_bytes_per_pixel(#[case] format: TextureFormat, #[case] bytes: u32) {
        assert_eq!(format.bytes_per_pixel(), bytes);
    }

    #[test]
    fn test_depth_formats() {
        assert!(TextureFormat::Depth32Float.is_depth());
        assert!(!TextureFormat::Rgba8Unorm.is_depth());
    }

    #[test]
    fn test_texture_desc_byte_size() {
        let desc = TextureDesc::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING,
        );
        assert_eq!(desc.byte_size(), 64);
    }

    #[test]
    fn test_usage_flags() {
        let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        assert!(usage.contains(TextureUsage::RENDER_ATTACHMENT));
        assert!(!usage.contains(TextureUsage::STORAGE_BINDING));
    }
}
