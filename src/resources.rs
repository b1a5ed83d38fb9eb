//! GPU-resident mesh and texture records.
//!
//! Callers hold opaque generational handles; the records behind them own the
//! native resources and their descriptors. Freeing a handle bumps the slot
//! generation, so a handle kept past `free_mesh`/`free_texture` asserts on
//! its next use instead of drawing from freed memory.

use crate::descriptor::Descriptor;
use crate::device::{NativeBufferId, NativeTextureId};
use crate::handle::{Handle, HandlePool};
use crate::types::TextureDesc;

/// Opaque reference to a GPU-resident mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshHandle(Handle);

/// Opaque reference to a GPU-resident texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(Handle);

/// Resident vertex and index buffers for one mesh.
#[derive(Debug)]
pub struct MeshRecord {
    pub vertex_buffer: NativeBufferId,
    pub vertex_count: u32,
    pub index_buffer: NativeBufferId,
    pub index_count: u32,
}

/// Resident texture with its shader-resource view.
#[derive(Debug)]
pub struct TextureRecord {
    pub texture: NativeTextureId,
    pub srv: Descriptor,
    pub desc: TextureDesc,
}

const MESH_CAPACITY: u32 = 4096;
const TEXTURE_CAPACITY: u32 = 4096;

/// All resident resources, keyed by generational handle.
#[derive(Debug)]
pub struct ResourceRegistry {
    meshes: HandlePool<MeshRecord>,
    textures: HandlePool<TextureRecord>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            meshes: HandlePool::with_capacity(MESH_CAPACITY),
            textures: HandlePool::with_capacity(TEXTURE_CAPACITY),
        }
    }

    pub fn insert_mesh(&mut self, record: MeshRecord) -> MeshHandle {
        MeshHandle(self.meshes.alloc(record))
    }

    pub fn insert_texture(&mut self, record: TextureRecord) -> TextureHandle {
        TextureHandle(self.textures.alloc(record))
    }

    /// Remove a mesh, returning its record so the caller can release the
    /// native buffers.
    pub fn remove_mesh(&mut self, handle: MeshHandle) -> MeshRecord {
        self.meshes.free(handle.0)
    }

    pub fn remove_texture(&mut self, handle: TextureHandle) -> TextureRecord {
        self.textures.free(handle.0)
    }

    pub fn mesh(&self, handle: MeshHandle) -> &MeshRecord {
        self.meshes.get(handle.0)
    }

    pub fn texture(&self, handle: TextureHandle) -> &TextureRecord {
        self.textures.get(handle.0)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
