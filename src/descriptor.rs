//! Descriptor heaps with generational validation.
//!
//! Each view kind gets its own fixed-capacity heap, provisioned at device
//! creation. A descriptor is a generational handle into one heap; freeing a
//! slot bumps its generation, so a descriptor held past the free of its view
//! trips an assert instead of silently aliasing whatever moved in after it.

use crate::device::{NativeBufferId, NativeTextureId};
use crate::handle::{Handle, HandlePool};

/// The kind of view a descriptor names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
    UnorderedAccess,
    ConstantBuffer,
}

/// The resource a descriptor slot points at.
#[derive(Debug, Clone)]
pub enum ResourceView {
    Buffer {
        buffer: NativeBufferId,
        offset: u64,
        size: u64,
    },
    Texture {
        texture: NativeTextureId,
    },
}

/// A validated reference to a slot in one of the descriptor heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    handle: Handle,
    kind: ViewKind,
}

impl Descriptor {
    /// Heap-relative slot index, as bound into root signatures.
    pub fn index(&self) -> u32 {
        self.handle.index()
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }
}

/// One fixed-capacity descriptor heap.
#[derive(Debug)]
pub struct DescriptorHeap {
    kind: ViewKind,
    pool: HandlePool<ResourceView>,
}

impl DescriptorHeap {
    pub fn new(kind: ViewKind, capacity: u32) -> Self {
        Self {
            kind,
            pool: HandlePool::with_capacity(capacity),
        }
    }

    pub fn alloc(&mut self, view: ResourceView) -> Descriptor {
        Descriptor {
            handle: self.pool.alloc(view),
            kind: self.kind,
        }
    }

    /// Release a descriptor. Panics if it is stale or was already freed.
    pub fn free(&mut self, descriptor: Descriptor) {
        assert!(
            descriptor.kind == self.kind,
            "descriptor kind {:?} freed into {:?} heap",
            descriptor.kind,
            self.kind
        );
        self.pool.free(descriptor.handle);
    }

    pub fn is_valid(&self, descriptor: Descriptor) -> bool {
        descriptor.kind == self.kind && self.pool.is_valid(descriptor.handle)
    }

    pub fn view(&self, descriptor: Descriptor) -> &ResourceView {
        assert!(
            descriptor.kind == self.kind,
            "descriptor kind {:?} looked up in {:?} heap",
            descriptor.kind,
            self.kind
        );
        self.pool.get(descriptor.handle)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

// Heap capacities, sized once at startup.
const RTV_CAPACITY: u32 = 1024;
const DSV_CAPACITY: u32 = 256;
const SRV_CAPACITY: u32 = 4096;
const UAV_CAPACITY: u32 = 1024;
const CBV_CAPACITY: u32 = 4096;

/// All descriptor heaps the renderer uses, one per view kind.
#[derive(Debug)]
pub struct DescriptorHeaps {
    pub rtv: DescriptorHeap,
    pub dsv: DescriptorHeap,
    pub srv: DescriptorHeap,
    pub uav: DescriptorHeap,
    pub cbv: DescriptorHeap,
}

impl DescriptorHeaps {
    pub fn new() -> Self {
        Self {
            rtv: DescriptorHeap::new(ViewKind::RenderTarget, RTV_CAPACITY),
            dsv: DescriptorHeap::new(ViewKind::DepthStencil, DSV_CAPACITY),
            srv: DescriptorHeap::new(ViewKind::ShaderResource, SRV_CAPACITY),
            uav: DescriptorHeap::new(ViewKind::UnorderedAccess, UAV_CAPACITY),
            cbv: DescriptorHeap::new(ViewKind::ConstantBuffer, CBV_CAPACITY),
        }
    }

    /// Free a descriptor through whichever heap owns its kind.
    pub fn free(&mut self, descriptor: Descriptor) {
        self.heap_mut(descriptor.kind()).free(descriptor);
    }

    pub fn heap_mut(&mut self, kind: ViewKind) -> &mut DescriptorHeap {
        match kind {
            ViewKind::RenderTarget => &mut self.rtv,
            ViewKind::DepthStencil => &mut self.dsv,
            ViewKind::ShaderResource => &mut self.srv,
            ViewKind::UnorderedAccess => &mut self.uav,
            ViewKind::ConstantBuffer => &mut self.cbv,
        }
    }
}

impl Default for DescriptorHeaps {
    fn default() -> Self {
        Self::new()
    }
}
