//! Transient per-frame GPU memory.
//!
//! Two suballocators feed command recording: a pool of fixed-size constant
//! buffer slots, and linear upload pools for staging data. Both hand memory
//! to a command list for the duration of one submission; when the list's
//! fence value is reached the memory flows back through [`TransientResources::reclaim`]
//! and is reused. Nothing here frees per-draw — reuse is strictly fence-gated,
//! so in-flight GPU reads are never overwritten.

use crate::descriptor::{Descriptor, DescriptorHeaps, ResourceView};
use crate::device::{NativeBufferId, NativeDevice};
use crate::error::GraphicsResult;
use crate::queue::CommandList;
use crate::types::{BufferDesc, BufferUsage};

use static_assertions::const_assert;

/// Size of one constant buffer slot. Matches the hardware alignment for
/// root CBVs, so every slot offset is directly bindable.
pub const CONSTANT_BUFFER_SIZE: u64 = 256;

/// Slots carved per backing allocation when the pool grows.
const CONSTANT_BUFFER_BATCH: u64 = 64;

/// Default capacity of a shared upload pool.
pub const DEFAULT_UPLOAD_POOL_SIZE: u64 = 4 * 1024 * 1024;

const UPLOAD_ALIGNMENT: u64 = 256;

// Every per-frame uniform must fit a single constant buffer slot.
const_assert!(std::mem::size_of::<crate::types::CameraUniform>() <= CONSTANT_BUFFER_SIZE as usize);
const_assert!(std::mem::size_of::<crate::types::LightsUniform>() <= CONSTANT_BUFFER_SIZE as usize);
const_assert!(std::mem::size_of::<crate::types::ObjectUniform>() <= CONSTANT_BUFFER_SIZE as usize);

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// One 256-byte constant buffer slot, with its bindable descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBuffer {
    pub descriptor: Descriptor,
    pub buffer: NativeBufferId,
    pub offset: u64,
}

/// Pool of constant buffer slots.
///
/// Grows in batches: when no slot is available, one backing buffer of
/// [`CONSTANT_BUFFER_BATCH`] slots is created and all of its slots (and their
/// CBV descriptors) join the free list. Slots are never destroyed; checkout
/// and release just move them between the free list and command lists.
#[derive(Debug, Default)]
pub struct ConstantBufferPool {
    available: Vec<ConstantBuffer>,
    batches: u32,
}

impl ConstantBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot, fill it with `bytes`, and return it.
    ///
    /// The returned slot must be attached to the command list that binds it,
    /// so it is released only after that list's fence is reached.
    pub fn checkout(
        &mut self,
        device: &mut NativeDevice,
        heaps: &mut DescriptorHeaps,
        bytes: &[u8],
    ) -> GraphicsResult<ConstantBuffer> {
        assert!(
            bytes.len() as u64 <= CONSTANT_BUFFER_SIZE,
            "constant data of {} bytes exceeds slot size",
            bytes.len()
        );

        if self.available.is_empty() {
            self.grow(device, heaps)?;
        }

        let slot = self.available.pop().expect("pool grew but is empty");
        device.write_buffer(slot.buffer, slot.offset, bytes);
        Ok(slot)
    }

    /// Return a slot to the free list. Called from fence-gated reclamation.
    pub fn release(&mut self, slot: ConstantBuffer) {
        self.available.push(slot);
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn batch_count(&self) -> u32 {
        self.batches
    }

    fn grow(
        &mut self,
        device: &mut NativeDevice,
        heaps: &mut DescriptorHeaps,
    ) -> GraphicsResult<()> {
        let buffer = device.create_buffer(
            &BufferDesc::new(
                CONSTANT_BUFFER_BATCH * CONSTANT_BUFFER_SIZE,
                BufferUsage::CONSTANT | BufferUsage::UPLOAD,
            )
            .with_label(format!("constant_batch_{}", self.batches)),
        )?;
        self.batches += 1;

        for i in 0..CONSTANT_BUFFER_BATCH {
            let offset = i * CONSTANT_BUFFER_SIZE;
            let descriptor = heaps.cbv.alloc(ResourceView::Buffer {
                buffer,
                offset,
                size: CONSTANT_BUFFER_SIZE,
            });
            self.available.push(ConstantBuffer {
                descriptor,
                buffer,
                offset,
            });
        }
        log::debug!(
            "constant buffer pool grew to {} batches ({} slots free)",
            self.batches,
            self.available.len()
        );
        Ok(())
    }
}

/// A staging allocation inside an upload pool.
#[derive(Debug, Clone, Copy)]
pub struct UploadAllocation {
    pub buffer: NativeBufferId,
    pub offset: u64,
}

/// One linear upload pool: CPU-writable memory carved front to back.
#[derive(Debug)]
pub struct UploadPool {
    buffer: NativeBufferId,
    capacity: u64,
    allocated: u64,
}

impl UploadPool {
    fn new(device: &mut NativeDevice, capacity: u64) -> GraphicsResult<Self> {
        let buffer = device.create_buffer(
            &BufferDesc::new(capacity, BufferUsage::UPLOAD | BufferUsage::COPY_SRC)
                .with_label("upload_pool"),
        )?;
        Ok(Self {
            buffer,
            capacity,
            allocated: 0,
        })
    }

    /// Carve `size` bytes, or `None` if the pool cannot hold them.
    fn try_allocate(&mut self, size: u64) -> Option<UploadAllocation> {
        let offset = align_up(self.allocated, UPLOAD_ALIGNMENT);
        if offset + size > self.capacity {
            return None;
        }
        self.allocated = offset + size;
        Some(UploadAllocation {
            buffer: self.buffer,
            offset,
        })
    }

    fn reset(&mut self) {
        self.allocated = 0;
    }

    pub fn buffer(&self) -> NativeBufferId {
        self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Shared reservoir of upload pools.
///
/// Allocation order: the requesting list's own pools first, then a shared
/// free pool that fits, then a fresh pool sized `max(request, default)`. At
/// retirement default-sized pools reset and rejoin the reservoir; oversized
/// ones are destroyed, so a single huge upload does not pin its memory.
#[derive(Debug)]
pub struct UploadHeap {
    available: Vec<UploadPool>,
    default_pool_size: u64,
}

impl UploadHeap {
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_UPLOAD_POOL_SIZE)
    }

    pub fn with_pool_size(default_pool_size: u64) -> Self {
        Self {
            available: Vec::new(),
            default_pool_size,
        }
    }

    /// Allocate `size` staging bytes for a command list.
    ///
    /// `list_pools` is the list's set of checked-out pools; a pool taken from
    /// the reservoir or created here is moved into it.
    pub fn allocate(
        &mut self,
        device: &mut NativeDevice,
        list_pools: &mut Vec<UploadPool>,
        size: u64,
    ) -> GraphicsResult<UploadAllocation> {
        assert!(size > 0, "zero-sized upload allocation");

        for pool in list_pools.iter_mut() {
            if let Some(allocation) = pool.try_allocate(size) {
                return Ok(allocation);
            }
        }

        let index = self
            .available
            .iter()
            .position(|pool| size <= pool.capacity);
        let mut pool = match index {
            Some(index) => self.available.swap_remove(index),
            None => {
                let capacity = size.max(self.default_pool_size);
                log::debug!("creating upload pool of {} bytes", capacity);
                UploadPool::new(device, capacity)?
            }
        };

        let allocation = pool
            .try_allocate(size)
            .expect("fresh pool cannot satisfy its own request");
        list_pools.push(pool);
        Ok(allocation)
    }

    /// Return a pool whose command list's fence has been reached.
    pub fn retire(&mut self, device: &mut NativeDevice, mut pool: UploadPool) {
        if pool.capacity <= self.default_pool_size {
            pool.reset();
            self.available.push(pool);
        } else {
            log::debug!("releasing oversized upload pool ({} bytes)", pool.capacity);
            device.destroy_buffer(pool.buffer);
        }
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }
}

impl Default for UploadHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// All transient allocators, plus the reclamation path that feeds them.
#[derive(Debug, Default)]
pub struct TransientResources {
    pub constant_buffers: ConstantBufferPool,
    pub uploads: UploadHeap,
}

impl TransientResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reclaim everything a completed command list holds.
    ///
    /// The caller guarantees the list's fence value has been reached; nothing
    /// here re-checks it.
    pub fn reclaim(&mut self, device: &mut NativeDevice, list: &mut CommandList) {
        for slot in list.take_constant_buffers() {
            self.constant_buffers.release(slot);
        }
        for pool in list.take_upload_pools() {
            self.uploads.retire(device, pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CompletionMode;
    use bytemuck::bytes_of;
    use glam::Mat4;

    fn device() -> NativeDevice {
        NativeDevice::new(CompletionMode::Immediate)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_constant_pool_grows_in_batches() {
        let mut device = device();
        let mut heaps = DescriptorHeaps::new();
        let mut pool = ConstantBufferPool::new();

        let slot = pool.checkout(&mut device, &mut heaps, &[1, 2, 3]).unwrap();
        assert_eq!(pool.batch_count(), 1);
        assert_eq!(pool.available_count(), CONSTANT_BUFFER_BATCH as usize - 1);
        assert_eq!(device.read_buffer(slot.buffer, slot.offset, 3), &[1, 2, 3]);

        // Drain the batch; the next checkout triggers a second one.
        for _ in 0..CONSTANT_BUFFER_BATCH - 1 {
            pool.checkout(&mut device, &mut heaps, &[0]).unwrap();
        }
        assert_eq!(pool.available_count(), 0);
        pool.checkout(&mut device, &mut heaps, &[0]).unwrap();
        assert_eq!(pool.batch_count(), 2);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut device = device();
        let mut heaps = DescriptorHeaps::new();
        let mut pool = ConstantBufferPool::new();

        let slot = pool.checkout(&mut device, &mut heaps, &[7]).unwrap();
        let offset = slot.offset;
        pool.release(slot);

        let again = pool.checkout(&mut device, &mut heaps, &[8]).unwrap();
        assert_eq!(again.offset, offset);
        assert_eq!(pool.batch_count(), 1);
    }

    #[test]
    #[should_panic(expected = "exceeds slot size")]
    fn test_oversized_constant_data_panics() {
        let mut device = device();
        let mut heaps = DescriptorHeaps::new();
        let mut pool = ConstantBufferPool::new();
        let _ = pool.checkout(&mut device, &mut heaps, &[0u8; 257]);
    }

    #[test]
    fn test_uniforms_fit_constant_slot() {
        let mut device = device();
        let mut heaps = DescriptorHeaps::new();
        let mut pool = ConstantBufferPool::new();

        let camera = crate::types::CameraUniform {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            view_proj: Mat4::IDENTITY,
            position: glam::Vec4::ZERO,
        };
        pool.checkout(&mut device, &mut heaps, bytes_of(&camera))
            .unwrap();
    }

    #[test]
    fn test_upload_first_fit_prefers_list_pools() {
        let mut device = device();
        let mut heap = UploadHeap::with_pool_size(1024);
        let mut list_pools = Vec::new();

        let a = heap.allocate(&mut device, &mut list_pools, 100).unwrap();
        let b = heap.allocate(&mut device, &mut list_pools, 100).unwrap();

        // Both fit the first pool; the second allocation lands 256-aligned
        // behind the first.
        assert_eq!(list_pools.len(), 1);
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
    }

    #[test]
    fn test_upload_full_pool_spills_to_new_pool() {
        let mut device = device();
        let mut heap = UploadHeap::with_pool_size(512);
        let mut list_pools = Vec::new();

        heap.allocate(&mut device, &mut list_pools, 512).unwrap();
        let spill = heap.allocate(&mut device, &mut list_pools, 512).unwrap();
        assert_eq!(list_pools.len(), 2);
        assert_eq!(spill.offset, 0);
    }

    #[test]
    fn test_retire_resets_and_shares_default_pools() {
        let mut device = device();
        let mut heap = UploadHeap::with_pool_size(1024);
        let mut list_pools = Vec::new();

        heap.allocate(&mut device, &mut list_pools, 1000).unwrap();
        let pool = list_pools.pop().unwrap();
        heap.retire(&mut device, pool);
        assert_eq!(heap.available_count(), 1);

        // The shared pool comes back with its full capacity available.
        let again = heap.allocate(&mut device, &mut list_pools, 1000).unwrap();
        assert_eq!(again.offset, 0);
        assert_eq!(heap.available_count(), 0);
    }

    #[test]
    fn test_oversized_pool_destroyed_at_retirement() {
        let mut device = device();
        let mut heap = UploadHeap::with_pool_size(1024);
        let mut list_pools = Vec::new();

        // Request larger than the default pool size: pool is sized to the
        // request and destroyed instead of pooled.
        heap.allocate(&mut device, &mut list_pools, 4096).unwrap();
        let pool = list_pools.pop().unwrap();
        assert_eq!(pool.capacity(), 4096);
        heap.retire(&mut device, pool);
        assert_eq!(heap.available_count(), 0);
    }

    #[test]
    fn test_shared_pool_too_small_is_skipped() {
        let mut device = device();
        let mut heap = UploadHeap::with_pool_size(512);
        let mut list_pools = Vec::new();

        heap.allocate(&mut device, &mut list_pools, 100).unwrap();
        heap.retire(&mut device, list_pools.pop().unwrap());
        assert_eq!(heap.available_count(), 1);

        // 2048 does not fit the 512-byte shared pool; a dedicated pool is
        // created and the shared one stays put.
        heap.allocate(&mut device, &mut list_pools, 2048).unwrap();
        assert_eq!(heap.available_count(), 1);
        assert_eq!(list_pools[0].capacity(), 2048);
    }
}
