//! Command queues, fences, and the command list pool.
//!
//! Each queue owns one monotonic fence. `signal` stamps the next value into
//! the submission stream and `reached` compares against the completed
//! counter, so "has this submission finished" is a single integer compare.
//! Submitted lists stay with their queue until their fence value is reached;
//! [`CommandQueue::poll_command_lists`] then reclaims their transients and
//! hands the lists back for reuse. Lists are never destroyed per frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::device::{Command, NativeBufferId, NativeDevice, NativeTextureId, CompletionMode};
use crate::handle::Handle;
use crate::transient::{ConstantBuffer, TransientResources, UploadPool};
use crate::types::{QueueKind, ResourceState};

/// A reusable command list.
///
/// Recording happens on exactly one list at a time per queue kind; the
/// `recording` flag makes misuse (recording into a submitted list, or
/// submitting a closed one) panic at the call site.
#[derive(Debug)]
pub struct CommandList {
    kind: QueueKind,
    commands: Vec<Command>,
    recording: bool,
    fence_value: u64,
    constant_buffers: Vec<ConstantBuffer>,
    upload_pools: Vec<UploadPool>,
}

impl CommandList {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            commands: Vec::new(),
            recording: true,
            fence_value: 0,
            constant_buffers: Vec::new(),
            upload_pools: Vec::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Reopen a recycled list for recording.
    pub fn reset(&mut self) {
        assert!(!self.recording, "resetting a list that is still recording");
        assert!(
            self.constant_buffers.is_empty() && self.upload_pools.is_empty(),
            "resetting a list with unreclaimed transients"
        );
        self.commands.clear();
        self.fence_value = 0;
        self.recording = true;
    }

    /// Fence value stamped at submission; 0 while recording.
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Tie a constant buffer slot's lifetime to this list's fence.
    pub fn attach_constant_buffer(&mut self, slot: ConstantBuffer) {
        assert!(self.recording, "list is not recording");
        self.constant_buffers.push(slot);
    }

    /// Upload pools checked out by this list, for the upload heap's first-fit
    /// pass.
    pub fn upload_pools_mut(&mut self) -> &mut Vec<UploadPool> {
        assert!(self.recording, "list is not recording");
        &mut self.upload_pools
    }

    pub(crate) fn take_constant_buffers(&mut self) -> Vec<ConstantBuffer> {
        std::mem::take(&mut self.constant_buffers)
    }

    pub(crate) fn take_upload_pools(&mut self) -> Vec<UploadPool> {
        std::mem::take(&mut self.upload_pools)
    }

    fn record(&mut self, command: Command) {
        assert!(self.recording, "list is not recording");
        self.commands.push(command);
    }

    pub fn transition(&mut self, texture: NativeTextureId, from: ResourceState, to: ResourceState) {
        if from == to {
            return;
        }
        self.record(Command::Transition { texture, from, to });
    }

    pub fn clear_render_target(&mut self, texture: NativeTextureId, color: [f32; 4]) {
        self.record(Command::ClearRenderTarget { texture, color });
    }

    pub fn clear_depth(&mut self, texture: NativeTextureId, depth: f32) {
        self.record(Command::ClearDepth { texture, depth });
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.record(Command::SetViewport { width, height });
    }

    pub fn set_render_targets(
        &mut self,
        colors: Vec<NativeTextureId>,
        depth: Option<NativeTextureId>,
    ) {
        self.record(Command::SetRenderTargets { colors, depth });
    }

    pub fn set_pipeline(&mut self, pipeline: Handle) {
        self.record(Command::SetPipeline { pipeline });
    }

    pub fn set_root_descriptor(&mut self, offset: u32, descriptor: Descriptor) {
        self.record(Command::SetRootDescriptor {
            offset,
            descriptor_index: descriptor.index(),
        });
    }

    pub fn set_vertex_buffer(&mut self, buffer: NativeBufferId) {
        self.record(Command::SetVertexBuffer { buffer });
    }

    pub fn set_index_buffer(&mut self, buffer: NativeBufferId) {
        self.record(Command::SetIndexBuffer { buffer });
    }

    pub fn draw_indexed(&mut self, index_count: u32) {
        self.record(Command::DrawIndexed { index_count });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(Command::Dispatch { x, y, z });
    }

    pub fn copy_buffer(
        &mut self,
        src: NativeBufferId,
        src_offset: u64,
        dst: NativeBufferId,
        dst_offset: u64,
        size: u64,
    ) {
        self.record(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        src: NativeBufferId,
        src_offset: u64,
        dst: NativeTextureId,
    ) {
        self.record(Command::CopyBufferToTexture {
            src,
            src_offset,
            dst,
        });
    }

    pub fn copy_texture(&mut self, src: NativeTextureId, dst: NativeTextureId) {
        self.record(Command::CopyTexture { src, dst });
    }
}

/// A hardware queue with its fence and in-flight command lists.
#[derive(Debug)]
pub struct CommandQueue {
    kind: QueueKind,
    last_signaled: u64,
    completed: Arc<AtomicU64>,
    mode: CompletionMode,
    in_flight: Vec<CommandList>,
}

impl CommandQueue {
    pub fn new(kind: QueueKind, mode: CompletionMode) -> Self {
        Self {
            kind,
            last_signaled: 0,
            completed: Arc::new(AtomicU64::new(0)),
            mode,
            in_flight: Vec::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Stamp the next fence value into the queue and return it.
    pub fn signal(&mut self) -> u64 {
        self.last_signaled += 1;
        if self.mode == CompletionMode::Immediate {
            self.completed.store(self.last_signaled, Ordering::Release);
        }
        self.last_signaled
    }

    /// Has the queue finished all work up to and including `value`?
    pub fn reached(&self, value: u64) -> bool {
        self.completed.load(Ordering::Acquire) >= value
    }

    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Block until `value` is reached.
    pub fn wait(&self, value: u64) {
        while !self.reached(value) {
            std::thread::yield_now();
        }
    }

    /// Signal and wait: the queue is fully drained on return.
    pub fn flush(&mut self) {
        let value = self.signal();
        self.wait(value);
    }

    /// Close a list, execute it, and stamp it with a fresh fence value.
    ///
    /// The list joins the in-flight set until a later
    /// [`poll_command_lists`](Self::poll_command_lists) observes its fence.
    pub fn submit_command_list(&mut self, mut list: CommandList, device: &mut NativeDevice) -> u64 {
        assert!(list.recording, "submitting a closed command list");
        assert!(
            list.kind == self.kind,
            "submitting a {:?} list to the {:?} queue",
            list.kind,
            self.kind
        );
        list.recording = false;

        device.execute(&list.commands);
        let fence_value = self.signal();
        list.fence_value = fence_value;
        log::trace!(
            "{:?} queue: submitted {} commands at fence {}",
            self.kind,
            list.commands.len(),
            fence_value
        );
        self.in_flight.push(list);
        fence_value
    }

    /// Sweep the in-flight set: every list whose fence has been reached gets
    /// its transients reclaimed and is moved into `free_lists`. Idempotent —
    /// polling with nothing newly completed changes nothing.
    pub fn poll_command_lists(
        &mut self,
        device: &mut NativeDevice,
        transients: &mut TransientResources,
        free_lists: &mut Vec<CommandList>,
    ) {
        let mut i = 0;
        while i < self.in_flight.len() {
            if self.reached(self.in_flight[i].fence_value) {
                let mut list = self.in_flight.swap_remove(i);
                transients.reclaim(device, &mut list);
                free_lists.push(list);
            } else {
                i += 1;
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Advance the completed counter by hand. Only meaningful with
    /// [`CompletionMode::Manual`].
    #[cfg(test)]
    pub(crate) fn complete_to(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorHeaps;
    use crate::types::{BufferDesc, BufferUsage};

    fn immediate() -> (NativeDevice, CommandQueue) {
        (
            NativeDevice::new(CompletionMode::Immediate),
            CommandQueue::new(QueueKind::Graphics, CompletionMode::Immediate),
        )
    }

    #[test]
    fn test_fence_monotonic() {
        let (_, mut queue) = immediate();
        let a = queue.signal();
        let b = queue.signal();
        assert_eq!((a, b), (1, 2));
        assert!(queue.reached(a));
        assert!(queue.reached(b));
        assert!(!queue.reached(3));
    }

    #[test]
    fn test_manual_completion() {
        let queue = CommandQueue::new(QueueKind::Graphics, CompletionMode::Manual);
        let mut queue = queue;
        let v = queue.signal();
        assert!(!queue.reached(v));
        queue.complete_to(v);
        assert!(queue.reached(v));
    }

    #[test]
    fn test_submit_executes_and_stamps_fence() {
        let (mut device, mut queue) = immediate();
        let src = device
            .create_buffer(&BufferDesc::new(4, BufferUsage::UPLOAD | BufferUsage::COPY_SRC))
            .unwrap();
        let dst = device
            .create_buffer(&BufferDesc::new(4, BufferUsage::COPY_DST))
            .unwrap();
        device.write_buffer(src, 0, &[5, 6, 7, 8]);

        let mut list = CommandList::new(QueueKind::Graphics);
        list.copy_buffer(src, 0, dst, 0, 4);
        let fence = queue.submit_command_list(list, &mut device);

        assert_eq!(fence, 1);
        assert_eq!(queue.in_flight_count(), 1);
        assert_eq!(device.read_buffer(dst, 0, 4), &[5, 6, 7, 8]);
    }

    #[test]
    #[should_panic(expected = "submitting a")]
    fn test_wrong_queue_kind_panics() {
        let (mut device, mut queue) = immediate();
        let list = CommandList::new(QueueKind::Copy);
        queue.submit_command_list(list, &mut device);
    }

    #[test]
    fn test_poll_returns_completed_lists_once() {
        let (mut device, mut queue) = immediate();
        let mut transients = TransientResources::new();
        let mut free = Vec::new();

        let list = CommandList::new(QueueKind::Graphics);
        queue.submit_command_list(list, &mut device);

        queue.poll_command_lists(&mut device, &mut transients, &mut free);
        assert_eq!(free.len(), 1);
        assert_eq!(queue.in_flight_count(), 0);

        // Idempotent: nothing new to collect.
        queue.poll_command_lists(&mut device, &mut transients, &mut free);
        assert_eq!(free.len(), 1);
    }

    #[test]
    fn test_poll_holds_lists_until_fence_reached() {
        let mut device = NativeDevice::new(CompletionMode::Manual);
        let mut queue = CommandQueue::new(QueueKind::Graphics, CompletionMode::Manual);
        let mut transients = TransientResources::new();
        let mut heaps = DescriptorHeaps::new();
        let mut free = Vec::new();

        let mut list = CommandList::new(QueueKind::Graphics);
        let slot = transients
            .constant_buffers
            .checkout(&mut device, &mut heaps, &[1])
            .unwrap();
        list.attach_constant_buffer(slot);
        let before = transients.constant_buffers.available_count();

        let fence = queue.submit_command_list(list, &mut device);

        // Fence not reached: list stays in flight, slot stays checked out.
        queue.poll_command_lists(&mut device, &mut transients, &mut free);
        assert!(free.is_empty());
        assert_eq!(queue.in_flight_count(), 1);
        assert_eq!(transients.constant_buffers.available_count(), before);

        queue.complete_to(fence);
        queue.poll_command_lists(&mut device, &mut transients, &mut free);
        assert_eq!(free.len(), 1);
        assert_eq!(transients.constant_buffers.available_count(), before + 1);
    }

    #[test]
    fn test_recycled_list_resets() {
        let (mut device, mut queue) = immediate();
        let mut transients = TransientResources::new();
        let mut free = Vec::new();

        let mut list = CommandList::new(QueueKind::Graphics);
        list.set_viewport(8, 8);
        queue.submit_command_list(list, &mut device);
        queue.poll_command_lists(&mut device, &mut transients, &mut free);

        let mut list = free.pop().unwrap();
        assert!(!list.is_recording());
        list.reset();
        assert!(list.is_recording());
        assert_eq!(list.command_count(), 0);
        assert_eq!(list.fence_value(), 0);
    }

    #[test]
    #[should_panic(expected = "not recording")]
    fn test_recording_into_submitted_list_panics() {
        let (mut device, mut queue) = immediate();
        let mut transients = TransientResources::new();
        let mut free = Vec::new();

        let list = CommandList::new(QueueKind::Graphics);
        queue.submit_command_list(list, &mut device);
        queue.poll_command_lists(&mut device, &mut transients, &mut free);
        free[0].set_viewport(1, 1);
    }

    #[test]
    fn test_flush_drains_queue() {
        let (_, mut queue) = immediate();
        queue.signal();
        queue.signal();
        queue.flush();
        assert_eq!(queue.completed_value(), queue.last_signaled());
    }
}
