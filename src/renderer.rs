//! The renderer: owns the device, queues, pools, and graph, and drives one
//! frame end to end.
//!
//! Frame flow: wait for the fence stamped the last time this back buffer was
//! presented, poll both queues to recycle finished command lists and their
//! transients, open a graphics list, checkout the frame's camera and light
//! constants, execute the render graph, copy its output into the back
//! buffer, submit, present, and stamp the back buffer's fence with the
//! submission value.
//!
//! Resident resources go through an explicit upload protocol on the copy
//! queue: open an upload context, create meshes and textures against it,
//! submit it for a ticket, and poll the ticket (or flush) before drawing
//! what it carried.

use bytemuck::cast_slice;

use crate::descriptor::{DescriptorHeaps, ResourceView};
use crate::device::{CompletionMode, NativeBufferId, NativeDevice, NativeTextureId, SwapChainDesc};
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::RenderInfo;
use crate::graph::{ExecuteContext, FrameConstants, RenderGraph};
use crate::queue::{CommandList, CommandQueue};
use crate::resources::{MeshHandle, MeshRecord, ResourceRegistry, TextureHandle, TextureRecord};
use crate::shader::{PipelineDesc, PipelineHandle, PipelineRegistry};
use crate::transient::TransientResources;
use crate::types::{
    BufferDesc, BufferUsage, QueueKind, ResourceState, TextureDesc, TextureFormat, TextureUsage,
    Vertex,
};

/// Renderer creation parameters.
#[derive(Debug, Clone)]
pub struct RendererDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub format: TextureFormat,
}

impl Default for RendererDesc {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            buffer_count: 3,
            format: TextureFormat::Bgra8Unorm,
        }
    }
}

/// Borrowed state handed to the graph builder callback.
pub struct GraphBuildContext<'a> {
    pub graph: &'a mut RenderGraph,
    pub device: &'a mut NativeDevice,
    pub heaps: &'a mut DescriptorHeaps,
    pub pipelines: &'a PipelineRegistry,
    pub width: u32,
    pub height: u32,
}

/// An open copy-queue recording for resident resource uploads.
pub struct UploadContext {
    list: CommandList,
}

/// Fence value identifying a submitted upload batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTicket(u64);

type GraphBuilder = Box<dyn FnMut(&mut GraphBuildContext<'_>)>;

pub struct Renderer {
    device: NativeDevice,
    heaps: DescriptorHeaps,
    pipelines: PipelineRegistry,
    resources: ResourceRegistry,
    transients: TransientResources,
    graphics_queue: CommandQueue,
    copy_queue: CommandQueue,
    free_lists: Vec<CommandList>,
    graph: RenderGraph,
    graph_builder: Option<GraphBuilder>,
    /// Fence value stamped when each back buffer was last presented.
    swapchain_fences: Vec<u64>,
    back_buffer_states: Vec<ResourceState>,
    width: u32,
    height: u32,
}

impl Renderer {
    pub fn new(desc: &RendererDesc) -> GraphicsResult<Self> {
        if desc.buffer_count < 2 {
            return Err(GraphicsError::InitializationFailed(format!(
                "need at least 2 swap chain buffers, got {}",
                desc.buffer_count
            )));
        }

        let mut device = NativeDevice::new(CompletionMode::Immediate);
        device.create_swap_chain(&SwapChainDesc {
            width: desc.width,
            height: desc.height,
            buffer_count: desc.buffer_count,
            format: desc.format,
        })?;
        log::info!("renderer created: {}x{}", desc.width, desc.height);

        Ok(Self {
            device,
            heaps: DescriptorHeaps::new(),
            pipelines: PipelineRegistry::new(),
            resources: ResourceRegistry::new(),
            transients: TransientResources::new(),
            graphics_queue: CommandQueue::new(QueueKind::Graphics, CompletionMode::Immediate),
            copy_queue: CommandQueue::new(QueueKind::Copy, CompletionMode::Immediate),
            free_lists: Vec::new(),
            graph: RenderGraph::new(),
            graph_builder: None,
            swapchain_fences: vec![0; desc.buffer_count as usize],
            back_buffer_states: vec![ResourceState::Common; desc.buffer_count as usize],
            width: desc.width,
            height: desc.height,
        })
    }

    pub fn create_pipeline(&mut self, desc: PipelineDesc) -> PipelineHandle {
        self.pipelines.create(desc)
    }

    /// Install the callback that declares the render graph. Runs on the next
    /// frame, and again whenever the graph is rebuilt after a resize.
    pub fn set_graph_builder(&mut self, builder: impl FnMut(&mut GraphBuildContext<'_>) + 'static) {
        if self.graph.is_built() {
            self.graphics_queue.flush();
            self.graph.reset(&mut self.device, &mut self.heaps);
        }
        self.graph_builder = Some(Box::new(builder));
    }

    /// Draw one frame.
    pub fn render(&mut self, frame: &RenderInfo) -> GraphicsResult<()> {
        if self.width == 0 || self.height == 0 {
            return Ok(());
        }

        // Reuse of this back buffer gates on its last presentation.
        let back_index = self.device.current_back_buffer_index() as usize;
        self.graphics_queue.wait(self.swapchain_fences[back_index]);
        self.poll_queues();

        if !self.graph.is_built() {
            self.build_graph();
        }

        let mut list = self.open_command_list(QueueKind::Graphics);
        let frame_constants = self.checkout_frame_constants(frame, &mut list)?;

        let presentable = self.graph.execute(&mut ExecuteContext {
            device: &mut self.device,
            heaps: &mut self.heaps,
            pipelines: &self.pipelines,
            resources: &self.resources,
            constants: &mut self.transients.constant_buffers,
            list: &mut list,
            frame,
            frame_constants: &frame_constants,
        })?;

        // Blit the graph's output into the back buffer.
        self.graph
            .transition(presentable, ResourceState::CopySrc, &mut list);
        let back_buffer = self.device.current_back_buffer();
        list.transition(
            back_buffer,
            self.back_buffer_states[back_index],
            ResourceState::CopyDst,
        );
        list.copy_texture(self.graph.texture_native(presentable), back_buffer);
        list.transition(back_buffer, ResourceState::CopyDst, ResourceState::Present);
        self.back_buffer_states[back_index] = ResourceState::Present;

        let fence = self
            .graphics_queue
            .submit_command_list(list, &mut self.device);
        self.device.present();
        self.swapchain_fences[back_index] = fence;
        Ok(())
    }

    /// React to a surface size change. Drains the GPU, resizes the swap
    /// chain, and tears the graph down for rebuild at the new size.
    pub fn resize(&mut self, width: u32, height: u32) -> GraphicsResult<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        log::info!("resize to {}x{}", width, height);

        self.graphics_queue.flush();
        self.copy_queue.flush();
        self.poll_queues();

        self.width = width;
        self.height = height;
        if width == 0 || height == 0 {
            // Minimized: keep everything, frames are skipped until restored.
            return Ok(());
        }

        self.device.resize_swap_chain(width, height)?;
        for fence in &mut self.swapchain_fences {
            *fence = 0;
        }
        for state in &mut self.back_buffer_states {
            *state = ResourceState::Common;
        }
        self.graph.reset(&mut self.device, &mut self.heaps);
        Ok(())
    }

    /// Begin recording resident resource uploads on the copy queue.
    pub fn open_upload_context(&mut self) -> UploadContext {
        UploadContext {
            list: self.open_command_list(QueueKind::Copy),
        }
    }

    /// Submit an upload batch. The returned ticket completes when the copy
    /// queue reaches it.
    pub fn submit_upload_context(&mut self, context: UploadContext) -> UploadTicket {
        UploadTicket(
            self.copy_queue
                .submit_command_list(context.list, &mut self.device),
        )
    }

    pub fn upload_finished(&self, ticket: UploadTicket) -> bool {
        self.copy_queue.reached(ticket.0)
    }

    /// Block until `ticket` has completed.
    pub fn flush_upload(&mut self, ticket: UploadTicket) {
        self.copy_queue.wait(ticket.0);
        self.poll_queues();
    }

    /// Block until all submitted uploads have completed.
    pub fn flush_uploads(&mut self) {
        self.copy_queue.flush();
        self.poll_queues();
    }

    /// Stage `bytes` through an upload pool and record a copy into `dst`.
    pub fn upload_buffer(
        &mut self,
        context: &mut UploadContext,
        dst: NativeBufferId,
        dst_offset: u64,
        bytes: &[u8],
    ) -> GraphicsResult<()> {
        let allocation = self.transients.uploads.allocate(
            &mut self.device,
            context.list.upload_pools_mut(),
            bytes.len() as u64,
        )?;
        self.device
            .write_buffer(allocation.buffer, allocation.offset, bytes);
        context.list.copy_buffer(
            allocation.buffer,
            allocation.offset,
            dst,
            dst_offset,
            bytes.len() as u64,
        );
        Ok(())
    }

    /// Stage `pixels` through an upload pool and record a full-surface copy
    /// into `dst`.
    pub fn upload_texture(
        &mut self,
        context: &mut UploadContext,
        dst: NativeTextureId,
        pixels: &[u8],
    ) -> GraphicsResult<()> {
        let allocation = self.transients.uploads.allocate(
            &mut self.device,
            context.list.upload_pools_mut(),
            pixels.len() as u64,
        )?;
        self.device
            .write_buffer(allocation.buffer, allocation.offset, pixels);
        context
            .list
            .transition(dst, ResourceState::Common, ResourceState::CopyDst);
        context
            .list
            .copy_buffer_to_texture(allocation.buffer, allocation.offset, dst);
        context
            .list
            .transition(dst, ResourceState::CopyDst, ResourceState::Common);
        Ok(())
    }

    /// Create a GPU-resident mesh, staging its data through `context`.
    ///
    /// The mesh must not be drawn until the context's ticket has completed.
    pub fn create_mesh(
        &mut self,
        context: &mut UploadContext,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> GraphicsResult<MeshHandle> {
        assert!(!vertices.is_empty() && !indices.is_empty(), "empty mesh");

        let vertex_bytes: &[u8] = cast_slice(vertices);
        let vertex_buffer = self.device.create_buffer(&BufferDesc::new(
            vertex_bytes.len() as u64,
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
        ))?;
        self.upload_buffer(context, vertex_buffer, 0, vertex_bytes)?;

        let index_bytes: &[u8] = cast_slice(indices);
        let index_buffer = self.device.create_buffer(&BufferDesc::new(
            index_bytes.len() as u64,
            BufferUsage::INDEX | BufferUsage::COPY_DST,
        ))?;
        self.upload_buffer(context, index_buffer, 0, index_bytes)?;

        Ok(self.resources.insert_mesh(MeshRecord {
            vertex_buffer,
            vertex_count: vertices.len() as u32,
            index_buffer,
            index_count: indices.len() as u32,
        }))
    }

    /// Create a GPU-resident texture with an SRV, staging `pixels` through
    /// `context`.
    pub fn create_texture(
        &mut self,
        context: &mut UploadContext,
        desc: TextureDesc,
        pixels: &[u8],
    ) -> GraphicsResult<TextureHandle> {
        assert!(
            desc.usage.contains(TextureUsage::TEXTURE_BINDING),
            "resident textures need TEXTURE_BINDING usage"
        );
        assert_eq!(
            pixels.len() as u64,
            desc.byte_size(),
            "pixel data does not match texture dimensions"
        );

        let texture = self.device.create_texture(&desc)?;
        self.upload_texture(context, texture, pixels)?;

        let srv = self.heaps.srv.alloc(ResourceView::Texture { texture });
        Ok(self.resources.insert_texture(TextureRecord { texture, srv, desc }))
    }

    /// Release a mesh. The caller guarantees no in-flight frame still draws
    /// it; flush first when unsure.
    pub fn free_mesh(&mut self, handle: MeshHandle) {
        let record = self.resources.remove_mesh(handle);
        self.device.destroy_buffer(record.vertex_buffer);
        self.device.destroy_buffer(record.index_buffer);
    }

    /// Release a texture and its SRV. Same in-flight contract as
    /// [`free_mesh`](Self::free_mesh).
    pub fn free_texture(&mut self, handle: TextureHandle) {
        let record = self.resources.remove_texture(handle);
        self.heaps.srv.free(record.srv);
        self.device.destroy_texture(record.texture);
    }

    pub fn mesh_count(&self) -> usize {
        self.resources.mesh_count()
    }

    pub fn texture_count(&self) -> usize {
        self.resources.texture_count()
    }

    /// Get an open command list for `kind`: recycle a completed one if the
    /// pool has it, otherwise create one.
    fn open_command_list(&mut self, kind: QueueKind) -> CommandList {
        let queue = match kind {
            QueueKind::Graphics => &mut self.graphics_queue,
            QueueKind::Copy => &mut self.copy_queue,
        };
        queue.poll_command_lists(&mut self.device, &mut self.transients, &mut self.free_lists);

        match self.free_lists.iter().position(|list| list.kind() == kind) {
            Some(index) => {
                let mut list = self.free_lists.swap_remove(index);
                list.reset();
                list
            }
            None => {
                log::debug!("creating new {:?} command list", kind);
                CommandList::new(kind)
            }
        }
    }

    fn poll_queues(&mut self) {
        self.graphics_queue.poll_command_lists(
            &mut self.device,
            &mut self.transients,
            &mut self.free_lists,
        );
        self.copy_queue.poll_command_lists(
            &mut self.device,
            &mut self.transients,
            &mut self.free_lists,
        );
    }

    fn build_graph(&mut self) {
        let mut builder = self.graph_builder.take().expect("no graph builder set");
        builder(&mut GraphBuildContext {
            graph: &mut self.graph,
            device: &mut self.device,
            heaps: &mut self.heaps,
            pipelines: &self.pipelines,
            width: self.width,
            height: self.height,
        });
        self.graph_builder = Some(builder);

        if let Err(err) = self.graph.build() {
            panic!("render graph build failed: {err}");
        }
    }

    fn checkout_frame_constants(
        &mut self,
        frame: &RenderInfo,
        list: &mut CommandList,
    ) -> GraphicsResult<FrameConstants> {
        let aspect = self.width as f32 / self.height as f32;
        let camera = self.transients.constant_buffers.checkout(
            &mut self.device,
            &mut self.heaps,
            bytemuck::bytes_of(&frame.camera.uniform(aspect)),
        )?;
        let lights = self.transients.constant_buffers.checkout(
            &mut self.device,
            &mut self.heaps,
            bytemuck::bytes_of(&frame.lights_uniform()),
        )?;
        let constants = FrameConstants {
            camera: camera.descriptor,
            lights: lights.descriptor,
        };
        list.attach_constant_buffer(camera);
        list.attach_constant_buffer(lights);
        Ok(constants)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.graphics_queue.flush();
        self.copy_queue.flush();
        self.poll_queues();
        log::info!("renderer shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Camera, MeshInstance};
    use crate::shader::{PipelineKind, ShaderReflection};
    use crate::types::ClearValue;
    use glam::{Mat4, Vec2, Vec3, Vec4};

    fn small_desc() -> RendererDesc {
        RendererDesc {
            width: 64,
            height: 64,
            buffer_count: 2,
            format: TextureFormat::Rgba8Unorm,
        }
    }

    fn forward_renderer() -> Renderer {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut renderer = Renderer::new(&small_desc()).unwrap();
        let pipeline = renderer.create_pipeline(PipelineDesc {
            label: "forward".to_string(),
            kind: PipelineKind::Raster,
            reflection: ShaderReflection::new()
                .with_binding("camera", 0)
                .with_binding("lights", 1)
                .with_binding("object", 2),
        });

        renderer.set_graph_builder(move |ctx| {
            let color = ctx
                .graph
                .create_texture(
                    ctx.device,
                    ctx.heaps,
                    TextureDesc::new_2d(
                        ctx.width,
                        ctx.height,
                        TextureFormat::Rgba8Unorm,
                        TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
                    )
                    .with_clear(ClearValue::Color([0.1, 0.1, 0.1, 1.0])),
                )
                .unwrap();
            let depth = ctx
                .graph
                .create_texture(
                    ctx.device,
                    ctx.heaps,
                    TextureDesc::new_2d(
                        ctx.width,
                        ctx.height,
                        TextureFormat::Depth32Float,
                        TextureUsage::RENDER_ATTACHMENT,
                    )
                    .with_clear(ClearValue::Depth(1.0)),
                )
                .unwrap();

            let forward = ctx
                .graph
                .add_pass("forward", pipeline, ctx.pipelines)
                .render_target(color)
                .depth_buffer(depth)
                .execute(|pass| {
                    let camera = pass.frame_constants.camera;
                    let lights = pass.frame_constants.lights;
                    pass.bind_constant("camera", camera);
                    pass.bind_constant("lights", lights);
                    let instances = pass.frame.instances.clone();
                    for instance in &instances {
                        pass.draw_mesh(instance).unwrap();
                    }
                });
            ctx.graph.set_final_pass(forward);
        });
        renderer
    }

    fn quad() -> (Vec<Vertex>, Vec<u32>) {
        let vertex = |x: f32, y: f32| Vertex {
            position: Vec3::new(x, y, 0.0),
            normal: Vec3::Z,
            uv: Vec2::new(x, y),
            tangent: Vec4::X,
        };
        (
            vec![
                vertex(0.0, 0.0),
                vertex(1.0, 0.0),
                vertex(1.0, 1.0),
                vertex(0.0, 1.0),
            ],
            vec![0, 1, 2, 0, 2, 3],
        )
    }

    #[test]
    fn test_render_three_frames() {
        let mut renderer = forward_renderer();
        let frame = RenderInfo {
            camera: Camera::default(),
            ..RenderInfo::default()
        };

        for _ in 0..3 {
            renderer.render(&frame).unwrap();
        }
        assert!(renderer.graph.is_built());
        // Back buffers alternate with a 2-deep swap chain.
        assert_eq!(renderer.device.current_back_buffer_index(), 1);
    }

    #[test]
    fn test_command_lists_are_recycled() {
        let mut renderer = forward_renderer();
        let frame = RenderInfo::default();

        for _ in 0..4 {
            renderer.render(&frame).unwrap();
        }
        // Immediate completion: each frame recycles the previous frame's
        // list, so at most one graphics list ever exists.
        let total = renderer.free_lists.len() + renderer.graphics_queue.in_flight_count();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_frame_constants_are_reclaimed() {
        let mut renderer = forward_renderer();
        let frame = RenderInfo::default();

        renderer.render(&frame).unwrap();
        renderer.render(&frame).unwrap();
        renderer.poll_queues();

        // Two constants per frame, recycled after their fences pass: the
        // pool never grows past one batch.
        assert_eq!(renderer.transients.constant_buffers.batch_count(), 1);
    }

    #[test]
    fn test_mesh_upload_and_draw() {
        let mut renderer = forward_renderer();
        let (vertices, indices) = quad();

        let mut upload = renderer.open_upload_context();
        let mesh = renderer.create_mesh(&mut upload, &vertices, &indices).unwrap();
        let ticket = renderer.submit_upload_context(upload);
        assert!(renderer.upload_finished(ticket));

        // Staged bytes landed in the resident vertex buffer.
        let record = renderer.resources.mesh(mesh);
        let uploaded = renderer.device.read_buffer(
            record.vertex_buffer,
            0,
            (vertices.len() * std::mem::size_of::<Vertex>()) as u64,
        );
        assert_eq!(uploaded, cast_slice::<Vertex, u8>(&vertices));

        let frame = RenderInfo {
            instances: vec![MeshInstance {
                mesh,
                transform: Mat4::IDENTITY,
                base_color: Vec4::ONE,
            }],
            ..RenderInfo::default()
        };
        renderer.render(&frame).unwrap();
    }

    #[test]
    fn test_texture_upload() {
        let mut renderer = forward_renderer();
        let pixels = vec![200u8; 4 * 4 * 4];

        let mut upload = renderer.open_upload_context();
        let texture = renderer
            .create_texture(
                &mut upload,
                TextureDesc::new_2d(
                    4,
                    4,
                    TextureFormat::Rgba8Unorm,
                    TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
                ),
                &pixels,
            )
            .unwrap();
        renderer.submit_upload_context(upload);
        renderer.flush_uploads();

        let record = renderer.resources.texture(texture);
        assert_eq!(renderer.device.read_texture(record.texture), &pixels[..]);

        renderer.free_texture(texture);
        assert_eq!(renderer.texture_count(), 0);
    }

    #[test]
    fn test_resize_rebuilds_graph() {
        let mut renderer = forward_renderer();
        let frame = RenderInfo::default();

        renderer.render(&frame).unwrap();
        assert!(renderer.graph.is_built());

        renderer.resize(128, 32).unwrap();
        assert!(!renderer.graph.is_built());

        renderer.render(&frame).unwrap();
        assert!(renderer.graph.is_built());
        assert_eq!(renderer.device.swap_chain_extent(), (128, 32));
    }

    #[test]
    fn test_minimized_surface_skips_frames() {
        let mut renderer = forward_renderer();
        let frame = RenderInfo::default();

        renderer.resize(0, 0).unwrap();
        renderer.render(&frame).unwrap();
        assert!(!renderer.graph.is_built());

        renderer.resize(64, 64).unwrap();
        renderer.render(&frame).unwrap();
        assert!(renderer.graph.is_built());
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_freed_mesh_handle_is_stale() {
        let mut renderer = forward_renderer();
        let (vertices, indices) = quad();

        let mut upload = renderer.open_upload_context();
        let mesh = renderer.create_mesh(&mut upload, &vertices, &indices).unwrap();
        let ticket = renderer.submit_upload_context(upload);
        renderer.flush_upload(ticket);

        renderer.free_mesh(mesh);
        renderer.free_mesh(mesh);
    }

    #[test]
    fn test_renderer_requires_two_buffers() {
        let result = Renderer::new(&RendererDesc {
            buffer_count: 1,
            ..small_desc()
        });
        assert!(matches!(result, Err(GraphicsError::InitializationFailed(_))));
    }
}
