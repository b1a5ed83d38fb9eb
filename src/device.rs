//! Simulated native device layer.
//!
//! This is the layer a D3D12 or Vulkan backend would replace: buffers,
//! textures, a swap chain, and execution of recorded command streams. Buffers
//! live in CPU memory and are mappable, so upload paths move real bytes and
//! tests can observe them. Everything above this module — descriptor heaps,
//! queues, transient pools, the render graph — is backend-agnostic and
//! interacts with the device only through ids and recorded commands.
//!
//! Queue completion is a monotonic counter owned by [`crate::queue::CommandQueue`];
//! with [`CompletionMode::Immediate`] the counter follows signals instantly
//! (the device "executes" submissions synchronously), while
//! [`CompletionMode::Manual`] leaves it under test control so fence-gated
//! reclamation can be observed mid-flight.

use crate::error::{GraphicsError, GraphicsResult};
use crate::handle::Handle;
use crate::types::{BufferDesc, BufferUsage, ResourceState, TextureDesc, TextureFormat};

/// Identifies a buffer owned by the native device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeBufferId(u32);

/// Identifies a texture owned by the native device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeTextureId(u32);

/// How submitted work reaches completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Work completes as soon as it is signaled. Default for the simulated
    /// device, where execution is synchronous.
    #[default]
    Immediate,
    /// Completion advances only when explicitly told to. Used by tests that
    /// need work to stay in flight.
    Manual,
}

/// A single recorded GPU command.
#[derive(Debug, Clone)]
pub enum Command {
    Transition {
        texture: NativeTextureId,
        from: ResourceState,
        to: ResourceState,
    },
    ClearRenderTarget {
        texture: NativeTextureId,
        color: [f32; 4],
    },
    ClearDepth {
        texture: NativeTextureId,
        depth: f32,
    },
    SetViewport {
        width: u32,
        height: u32,
    },
    SetRenderTargets {
        colors: Vec<NativeTextureId>,
        depth: Option<NativeTextureId>,
    },
    SetPipeline {
        pipeline: Handle,
    },
    SetRootDescriptor {
        offset: u32,
        descriptor_index: u32,
    },
    SetVertexBuffer {
        buffer: NativeBufferId,
    },
    SetIndexBuffer {
        buffer: NativeBufferId,
    },
    DrawIndexed {
        index_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: NativeBufferId,
        src_offset: u64,
        dst: NativeBufferId,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: NativeBufferId,
        src_offset: u64,
        dst: NativeTextureId,
    },
    CopyTexture {
        src: NativeTextureId,
        dst: NativeTextureId,
    },
}

#[derive(Debug)]
struct NativeBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

#[derive(Debug)]
struct NativeTexture {
    desc: TextureDesc,
    data: Vec<u8>,
}

/// Swap-chain descriptor.
#[derive(Debug, Clone)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub format: TextureFormat,
}

#[derive(Debug)]
struct SwapChain {
    desc: SwapChainDesc,
    buffers: Vec<NativeTextureId>,
    current: u32,
}

/// The simulated native device.
#[derive(Debug)]
pub struct NativeDevice {
    buffers: Vec<Option<NativeBuffer>>,
    textures: Vec<Option<NativeTexture>>,
    swap_chain: Option<SwapChain>,
    completion: CompletionMode,
}

impl NativeDevice {
    pub fn new(completion: CompletionMode) -> Self {
        log::info!("native device created ({:?} completion)", completion);
        Self {
            buffers: Vec::new(),
            textures: Vec::new(),
            swap_chain: None,
            completion,
        }
    }

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> GraphicsResult<NativeBufferId> {
        if desc.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        let id = NativeBufferId(self.buffers.len() as u32);
        self.buffers.push(Some(NativeBuffer {
            data: vec![0; desc.size as usize],
            desc: desc.clone(),
        }));
        Ok(id)
    }

    pub fn destroy_buffer(&mut self, id: NativeBufferId) {
        let slot = &mut self.buffers[id.0 as usize];
        assert!(slot.is_some(), "buffer {:?} already destroyed", id);
        *slot = None;
    }

    /// Write through a buffer's mapped pointer.
    ///
    /// Only `UPLOAD` buffers are CPU-writable; GPU-resident buffers receive
    /// data through recorded copies.
    pub fn write_buffer(&mut self, id: NativeBufferId, offset: u64, bytes: &[u8]) {
        let buffer = self.buffer_mut(id);
        assert!(
            buffer.desc.usage.contains(BufferUsage::UPLOAD),
            "buffer {:?} is not CPU-writable",
            id
        );
        let start = offset as usize;
        let end = start + bytes.len();
        assert!(end <= buffer.data.len(), "write past end of buffer {:?}", id);
        buffer.data[start..end].copy_from_slice(bytes);
    }

    pub fn read_buffer(&self, id: NativeBufferId, offset: u64, len: u64) -> &[u8] {
        let buffer = self.buffer(id);
        let start = offset as usize;
        let end = start + len as usize;
        assert!(end <= buffer.data.len(), "read past end of buffer {:?}", id);
        &buffer.data[start..end]
    }

    pub fn create_texture(&mut self, desc: &TextureDesc) -> GraphicsResult<NativeTextureId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::InvalidParameter(
                "texture dimensions cannot be zero".to_string(),
            ));
        }
        let id = NativeTextureId(self.textures.len() as u32);
        self.textures.push(Some(NativeTexture {
            data: vec![0; desc.byte_size() as usize],
            desc: desc.clone(),
        }));
        Ok(id)
    }

    pub fn destroy_texture(&mut self, id: NativeTextureId) {
        let slot = &mut self.textures[id.0 as usize];
        assert!(slot.is_some(), "texture {:?} already destroyed", id);
        *slot = None;
    }

    pub fn texture_desc(&self, id: NativeTextureId) -> &TextureDesc {
        &self.texture(id).desc
    }

    pub fn read_texture(&self, id: NativeTextureId) -> &[u8] {
        &self.texture(id).data
    }

    /// Create the swap chain. Fails rather than panics: surface setup is the
    /// boundary with platform code, and startup wants a diagnostic it can
    /// report.
    pub fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> GraphicsResult<()> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::SwapchainCreationFailed(
                "zero-sized surface".to_string(),
            ));
        }
        if desc.buffer_count < 2 {
            return Err(GraphicsError::SwapchainCreationFailed(format!(
                "need at least 2 buffers, got {}",
                desc.buffer_count
            )));
        }

        let buffers = self.create_swap_chain_buffers(desc)?;
        self.swap_chain = Some(SwapChain {
            desc: desc.clone(),
            buffers,
            current: 0,
        });
        log::info!(
            "swap chain created: {}x{} x{} {:?}",
            desc.width,
            desc.height,
            desc.buffer_count,
            desc.format
        );
        Ok(())
    }

    /// Resize the swap chain, releasing and re-acquiring its buffers.
    ///
    /// The caller must have flushed the queue beforehand; back buffers are
    /// destroyed here unconditionally.
    pub fn resize_swap_chain(&mut self, width: u32, height: u32) -> GraphicsResult<()> {
        let old = self.swap_chain.take().expect("no swap chain to resize");
        let mut desc = old.desc.clone();
        for id in old.buffers {
            self.destroy_texture(id);
        }

        desc.width = width;
        desc.height = height;
        self.create_swap_chain(&desc)
    }

    pub fn swap_chain_buffers(&self) -> &[NativeTextureId] {
        &self.swap_chain().buffers
    }

    pub fn swap_chain_extent(&self) -> (u32, u32) {
        let desc = &self.swap_chain().desc;
        (desc.width, desc.height)
    }

    pub fn current_back_buffer_index(&self) -> u32 {
        self.swap_chain().current
    }

    pub fn current_back_buffer(&self) -> NativeTextureId {
        let sc = self.swap_chain();
        sc.buffers[sc.current as usize]
    }

    /// Present the current back buffer and advance to the next one.
    pub fn present(&mut self) {
        let sc = self
            .swap_chain
            .as_mut()
            .expect("no swap chain to present to");
        sc.current = (sc.current + 1) % sc.desc.buffer_count;
    }

    /// Execute a recorded command stream.
    ///
    /// Copies move real bytes so uploads are observable; draw, dispatch, and
    /// state commands are accepted and dropped, as a real GPU's effects are
    /// out of scope for the simulated device.
    pub(crate) fn execute(&mut self, commands: &[Command]) {
        for command in commands {
            match command {
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let data = self
                        .read_buffer(*src, *src_offset, *size)
                        .to_vec();
                    let dst_buf = self.buffer_mut(*dst);
                    let start = *dst_offset as usize;
                    let end = start + data.len();
                    assert!(end <= dst_buf.data.len(), "copy past end of buffer {:?}", dst);
                    dst_buf.data[start..end].copy_from_slice(&data);
                }
                Command::CopyBufferToTexture {
                    src,
                    src_offset,
                    dst,
                } => {
                    let size = self.texture(*dst).data.len() as u64;
                    let data = self.read_buffer(*src, *src_offset, size).to_vec();
                    self.texture_mut(*dst).data.copy_from_slice(&data);
                }
                Command::CopyTexture { src, dst } => {
                    let data = self.texture(*src).data.clone();
                    let dst_tex = self.texture_mut(*dst);
                    assert_eq!(
                        data.len(),
                        dst_tex.data.len(),
                        "texture copy size mismatch"
                    );
                    dst_tex.data.copy_from_slice(&data);
                }
                // State, draw, and barrier commands have no CPU-visible effect.
                _ => {}
            }
        }
    }

    fn create_swap_chain_buffers(
        &mut self,
        desc: &SwapChainDesc,
    ) -> GraphicsResult<Vec<NativeTextureId>> {
        (0..desc.buffer_count)
            .map(|i| {
                self.create_texture(
                    &TextureDesc::new_2d(
                        desc.width,
                        desc.height,
                        desc.format,
                        crate::types::TextureUsage::RENDER_ATTACHMENT
                            | crate::types::TextureUsage::COPY_DST,
                    )
                    .with_label(format!("swap_chain_{i}")),
                )
            })
            .collect()
    }

    fn swap_chain(&self) -> &SwapChain {
        self.swap_chain.as_ref().expect("no swap chain")
    }

    fn buffer(&self, id: NativeBufferId) -> &NativeBuffer {
        self.buffers[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("buffer {:?} destroyed", id))
    }

    fn buffer_mut(&mut self, id: NativeBufferId) -> &mut NativeBuffer {
        self.buffers[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("buffer {:?} destroyed", id))
    }

    fn texture(&self, id: NativeTextureId) -> &NativeTexture {
        self.textures[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("texture {:?} destroyed", id))
    }

    fn texture_mut(&mut self, id: NativeTextureId) -> &mut NativeTexture {
        self.textures[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("texture {:?} destroyed", id))
    }
}
