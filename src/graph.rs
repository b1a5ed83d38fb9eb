//! Versioned render graph.
//!
//! Passes declare reads and writes against graph textures before any command
//! is recorded. Every write bumps the texture's version, and each
//! `(texture, version)` pair remembers the pass that produced it; a read of
//! version `v` therefore names exactly one producer, and the dependency edges
//! fall out of the declarations with no manual ordering. `build` walks those
//! edges depth-first from the final pass to produce the execution order (and
//! rejects cycles); `execute` then replays the order, inserting state
//! transitions and first-use clears before each pass's callback records its
//! draws.
//!
//! The graph is built once and executed every frame; `reset` tears it down
//! for rebuild when the surface size changes.

use std::collections::HashMap;

use thiserror::Error;

use crate::descriptor::{Descriptor, DescriptorHeaps, ResourceView, ViewKind};
use crate::device::{NativeDevice, NativeTextureId};
use crate::error::GraphicsResult;
use crate::frame::RenderInfo;
use crate::queue::CommandList;
use crate::resources::ResourceRegistry;
use crate::shader::{PipelineHandle, PipelineKind, PipelineRegistry, ShaderReflection};
use crate::transient::ConstantBufferPool;
use crate::types::{ClearValue, ResourceState, TextureDesc, TextureUsage};

/// Most bindings a single pass may declare.
const MAX_PASS_BINDINGS: usize = 16;

/// Errors detected when compiling the declared passes into an execution
/// order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("render graph contains a cycle through pass '{0}'")]
    Cycle(String),
    #[error("no final pass set")]
    MissingFinalPass,
}

/// A texture owned by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphTexture(u32);

/// A declared pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassHandle(u32);

/// Constant buffer descriptors shared by every pass in a frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameConstants {
    pub camera: Descriptor,
    pub lights: Descriptor,
}

/// Everything a pass callback may touch while recording.
pub struct PassExec<'a> {
    pub device: &'a mut NativeDevice,
    pub heaps: &'a mut DescriptorHeaps,
    pub constants: &'a mut ConstantBufferPool,
    pub resources: &'a ResourceRegistry,
    pub list: &'a mut CommandList,
    pub frame: &'a RenderInfo,
    pub frame_constants: &'a FrameConstants,
    pub reflection: &'a ShaderReflection,
}

impl PassExec<'_> {
    /// Bind a frame constant by shader binding name.
    pub fn bind_constant(&mut self, name: &str, descriptor: Descriptor) {
        let offset = self.reflection.binding_offset(name);
        self.list.set_root_descriptor(offset, descriptor);
    }

    /// Record one mesh instance: checkout its object constants, bind its
    /// buffers, draw.
    pub fn draw_mesh(&mut self, instance: &crate::frame::MeshInstance) -> GraphicsResult<()> {
        let uniform = crate::types::ObjectUniform {
            model: instance.transform,
            base_color: instance.base_color,
        };
        let slot =
            self.constants
                .checkout(self.device, self.heaps, bytemuck::bytes_of(&uniform))?;
        let descriptor = slot.descriptor;
        self.list.attach_constant_buffer(slot);
        self.bind_constant("object", descriptor);

        let mesh = self.resources.mesh(instance.mesh);
        self.list.set_vertex_buffer(mesh.vertex_buffer);
        self.list.set_index_buffer(mesh.index_buffer);
        self.list.draw_indexed(mesh.index_count);
        Ok(())
    }
}

/// Borrowed state the graph needs while replaying the execution order.
pub struct ExecuteContext<'a> {
    pub device: &'a mut NativeDevice,
    pub heaps: &'a mut DescriptorHeaps,
    pub pipelines: &'a PipelineRegistry,
    pub resources: &'a ResourceRegistry,
    pub constants: &'a mut ConstantBufferPool,
    pub list: &'a mut CommandList,
    pub frame: &'a RenderInfo,
    pub frame_constants: &'a FrameConstants,
}

type PassCallback = Box<dyn FnMut(&mut PassExec<'_>)>;

struct TextureState {
    desc: TextureDesc,
    version: u32,
    state: ResourceState,
    resource: NativeTextureId,
    srv: Option<Descriptor>,
    rtv: Option<Descriptor>,
    dsv: Option<Descriptor>,
    uav: Option<Descriptor>,
}

struct Node {
    name: String,
    pipeline: PipelineHandle,
    kind: PipelineKind,
    callback: Option<PassCallback>,
    reads: Vec<(GraphTexture, u32)>,
    writes: Vec<(GraphTexture, u32)>,
    color_targets: Vec<GraphTexture>,
    depth_target: Option<GraphTexture>,
    /// (root offset, texture, view kind) resolved at declaration.
    bindings: Vec<(u32, GraphTexture, ViewKind)>,
    parents: Vec<usize>,
}

/// The render graph.
pub struct RenderGraph {
    textures: Vec<TextureState>,
    nodes: Vec<Node>,
    /// (texture index, version) -> producing node.
    owners: HashMap<(u32, u32), usize>,
    final_pass: Option<usize>,
    order: Vec<usize>,
    built: bool,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            textures: Vec::new(),
            nodes: Vec::new(),
            owners: HashMap::new(),
            final_pass: None,
            order: Vec::new(),
            built: false,
        }
    }

    /// Declare a graph texture and realize it on the device, creating the
    /// views its usage flags call for.
    pub fn create_texture(
        &mut self,
        device: &mut NativeDevice,
        heaps: &mut DescriptorHeaps,
        desc: TextureDesc,
    ) -> GraphicsResult<GraphTexture> {
        let resource = device.create_texture(&desc)?;
        let view = ResourceView::Texture { texture: resource };

        let rtv = (desc.usage.contains(TextureUsage::RENDER_ATTACHMENT)
            && !desc.format.is_depth())
        .then(|| heaps.rtv.alloc(view.clone()));
        let dsv = (desc.usage.contains(TextureUsage::RENDER_ATTACHMENT)
            && desc.format.is_depth())
        .then(|| heaps.dsv.alloc(view.clone()));
        let srv = desc
            .usage
            .contains(TextureUsage::TEXTURE_BINDING)
            .then(|| heaps.srv.alloc(view.clone()));
        let uav = desc
            .usage
            .contains(TextureUsage::STORAGE_BINDING)
            .then(|| heaps.uav.alloc(view));

        let index = self.textures.len() as u32;
        self.textures.push(TextureState {
            desc,
            version: 0,
            state: ResourceState::Common,
            resource,
            srv,
            rtv,
            dsv,
            uav,
        });
        Ok(GraphTexture(index))
    }

    pub fn texture_native(&self, texture: GraphTexture) -> NativeTextureId {
        self.texture(texture).resource
    }

    /// Declare a pass. Reads and writes are resolved against the pipeline's
    /// reflection as they are declared on the returned builder.
    pub fn add_pass(
        &mut self,
        name: impl Into<String>,
        pipeline: PipelineHandle,
        pipelines: &PipelineRegistry,
    ) -> PassBuilder<'_> {
        assert!(!self.built, "adding a pass to a built graph");
        let info = pipelines.get(pipeline);
        let reflection = info.reflection().clone();
        let index = self.nodes.len();
        self.nodes.push(Node {
            name: name.into(),
            pipeline,
            kind: info.kind(),
            callback: None,
            reads: Vec::new(),
            writes: Vec::new(),
            color_targets: Vec::new(),
            depth_target: None,
            bindings: Vec::new(),
            parents: Vec::new(),
        });
        PassBuilder {
            graph: self,
            reflection,
            index,
        }
    }

    /// The pass whose output is presented; roots the dependency walk.
    pub fn set_final_pass(&mut self, pass: PassHandle) {
        self.final_pass = Some(pass.0 as usize);
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn pass_count(&self) -> usize {
        self.nodes.len()
    }

    /// Compile the declared passes into an execution order.
    pub fn build(&mut self) -> Result<(), GraphError> {
        assert!(!self.built, "graph already built");
        let final_pass = self.final_pass.ok_or(GraphError::MissingFinalPass)?;

        for index in 0..self.nodes.len() {
            let mut parents = Vec::new();
            for &(texture, version) in &self.nodes[index].reads {
                if version == 0 {
                    // Contents come from outside the graph (uploads).
                    continue;
                }
                let owner = *self
                    .owners
                    .get(&(texture.0, version))
                    .unwrap_or_else(|| {
                        panic!(
                            "pass '{}' reads texture version {} that no pass produces",
                            self.nodes[index].name, version
                        )
                    });
                if owner != index && !parents.contains(&owner) {
                    parents.push(owner);
                }
            }
            // Writing version v comes after the producer of v-1.
            for &(texture, version) in &self.nodes[index].writes {
                if version > 1 {
                    let owner = self.owners[&(texture.0, version - 1)];
                    if owner != index && !parents.contains(&owner) {
                        parents.push(owner);
                    }
                }
            }
            self.nodes[index].parents = parents;
        }

        self.order = self.post_order(final_pass)?;
        self.built = true;
        log::debug!(
            "render graph built: {} of {} passes in order {:?}",
            self.order.len(),
            self.nodes.len(),
            self.order
        );
        Ok(())
    }

    fn post_order(&self, root: usize) -> Result<Vec<usize>, GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::new();
        // (node, next parent edge to follow)
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::OnStack;

        while let Some(&mut (node, ref mut edge)) = stack.last_mut() {
            if *edge < self.nodes[node].parents.len() {
                let parent = self.nodes[node].parents[*edge];
                *edge += 1;
                match marks[parent] {
                    Mark::OnStack => {
                        return Err(GraphError::Cycle(self.nodes[parent].name.clone()))
                    }
                    Mark::Unvisited => {
                        marks[parent] = Mark::OnStack;
                        stack.push((parent, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                order.push(node);
                stack.pop();
            }
        }
        Ok(order)
    }

    /// Passes in the order `execute` will run them. Empty until built.
    pub fn execution_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|&i| self.nodes[i].name.as_str())
    }

    /// Replay the built graph into `ctx.list` and return the texture to
    /// present.
    pub fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> GraphicsResult<GraphTexture> {
        assert!(self.built, "executing an unbuilt graph");

        for position in 0..self.order.len() {
            let index = self.order[position];
            let node = &self.nodes[index];
            let kind = node.kind;
            let pipeline = node.pipeline;
            let name = node.name.clone();
            let reads = node.reads.clone();
            let writes = node.writes.clone();
            let color_targets = node.color_targets.clone();
            let depth_target = node.depth_target;
            let bindings = node.bindings.clone();
            log::trace!("pass '{}'", name);

            for &(texture, _) in &reads {
                self.transition(texture, ResourceState::ShaderResource, ctx.list);
            }
            for &texture in &color_targets {
                self.transition(texture, ResourceState::RenderTarget, ctx.list);
            }
            if let Some(texture) = depth_target {
                self.transition(texture, ResourceState::DepthWrite, ctx.list);
            }
            for &(_, texture, view) in &bindings {
                if view == ViewKind::UnorderedAccess {
                    self.transition(texture, ResourceState::UnorderedAccess, ctx.list);
                }
            }

            // First write into a cleared texture starts from its clear value.
            for &(texture, version) in &writes {
                if version != 1 {
                    continue;
                }
                let state = self.texture(texture);
                match state.desc.clear {
                    Some(ClearValue::Color(color)) => {
                        ctx.list.clear_render_target(state.resource, color)
                    }
                    Some(ClearValue::Depth(depth)) => {
                        ctx.list.clear_depth(state.resource, depth)
                    }
                    None => {}
                }
            }

            if kind == PipelineKind::Raster {
                let colors: Vec<_> = color_targets
                    .iter()
                    .map(|&t| self.texture(t).resource)
                    .collect();
                let depth = depth_target.map(|t| self.texture(t).resource);
                ctx.list.set_render_targets(colors, depth);

                let extent = color_targets.first().copied().or(depth_target).map(|t| {
                    let desc = &self.texture(t).desc;
                    (desc.width, desc.height)
                });
                if let Some((width, height)) = extent {
                    ctx.list.set_viewport(width, height);
                }
            }
            ctx.list.set_pipeline(pipeline.raw());

            for &(offset, texture, view) in &bindings {
                let state = self.texture(texture);
                let descriptor = match view {
                    ViewKind::ShaderResource => state.srv,
                    ViewKind::UnorderedAccess => state.uav,
                    _ => None,
                }
                .unwrap_or_else(|| {
                    panic!("texture bound in pass '{}' has no {:?} view", name, view)
                });
                ctx.list.set_root_descriptor(offset, descriptor);
            }

            if let Some(mut callback) = self.nodes[index].callback.take() {
                let reflection = ctx.pipelines.get(pipeline).reflection().clone();
                let mut pass = PassExec {
                    device: &mut *ctx.device,
                    heaps: &mut *ctx.heaps,
                    constants: &mut *ctx.constants,
                    resources: ctx.resources,
                    list: &mut *ctx.list,
                    frame: ctx.frame,
                    frame_constants: ctx.frame_constants,
                    reflection: &reflection,
                };
                callback(&mut pass);
                self.nodes[index].callback = Some(callback);
            }
        }

        Ok(self.presentable())
    }

    /// The final pass's primary output.
    pub fn presentable(&self) -> GraphTexture {
        let final_pass = self.final_pass.expect("no final pass set");
        let node = &self.nodes[final_pass];
        node.color_targets
            .first()
            .copied()
            .or_else(|| node.writes.first().map(|&(t, _)| t))
            .expect("final pass writes nothing")
    }

    /// Record a transition to `to`, tracking the texture's current state.
    /// No-op when already there.
    pub fn transition(&mut self, texture: GraphTexture, to: ResourceState, list: &mut CommandList) {
        let state = &mut self.textures[texture.0 as usize];
        list.transition(state.resource, state.state, to);
        state.state = to;
    }

    /// Tear the graph down, releasing its textures and their views. Used
    /// before a rebuild (surface resize).
    pub fn reset(&mut self, device: &mut NativeDevice, heaps: &mut DescriptorHeaps) {
        for state in self.textures.drain(..) {
            for descriptor in [state.srv, state.rtv, state.dsv, state.uav]
                .into_iter()
                .flatten()
            {
                heaps.free(descriptor);
            }
            device.destroy_texture(state.resource);
        }
        self.nodes.clear();
        self.owners.clear();
        self.order.clear();
        self.final_pass = None;
        self.built = false;
        log::debug!("render graph reset");
    }

    fn texture(&self, texture: GraphTexture) -> &TextureState {
        &self.textures[texture.0 as usize]
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares one pass's reads, writes, and attachments.
pub struct PassBuilder<'a> {
    graph: &'a mut RenderGraph,
    reflection: ShaderReflection,
    index: usize,
}

impl PassBuilder<'_> {
    /// Read `texture` at its current version through the shader binding
    /// `name`.
    pub fn read(self, name: &str, texture: GraphTexture) -> Self {
        let offset = self.reflection.binding_offset(name);
        let version = self.graph.texture(texture).version;
        let node = &mut self.graph.nodes[self.index];
        node.reads.push((texture, version));
        node.bindings.push((offset, texture, ViewKind::ShaderResource));
        self.check_binding_count();
        self
    }

    /// Write `texture` through the storage binding `name`, bumping its
    /// version.
    pub fn write(mut self, name: &str, texture: GraphTexture) -> Self {
        let offset = self.reflection.binding_offset(name);
        let version = self.bump(texture);
        let node = &mut self.graph.nodes[self.index];
        node.writes.push((texture, version));
        node.bindings.push((offset, texture, ViewKind::UnorderedAccess));
        self.check_binding_count();
        self
    }

    /// Attach `texture` as a color target, bumping its version.
    pub fn render_target(mut self, texture: GraphTexture) -> Self {
        assert!(
            !self.graph.texture(texture).desc.format.is_depth(),
            "depth format used as color target"
        );
        let version = self.bump(texture);
        let node = &mut self.graph.nodes[self.index];
        node.writes.push((texture, version));
        node.color_targets.push(texture);
        self
    }

    /// Attach `texture` as the depth target, bumping its version.
    pub fn depth_buffer(mut self, texture: GraphTexture) -> Self {
        assert!(
            self.graph.texture(texture).desc.format.is_depth(),
            "color format used as depth target"
        );
        let version = self.bump(texture);
        let node = &mut self.graph.nodes[self.index];
        assert!(node.depth_target.is_none(), "pass already has a depth target");
        node.writes.push((texture, version));
        node.depth_target = Some(texture);
        self
    }

    /// Finish the declaration with the callback that records the pass.
    pub fn execute(self, callback: impl FnMut(&mut PassExec<'_>) + 'static) -> PassHandle {
        self.graph.nodes[self.index].callback = Some(Box::new(callback));
        PassHandle(self.index as u32)
    }

    fn bump(&mut self, texture: GraphTexture) -> u32 {
        let version = {
            let state = &mut self.graph.textures[texture.0 as usize];
            state.version += 1;
            state.version
        };
        self.graph.owners.insert((texture.0, version), self.index);
        version
    }

    fn check_binding_count(&self) {
        assert!(
            self.graph.nodes[self.index].bindings.len() <= MAX_PASS_BINDINGS,
            "pass '{}' declares more than {} bindings",
            self.graph.nodes[self.index].name,
            MAX_PASS_BINDINGS
        );
    }
}
