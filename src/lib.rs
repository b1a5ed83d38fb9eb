//! GPU-resident resource and execution scheduler for a real-time renderer.
//!
//! The crate is organized around five cooperating pieces:
//!
//! - [`handle`] / [`descriptor`]: generational slot allocation and the
//!   descriptor heaps built on it, so stale references assert instead of
//!   aliasing.
//! - [`queue`]: command queues with monotonic fences and a recycling command
//!   list pool.
//! - [`transient`]: per-frame constant buffer slots and linear upload pools,
//!   reclaimed only when the fence of the command list that used them has
//!   been reached.
//! - [`graph`]: a versioned render graph that derives pass ordering from
//!   declared reads and writes.
//! - [`renderer`]: the per-frame glue tying the above to a swap chain, with
//!   an explicit upload protocol for resident meshes and textures.

pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod graph;
pub mod handle;
pub mod queue;
pub mod renderer;
pub mod resources;
pub mod shader;
pub mod transient;
pub mod types;

pub use error::{GraphicsError, GraphicsResult};
pub use frame::{Camera, DirectionalLight, MeshInstance, PointLight, RenderInfo};
pub use graph::{GraphError, GraphTexture, PassHandle, RenderGraph};
pub use renderer::{GraphBuildContext, Renderer, RendererDesc, UploadContext, UploadTicket};
pub use resources::{MeshHandle, TextureHandle};
pub use shader::{PipelineDesc, PipelineHandle, PipelineKind, ShaderReflection};
pub use types::{
    BufferUsage, ClearValue, QueueKind, TextureDesc, TextureFormat, TextureUsage, Vertex,
};
