//! Pipelines and shader binding reflection.
//!
//! A pipeline pairs shader bytecode with a reflection table mapping binding
//! names to root signature offsets. Passes bind resources by name; the
//! lookup is an assert, since a misspelled binding is a programmer error.

use std::collections::HashMap;

use crate::handle::{Handle, HandlePool};

/// Shader bytecode blob.
#[derive(Debug, Clone)]
pub struct Shader {
    pub bytecode: Vec<u8>,
}

impl Shader {
    pub fn new(bytecode: Vec<u8>) -> Self {
        Self { bytecode }
    }
}

/// Binding name to root offset table, as a compiler's reflection step would
/// produce it.
#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    bindings: HashMap<String, u32>,
}

impl ShaderReflection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, name: impl Into<String>, offset: u32) -> Self {
        self.bindings.insert(name.into(), offset);
        self
    }

    /// Root offset for `name`. Panics if the shader declares no such binding.
    pub fn binding_offset(&self, name: &str) -> u32 {
        *self
            .bindings
            .get(name)
            .unwrap_or_else(|| panic!("shader has no binding named '{name}'"))
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Raster,
    Compute,
}

/// Pipeline creation parameters.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub label: String,
    pub kind: PipelineKind,
    pub reflection: ShaderReflection,
}

#[derive(Debug)]
pub struct Pipeline {
    desc: PipelineDesc,
}

impl Pipeline {
    pub fn kind(&self) -> PipelineKind {
        self.desc.kind
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.desc.reflection
    }
}

/// Generational reference to a created pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(Handle);

impl PipelineHandle {
    pub(crate) fn raw(self) -> Handle {
        self.0
    }
}

const PIPELINE_CAPACITY: u32 = 256;

/// All created pipelines.
#[derive(Debug)]
pub struct PipelineRegistry {
    pool: HandlePool<Pipeline>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            pool: HandlePool::with_capacity(PIPELINE_CAPACITY),
        }
    }

    pub fn create(&mut self, desc: PipelineDesc) -> PipelineHandle {
        log::debug!("created pipeline '{}' ({:?})", desc.label, desc.kind);
        PipelineHandle(self.pool.alloc(Pipeline { desc }))
    }

    pub fn destroy(&mut self, handle: PipelineHandle) {
        self.pool.free(handle.0);
    }

    pub fn get(&self, handle: PipelineHandle) -> &Pipeline {
        self.pool.get(handle.0)
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
