//! Shader binding reflection
//!
//! Both windowed backends build their descriptor layouts from what a shader
//! actually uses, so a table may carry entries the shader ignores.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{RenderError, RenderResult};

use super::types::ResourceTableDesc;

/// Kind of resource a shader binding expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    Texture { depth: bool },
    Sampler { comparison: bool },
}

/// A table resource resolved for one binding number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    Buffer(super::BufferHandle),
    Texture(super::TextureHandle),
    Sampler(super::SamplerHandle),
}

/// Group 0 bindings referenced by any function of `module`
pub fn used_bindings(module: &naga::Module) -> BTreeMap<u32, BindingKind> {
    let functions = module
        .functions
        .iter()
        .map(|(_, f)| f)
        .chain(module.entry_points.iter().map(|ep| &ep.function));

    let mut used = std::collections::HashSet::new();
    for function in functions {
        for (_, expression) in function.expressions.iter() {
            if let naga::Expression::GlobalVariable(handle) = expression {
                used.insert(*handle);
            }
        }
    }

    let mut bindings = BTreeMap::new();
    for handle in used {
        let var = &module.global_variables[handle];
        let Some(binding) = &var.binding else {
            continue;
        };
        if binding.group != 0 {
            log::warn!(
                "Ignoring binding {} in group {}: only group 0 is bound",
                binding.binding,
                binding.group
            );
            continue;
        }
        if let Some(kind) = binding_kind(module, var) {
            bindings.insert(binding.binding, kind);
        }
    }
    bindings
}

fn binding_kind(module: &naga::Module, var: &naga::GlobalVariable) -> Option<BindingKind> {
    match var.space {
        naga::AddressSpace::Uniform => Some(BindingKind::UniformBuffer),
        naga::AddressSpace::Storage { .. } => Some(BindingKind::StorageBuffer),
        naga::AddressSpace::Handle => match &module.types[var.ty].inner {
            naga::TypeInner::Image { class, .. } => Some(BindingKind::Texture {
                depth: matches!(class, naga::ImageClass::Depth { .. }),
            }),
            naga::TypeInner::Sampler { comparison } => Some(BindingKind::Sampler {
                comparison: *comparison,
            }),
            _ => None,
        },
        _ => None,
    }
}

/// Merge the bindings of separately compiled stages
pub fn merge_bindings(
    into: &mut BTreeMap<u32, BindingKind>,
    other: BTreeMap<u32, BindingKind>,
    path: &Path,
) -> RenderResult<()> {
    for (binding, kind) in other {
        match into.get(&binding) {
            Some(existing) if *existing != kind => {
                return Err(RenderError::CompileFailure {
                    path: path.to_path_buf(),
                    log: format!("binding {binding} is {existing:?} in one stage and {kind:?} in another"),
                });
            }
            _ => {
                into.insert(binding, kind);
            }
        }
    }
    Ok(())
}

/// Table entry that feeds `binding`
pub fn resolve_binding(desc: &ResourceTableDesc, binding: u32) -> Option<BoundResource> {
    if binding >= super::SAMPLER_BINDING_OFFSET {
        let index = (binding - super::SAMPLER_BINDING_OFFSET) as usize;
        return desc.samplers.get(index).copied().map(BoundResource::Sampler);
    }
    let mut index = binding as usize;
    if index < desc.constant_buffers.len() {
        return Some(BoundResource::Buffer(desc.constant_buffers[index]));
    }
    index -= desc.constant_buffers.len();
    if index < desc.textures.len() {
        return Some(BoundResource::Texture(desc.textures[index]));
    }
    index -= desc.textures.len();
    desc.buffers.get(index).copied().map(BoundResource::Buffer)
}

/// Parse WGSL for reflection, reporting errors against `path`
pub fn parse_wgsl(source: &str, path: &Path) -> RenderResult<naga::Module> {
    naga::front::wgsl::parse_str(source).map_err(|e| RenderError::CompileFailure {
        path: path.to_path_buf(),
        log: e.emit_to_string(source),
    })
}

/// Parse one GLSL stage for reflection
pub fn parse_glsl(source: &str, stage: naga::ShaderStage, path: &Path) -> RenderResult<naga::Module> {
    let mut frontend = naga::front::glsl::Frontend::default();
    frontend
        .parse(&naga::front::glsl::Options::from(stage), source)
        .map_err(|e| RenderError::CompileFailure {
            path: path.to_path_buf(),
            log: e.emit_to_string(source),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, SamplerHandle, TextureHandle};

    const SOURCE: &str = r#"
struct Constants { color: vec4<f32> }
@group(0) @binding(0) var<uniform> constants: Constants;
@group(0) @binding(1) var color_texture: texture_2d<f32>;
@group(0) @binding(2) var depth_texture: texture_depth_2d;
@group(0) @binding(16) var unused_sampler: sampler;

@vertex
fn vs_main(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(i), 0.0, 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) p: vec4<f32>) -> @location(0) vec4<f32> {
    let c = textureLoad(color_texture, vec2<i32>(p.xy), 0);
    let d = textureLoad(depth_texture, vec2<i32>(p.xy), 0);
    return c * constants.color * d;
}
"#;

    #[test]
    fn declared_but_unused_bindings_are_skipped() {
        let module = parse_wgsl(SOURCE, Path::new("inline.wgsl")).unwrap();
        let bindings = used_bindings(&module);
        assert_eq!(bindings.get(&0), Some(&BindingKind::UniformBuffer));
        assert_eq!(bindings.get(&1), Some(&BindingKind::Texture { depth: false }));
        assert_eq!(bindings.get(&2), Some(&BindingKind::Texture { depth: true }));
        assert!(!bindings.contains_key(&16));
    }

    #[test]
    fn bindings_resolve_by_category() {
        let desc = ResourceTableDesc {
            constant_buffers: vec![BufferHandle(10)],
            textures: vec![TextureHandle(20), TextureHandle(21)],
            samplers: vec![SamplerHandle(30)],
            buffers: vec![BufferHandle(40)],
            ..Default::default()
        };
        assert_eq!(resolve_binding(&desc, 0), Some(BoundResource::Buffer(BufferHandle(10))));
        assert_eq!(resolve_binding(&desc, 2), Some(BoundResource::Texture(TextureHandle(21))));
        assert_eq!(resolve_binding(&desc, 3), Some(BoundResource::Buffer(BufferHandle(40))));
        assert_eq!(resolve_binding(&desc, 16), Some(BoundResource::Sampler(SamplerHandle(30))));
        assert_eq!(resolve_binding(&desc, 4), None);
        assert_eq!(resolve_binding(&desc, 17), None);
    }

    #[test]
    fn conflicting_stage_bindings_fail() {
        let mut a = BTreeMap::from([(0, BindingKind::UniformBuffer)]);
        let b = BTreeMap::from([(0, BindingKind::StorageBuffer)]);
        assert!(merge_bindings(&mut a, b, Path::new("x")).is_err());
    }
}
