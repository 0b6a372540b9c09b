//! SPIR-V shader loading
//!
//! Precompiled `_vert.spirv` / `_frag.spirv` blobs are preferred. Without
//! them the WGSL source is translated with naga. Clip-space Y is left
//! untouched in both cases: the engine's projection correction flips it.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::Path;

use ash::vk;

use crate::backend::reflect::{self, BindingKind};
use crate::backend::types::{ShaderDesc, ShaderStageFlags};
use crate::backend::{check_entry_points, shader_path, FRAGMENT_ENTRY, VERTEX_ENTRY};
use crate::error::{RenderError, RenderResult};

use super::VulkanBackend;

/// One compiled stage
pub struct ShaderStage {
    pub module: vk::ShaderModule,
    pub entry: CString,
}

pub struct VkShader {
    pub vertex: Option<ShaderStage>,
    pub fragment: Option<ShaderStage>,
    pub bindings: BTreeMap<u32, BindingKind>,
}

impl VkShader {
    pub fn stages(&self) -> impl Iterator<Item = (vk::ShaderStageFlags, &ShaderStage)> {
        self.vertex
            .iter()
            .map(|s| (vk::ShaderStageFlags::VERTEX, s))
            .chain(self.fragment.iter().map(|s| (vk::ShaderStageFlags::FRAGMENT, s)))
    }
}

fn compile_error(path: &Path, log: impl ToString) -> RenderError {
    RenderError::CompileFailure {
        path: path.to_path_buf(),
        log: log.to_string(),
    }
}

fn read_file(path: &Path) -> RenderResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RenderError::AssetNotFound(path.to_path_buf()),
        _ => RenderError::AssetDecode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    })
}

fn entry_name(name: &str, path: &Path) -> RenderResult<CString> {
    CString::new(name).map_err(|e| compile_error(path, e))
}

/// Translate a validated WGSL module into SPIR-V for one entry point
fn wgsl_to_spirv(
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
    stage: naga::ShaderStage,
    entry: &str,
    path: &Path,
) -> RenderResult<Vec<u32>> {
    let mut options = naga::back::spv::Options::default();
    options
        .flags
        .remove(naga::back::spv::WriterFlags::ADJUST_COORDINATE_SPACE);
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry.to_string(),
    };
    naga::back::spv::write_vec(module, info, &options, Some(&pipeline_options)).map_err(|e| compile_error(path, e))
}

impl VulkanBackend {
    fn create_module(&self, words: &[u32], path: &Path) -> RenderResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(words);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| compile_error(path, format!("vkCreateShaderModule: {e:?}")))
    }

    fn destroy_stages(&self, stages: impl IntoIterator<Item = ShaderStage>) {
        for stage in stages {
            unsafe { self.device.destroy_shader_module(stage.module, None) };
        }
    }

    pub(super) fn load_shader(&self, desc: &ShaderDesc) -> RenderResult<VkShader> {
        if shader_path(&desc.path_stem, "_vert.spirv").exists() {
            self.load_spirv(desc)
        } else {
            log::debug!(
                "No SPIR-V for {}, translating WGSL",
                desc.path_stem.display()
            );
            self.load_wgsl(desc)
        }
    }

    fn load_spirv_stage(
        &self,
        path: &Path,
        stage: naga::ShaderStage,
        bindings: &mut BTreeMap<u32, BindingKind>,
    ) -> RenderResult<ShaderStage> {
        let bytes = read_file(path)?;
        let words = ash::util::read_spv(&mut std::io::Cursor::new(&bytes)).map_err(|e| compile_error(path, e))?;

        let module = naga::front::spv::parse_u8_slice(&bytes, &naga::front::spv::Options::default())
            .map_err(|e| compile_error(path, e))?;
        let entry = module
            .entry_points
            .iter()
            .find(|ep| ep.stage == stage)
            .map(|ep| ep.name.clone())
            .ok_or_else(|| compile_error(path, format!("no {stage:?} entry point")))?;
        reflect::merge_bindings(bindings, reflect::used_bindings(&module), path)?;

        Ok(ShaderStage {
            module: self.create_module(&words, path)?,
            entry: entry_name(&entry, path)?,
        })
    }

    fn load_spirv(&self, desc: &ShaderDesc) -> RenderResult<VkShader> {
        let mut bindings = BTreeMap::new();
        let vertex_path = shader_path(&desc.path_stem, "_vert.spirv");
        let vertex = self.load_spirv_stage(&vertex_path, naga::ShaderStage::Vertex, &mut bindings)?;

        let fragment = if desc.stages.contains(ShaderStageFlags::FRAGMENT) {
            let fragment_path = shader_path(&desc.path_stem, "_frag.spirv");
            match self.load_spirv_stage(&fragment_path, naga::ShaderStage::Fragment, &mut bindings) {
                Ok(stage) => Some(stage),
                Err(e) => {
                    self.destroy_stages([vertex]);
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(VkShader {
            vertex: Some(vertex),
            fragment,
            bindings,
        })
    }

    fn load_wgsl(&self, desc: &ShaderDesc) -> RenderResult<VkShader> {
        let path = shader_path(&desc.path_stem, ".wgsl");
        let bytes = read_file(&path)?;
        let source = String::from_utf8(bytes).map_err(|e| RenderError::AssetDecode {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let module = reflect::parse_wgsl(&source, &path)?;
        check_entry_points(&module, desc.stages, &path)?;

        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| compile_error(&path, e.emit_to_string(&source)))?;

        let vertex_words = wgsl_to_spirv(&module, &info, naga::ShaderStage::Vertex, VERTEX_ENTRY, &path)?;
        let vertex = ShaderStage {
            module: self.create_module(&vertex_words, &path)?,
            entry: entry_name(VERTEX_ENTRY, &path)?,
        };

        let fragment = if desc.stages.contains(ShaderStageFlags::FRAGMENT) {
            let compiled = wgsl_to_spirv(&module, &info, naga::ShaderStage::Fragment, FRAGMENT_ENTRY, &path)
                .and_then(|words| self.create_module(&words, &path));
            match compiled {
                Ok(module) => Some(ShaderStage {
                    module,
                    entry: entry_name(FRAGMENT_ENTRY, &path)?,
                }),
                Err(e) => {
                    self.destroy_stages([vertex]);
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(VkShader {
            vertex: Some(vertex),
            fragment,
            bindings: reflect::used_bindings(&module),
        })
    }

    pub(super) fn destroy_vk_shader(&self, shader: VkShader) {
        self.destroy_stages(shader.vertex.into_iter().chain(shader.fragment));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(i), 1.0, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#;

    #[test]
    fn wgsl_translates_per_entry_point() {
        let path = Path::new("inline.wgsl");
        let module = reflect::parse_wgsl(SOURCE, path).unwrap();
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap();
        let words = wgsl_to_spirv(&module, &info, naga::ShaderStage::Vertex, VERTEX_ENTRY, path).unwrap();
        assert_eq!(words[0], 0x0723_0203);
        assert!(wgsl_to_spirv(&module, &info, naga::ShaderStage::Fragment, "missing", path).is_err());
    }
}
