//! Vulkan Shader - SPIR-V modules and binding reflection.
//!
//! Shader code arrives as opaque compiled SPIR-V; the only thing read
//! out of it is the (set, binding) -> descriptor-kind table used to
//! validate deferred resource bindings.

use ash::vk;
use rspirv_reflect::{BindingCount, DescriptorType, Reflection};
use std::collections::HashMap;
use std::ffi::CString;

/// Shader creation and reflection errors.
#[derive(Debug)]
pub enum ShaderError {
    ReflectionFailed(String),
    VulkanError(vk::Result),
}

impl From<vk::Result> for ShaderError {
    fn from(e: vk::Result) -> Self {
        ShaderError::VulkanError(e)
    }
}

impl std::fmt::Display for ShaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderError::ReflectionFailed(msg) => write!(f, "Shader reflection failed: {}", msg),
            ShaderError::VulkanError(e) => write!(f, "Vulkan error: {:?}", e),
        }
    }
}

impl std::error::Error for ShaderError {}

/// Shader stage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Convert to Vulkan shader stage flags.
    pub fn to_vk_stage(&self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// A single shader resource binding.
#[derive(Debug, Clone)]
pub struct ShaderBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stage_flags: vk::ShaderStageFlags,
    pub count: u32,
}

/// Shader reflection data.
#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    pub bindings: Vec<ShaderBinding>,
    pub push_constant_size: u32,
}

impl ShaderReflection {
    /// Merge multiple shader reflections into one.
    /// Combines stage_flags for bindings at the same (set, binding).
    pub fn merge(reflections: &[&ShaderReflection]) -> Self {
        let mut binding_map: HashMap<(u32, u32), ShaderBinding> = HashMap::new();
        let mut push_constant_size = 0u32;

        for reflection in reflections {
            push_constant_size = push_constant_size.max(reflection.push_constant_size);

            for binding in &reflection.bindings {
                let key = (binding.set, binding.binding);
                if let Some(existing) = binding_map.get_mut(&key) {
                    existing.stage_flags |= binding.stage_flags;
                } else {
                    binding_map.insert(key, binding.clone());
                }
            }
        }

        let mut bindings: Vec<ShaderBinding> = binding_map.into_values().collect();
        bindings.sort_by_key(|b| (b.set, b.binding));

        Self {
            bindings,
            push_constant_size,
        }
    }

    /// Find a binding by (set, binding) index.
    pub fn binding_at(&self, set: u32, binding: u32) -> Option<&ShaderBinding> {
        self.bindings
            .iter()
            .find(|b| b.set == set && b.binding == binding)
    }

    /// Get the maximum set index used.
    pub fn max_set(&self) -> Option<u32> {
        self.bindings.iter().map(|b| b.set).max()
    }
}

/// Compiled shader with Vulkan shader module and reflection data.
pub struct ShaderModule {
    device: ash::Device,
    name: String,
    module: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
    reflection: ShaderReflection,
}

impl ShaderModule {
    /// Create a shader from pre-compiled SPIR-V bytecode.
    pub fn from_spirv(
        name: &str,
        device: &crate::RenderDevice,
        spirv: &[u8],
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<Self, ShaderError> {
        let reflection = reflect_spirv(spirv, stage)?;
        let module = create_shader_module(device.handle(), spirv)?;

        Ok(Self {
            device: device.handle().clone(),
            name: name.to_owned(),
            module,
            stage,
            entry_point: CString::new(entry_point)
                .map_err(|_| ShaderError::ReflectionFailed("entry point contains NUL".into()))?,
            reflection,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Get the shader stage.
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Get the entry point name.
    pub fn entry_point(&self) -> &CString {
        &self.entry_point
    }

    /// Get the shader reflection data.
    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    /// Get Vulkan shader stage flags.
    pub fn vk_stage(&self) -> vk::ShaderStageFlags {
        self.stage.to_vk_stage()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Extract the (set, binding) -> resource-kind table from a SPIR-V blob.
///
/// Only descriptor bindings and the push constant block are read; the
/// rest of the module stays opaque.
pub fn reflect_spirv(spirv: &[u8], stage: ShaderStage) -> Result<ShaderReflection, ShaderError> {
    if spirv.len() % 4 != 0 {
        return Err(ShaderError::ReflectionFailed(
            "SPIR-V must be 4-byte aligned".to_string(),
        ));
    }

    let module = Reflection::new_from_spirv(spirv)
        .map_err(|e| ShaderError::ReflectionFailed(format!("{:?}", e)))?;
    let descriptor_sets = module
        .get_descriptor_sets()
        .map_err(|e| ShaderError::ReflectionFailed(format!("{:?}", e)))?;

    let stage_flags = stage.to_vk_stage();
    let mut bindings = Vec::new();
    for (&set, slots) in &descriptor_sets {
        for (&slot, info) in slots {
            bindings.push(ShaderBinding {
                name: info.name.clone(),
                set,
                binding: slot,
                descriptor_type: descriptor_kind_to_vk(info.ty),
                stage_flags,
                count: binding_array_len(&info.binding_count),
            });
        }
    }
    bindings.sort_by_key(|b| (b.set, b.binding));

    let push_constant_size = match module.get_push_constant_range() {
        Ok(Some(block)) => block.size,
        _ => 0,
    };

    Ok(ShaderReflection {
        bindings,
        push_constant_size,
    })
}

fn binding_array_len(count: &BindingCount) -> u32 {
    match count {
        BindingCount::One => 1,
        BindingCount::StaticSized(len) => *len as u32,
        // Bindless arrays size themselves from the set layout, not the
        // shader; treat the count as unbounded here.
        BindingCount::Unbounded => u32::MAX,
    }
}

/// Translate a reflected descriptor kind into the type used for set
/// layouts and writes. Kinds outside the table (acceleration structures,
/// inline uniform blocks) pass through by raw value.
fn descriptor_kind_to_vk(kind: DescriptorType) -> vk::DescriptorType {
    const KINDS: &[(DescriptorType, vk::DescriptorType)] = &[
        (DescriptorType::SAMPLER, vk::DescriptorType::SAMPLER),
        (
            DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        ),
        (DescriptorType::SAMPLED_IMAGE, vk::DescriptorType::SAMPLED_IMAGE),
        (DescriptorType::STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE),
        (
            DescriptorType::UNIFORM_TEXEL_BUFFER,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        ),
        (
            DescriptorType::STORAGE_TEXEL_BUFFER,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        ),
        (DescriptorType::UNIFORM_BUFFER, vk::DescriptorType::UNIFORM_BUFFER),
        (DescriptorType::STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER),
        (
            DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        ),
        (
            DescriptorType::STORAGE_BUFFER_DYNAMIC,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        ),
        (
            DescriptorType::INPUT_ATTACHMENT,
            vk::DescriptorType::INPUT_ATTACHMENT,
        ),
    ];

    KINDS
        .iter()
        .find(|(reflected, _)| *reflected == kind)
        .map(|&(_, vk_type)| vk_type)
        .unwrap_or(vk::DescriptorType::from_raw(kind.0 as i32))
}

/// Create a Vulkan shader module from SPIR-V bytecode.
fn create_shader_module(
    device: &ash::Device,
    spirv: &[u8],
) -> Result<vk::ShaderModule, ShaderError> {
    if spirv.len() % 4 != 0 {
        return Err(ShaderError::ReflectionFailed(
            "SPIR-V must be 4-byte aligned".to_string(),
        ));
    }

    let code: &[u32] =
        unsafe { std::slice::from_raw_parts(spirv.as_ptr() as *const u32, spirv.len() / 4) };

    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    let module = unsafe { device.create_shader_module(&create_info, None)? };

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(set: u32, idx: u32, stage: vk::ShaderStageFlags) -> ShaderBinding {
        ShaderBinding {
            name: format!("b{}_{}", set, idx),
            set,
            binding: idx,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            stage_flags: stage,
            count: 1,
        }
    }

    #[test]
    fn test_reflection_merge_combines_stages() {
        let vs = ShaderReflection {
            bindings: vec![binding(0, 0, vk::ShaderStageFlags::VERTEX)],
            push_constant_size: 16,
        };
        let fs = ShaderReflection {
            bindings: vec![
                binding(0, 0, vk::ShaderStageFlags::FRAGMENT),
                binding(1, 2, vk::ShaderStageFlags::FRAGMENT),
            ],
            push_constant_size: 0,
        };

        let merged = ShaderReflection::merge(&[&vs, &fs]);
        assert_eq!(merged.bindings.len(), 2);
        assert_eq!(merged.push_constant_size, 16);
        assert_eq!(merged.max_set(), Some(1));

        let shared = merged.binding_at(0, 0).unwrap();
        assert_eq!(
            shared.stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }
}
