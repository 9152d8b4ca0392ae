//! Vulkan Pipeline - graphics and compute pipeline state objects.
//!
//! Pipeline and layout *compilation* are inputs to the command core: a
//! pipeline arrives here fully described, is baked once against a render
//! pass and subpass, and afterwards only its layout and reflection table
//! matter (for deferred descriptor binding).

use ash::vk;
use std::sync::Arc;

use crate::descriptor::{DescriptorSetLayout, PipelineLayout};
use crate::render_pass::RenderPass;
use crate::shader::{ShaderModule, ShaderReflection};

/// Depth testing configuration.
#[derive(Debug, Clone, Copy)]
pub struct DepthState {
    pub test_enable: bool,
    pub write_enable: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enable: true,
            write_enable: true,
            compare_op: vk::CompareOp::LESS,
        }
    }
}

/// Graphics pipeline configuration.
pub struct GraphicPipelineDesc {
    pub name: String,
    pub vertex_shader: Arc<ShaderModule>,
    pub fragment_shader: Arc<ShaderModule>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: u32,
    pub depth: Option<DepthState>,
    /// One entry per color attachment of the target subpass.
    pub blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
}

impl GraphicPipelineDesc {
    pub fn new(vertex_shader: Arc<ShaderModule>, fragment_shader: Arc<ShaderModule>) -> Self {
        Self {
            name: String::new(),
            vertex_shader,
            fragment_shader,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: 1,
            depth: None,
            blend_attachments: vec![default_blend_attachment()],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

pub fn default_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

/// Dynamic state every pipeline enables; the command contexts drive these.
const DYNAMIC_STATES: [vk::DynamicState; 4] = [
    vk::DynamicState::VIEWPORT,
    vk::DynamicState::SCISSOR,
    vk::DynamicState::BLEND_CONSTANTS,
    vk::DynamicState::STENCIL_REFERENCE,
];

/// A baked pipeline with its layout and merged binding table.
pub struct Pipeline {
    device: ash::Device,
    pipeline: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    bind_point: vk::PipelineBindPoint,
    reflection: ShaderReflection,
}

impl Pipeline {
    /// Create a graphics pipeline against a render pass and subpass.
    pub fn new_graphics(
        device: &crate::RenderDevice,
        desc: &GraphicPipelineDesc,
        layout: Arc<PipelineLayout>,
        render_pass: &RenderPass,
        subpass: u32,
    ) -> Result<Self, vk::Result> {
        let cache = device.pipeline_cache();
        let device = device.handle();

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex_shader.handle())
                .name(desc.vertex_shader.entry_point()),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment_shader.handle())
                .name(desc.fragment_shader.entry_point()),
        ];

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let input_assembly_state =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);

        // Viewport state (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::from_raw(desc.samples));

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&desc.blend_attachments);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&DYNAMIC_STATES);

        let depth_stencil_state = desc.depth.map(|d| {
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(d.test_enable)
                .depth_write_enable(d.write_enable)
                .depth_compare_op(d.compare_op)
        });

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(subpass);

        if let Some(ref depth_stencil) = depth_stencil_state {
            pipeline_info = pipeline_info.depth_stencil_state(depth_stencil);
        }

        let pipelines =
            unsafe { device.create_graphics_pipelines(cache, &[pipeline_info], None) }
                .map_err(|e| e.1)?;

        log::trace!("graphics pipeline created: {}", desc.name);

        let reflection = ShaderReflection::merge(&[
            desc.vertex_shader.reflection(),
            desc.fragment_shader.reflection(),
        ]);

        Ok(Self {
            device: device.clone(),
            pipeline: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            reflection,
        })
    }

    /// Create a compute pipeline.
    pub fn new_compute(
        device: &crate::RenderDevice,
        shader: &ShaderModule,
        layout: Arc<PipelineLayout>,
    ) -> Result<Self, vk::Result> {
        let cache = device.pipeline_cache();
        let device = device.handle();

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.handle())
            .name(shader.entry_point());

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout.handle());

        let pipelines =
            unsafe { device.create_compute_pipelines(cache, &[pipeline_info], None) }
                .map_err(|e| e.1)?;

        log::trace!("compute pipeline created: {}", shader.name());

        Ok(Self {
            device: device.clone(),
            pipeline: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            reflection: shader.reflection().clone(),
        })
    }

    /// Get the raw Vulkan pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// The merged (set, binding) table across all shader stages.
    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

/// Build a pipeline layout straight from merged shader reflection: one set
/// layout per set index up to the highest one referenced, plus a push
/// constant range when the shaders declare one.
pub fn create_layout_from_reflection(
    device: &ash::Device,
    reflection: &ShaderReflection,
    push_constant_stages: vk::ShaderStageFlags,
) -> Result<PipelineLayout, vk::Result> {
    let max_set = reflection.max_set().map(|s| s + 1).unwrap_or(0);
    let mut set_layouts = Vec::with_capacity(max_set as usize);
    for set_index in 0..max_set {
        let layout = DescriptorSetLayout::from_reflection(device, &reflection.bindings, set_index)?;
        set_layouts.push(Arc::new(layout));
    }

    let mut ranges = Vec::new();
    if reflection.push_constant_size > 0 {
        ranges.push(
            vk::PushConstantRange::default()
                .stage_flags(push_constant_stages)
                .offset(0)
                .size(reflection.push_constant_size),
        );
    }

    PipelineLayout::new(device, set_layouts, &ranges)
}
