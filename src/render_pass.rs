//! Vulkan RenderPass - render pass objects and framebuffer derivation.
//!
//! A render pass binds attachment *sources* (image views or a swapchain)
//! at creation; the concrete framebuffer is derived per recording, because
//! a swapchain attachment only picks its image at acquire time. Acquiring
//! also surfaces the semaphores the enclosing submission must honor.

use ash::vk;
use std::sync::Arc;

use crate::barrier::ResourceState;
use crate::image::{Image, ImageView, SubresourceRange};
use crate::swapchain::Swapchain;

/// Where an attachment's pixels live.
#[derive(Clone)]
pub enum AttachmentTarget {
    View(Arc<ImageView>),
    /// The back buffer chosen by the next acquire.
    Swapchain(Arc<Swapchain>),
}

/// One attachment of a render pass.
#[derive(Clone)]
pub struct Attachment {
    pub target: AttachmentTarget,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    /// State the attachment is expected to be in when the pass begins.
    pub initial_state: ResourceState,
    /// State the pass leaves the attachment in.
    pub final_state: ResourceState,
}

impl Attachment {
    /// A color attachment cleared on load.
    pub fn color_cleared(target: AttachmentTarget, final_state: ResourceState) -> Self {
        Self {
            target,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_state: ResourceState::Undefined,
            final_state,
        }
    }

    /// A depth attachment cleared on load and discarded after the pass.
    pub fn depth_cleared(target: AttachmentTarget) -> Self {
        Self {
            target,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_state: ResourceState::Undefined,
            final_state: ResourceState::DepthWrite,
        }
    }

    fn format(&self) -> vk::Format {
        match &self.target {
            AttachmentTarget::View(view) => view.format(),
            AttachmentTarget::Swapchain(sc) => sc.format(),
        }
    }

    fn samples(&self) -> vk::SampleCountFlags {
        match &self.target {
            AttachmentTarget::View(view) => {
                vk::SampleCountFlags::from_raw(view.image().desc().samples)
            }
            AttachmentTarget::Swapchain(_) => vk::SampleCountFlags::TYPE_1,
        }
    }
}

/// Attachment references of one subpass.
#[derive(Clone, Default)]
pub struct SubpassDesc {
    pub color_attachments: Vec<u32>,
    pub depth_attachment: Option<u32>,
    pub input_attachments: Vec<u32>,
}

/// Render pass configuration.
pub struct RenderPassDesc {
    pub name: String,
    pub attachments: Vec<Attachment>,
    pub subpasses: Vec<SubpassDesc>,
    pub area: vk::Rect2D,
}

/// An attachment instance resolved at framebuffer derivation.
pub(crate) struct ResolvedAttachment {
    pub image: Arc<Image>,
    pub range: SubresourceRange,
    pub initial_state: ResourceState,
    pub final_state: ResourceState,
}

/// Everything one recording of the pass needs: the framebuffer plus the
/// semaphores and attachment states the enclosing section must absorb.
pub(crate) struct FramebufferBundle {
    pub framebuffer: vk::Framebuffer,
    /// Waited at COLOR_ATTACHMENT_OUTPUT before the pass may write.
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Signaled when the submission finishes (consumed by present).
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub attachments: Vec<ResolvedAttachment>,
}

/// A render pass with deferred framebuffer derivation.
pub struct RenderPass {
    device: ash::Device,
    handle: vk::RenderPass,
    desc: RenderPassDesc,
}

impl RenderPass {
    pub fn new(device: &crate::RenderDevice, desc: RenderPassDesc) -> Result<Self, vk::Result> {
        let device = device.handle();

        let attachment_descs: Vec<vk::AttachmentDescription> = desc
            .attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(a.format())
                    .samples(a.samples())
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(a.initial_state.image_layout())
                    .final_layout(a.final_state.image_layout())
            })
            .collect();

        // Reference arrays must outlive the subpass descriptions.
        let mut color_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut input_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut depth_refs: Vec<Option<vk::AttachmentReference>> = Vec::new();
        for sp in &desc.subpasses {
            color_refs.push(
                sp.color_attachments
                    .iter()
                    .map(|&i| {
                        vk::AttachmentReference::default()
                            .attachment(i)
                            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    })
                    .collect(),
            );
            input_refs.push(
                sp.input_attachments
                    .iter()
                    .map(|&i| {
                        vk::AttachmentReference::default()
                            .attachment(i)
                            .layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    })
                    .collect(),
            );
            depth_refs.push(sp.depth_attachment.map(|i| {
                vk::AttachmentReference::default()
                    .attachment(i)
                    .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            }));
        }

        let subpass_descs: Vec<vk::SubpassDescription> = desc
            .subpasses
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let mut sd = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color_refs[i])
                    .input_attachments(&input_refs[i]);
                if let Some(ref depth) = depth_refs[i] {
                    sd = sd.depth_stencil_attachment(depth);
                }
                sd
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachment_descs)
            .subpasses(&subpass_descs);

        let handle = unsafe { device.create_render_pass(&create_info, None)? };

        log::trace!("render pass created: {}", desc.name);

        Ok(Self {
            device: device.clone(),
            handle,
            desc,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn subpass_count(&self) -> u32 {
        self.desc.subpasses.len() as u32
    }

    pub fn area(&self) -> vk::Rect2D {
        self.desc.area
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Derive the framebuffer for one recording of this pass.
    ///
    /// Swapchain attachments acquire their back buffer here, which is what
    /// produces the wait/signal semaphores. The caller owns the returned
    /// framebuffer and the wait semaphores and must hand them to post-frame
    /// cleanup.
    pub(crate) fn make_framebuffer(&self) -> Result<FramebufferBundle, vk::Result> {
        let mut views: Vec<vk::ImageView> = Vec::with_capacity(self.desc.attachments.len());
        let mut wait_semaphores = Vec::new();
        let mut signal_semaphores = Vec::new();
        let mut attachments = Vec::with_capacity(self.desc.attachments.len());

        for attachment in &self.desc.attachments {
            match &attachment.target {
                AttachmentTarget::View(view) => {
                    views.push(view.handle());
                    attachments.push(ResolvedAttachment {
                        image: view.image().clone(),
                        range: view.range(),
                        initial_state: attachment.initial_state,
                        final_state: attachment.final_state,
                    });
                }
                AttachmentTarget::Swapchain(swapchain) => {
                    let acquired = swapchain.acquire_next()?;
                    views.push(acquired.view);
                    wait_semaphores.push(acquired.acquire_semaphore);
                    signal_semaphores.push(acquired.present_semaphore);
                    attachments.push(ResolvedAttachment {
                        image: acquired.image,
                        range: SubresourceRange::full(1, 1),
                        initial_state: attachment.initial_state,
                        final_state: attachment.final_state,
                    });
                }
            }
        }

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(self.handle)
            .attachments(&views)
            .width(self.desc.area.extent.width)
            .height(self.desc.area.extent.height)
            .layers(1);

        let framebuffer = unsafe { self.device.create_framebuffer(&create_info, None)? };

        Ok(FramebufferBundle {
            framebuffer,
            wait_semaphores,
            signal_semaphores,
            attachments,
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.handle, None);
        }
    }
}
