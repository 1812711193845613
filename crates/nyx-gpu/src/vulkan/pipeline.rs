//! Pipelines with one descriptor set each.

use super::convert;
use crate::backend::{PipelineDesc, PipelineKind};
use crate::error::{GpuError, Result};
use ash::vk;
use nyx_core::PipelineStage;

/// A pipeline, its layout and its descriptor set.
pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_stages: vk::ShaderStageFlags,
    pub push_constant_size: u32,
    pub has_vertex_input: bool,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub set: Option<vk::DescriptorSet>,
    /// Binding number and descriptor type for each slot.
    pub slots: Vec<(u32, vk::DescriptorType)>,
}

impl VulkanPipeline {
    /// # Safety
    /// The device must be valid and every shader must be valid SPIR-V.
    pub unsafe fn new(device: &ash::Device, desc: &PipelineDesc) -> Result<Self> {
        let slots: Vec<_> = desc
            .bindings
            .iter()
            .map(|b| (b.binding, convert::descriptor_type(b.kind)))
            .collect();
        let layout_bindings: Vec<_> = desc
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(convert::descriptor_type(b.kind))
                    .descriptor_count(1)
                    .stage_flags(convert::shader_stages(b.stages))
            })
            .collect();

        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings),
                None,
            )?
        };

        let mut pipeline = Self {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            bind_point: if desc.is_compute() {
                vk::PipelineBindPoint::COMPUTE
            } else {
                vk::PipelineBindPoint::GRAPHICS
            },
            push_stages: desc
                .shaders
                .iter()
                .fold(vk::ShaderStageFlags::empty(), |acc, s| acc | convert::stage(s.stage)),
            push_constant_size: desc.push_constant_size,
            has_vertex_input: false,
            set_layout,
            pool: vk::DescriptorPool::null(),
            set: None,
            slots,
        };

        if let Err(err) = unsafe { pipeline.build(device, desc) } {
            unsafe { pipeline.destroy(device) };
            return Err(err);
        }
        Ok(pipeline)
    }

    unsafe fn build(&mut self, device: &ash::Device, desc: &PipelineDesc) -> Result<()> {
        if !self.slots.is_empty() {
            let sizes: Vec<_> = self
                .slots
                .iter()
                .map(|(_, ty)| vk::DescriptorPoolSize::default().ty(*ty).descriptor_count(1))
                .collect();
            self.pool = unsafe {
                device.create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default()
                        .max_sets(1)
                        .pool_sizes(&sizes),
                    None,
                )?
            };
            let layouts = [self.set_layout];
            let sets = unsafe {
                device.allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::default()
                        .descriptor_pool(self.pool)
                        .set_layouts(&layouts),
                )?
            };
            self.set = sets.first().copied();
        }

        let push_ranges: Vec<_> = (desc.push_constant_size > 0)
            .then(|| {
                vk::PushConstantRange::default()
                    .stage_flags(self.push_stages)
                    .offset(0)
                    .size(desc.push_constant_size)
            })
            .into_iter()
            .collect();
        let set_layouts = [self.set_layout];
        self.layout = unsafe {
            device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default()
                        .set_layouts(&set_layouts)
                        .push_constant_ranges(&push_ranges),
                    None,
                )
                .map_err(|e| GpuError::PipelineCreation(e.to_string()))?
        };

        let mut modules = Vec::with_capacity(desc.shaders.len());
        for shader in &desc.shaders {
            let info = vk::ShaderModuleCreateInfo::default().code(&shader.spirv);
            match unsafe { device.create_shader_module(&info, None) } {
                Ok(module) => modules.push((shader.stage, module)),
                Err(e) => {
                    destroy_modules(device, &modules);
                    return Err(GpuError::ShaderCompilation(format!("{:?}: {e}", shader.stage)));
                }
            }
        }

        let created = match &desc.kind {
            PipelineKind::Compute => unsafe { self.create_compute(device, &modules) },
            PipelineKind::Graphics {
                vertex_layout,
                color_formats,
                depth_format,
            } => {
                self.has_vertex_input = vertex_layout.is_some();
                let attributes: Vec<_> = vertex_layout
                    .iter()
                    .flat_map(|layout| &layout.attributes)
                    .map(|a| {
                        vk::VertexInputAttributeDescription::default()
                            .location(a.location)
                            .binding(0)
                            .format(convert::vertex_format(a.format))
                            .offset(a.offset)
                    })
                    .collect();
                let bindings: Vec<_> = vertex_layout
                    .iter()
                    .map(|layout| {
                        vk::VertexInputBindingDescription::default()
                            .binding(0)
                            .stride(layout.stride)
                            .input_rate(vk::VertexInputRate::VERTEX)
                    })
                    .collect();
                let colors: Vec<_> = color_formats.iter().map(|f| convert::format(*f)).collect();
                unsafe {
                    self.create_graphics(
                        device,
                        &modules,
                        &bindings,
                        &attributes,
                        &colors,
                        depth_format.map(convert::format),
                    )
                }
            }
        };
        destroy_modules(device, &modules);
        self.pipeline = created?;
        Ok(())
    }

    unsafe fn create_compute(
        &self,
        device: &ash::Device,
        modules: &[(PipelineStage, vk::ShaderModule)],
    ) -> Result<vk::Pipeline> {
        let module = modules
            .iter()
            .find(|(stage, _)| *stage == PipelineStage::Compute)
            .map(|(_, module)| *module)
            .ok_or_else(|| GpuError::PipelineCreation("missing compute shader".to_string()))?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(self.layout);

        let pipelines = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?
        };
        Ok(pipelines[0])
    }

    unsafe fn create_graphics(
        &self,
        device: &ash::Device,
        modules: &[(PipelineStage, vk::ShaderModule)],
        vertex_bindings: &[vk::VertexInputBindingDescription],
        vertex_attributes: &[vk::VertexInputAttributeDescription],
        color_formats: &[vk::Format],
        depth_format: Option<vk::Format>,
    ) -> Result<vk::Pipeline> {
        let stages: Vec<_> = modules
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(convert::stage(*stage))
                    .module(*module)
                    .name(c"main")
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(vertex_bindings)
            .vertex_attribute_descriptions(vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_format.is_some())
            .depth_write_enable(depth_format.is_some())
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachments: Vec<_> = color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(color_formats);
        if let Some(depth_format) = depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?
        };
        Ok(pipelines[0])
    }

    /// Descriptor type of binding `slot`.
    pub fn slot(&self, slot: u32) -> Option<vk::DescriptorType> {
        self.slots
            .iter()
            .find(|(binding, _)| *binding == slot)
            .map(|(_, ty)| *ty)
    }

    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
            if self.pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.pool, None);
            }
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

fn destroy_modules(device: &ash::Device, modules: &[(PipelineStage, vk::ShaderModule)]) {
    for (_, module) in modules {
        unsafe { device.destroy_shader_module(*module, None) };
    }
}

/// Point binding `slot` of `set` at a buffer range.
///
/// # Safety
/// Device, set and buffer must be valid.
pub unsafe fn write_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    slot: u32,
    ty: vk::DescriptorType,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(slot)
        .descriptor_type(ty)
        .buffer_info(std::slice::from_ref(&buffer_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Point binding `slot` of `set` at an image view.
///
/// # Safety
/// Device, set, view and sampler must be valid.
pub unsafe fn write_image(
    device: &ash::Device,
    set: vk::DescriptorSet,
    slot: u32,
    ty: vk::DescriptorType,
    view: vk::ImageView,
    layout: vk::ImageLayout,
    sampler: vk::Sampler,
) {
    let mut image_info = vk::DescriptorImageInfo::default()
        .image_view(view)
        .image_layout(layout);
    if ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
        image_info = image_info.sampler(sampler);
    }

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(slot)
        .descriptor_type(ty)
        .image_info(std::slice::from_ref(&image_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}
