//! Recording backend commands into a Vulkan command buffer.
//!
//! Every transfer, dispatch and rendering scope is preceded by a full
//! memory barrier so commands observe each other in program order.

use super::convert;
use super::device::{ImageRecord, Objects};
use super::staging::{Staging, StagingBuffer};
use crate::backend::{Command, ImageRegion, ReadbackSlot, RenderTargets, Viewport};
use crate::error::{GpuError, Result};
use ash::vk;
use nyx_core::Extent2D;

/// Records one submission.
pub struct Recorder<'a> {
    device: &'a ash::Device,
    objects: &'a Objects,
    staging: &'a Staging,
    cmd: vk::CommandBuffer,
    rendering: bool,
    /// Staging buffers that must live until the submission completes.
    pub buffers: Vec<StagingBuffer>,
    /// Download slots and the staging buffer each one reads from.
    pub readbacks: Vec<(ReadbackSlot, usize)>,
}

impl<'a> Recorder<'a> {
    pub fn new(
        device: &'a ash::Device,
        objects: &'a Objects,
        staging: &'a Staging,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self {
            device,
            objects,
            staging,
            cmd,
            rendering: false,
            buffers: Vec::new(),
            readbacks: Vec::new(),
        }
    }

    /// Begin the command buffer, record `commands` and end it.
    ///
    /// # Safety
    /// The command buffer must be in the initial state.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record_all(&mut self, commands: &[Command]) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.cmd, &begin_info)? };

        for command in commands {
            unsafe { self.record(command)? };
        }
        if self.rendering {
            return Err(GpuError::InvalidState(
                "submission ends inside a rendering scope".to_string(),
            ));
        }
        if !self.readbacks.is_empty() {
            unsafe {
                self.barrier(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::PipelineStageFlags2::HOST,
                    vk::AccessFlags2::HOST_READ,
                );
            }
        }

        unsafe { self.device.end_command_buffer(self.cmd)? };
        Ok(())
    }

    unsafe fn record(&mut self, command: &Command) -> Result<()> {
        let device = self.device;
        let cmd = self.cmd;
        match command {
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                let src = self.objects.buffer(*src)?.buffer;
                let dst = self.objects.buffer(*dst)?.buffer;
                unsafe {
                    self.transfer_barrier()?;
                    let region = vk::BufferCopy::default()
                        .src_offset(*src_offset)
                        .dst_offset(*dst_offset)
                        .size(*size);
                    device.cmd_copy_buffer(cmd, src, dst, &[region]);
                }
            }
            Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
                layout,
                regions,
                ..
            } => {
                let buffer = self.objects.buffer(*src)?.buffer;
                let image = self.objects.image(*dst)?;
                let copies = buffer_image_copies(image, *src_offset, regions);
                unsafe {
                    self.transfer_barrier()?;
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        buffer,
                        image.image,
                        convert::layout(*layout, image.desc.format.is_depth()),
                        &copies,
                    );
                }
            }
            Command::CopyImageToBuffer {
                src,
                layout,
                regions,
                dst,
                dst_offset,
                ..
            } => {
                let image = self.objects.image(*src)?;
                let buffer = self.objects.buffer(*dst)?.buffer;
                let copies = buffer_image_copies(image, *dst_offset, regions);
                unsafe {
                    self.transfer_barrier()?;
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        image.image,
                        convert::layout(*layout, image.desc.format.is_depth()),
                        buffer,
                        &copies,
                    );
                }
            }
            Command::CopyImage {
                src,
                src_layout,
                src_regions,
                dst,
                dst_layout,
                dst_regions,
                ..
            } => {
                let from = self.objects.image(*src)?;
                let to = self.objects.image(*dst)?;
                let aspect = convert::aspect(from.desc.format);
                let copies: Vec<_> = pair_rows(src_regions, dst_regions)?
                    .into_iter()
                    .map(|(a, b)| {
                        vk::ImageCopy::default()
                            .src_subresource(layer(aspect, a.layer))
                            .src_offset(vk::Offset3D { x: 0, y: a.y as i32, z: 0 })
                            .dst_subresource(layer(aspect, b.layer))
                            .dst_offset(vk::Offset3D { x: 0, y: b.y as i32, z: 0 })
                            .extent(vk::Extent3D {
                                width: a.width,
                                height: a.rows,
                                depth: 1,
                            })
                    })
                    .collect();
                unsafe {
                    self.transfer_barrier()?;
                    device.cmd_copy_image(
                        cmd,
                        from.image,
                        convert::layout(*src_layout, from.desc.format.is_depth()),
                        to.image,
                        convert::layout(*dst_layout, to.desc.format.is_depth()),
                        &copies,
                    );
                }
            }
            Command::Upload {
                dst,
                dst_offset,
                data,
            } => {
                let dst = self.objects.buffer(*dst)?.buffer;
                let mut staging = self.staging.create(device, data.len() as u64, true)?;
                let written = staging.write(data);
                let source = staging.buffer;
                self.buffers.push(staging);
                written?;
                unsafe {
                    self.transfer_barrier()?;
                    let region = vk::BufferCopy::default()
                        .dst_offset(*dst_offset)
                        .size(data.len() as u64);
                    device.cmd_copy_buffer(cmd, source, dst, &[region]);
                }
            }
            Command::Download {
                src,
                src_offset,
                size,
                slot,
            } => {
                let src = self.objects.buffer(*src)?.buffer;
                let staging = self.staging.create(device, *size, false)?;
                let target = staging.buffer;
                self.buffers.push(staging);
                self.readbacks.push((slot.clone(), self.buffers.len() - 1));
                unsafe {
                    self.transfer_barrier()?;
                    let region = vk::BufferCopy::default()
                        .src_offset(*src_offset)
                        .size(*size);
                    device.cmd_copy_buffer(cmd, src, target, &[region]);
                }
            }
            Command::Transition {
                image,
                old,
                new,
                layers,
                mip_levels,
                format,
            } => {
                self.outside_rendering("transition")?;
                let image = self.objects.image(*image)?.image;
                let depth = format.is_depth();
                let (dst_stage, dst_access) = convert::layout_scope(*new);
                let barrier = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .old_layout(convert::layout(*old, depth))
                    .new_layout(convert::layout(*new, depth))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(convert::aspect(*format))
                            .level_count(*mip_levels)
                            .layer_count(*layers),
                    );
                let dependency =
                    vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
                unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
            }
            Command::BeginRendering(targets) => {
                self.outside_rendering("begin rendering")?;
                unsafe {
                    self.full_barrier();
                    self.begin_rendering(targets)?;
                }
                self.rendering = true;
            }
            Command::EndRendering => {
                if !self.rendering {
                    return Err(GpuError::InvalidState("no rendering scope to end".to_string()));
                }
                unsafe { device.cmd_end_rendering(cmd) };
                self.rendering = false;
            }
            Command::PushConstants {
                pipeline,
                offset,
                data,
            } => {
                let pipeline = self.objects.pipeline(*pipeline)?;
                if *offset as usize + data.len() > pipeline.push_constant_size as usize {
                    return Err(GpuError::OutOfRange {
                        offset: u64::from(*offset),
                        end: u64::from(*offset) + data.len() as u64,
                        len: u64::from(pipeline.push_constant_size),
                    });
                }
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        pipeline.push_stages,
                        *offset,
                        data,
                    );
                }
            }
            Command::Draw {
                pipeline,
                extent,
                viewports,
                vertex_buffer,
                vertex_count,
                first_vertex,
            } => {
                let vertex_buffer = self.objects.buffer(*vertex_buffer)?.buffer;
                unsafe {
                    self.bind_graphics(*pipeline, *extent, viewports, vertex_buffer)?;
                    device.cmd_draw(cmd, *vertex_count, 1, *first_vertex, 0);
                }
            }
            Command::DrawIndexed {
                pipeline,
                extent,
                viewports,
                vertex_buffer,
                index_buffer,
                index_type,
                index_count,
                first_index,
            } => {
                let vertex_buffer = self.objects.buffer(*vertex_buffer)?.buffer;
                let index_buffer = self.objects.buffer(*index_buffer)?.buffer;
                unsafe {
                    self.bind_graphics(*pipeline, *extent, viewports, vertex_buffer)?;
                    device.cmd_bind_index_buffer(
                        cmd,
                        index_buffer,
                        0,
                        convert::index_type(*index_type),
                    );
                    device.cmd_draw_indexed(cmd, *index_count, 1, *first_index, 0, 0);
                }
            }
            Command::Dispatch { pipeline, groups } => {
                let record = self.objects.pipeline(*pipeline)?;
                if record.bind_point != vk::PipelineBindPoint::COMPUTE {
                    return Err(GpuError::InvalidState(format!(
                        "pipeline {} is not a compute pipeline",
                        pipeline.0
                    )));
                }
                unsafe {
                    self.transfer_barrier()?;
                    device.cmd_bind_pipeline(cmd, record.bind_point, record.pipeline);
                    if let Some(set) = record.set {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            record.bind_point,
                            record.layout,
                            0,
                            &[set],
                            &[],
                        );
                    }
                    device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
                }
            }
        }
        Ok(())
    }

    unsafe fn begin_rendering(&self, targets: &RenderTargets) -> Result<()> {
        let colors: Vec<_> = targets
            .colors
            .iter()
            .map(|target| {
                let view = self.objects.image(target.image)?.view;
                Ok(vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(if target.clear.is_some() {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: target.clear.unwrap_or_default(),
                        },
                    }))
            })
            .collect::<Result<_>>()?;

        let depth = match &targets.depth {
            Some(target) => Some(
                vk::RenderingAttachmentInfo::default()
                    .image_view(self.objects.image(target.image)?.view)
                    .image_layout(vk::ImageLayout::GENERAL)
                    .load_op(if target.clear.is_some() {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: target.clear.unwrap_or(1.0),
                            stencil: 0,
                        },
                    }),
            ),
            None => None,
        };

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: convert::extent(targets.extent),
            })
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(self.cmd, &info) };
        Ok(())
    }

    unsafe fn bind_graphics(
        &self,
        pipeline: crate::backend::PipelineHandle,
        extent: Extent2D,
        viewports: &[Viewport],
        vertex_buffer: vk::Buffer,
    ) -> Result<()> {
        if !self.rendering {
            return Err(GpuError::InvalidState(
                "draw recorded outside a rendering scope".to_string(),
            ));
        }
        let record = self.objects.pipeline(pipeline)?;
        if record.bind_point != vk::PipelineBindPoint::GRAPHICS {
            return Err(GpuError::InvalidState(format!(
                "pipeline {} is not a graphics pipeline",
                pipeline.0
            )));
        }

        let viewport = viewports.first().map_or_else(
            || {
                vk::Viewport::default()
                    .width(extent.width as f32)
                    .height(extent.height as f32)
                    .max_depth(1.0)
            },
            |v| {
                vk::Viewport::default()
                    .x(v.x)
                    .y(v.y)
                    .width(v.width)
                    .height(v.height)
                    .max_depth(v.max_depth)
            },
        );
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: convert::extent(extent),
        };

        let device = self.device;
        unsafe {
            device.cmd_bind_pipeline(self.cmd, record.bind_point, record.pipeline);
            if let Some(set) = record.set {
                device.cmd_bind_descriptor_sets(
                    self.cmd,
                    record.bind_point,
                    record.layout,
                    0,
                    &[set],
                    &[],
                );
            }
            device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            device.cmd_set_scissor(self.cmd, 0, &[scissor]);
            if record.has_vertex_input {
                device.cmd_bind_vertex_buffers(self.cmd, 0, &[vertex_buffer], &[0]);
            }
        }
        Ok(())
    }

    fn outside_rendering(&self, what: &str) -> Result<()> {
        if self.rendering {
            Err(GpuError::InvalidState(format!(
                "cannot {what} inside a rendering scope"
            )))
        } else {
            Ok(())
        }
    }

    unsafe fn transfer_barrier(&self) -> Result<()> {
        self.outside_rendering("copy or dispatch")?;
        unsafe { self.full_barrier() };
        Ok(())
    }

    unsafe fn full_barrier(&self) {
        unsafe {
            self.barrier(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            );
        }
    }

    unsafe fn barrier(
        &self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access);
        let dependency =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
    }
}

fn layer(aspect: vk::ImageAspectFlags, layer: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(aspect)
        .mip_level(0)
        .base_array_layer(layer)
        .layer_count(1)
}

/// Buffer-image copies for tightly packed rows starting at `offset`.
fn buffer_image_copies(
    image: &ImageRecord,
    offset: u64,
    regions: &[ImageRegion],
) -> Vec<vk::BufferImageCopy> {
    let aspect = convert::aspect(image.desc.format);
    let pixel = u64::from(image.desc.format.bytes_per_pixel());
    let mut cursor = offset;
    regions
        .iter()
        .map(|region| {
            let copy = vk::BufferImageCopy::default()
                .buffer_offset(cursor)
                .image_subresource(layer(aspect, region.layer))
                .image_offset(vk::Offset3D {
                    x: 0,
                    y: region.y as i32,
                    z: 0,
                })
                .image_extent(vk::Extent3D {
                    width: region.width,
                    height: region.rows,
                    depth: 1,
                });
            cursor += u64::from(region.width) * u64::from(region.rows) * pixel;
            copy
        })
        .collect()
}

/// Split two region lists into pairs covering the same number of rows.
pub fn pair_rows(
    src: &[ImageRegion],
    dst: &[ImageRegion],
) -> Result<Vec<(ImageRegion, ImageRegion)>> {
    let mut pairs = Vec::new();
    let mut src_iter = src.iter().copied();
    let mut dst_iter = dst.iter().copied();
    let mut a = src_iter.next();
    let mut b = dst_iter.next();

    while let (Some(mut left), Some(mut right)) = (a, b) {
        if left.width != right.width {
            return Err(GpuError::InvalidArgument(
                "image copy regions differ in width".to_string(),
            ));
        }
        let rows = left.rows.min(right.rows);
        pairs.push((
            ImageRegion { rows, ..left },
            ImageRegion { rows, ..right },
        ));

        left.rows -= rows;
        left.y += rows;
        right.rows -= rows;
        right.y += rows;
        a = if left.rows == 0 { src_iter.next() } else { Some(left) };
        b = if right.rows == 0 { dst_iter.next() } else { Some(right) };
    }

    if a.is_some() || b.is_some() {
        return Err(GpuError::InvalidArgument(
            "image copy regions differ in size".to_string(),
        ));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(layer: u32, y: u32, rows: u32) -> ImageRegion {
        ImageRegion {
            layer,
            y,
            rows,
            width: 4,
        }
    }

    #[test]
    fn pairs_split_at_both_boundaries() {
        let src = [region(0, 2, 2), region(1, 0, 2)];
        let dst = [region(0, 0, 3), region(1, 0, 1)];
        let pairs = pair_rows(&src, &dst).unwrap();
        assert_eq!(
            pairs,
            vec![
                (region(0, 2, 2), region(0, 0, 2)),
                (region(1, 0, 1), region(0, 2, 1)),
                (region(1, 1, 1), region(1, 0, 1)),
            ]
        );
    }

    #[test]
    fn mismatched_totals_are_rejected() {
        assert!(pair_rows(&[region(0, 0, 2)], &[region(0, 0, 1)]).is_err());
        let narrow = ImageRegion {
            width: 2,
            ..region(0, 0, 1)
        };
        assert!(pair_rows(&[region(0, 0, 1)], &[narrow]).is_err());
    }
}
