//! Recording entry points.
//!
//! One method per command. Each resolves the application handles it is
//! given, registers resource usage (and layout changes) against the id the
//! command is about to get, updates the binding-state snapshots, adds the
//! command to the record and forwards it to the driver.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use tracing::{trace, warn};

use vkshadow_core::{contract_violation, HandleTable, LayerError};

use crate::command::{
    AccelerationStructureBuild, BufferBarrier, ClearAttachment, ClearValue, Command, CommandId,
    DependencyInfo, DynamicValue, ImageBarrier, MemoryBarrier, RenderingAttachment,
};
use crate::command_buffer::{CommandBuffer, CommandBufferState};
use crate::device::Device;
use crate::hook::{LocalCapture, LocalCaptureRequest};
use crate::record::{CommandRecord, RecordBuilder};
use crate::state::{
    bind_descriptor_sets, disturb_incompatible_sets, BindPointState, BoundIndexBuffer, BoundVertexBuffer,
};

// ── Inputs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BufferBarrierInfo {
    pub buffer: vk::Buffer,
    pub barrier: MemoryBarrier,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageBarrierInfo {
    pub image: vk::Image,
    pub barrier: MemoryBarrier,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub range: vk::ImageSubresourceRange,
}

/// Barriers as passed by the application, with application handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyInput<'a> {
    pub flags: vk::DependencyFlags,
    pub memory: &'a [MemoryBarrier],
    pub buffers: &'a [BufferBarrierInfo],
    pub images: &'a [ImageBarrierInfo],
}

#[derive(Debug, Clone, Copy)]
pub struct RenderingAttachmentInfo {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub resolve: Option<(vk::ImageView, vk::ImageLayout)>,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: Option<ClearValue>,
}

#[derive(Debug, Clone, Copy)]
pub struct AccelerationStructureBuildInfo {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub src: Option<vk::AccelerationStructureKHR>,
    pub dst: vk::AccelerationStructureKHR,
    pub geometry_count: u32,
}

fn resolve<T, H: Handle>(table: &HandleTable<T>, handle: H) -> Result<Arc<T>, LayerError> {
    table.try_get(handle.as_raw())
}

fn resolve_all<T, H: Handle + Copy>(table: &HandleTable<T>, handles: &[H]) -> Result<Vec<Arc<T>>, LayerError> {
    handles.iter().map(|h| resolve(table, *h)).collect()
}

/// Run `$body` against the binding-state lineage of `$bind_point`.
macro_rules! on_bind_point {
    ($builder:expr, $bind_point:expr, |$s:ident| $body:expr) => {
        match $bind_point {
            vk::PipelineBindPoint::GRAPHICS => {
                $builder.graphics.mutate(|$s| $body);
            }
            vk::PipelineBindPoint::COMPUTE => {
                $builder.compute.mutate(|$s| $body);
            }
            vk::PipelineBindPoint::RAY_TRACING_KHR => {
                $builder.ray_tracing.mutate(|$s| $body);
            }
            other => warn!(bind_point = ?other, "binding state not tracked for bind point"),
        }
    };
}

pub struct Recorder<'a> {
    device: &'a Device,
    cb: Arc<CommandBuffer>,
}

impl<'a> Recorder<'a> {
    pub(crate) fn new(device: &'a Device, cb: Arc<CommandBuffer>) -> Self {
        Self { device, cb }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cb.handle
    }

    fn track_layouts(&self) -> bool {
        self.device.config.recording.track_image_layouts
    }

    fn capture_state(&self) -> bool {
        self.device.config.recording.capture_binding_state
    }

    fn not_recording(&self) -> LayerError {
        let raw = self.cb.handle.as_raw();
        let found = self
            .device
            .command_buffer_state(self.cb.handle)
            .map_or("unknown", CommandBufferState::name);
        contract_violation!(raw, "recording", found)
    }

    /// Build, add, capture and forward one command. `build` only registers
    /// and constructs; every handle must already be resolved.
    fn push(&self, build: impl FnOnce(&mut RecordBuilder, CommandId) -> Command) -> Result<CommandId, LayerError> {
        let mut slot = self.cb.builder.lock();
        let Some(builder) = slot.as_mut() else {
            drop(slot);
            return Err(self.not_recording());
        };

        let next = builder.next_id();
        let command = build(builder, next);
        let id = builder.add(command);
        debug_assert_eq!(id, next);

        if let Some(request) = builder.take_capture() {
            match &self.device.hook {
                Some(hook) => hook.capture_local(LocalCapture {
                    request,
                    command_buffer: self.cb.handle,
                    record_id: builder.record().record_id,
                    id,
                    command: builder.record().command(id),
                }),
                None => warn!(name = %request.name, "local capture requested without a command hook"),
            }
        }

        let record = builder.record();
        let command = record.command(id);
        trace!(
            command_buffer = format_args!("{:#x}", self.cb.handle.as_raw()),
            id = id.0,
            kind = ?command.kind(),
            "recorded"
        );
        self.device.driver.record(self.cb.native, command, record.arena());
        Ok(id)
    }

    /// Capture the next recorded command through the command hook.
    pub fn request_local_capture(&self, name: &str) -> Result<(), LayerError> {
        let mut slot = self.cb.builder.lock();
        match slot.as_mut() {
            Some(builder) => {
                builder.request_local_capture(LocalCaptureRequest { name: name.to_owned() });
                Ok(())
            }
            None => {
                drop(slot);
                Err(self.not_recording())
            }
        }
    }

    // ── Render passes ───────────────────────────────────────

    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[ClearValue],
        contents: vk::SubpassContents,
    ) -> Result<CommandId, LayerError> {
        let render_pass = resolve(&self.device.resources.render_passes, render_pass)?;
        let framebuffer = resolve(&self.device.resources.framebuffers, framebuffer)?;
        self.push(|b, id| {
            let used = b.used_mut();
            used.render_passes.add(&render_pass, Some(id));
            used.use_framebuffer(&framebuffer, Some(id));
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                render_area,
                clear_values: clear_values.to_vec(),
                contents,
            }
        })
    }

    pub fn next_subpass(&self, contents: vk::SubpassContents) -> Result<CommandId, LayerError> {
        self.push(|_, _| Command::NextSubpass { contents })
    }

    /// Ends the render pass; every attachment image is left in the final
    /// layout its attachment description asks for.
    pub fn end_render_pass(&self) -> Result<CommandId, LayerError> {
        let track = self.track_layouts();
        self.push(|b, id| {
            if let Some((render_pass, framebuffer)) = b.active_render_pass() {
                let used = b.used_mut();
                for (desc, view) in render_pass.attachments.iter().zip(&framebuffer.attachments) {
                    if track && desc.final_layout != vk::ImageLayout::UNDEFINED {
                        used.use_image_layout(&view.image, Some(id), view.range, desc.final_layout);
                    }
                }
            }
            Command::EndRenderPass
        })
    }

    fn resolve_attachment(&self, info: &RenderingAttachmentInfo) -> Result<RenderingAttachment, LayerError> {
        let views = &self.device.resources.image_views;
        Ok(RenderingAttachment {
            view: resolve(views, info.view)?,
            layout: info.layout,
            resolve: match info.resolve {
                Some((view, layout)) => Some((resolve(views, view)?, layout)),
                None => None,
            },
            load_op: info.load_op,
            store_op: info.store_op,
            clear: info.clear,
        })
    }

    pub fn begin_rendering(
        &self,
        render_area: vk::Rect2D,
        layer_count: u32,
        color_attachments: &[RenderingAttachmentInfo],
        depth_attachment: Option<&RenderingAttachmentInfo>,
        stencil_attachment: Option<&RenderingAttachmentInfo>,
    ) -> Result<CommandId, LayerError> {
        let colors = color_attachments
            .iter()
            .map(|a| self.resolve_attachment(a))
            .collect::<Result<Vec<_>, _>>()?;
        let depth = depth_attachment.map(|a| self.resolve_attachment(a)).transpose()?;
        let stencil = stencil_attachment.map(|a| self.resolve_attachment(a)).transpose()?;

        self.push(|b, id| {
            let used = b.used_mut();
            for att in colors.iter().chain(depth.iter()).chain(stencil.iter()) {
                used.use_image_view(&att.view, Some(id));
                if let Some((view, _)) = &att.resolve {
                    used.use_image_view(view, Some(id));
                }
            }
            Command::BeginRendering {
                render_area,
                layer_count,
                color_attachments: colors,
                depth_attachment: depth,
                stencil_attachment: stencil,
            }
        })
    }

    pub fn end_rendering(&self) -> Result<CommandId, LayerError> {
        self.push(|_, _| Command::EndRendering)
    }

    // ── Binding ─────────────────────────────────────────────

    pub fn bind_pipeline(&self, pipeline: vk::Pipeline) -> Result<CommandId, LayerError> {
        let pipeline = resolve(&self.device.resources.pipelines, pipeline)?;
        let capture = self.capture_state();
        self.push(|b, id| {
            b.used_mut().use_pipeline(&pipeline, Some(id));
            if capture {
                on_bind_point!(b, pipeline.bind_point, |s| {
                    *s.pipeline_mut() = Some(Arc::clone(&pipeline))
                });
            }
            Command::BindPipeline { pipeline }
        })
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> Result<CommandId, LayerError> {
        let layout = resolve(&self.device.resources.pipeline_layouts, layout)?;
        let sets = resolve_all(&self.device.resources.descriptor_sets, sets)?;
        let capture = self.capture_state();
        let disturb = self.device.config.recording.invalidate_disturbed_descriptor_sets;

        self.push(|b, id| {
            let used = b.used_mut();
            used.pipeline_layouts.add(&layout, Some(id));
            for set in &sets {
                used.use_descriptor_set(set, Some(id));
            }
            if capture {
                on_bind_point!(b, bind_point, |s| {
                    let descriptors = s.descriptors_mut();
                    if disturb {
                        disturb_incompatible_sets(descriptors, &layout, first_set, sets.len() as u32);
                    }
                    bind_descriptor_sets(descriptors, &layout, first_set, &sets, dynamic_offsets)
                });
            }
            Command::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets: dynamic_offsets.to_vec(),
            }
        })
    }

    pub fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<CommandId, LayerError> {
        let layout = resolve(&self.device.resources.pipeline_layouts, layout)?;
        self.push(|b, id| {
            b.used_mut().pipeline_layouts.add(&layout, Some(id));
            let data = b.arena_mut().alloc_bytes(data);
            Command::PushConstants {
                layout,
                stages,
                offset,
                data,
            }
        })
    }

    pub fn bind_vertex_buffers(
        &self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) -> Result<CommandId, LayerError> {
        let buffers = resolve_all(&self.device.resources.buffers, buffers)?;
        let capture = self.capture_state();
        self.push(|b, id| {
            for buffer in &buffers {
                b.used_mut().buffers.add(buffer, Some(id));
            }
            if capture {
                b.graphics.mutate(|s| {
                    let first = first_binding as usize;
                    if s.vertex_buffers.len() < first + buffers.len() {
                        s.vertex_buffers.resize(first + buffers.len(), None);
                    }
                    for (i, buffer) in buffers.iter().enumerate() {
                        s.vertex_buffers[first + i] = Some(BoundVertexBuffer {
                            buffer: Arc::clone(buffer),
                            offset: offsets.get(i).copied().unwrap_or(0),
                        });
                    }
                });
            }
            Command::BindVertexBuffers {
                first_binding,
                buffers,
                offsets: offsets.to_vec(),
            }
        })
    }

    pub fn bind_index_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> Result<CommandId, LayerError> {
        let buffer = resolve(&self.device.resources.buffers, buffer)?;
        let capture = self.capture_state();
        self.push(|b, id| {
            b.used_mut().buffers.add(&buffer, Some(id));
            if capture {
                b.graphics.mutate(|s| {
                    s.index_buffer = Some(BoundIndexBuffer {
                        buffer: Arc::clone(&buffer),
                        offset,
                        index_type,
                    })
                });
            }
            Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            }
        })
    }

    pub fn set_dynamic(&self, value: DynamicValue) -> Result<CommandId, LayerError> {
        let capture = self.capture_state();
        self.push(|b, _| {
            if capture {
                b.graphics.mutate(|s| s.dynamic.apply(&value));
            }
            Command::SetDynamic(value)
        })
    }

    // ── Work ────────────────────────────────────────────────

    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<CommandId, LayerError> {
        self.push(|b, _| Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
            state: b.graphics.snapshot(),
        })
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<CommandId, LayerError> {
        self.push(|b, _| Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
            state: b.graphics.snapshot(),
        })
    }

    pub fn draw_indirect(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
        indexed: bool,
    ) -> Result<CommandId, LayerError> {
        let buffer = resolve(&self.device.resources.buffers, buffer)?;
        self.push(|b, id| {
            b.used_mut().buffers.add(&buffer, Some(id));
            Command::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
                indexed,
                state: b.graphics.snapshot(),
            }
        })
    }

    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) -> Result<CommandId, LayerError> {
        self.push(|b, _| Command::Dispatch {
            group_count_x,
            group_count_y,
            group_count_z,
            state: b.compute.snapshot(),
        })
    }

    pub fn dispatch_indirect(&self, buffer: vk::Buffer, offset: vk::DeviceSize) -> Result<CommandId, LayerError> {
        let buffer = resolve(&self.device.resources.buffers, buffer)?;
        self.push(|b, id| {
            b.used_mut().buffers.add(&buffer, Some(id));
            Command::DispatchIndirect {
                buffer,
                offset,
                state: b.compute.snapshot(),
            }
        })
    }

    pub fn trace_rays(&self, width: u32, height: u32, depth: u32) -> Result<CommandId, LayerError> {
        self.push(|b, _| Command::TraceRays {
            width,
            height,
            depth,
            state: b.ray_tracing.snapshot(),
        })
    }

    // ── Transfer ────────────────────────────────────────────

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) -> Result<CommandId, LayerError> {
        let src = resolve(&self.device.resources.buffers, src)?;
        let dst = resolve(&self.device.resources.buffers, dst)?;
        self.push(|b, id| {
            let used = b.used_mut();
            used.buffers.add(&src, Some(id));
            used.buffers.add(&dst, Some(id));
            Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            }
        })
    }

    pub fn copy_image(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) -> Result<CommandId, LayerError> {
        let src = resolve(&self.device.resources.images, src)?;
        let dst = resolve(&self.device.resources.images, dst)?;
        self.push(|b, id| {
            let used = b.used_mut();
            used.use_image(&src, Some(id));
            used.use_image(&dst, Some(id));
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            }
        })
    }

    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> Result<CommandId, LayerError> {
        let src = resolve(&self.device.resources.buffers, src)?;
        let dst = resolve(&self.device.resources.images, dst)?;
        self.push(|b, id| {
            let used = b.used_mut();
            used.buffers.add(&src, Some(id));
            used.use_image(&dst, Some(id));
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            }
        })
    }

    pub fn copy_image_to_buffer(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) -> Result<CommandId, LayerError> {
        let src = resolve(&self.device.resources.images, src)?;
        let dst = resolve(&self.device.resources.buffers, dst)?;
        self.push(|b, id| {
            let used = b.used_mut();
            used.use_image(&src, Some(id));
            used.buffers.add(&dst, Some(id));
            Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions: regions.to_vec(),
            }
        })
    }

    pub fn blit_image(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) -> Result<CommandId, LayerError> {
        let src = resolve(&self.device.resources.images, src)?;
        let dst = resolve(&self.device.resources.images, dst)?;
        self.push(|b, id| {
            let used = b.used_mut();
            used.use_image(&src, Some(id));
            used.use_image(&dst, Some(id));
            Command::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
                filter,
            }
        })
    }

    pub fn clear_color_image(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [u32; 4],
        ranges: &[vk::ImageSubresourceRange],
    ) -> Result<CommandId, LayerError> {
        let image = resolve(&self.device.resources.images, image)?;
        self.push(|b, id| {
            b.used_mut().use_image(&image, Some(id));
            Command::ClearColorImage {
                image,
                layout,
                color,
                ranges: ranges.to_vec(),
            }
        })
    }

    pub fn clear_depth_stencil_image(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        depth: f32,
        stencil: u32,
        ranges: &[vk::ImageSubresourceRange],
    ) -> Result<CommandId, LayerError> {
        let image = resolve(&self.device.resources.images, image)?;
        self.push(|b, id| {
            b.used_mut().use_image(&image, Some(id));
            Command::ClearDepthStencilImage {
                image,
                layout,
                depth,
                stencil,
                ranges: ranges.to_vec(),
            }
        })
    }

    pub fn clear_attachments(&self, attachments: &[ClearAttachment], rects: &[vk::ClearRect]) -> Result<CommandId, LayerError> {
        self.push(|_, _| Command::ClearAttachments {
            attachments: attachments.to_vec(),
            rects: rects.to_vec(),
        })
    }

    pub fn fill_buffer(
        &self,
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) -> Result<CommandId, LayerError> {
        let dst = resolve(&self.device.resources.buffers, dst)?;
        self.push(|b, id| {
            b.used_mut().buffers.add(&dst, Some(id));
            Command::FillBuffer {
                dst,
                offset,
                size,
                data,
            }
        })
    }

    pub fn update_buffer(&self, dst: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<CommandId, LayerError> {
        let dst = resolve(&self.device.resources.buffers, dst)?;
        self.push(|b, id| {
            b.used_mut().buffers.add(&dst, Some(id));
            let data = b.arena_mut().alloc_bytes(data);
            Command::UpdateBuffer { dst, offset, data }
        })
    }

    // ── Synchronization ─────────────────────────────────────

    fn resolve_dependency(&self, input: &DependencyInput<'_>) -> Result<DependencyInfo, LayerError> {
        let res = &self.device.resources;
        let buffers = input
            .buffers
            .iter()
            .map(|info| {
                Ok(BufferBarrier {
                    buffer: resolve(&res.buffers, info.buffer)?,
                    barrier: info.barrier,
                    src_queue_family: info.src_queue_family,
                    dst_queue_family: info.dst_queue_family,
                    offset: info.offset,
                    size: info.size,
                })
            })
            .collect::<Result<Vec<_>, LayerError>>()?;
        let images = input
            .images
            .iter()
            .map(|info| {
                Ok(ImageBarrier {
                    image: resolve(&res.images, info.image)?,
                    barrier: info.barrier,
                    old_layout: info.old_layout,
                    new_layout: info.new_layout,
                    src_queue_family: info.src_queue_family,
                    dst_queue_family: info.dst_queue_family,
                    range: info.range,
                })
            })
            .collect::<Result<Vec<_>, LayerError>>()?;
        Ok(DependencyInfo {
            flags: input.flags,
            memory: input.memory.to_vec(),
            buffers,
            images,
        })
    }

    /// Register barrier resources. `transitions` applies image layout
    /// transitions, which only execute at the barrier or wait side.
    fn use_dependency(builder: &mut RecordBuilder, id: CommandId, dependency: &DependencyInfo, transitions: bool) {
        let used = builder.used_mut();
        for barrier in &dependency.buffers {
            used.buffers.add(&barrier.buffer, Some(id));
        }
        for barrier in &dependency.images {
            if transitions {
                used.use_image_layout(&barrier.image, Some(id), barrier.range, barrier.new_layout);
            } else {
                used.use_image(&barrier.image, Some(id));
            }
        }
    }

    pub fn pipeline_barrier(&self, dependency: &DependencyInput<'_>) -> Result<CommandId, LayerError> {
        let dependency = self.resolve_dependency(dependency)?;
        let track = self.track_layouts();
        self.push(|b, id| {
            Self::use_dependency(b, id, &dependency, track);
            Command::PipelineBarrier { dependency }
        })
    }

    pub fn set_event(&self, event: vk::Event, dependency: &DependencyInput<'_>) -> Result<CommandId, LayerError> {
        let event = resolve(&self.device.resources.events, event)?;
        let dependency = self.resolve_dependency(dependency)?;
        self.push(|b, id| {
            b.used_mut().events.add(&event, Some(id));
            Self::use_dependency(b, id, &dependency, false);
            Command::SetEvent { event, dependency }
        })
    }

    pub fn reset_event(&self, event: vk::Event, stage: vk::PipelineStageFlags2) -> Result<CommandId, LayerError> {
        let event = resolve(&self.device.resources.events, event)?;
        self.push(|b, id| {
            b.used_mut().events.add(&event, Some(id));
            Command::ResetEvent { event, stage }
        })
    }

    pub fn wait_events(&self, events: &[vk::Event], dependency: &DependencyInput<'_>) -> Result<CommandId, LayerError> {
        let events = resolve_all(&self.device.resources.events, events)?;
        let dependency = self.resolve_dependency(dependency)?;
        let track = self.track_layouts();
        self.push(|b, id| {
            for event in &events {
                b.used_mut().events.add(event, Some(id));
            }
            Self::use_dependency(b, id, &dependency, track);
            Command::WaitEvents { events, dependency }
        })
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn begin_query(&self, pool: vk::QueryPool, query: u32, flags: vk::QueryControlFlags) -> Result<CommandId, LayerError> {
        let pool = resolve(&self.device.resources.query_pools, pool)?;
        self.push(|b, id| {
            b.used_mut().query_pools.add(&pool, Some(id));
            Command::BeginQuery { pool, query, flags }
        })
    }

    pub fn end_query(&self, pool: vk::QueryPool, query: u32) -> Result<CommandId, LayerError> {
        let pool = resolve(&self.device.resources.query_pools, pool)?;
        self.push(|b, id| {
            b.used_mut().query_pools.add(&pool, Some(id));
            Command::EndQuery { pool, query }
        })
    }

    pub fn reset_query_pool(&self, pool: vk::QueryPool, first_query: u32, query_count: u32) -> Result<CommandId, LayerError> {
        let pool = resolve(&self.device.resources.query_pools, pool)?;
        self.push(|b, id| {
            b.used_mut().query_pools.add(&pool, Some(id));
            Command::ResetQueryPool {
                pool,
                first_query,
                query_count,
            }
        })
    }

    pub fn write_timestamp(
        &self,
        stage: vk::PipelineStageFlags2,
        pool: vk::QueryPool,
        query: u32,
    ) -> Result<CommandId, LayerError> {
        let pool = resolve(&self.device.resources.query_pools, pool)?;
        self.push(|b, id| {
            b.used_mut().query_pools.add(&pool, Some(id));
            Command::WriteTimestamp { pool, query, stage }
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_query_pool_results(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        stride: vk::DeviceSize,
        flags: vk::QueryResultFlags,
    ) -> Result<CommandId, LayerError> {
        let pool = resolve(&self.device.resources.query_pools, pool)?;
        let dst = resolve(&self.device.resources.buffers, dst)?;
        self.push(|b, id| {
            let used = b.used_mut();
            used.query_pools.add(&pool, Some(id));
            used.buffers.add(&dst, Some(id));
            Command::CopyQueryPoolResults {
                pool,
                first_query,
                query_count,
                dst,
                dst_offset,
                stride,
                flags,
            }
        })
    }

    // ── Debug labels ────────────────────────────────────────

    pub fn begin_debug_label(&self, name: &str, color: [f32; 4]) -> Result<CommandId, LayerError> {
        self.push(|b, _| Command::BeginDebugLabel {
            name: b.arena_mut().alloc_str(name),
            color,
        })
    }

    pub fn end_debug_label(&self) -> Result<CommandId, LayerError> {
        self.push(|_, _| Command::EndDebugLabel)
    }

    pub fn insert_debug_label(&self, name: &str, color: [f32; 4]) -> Result<CommandId, LayerError> {
        self.push(|b, _| Command::InsertDebugLabel {
            name: b.arena_mut().alloc_str(name),
            color,
        })
    }

    // ── Conditional rendering ───────────────────────────────

    pub fn begin_conditional_rendering(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        inverted: bool,
    ) -> Result<CommandId, LayerError> {
        let buffer = resolve(&self.device.resources.buffers, buffer)?;
        self.push(|b, id| {
            b.used_mut().buffers.add(&buffer, Some(id));
            Command::BeginConditionalRendering {
                buffer,
                offset,
                inverted,
            }
        })
    }

    pub fn end_conditional_rendering(&self) -> Result<CommandId, LayerError> {
        self.push(|_, _| Command::EndConditionalRendering)
    }

    // ── Nesting ─────────────────────────────────────────────

    /// Execute secondary command buffers. Their usage is flattened into
    /// this record.
    pub fn execute_commands(&self, secondaries: &[vk::CommandBuffer]) -> Result<CommandId, LayerError> {
        let records = {
            let state = self.device.state.lock();
            secondaries
                .iter()
                .map(|cb| {
                    let raw = cb.as_raw();
                    let slot = state.slot(raw)?;
                    match (slot.state, &slot.last) {
                        (CommandBufferState::Executable, Some(record))
                            if record.level == vk::CommandBufferLevel::SECONDARY =>
                        {
                            Ok(Arc::clone(record))
                        }
                        (found, _) => Err(contract_violation!(raw, "executable secondary", found.name())),
                    }
                })
                .collect::<Result<Vec<Arc<CommandRecord>>, LayerError>>()?
        };

        self.push(|b, _| {
            for record in &records {
                let imported = record.used();
                b.used_mut().import(&imported);
                drop(imported);
                b.note_secondary(Arc::clone(record));
            }
            Command::ExecuteCommands { secondaries: records }
        })
    }

    pub fn build_acceleration_structures(&self, builds: &[AccelerationStructureBuildInfo]) -> Result<CommandId, LayerError> {
        let table = &self.device.resources.acceleration_structures;
        let builds = builds
            .iter()
            .map(|info| {
                Ok(AccelerationStructureBuild {
                    ty: info.ty,
                    mode: info.mode,
                    flags: info.flags,
                    src: info.src.map(|h| resolve(table, h)).transpose()?,
                    dst: resolve(table, info.dst)?,
                    geometry_count: info.geometry_count,
                })
            })
            .collect::<Result<Vec<_>, LayerError>>()?;

        self.push(|b, id| {
            for build in &builds {
                let used = b.used_mut();
                if let Some(src) = &build.src {
                    used.acceleration_structures.add(src, Some(id));
                }
                used.acceleration_structures.add(&build.dst, Some(id));
                b.note_accel_build(build.dst.handle, build.flags);
            }
            Command::BuildAccelerationStructures { builds }
        })
    }
}
