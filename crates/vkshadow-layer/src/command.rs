//! The closed set of recorded commands.
//!
//! Commands hold strong references to the shadow objects they touch and
//! offsets into the record's arena for copied payloads. Section structure
//! (render passes, labels, conditional rendering) lives in
//! [`crate::section`]; a command only knows which section it was recorded in.

use std::sync::Arc;

use ash::vk;

use crate::arena::{ArenaSlice, ArenaStr};
use crate::record::CommandRecord;
use crate::resource::{
    AccelerationStructure, Buffer, DescriptorSet, Event, Framebuffer, Image, ImageView, Pipeline,
    PipelineLayout, QueryPool, RenderPass,
};
use crate::state::{ComputeState, GraphicsState, RayTracingState};

/// Index of a command inside its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u32);

impl CommandId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ── Payload types ───────────────────────────────────────────

/// Clear value with the color stored as raw bits, so float, int and uint
/// formats round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([u32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearAttachment {
    pub aspect_mask: vk::ImageAspectFlags,
    pub color_attachment: u32,
    pub value: ClearValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    /// Widen a barrier from the 32-bit stage and access masks.
    pub fn legacy(
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::from_raw(u64::from(src_stage.as_raw())),
            src_access: vk::AccessFlags2::from_raw(u64::from(src_access.as_raw())),
            dst_stage: vk::PipelineStageFlags2::from_raw(u64::from(dst_stage.as_raw())),
            dst_access: vk::AccessFlags2::from_raw(u64::from(dst_access.as_raw())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferBarrier {
    pub buffer: Arc<Buffer>,
    pub barrier: MemoryBarrier,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Debug, Clone)]
pub struct ImageBarrier {
    pub image: Arc<Image>,
    pub barrier: MemoryBarrier,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub range: vk::ImageSubresourceRange,
}

/// Barrier set shared by pipeline barriers, set-event and wait-events.
/// Legacy (single stage mask) barriers are widened to the 64-bit masks.
#[derive(Debug, Clone, Default)]
pub struct DependencyInfo {
    pub flags: vk::DependencyFlags,
    pub memory: Vec<MemoryBarrier>,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

#[derive(Debug, Clone)]
pub struct RenderingAttachment {
    pub view: Arc<ImageView>,
    pub layout: vk::ImageLayout,
    pub resolve: Option<(Arc<ImageView>, vk::ImageLayout)>,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: Option<ClearValue>,
}

#[derive(Debug, Clone)]
pub struct AccelerationStructureBuild {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub src: Option<Arc<AccelerationStructure>>,
    pub dst: Arc<AccelerationStructure>,
    pub geometry_count: u32,
}

/// One piece of dynamic render state set by a `vkCmdSet*` call.
#[derive(Debug, Clone)]
pub enum DynamicValue {
    Viewports { first: u32, viewports: Vec<vk::Viewport> },
    Scissors { first: u32, scissors: Vec<vk::Rect2D> },
    LineWidth(f32),
    DepthBias { constant: f32, clamp: f32, slope: f32 },
    BlendConstants([f32; 4]),
    DepthBounds { min: f32, max: f32 },
    StencilCompareMask { faces: vk::StencilFaceFlags, mask: u32 },
    StencilWriteMask { faces: vk::StencilFaceFlags, mask: u32 },
    StencilReference { faces: vk::StencilFaceFlags, reference: u32 },
    CullMode(vk::CullModeFlags),
    FrontFace(vk::FrontFace),
    PrimitiveTopology(vk::PrimitiveTopology),
    DepthTestEnable(bool),
    DepthWriteEnable(bool),
    DepthCompareOp(vk::CompareOp),
}

// ── Command ─────────────────────────────────────────────────

#[derive(Debug)]
pub enum Command {
    // ── Render pass boundaries ──────────────────────────────
    BeginRenderPass {
        render_pass: Arc<RenderPass>,
        framebuffer: Arc<Framebuffer>,
        render_area: vk::Rect2D,
        clear_values: Vec<ClearValue>,
        contents: vk::SubpassContents,
    },
    NextSubpass {
        contents: vk::SubpassContents,
    },
    EndRenderPass,
    BeginRendering {
        render_area: vk::Rect2D,
        layer_count: u32,
        color_attachments: Vec<RenderingAttachment>,
        depth_attachment: Option<RenderingAttachment>,
        stencil_attachment: Option<RenderingAttachment>,
    },
    EndRendering,

    // ── Binding ─────────────────────────────────────────────
    BindPipeline {
        pipeline: Arc<Pipeline>,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: Arc<PipelineLayout>,
        first_set: u32,
        sets: Vec<Arc<DescriptorSet>>,
        dynamic_offsets: Vec<u32>,
    },
    PushConstants {
        layout: Arc<PipelineLayout>,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: ArenaSlice,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<Arc<Buffer>>,
        offsets: Vec<vk::DeviceSize>,
    },
    BindIndexBuffer {
        buffer: Arc<Buffer>,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    SetDynamic(DynamicValue),

    // ── Work ────────────────────────────────────────────────
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
        state: Arc<GraphicsState>,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
        state: Arc<GraphicsState>,
    },
    DrawIndirect {
        buffer: Arc<Buffer>,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
        indexed: bool,
        state: Arc<GraphicsState>,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
        state: Arc<ComputeState>,
    },
    DispatchIndirect {
        buffer: Arc<Buffer>,
        offset: vk::DeviceSize,
        state: Arc<ComputeState>,
    },
    TraceRays {
        width: u32,
        height: u32,
        depth: u32,
        state: Arc<RayTracingState>,
    },

    // ── Transfer ────────────────────────────────────────────
    CopyBuffer {
        src: Arc<Buffer>,
        dst: Arc<Buffer>,
        regions: Vec<vk::BufferCopy>,
    },
    CopyImage {
        src: Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    CopyBufferToImage {
        src: Arc<Buffer>,
        dst: Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: Arc<Buffer>,
        regions: Vec<vk::BufferImageCopy>,
    },
    BlitImage {
        src: Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
        filter: vk::Filter,
    },
    ClearColorImage {
        image: Arc<Image>,
        layout: vk::ImageLayout,
        color: [u32; 4],
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ClearDepthStencilImage {
        image: Arc<Image>,
        layout: vk::ImageLayout,
        depth: f32,
        stencil: u32,
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ClearAttachments {
        attachments: Vec<ClearAttachment>,
        rects: Vec<vk::ClearRect>,
    },
    FillBuffer {
        dst: Arc<Buffer>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    },
    UpdateBuffer {
        dst: Arc<Buffer>,
        offset: vk::DeviceSize,
        data: ArenaSlice,
    },

    // ── Synchronization ─────────────────────────────────────
    PipelineBarrier {
        dependency: DependencyInfo,
    },
    SetEvent {
        event: Arc<Event>,
        dependency: DependencyInfo,
    },
    ResetEvent {
        event: Arc<Event>,
        stage: vk::PipelineStageFlags2,
    },
    WaitEvents {
        events: Vec<Arc<Event>>,
        dependency: DependencyInfo,
    },

    // ── Queries ─────────────────────────────────────────────
    BeginQuery {
        pool: Arc<QueryPool>,
        query: u32,
        flags: vk::QueryControlFlags,
    },
    EndQuery {
        pool: Arc<QueryPool>,
        query: u32,
    },
    ResetQueryPool {
        pool: Arc<QueryPool>,
        first_query: u32,
        query_count: u32,
    },
    WriteTimestamp {
        pool: Arc<QueryPool>,
        query: u32,
        stage: vk::PipelineStageFlags2,
    },
    CopyQueryPoolResults {
        pool: Arc<QueryPool>,
        first_query: u32,
        query_count: u32,
        dst: Arc<Buffer>,
        dst_offset: vk::DeviceSize,
        stride: vk::DeviceSize,
        flags: vk::QueryResultFlags,
    },

    // ── Debug labels ────────────────────────────────────────
    BeginDebugLabel {
        name: ArenaStr,
        color: [f32; 4],
    },
    EndDebugLabel,
    InsertDebugLabel {
        name: ArenaStr,
        color: [f32; 4],
    },

    // ── Conditional rendering ───────────────────────────────
    BeginConditionalRendering {
        buffer: Arc<Buffer>,
        offset: vk::DeviceSize,
        inverted: bool,
    },
    EndConditionalRendering,

    // ── Nesting ─────────────────────────────────────────────
    ExecuteCommands {
        secondaries: Vec<Arc<CommandRecord>>,
    },
    BuildAccelerationStructures {
        builds: Vec<AccelerationStructureBuild>,
    },
}

/// Fieldless tag of a [`Command`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    BeginRenderPass,
    NextSubpass,
    EndRenderPass,
    BeginRendering,
    EndRendering,
    BindPipeline,
    BindDescriptorSets,
    PushConstants,
    BindVertexBuffers,
    BindIndexBuffer,
    SetDynamic,
    Draw,
    DrawIndexed,
    DrawIndirect,
    Dispatch,
    DispatchIndirect,
    TraceRays,
    CopyBuffer,
    CopyImage,
    CopyBufferToImage,
    CopyImageToBuffer,
    BlitImage,
    ClearColorImage,
    ClearDepthStencilImage,
    ClearAttachments,
    FillBuffer,
    UpdateBuffer,
    PipelineBarrier,
    SetEvent,
    ResetEvent,
    WaitEvents,
    BeginQuery,
    EndQuery,
    ResetQueryPool,
    WriteTimestamp,
    CopyQueryPoolResults,
    BeginDebugLabel,
    EndDebugLabel,
    InsertDebugLabel,
    BeginConditionalRendering,
    EndConditionalRendering,
    ExecuteCommands,
    BuildAccelerationStructures,
}

/// Coarse grouping used for per-section statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    Draw,
    Dispatch,
    TraceRays,
    Transfer,
    Sync,
    Bind,
    Query,
    Label,
    RenderPass,
    Other,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::BeginRenderPass { .. } => CommandKind::BeginRenderPass,
            Command::NextSubpass { .. } => CommandKind::NextSubpass,
            Command::EndRenderPass => CommandKind::EndRenderPass,
            Command::BeginRendering { .. } => CommandKind::BeginRendering,
            Command::EndRendering => CommandKind::EndRendering,
            Command::BindPipeline { .. } => CommandKind::BindPipeline,
            Command::BindDescriptorSets { .. } => CommandKind::BindDescriptorSets,
            Command::PushConstants { .. } => CommandKind::PushConstants,
            Command::BindVertexBuffers { .. } => CommandKind::BindVertexBuffers,
            Command::BindIndexBuffer { .. } => CommandKind::BindIndexBuffer,
            Command::SetDynamic(_) => CommandKind::SetDynamic,
            Command::Draw { .. } => CommandKind::Draw,
            Command::DrawIndexed { .. } => CommandKind::DrawIndexed,
            Command::DrawIndirect { .. } => CommandKind::DrawIndirect,
            Command::Dispatch { .. } => CommandKind::Dispatch,
            Command::DispatchIndirect { .. } => CommandKind::DispatchIndirect,
            Command::TraceRays { .. } => CommandKind::TraceRays,
            Command::CopyBuffer { .. } => CommandKind::CopyBuffer,
            Command::CopyImage { .. } => CommandKind::CopyImage,
            Command::CopyBufferToImage { .. } => CommandKind::CopyBufferToImage,
            Command::CopyImageToBuffer { .. } => CommandKind::CopyImageToBuffer,
            Command::BlitImage { .. } => CommandKind::BlitImage,
            Command::ClearColorImage { .. } => CommandKind::ClearColorImage,
            Command::ClearDepthStencilImage { .. } => CommandKind::ClearDepthStencilImage,
            Command::ClearAttachments { .. } => CommandKind::ClearAttachments,
            Command::FillBuffer { .. } => CommandKind::FillBuffer,
            Command::UpdateBuffer { .. } => CommandKind::UpdateBuffer,
            Command::PipelineBarrier { .. } => CommandKind::PipelineBarrier,
            Command::SetEvent { .. } => CommandKind::SetEvent,
            Command::ResetEvent { .. } => CommandKind::ResetEvent,
            Command::WaitEvents { .. } => CommandKind::WaitEvents,
            Command::BeginQuery { .. } => CommandKind::BeginQuery,
            Command::EndQuery { .. } => CommandKind::EndQuery,
            Command::ResetQueryPool { .. } => CommandKind::ResetQueryPool,
            Command::WriteTimestamp { .. } => CommandKind::WriteTimestamp,
            Command::CopyQueryPoolResults { .. } => CommandKind::CopyQueryPoolResults,
            Command::BeginDebugLabel { .. } => CommandKind::BeginDebugLabel,
            Command::EndDebugLabel => CommandKind::EndDebugLabel,
            Command::InsertDebugLabel { .. } => CommandKind::InsertDebugLabel,
            Command::BeginConditionalRendering { .. } => CommandKind::BeginConditionalRendering,
            Command::EndConditionalRendering => CommandKind::EndConditionalRendering,
            Command::ExecuteCommands { .. } => CommandKind::ExecuteCommands,
            Command::BuildAccelerationStructures { .. } => CommandKind::BuildAccelerationStructures,
        }
    }

    pub fn category(&self) -> CommandCategory {
        self.kind().category()
    }
}

impl CommandKind {
    pub fn category(self) -> CommandCategory {
        use CommandKind::*;
        match self {
            Draw | DrawIndexed | DrawIndirect | ClearAttachments => CommandCategory::Draw,
            Dispatch | DispatchIndirect => CommandCategory::Dispatch,
            TraceRays => CommandCategory::TraceRays,
            CopyBuffer | CopyImage | CopyBufferToImage | CopyImageToBuffer | BlitImage
            | ClearColorImage | ClearDepthStencilImage | FillBuffer | UpdateBuffer
            | BuildAccelerationStructures => CommandCategory::Transfer,
            PipelineBarrier | SetEvent | ResetEvent | WaitEvents => CommandCategory::Sync,
            BindPipeline | BindDescriptorSets | PushConstants | BindVertexBuffers
            | BindIndexBuffer | SetDynamic => CommandCategory::Bind,
            BeginQuery | EndQuery | ResetQueryPool | WriteTimestamp | CopyQueryPoolResults => {
                CommandCategory::Query
            }
            BeginDebugLabel | EndDebugLabel | InsertDebugLabel => CommandCategory::Label,
            BeginRenderPass | NextSubpass | EndRenderPass | BeginRendering | EndRendering => {
                CommandCategory::RenderPass
            }
            BeginConditionalRendering | EndConditionalRendering | ExecuteCommands => {
                CommandCategory::Other
            }
        }
    }
}
