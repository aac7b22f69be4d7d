//! Shadow objects for the resources command buffers reference.
//!
//! The object model itself (creation, destruction, memory binding) belongs to
//! the surrounding layer. This module only holds what recording and
//! submission consult: the driver-native handle and a few read-only fields.
//! Reference counts are the `Arc` strong counts.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::RwLock;

use vkshadow_core::HandleTable;

use crate::usage::SubresourceLayouts;

/// Common surface of every shadow object.
pub trait ShadowObject: Send + Sync + 'static {
    type Handle: Handle + Copy;

    /// Object kind used in diagnostics.
    const KIND: &'static str;

    /// Handle the application sees.
    fn handle(&self) -> Self::Handle;

    /// Handle the driver sees.
    fn native(&self) -> Self::Handle;

    fn raw(&self) -> u64 {
        self.handle().as_raw()
    }
}

macro_rules! shadow_object {
    ($name:ident, $vk:ty, $kind:literal { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug)]
        pub struct $name {
            pub handle: $vk,
            pub native: $vk,
            $(pub $field: $ty,)*
        }

        impl ShadowObject for $name {
            type Handle = $vk;
            const KIND: &'static str = $kind;

            fn handle(&self) -> $vk {
                self.handle
            }

            fn native(&self) -> $vk {
                self.native
            }
        }
    };
}

shadow_object!(Buffer, vk::Buffer, "buffer" { size: vk::DeviceSize });
shadow_object!(Sampler, vk::Sampler, "sampler" {});
shadow_object!(DescriptorSetLayout, vk::DescriptorSetLayout, "descriptor set layout" {
    bindings: Vec<DescriptorBindingDesc>,
});
shadow_object!(DescriptorPool, vk::DescriptorPool, "descriptor pool" {});
shadow_object!(DescriptorSet, vk::DescriptorSet, "descriptor set" {
    pool: Arc<DescriptorPool>,
    layout: Arc<DescriptorSetLayout>,
});
shadow_object!(DescriptorUpdateTemplate, vk::DescriptorUpdateTemplate, "descriptor update template" {});
shadow_object!(PipelineLayout, vk::PipelineLayout, "pipeline layout" {
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
});
shadow_object!(Pipeline, vk::Pipeline, "pipeline" {
    bind_point: vk::PipelineBindPoint,
    layout: Arc<PipelineLayout>,
});
shadow_object!(QueryPool, vk::QueryPool, "query pool" {
    query_type: vk::QueryType,
    query_count: u32,
});
shadow_object!(AccelerationStructure, vk::AccelerationStructureKHR, "acceleration structure" {});
shadow_object!(Event, vk::Event, "event" {});
shadow_object!(RenderPass, vk::RenderPass, "render pass" {
    attachments: Vec<AttachmentDesc>,
    subpass_count: u32,
});
shadow_object!(ImageView, vk::ImageView, "image view" {
    image: Arc<Image>,
    range: vk::ImageSubresourceRange,
});
shadow_object!(Framebuffer, vk::Framebuffer, "framebuffer" {
    attachments: Vec<Arc<ImageView>>,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub final_layout: vk::ImageLayout,
}

/// Creation parameters of an [`Image`] relevant for layout tracking.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub aspects: vk::ImageAspectFlags,
    pub initial_layout: vk::ImageLayout,
}

#[derive(Debug)]
pub struct Image {
    pub handle: vk::Image,
    pub native: vk::Image,
    pub desc: ImageDesc,
    /// Layouts the image will have once all submitted work has executed.
    /// Only updated at submission time, never while recording.
    pub pending_layouts: RwLock<SubresourceLayouts>,
}

impl Image {
    pub fn new(handle: vk::Image, native: vk::Image, desc: ImageDesc) -> Self {
        Self {
            handle,
            native,
            desc,
            pending_layouts: RwLock::new(SubresourceLayouts::new(&desc, desc.initial_layout)),
        }
    }

    /// Range covering every subresource of the image.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.desc.aspects,
            base_mip_level: 0,
            level_count: self.desc.mip_levels,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        }
    }

    pub fn pending_layout(&self, aspect: vk::ImageAspectFlags, mip: u32, layer: u32) -> vk::ImageLayout {
        self.pending_layouts.read().get(aspect, mip, layer)
    }
}

impl ShadowObject for Image {
    type Handle = vk::Image;
    const KIND: &'static str = "image";

    fn handle(&self) -> vk::Image {
        self.handle
    }

    fn native(&self) -> vk::Image {
        self.native
    }
}

/// Lookup tables for every resource category, keyed by application handle.
pub struct ResourceTables {
    pub images: HandleTable<Image>,
    pub image_views: HandleTable<ImageView>,
    pub buffers: HandleTable<Buffer>,
    pub samplers: HandleTable<Sampler>,
    pub descriptor_set_layouts: HandleTable<DescriptorSetLayout>,
    pub descriptor_pools: HandleTable<DescriptorPool>,
    pub descriptor_sets: HandleTable<DescriptorSet>,
    pub update_templates: HandleTable<DescriptorUpdateTemplate>,
    pub pipeline_layouts: HandleTable<PipelineLayout>,
    pub pipelines: HandleTable<Pipeline>,
    pub query_pools: HandleTable<QueryPool>,
    pub acceleration_structures: HandleTable<AccelerationStructure>,
    pub events: HandleTable<Event>,
    pub render_passes: HandleTable<RenderPass>,
    pub framebuffers: HandleTable<Framebuffer>,
}

impl ResourceTables {
    pub fn new() -> Self {
        Self {
            images: HandleTable::new(Image::KIND),
            image_views: HandleTable::new(ImageView::KIND),
            buffers: HandleTable::new(Buffer::KIND),
            samplers: HandleTable::new(Sampler::KIND),
            descriptor_set_layouts: HandleTable::new(DescriptorSetLayout::KIND),
            descriptor_pools: HandleTable::new(DescriptorPool::KIND),
            descriptor_sets: HandleTable::new(DescriptorSet::KIND),
            update_templates: HandleTable::new(DescriptorUpdateTemplate::KIND),
            pipeline_layouts: HandleTable::new(PipelineLayout::KIND),
            pipelines: HandleTable::new(Pipeline::KIND),
            query_pools: HandleTable::new(QueryPool::KIND),
            acceleration_structures: HandleTable::new(AccelerationStructure::KIND),
            events: HandleTable::new(Event::KIND),
            render_passes: HandleTable::new(RenderPass::KIND),
            framebuffers: HandleTable::new(Framebuffer::KIND),
        }
    }
}

impl Default for ResourceTables {
    fn default() -> Self {
        Self::new()
    }
}
