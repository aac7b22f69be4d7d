//! Per-record handle-usage tracking.
//!
//! Every resource a record touches gets exactly one entry per record. The
//! entry holds a strong reference so the resource outlives any submission
//! that might still execute the record. Images additionally collect the
//! layout transitions the record performs, which are propagated onto the
//! image's pending layout once the record is actually submitted.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use crate::command::CommandId;
use crate::resource::{
    AccelerationStructure, Buffer, DescriptorPool, DescriptorSet, DescriptorUpdateTemplate, Event,
    Framebuffer, Image, ImageDesc, ImageView, Pipeline, PipelineLayout, QueryPool, RenderPass,
    Sampler, ShadowObject,
};

const ASPECT_BITS: [vk::ImageAspectFlags; 6] = [
    vk::ImageAspectFlags::COLOR,
    vk::ImageAspectFlags::DEPTH,
    vk::ImageAspectFlags::STENCIL,
    vk::ImageAspectFlags::PLANE_0,
    vk::ImageAspectFlags::PLANE_1,
    vk::ImageAspectFlags::PLANE_2,
];

// ── Subresource layouts ─────────────────────────────────────

/// One layout transition, with its range already resolved against the
/// image's real geometry (no `REMAINING_*` values).
#[derive(Debug, Clone, Copy)]
pub struct LayoutChange {
    pub range: vk::ImageSubresourceRange,
    pub layout: vk::ImageLayout,
    /// Command that caused the transition. `None` for transitions imported
    /// from a secondary record.
    pub command: Option<CommandId>,
}

/// Clamp `range` to the image described by `desc`, resolving
/// `REMAINING_MIP_LEVELS`/`REMAINING_ARRAY_LAYERS` and dropping aspects the
/// image does not have.
pub fn resolve_range(desc: &ImageDesc, range: vk::ImageSubresourceRange) -> vk::ImageSubresourceRange {
    let base_mip_level = range.base_mip_level.min(desc.mip_levels);
    let base_array_layer = range.base_array_layer.min(desc.array_layers);
    let max_levels = desc.mip_levels - base_mip_level;
    let max_layers = desc.array_layers - base_array_layer;

    let level_count = if range.level_count == vk::REMAINING_MIP_LEVELS {
        max_levels
    } else {
        range.level_count.min(max_levels)
    };
    let layer_count = if range.layer_count == vk::REMAINING_ARRAY_LAYERS {
        max_layers
    } else {
        range.layer_count.min(max_layers)
    };

    vk::ImageSubresourceRange {
        aspect_mask: range.aspect_mask & desc.aspects,
        base_mip_level,
        level_count,
        base_array_layer,
        layer_count,
    }
}

/// Layout of every (aspect, mip, layer) subresource of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubresourceLayouts {
    aspects: Vec<vk::ImageAspectFlags>,
    mip_levels: u32,
    array_layers: u32,
    layouts: Vec<vk::ImageLayout>,
}

impl SubresourceLayouts {
    pub fn new(desc: &ImageDesc, initial: vk::ImageLayout) -> Self {
        let aspects: Vec<_> = ASPECT_BITS
            .iter()
            .copied()
            .filter(|bit| desc.aspects.contains(*bit))
            .collect();
        let count = aspects.len() * desc.mip_levels as usize * desc.array_layers as usize;
        Self {
            aspects,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            layouts: vec![initial; count],
        }
    }

    fn index(&self, aspect_index: usize, mip: u32, layer: u32) -> usize {
        (aspect_index * self.mip_levels as usize + mip as usize) * self.array_layers as usize
            + layer as usize
    }

    /// Layout of a single subresource. Out-of-range queries return
    /// `UNDEFINED`.
    pub fn get(&self, aspect: vk::ImageAspectFlags, mip: u32, layer: u32) -> vk::ImageLayout {
        if mip >= self.mip_levels || layer >= self.array_layers {
            return vk::ImageLayout::UNDEFINED;
        }
        match self.aspects.iter().position(|a| *a == aspect) {
            Some(ai) => self.layouts[self.index(ai, mip, layer)],
            None => vk::ImageLayout::UNDEFINED,
        }
    }

    /// Set every subresource covered by `change.range` to `change.layout`.
    pub fn apply(&mut self, change: &LayoutChange) {
        let range = change.range;
        let mip_end = (range.base_mip_level + range.level_count).min(self.mip_levels);
        let layer_end = (range.base_array_layer + range.layer_count).min(self.array_layers);

        for ai in 0..self.aspects.len() {
            if !range.aspect_mask.contains(self.aspects[ai]) {
                continue;
            }
            for mip in range.base_mip_level..mip_end {
                for layer in range.base_array_layer..layer_end {
                    let idx = self.index(ai, mip, layer);
                    self.layouts[idx] = change.layout;
                }
            }
        }
    }

    pub fn subresource_count(&self) -> usize {
        self.layouts.len()
    }
}

// ── Used handle entries ─────────────────────────────────────

/// A resource referenced by a record.
#[derive(Debug)]
pub struct UsedHandle<T> {
    pub handle: Arc<T>,
    /// Commands in this record that referenced the resource, in call order.
    pub commands: Vec<CommandId>,
}

impl<T> UsedHandle<T> {
    fn new(handle: Arc<T>) -> Self {
        Self {
            handle,
            commands: Vec::new(),
        }
    }

    fn note_command(&mut self, command: Option<CommandId>) {
        if let Some(cmd) = command {
            if self.commands.last() != Some(&cmd) {
                self.commands.push(cmd);
            }
        }
    }
}

#[derive(Debug)]
pub struct UsedImage {
    pub used: UsedHandle<Image>,
    pub layout_changes: Vec<LayoutChange>,
}

impl UsedImage {
    /// Layouts after replaying this record's transitions on top of `start`.
    pub fn final_layouts(&self, start: &SubresourceLayouts) -> SubresourceLayouts {
        let mut layouts = start.clone();
        for change in &self.layout_changes {
            layouts.apply(change);
        }
        layouts
    }
}

/// Deduplicating set of used handles for one resource category.
#[derive(Debug)]
pub struct UsedSet<T> {
    entries: HashMap<u64, UsedHandle<T>>,
}

impl<T: ShadowObject> UsedSet<T> {
    /// Insert-if-absent. Subsequent references only append the command.
    pub fn add(&mut self, object: &Arc<T>, command: Option<CommandId>) -> &mut UsedHandle<T> {
        let entry = self
            .entries
            .entry(object.raw())
            .or_insert_with(|| UsedHandle::new(Arc::clone(object)));
        // The caller holds a reference and so do we; a mismatch means the
        // handle value was recycled while this record still pinned the old
        // object.
        debug_assert!(Arc::ptr_eq(&entry.handle, object));
        debug_assert!(Arc::strong_count(&entry.handle) >= 2);
        entry.note_command(command);
        entry
    }

    pub fn get(&self, raw: u64) -> Option<&UsedHandle<T>> {
        self.entries.get(&raw)
    }

    pub fn contains(&self, raw: u64) -> bool {
        self.entries.contains_key(&raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsedHandle<T>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn import(&mut self, other: &UsedSet<T>) {
        for used in other.entries.values() {
            self.add(&used.handle, None);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for UsedSet<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

// ── Per-record tracker ──────────────────────────────────────

/// All resources referenced by one record, one set per category.
#[derive(Debug, Default)]
pub struct UsedHandles {
    images: HashMap<u64, UsedImage>,
    pub image_views: UsedSet<ImageView>,
    pub buffers: UsedSet<Buffer>,
    pub samplers: UsedSet<Sampler>,
    pub descriptor_sets: UsedSet<DescriptorSet>,
    pub descriptor_pools: UsedSet<DescriptorPool>,
    pub update_templates: UsedSet<DescriptorUpdateTemplate>,
    pub pipeline_layouts: UsedSet<PipelineLayout>,
    pub pipelines: UsedSet<Pipeline>,
    pub query_pools: UsedSet<QueryPool>,
    pub acceleration_structures: UsedSet<AccelerationStructure>,
    pub events: UsedSet<Event>,
    pub render_passes: UsedSet<RenderPass>,
    pub framebuffers: UsedSet<Framebuffer>,
}

impl UsedHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_image(&mut self, image: &Arc<Image>, command: Option<CommandId>) -> &mut UsedImage {
        let entry = self.images.entry(image.raw()).or_insert_with(|| UsedImage {
            used: UsedHandle::new(Arc::clone(image)),
            layout_changes: Vec::new(),
        });
        debug_assert!(Arc::ptr_eq(&entry.used.handle, image));
        entry.used.note_command(command);
        entry
    }

    /// Register an image use that leaves `range` in `layout`.
    pub fn use_image_layout(
        &mut self,
        image: &Arc<Image>,
        command: Option<CommandId>,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
    ) {
        let range = resolve_range(&image.desc, range);
        let entry = self.use_image(image, command);
        entry.layout_changes.push(LayoutChange {
            range,
            layout,
            command,
        });
    }

    /// Registers the view and pins its parent image.
    pub fn use_image_view(&mut self, view: &Arc<ImageView>, command: Option<CommandId>) {
        self.image_views.add(view, command);
        self.use_image(&view.image, command);
    }

    /// Registers the set and pins its owning pool.
    pub fn use_descriptor_set(&mut self, set: &Arc<DescriptorSet>, command: Option<CommandId>) {
        self.descriptor_sets.add(set, command);
        self.descriptor_pools.add(&set.pool, command);
    }

    /// Registers the pipeline and its layout.
    pub fn use_pipeline(&mut self, pipeline: &Arc<Pipeline>, command: Option<CommandId>) {
        self.pipelines.add(pipeline, command);
        self.pipeline_layouts.add(&pipeline.layout, command);
    }

    /// Registers the framebuffer and every attachment view (and so image).
    pub fn use_framebuffer(&mut self, fb: &Arc<Framebuffer>, command: Option<CommandId>) {
        self.framebuffers.add(fb, command);
        for view in &fb.attachments {
            self.use_image_view(view, command);
        }
    }

    pub fn image(&self, raw: u64) -> Option<&UsedImage> {
        self.images.get(&raw)
    }

    pub fn images(&self) -> impl Iterator<Item = &UsedImage> {
        self.images.values()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Flatten another record's usage into this one (secondary command
    /// buffers executed from a primary). Layout changes are appended in
    /// order.
    pub fn import(&mut self, other: &UsedHandles) {
        for used in other.images.values() {
            let entry = self.use_image(&used.used.handle, None);
            entry.layout_changes.extend(used.layout_changes.iter().map(|c| LayoutChange {
                command: None,
                ..*c
            }));
        }
        self.image_views.import(&other.image_views);
        self.buffers.import(&other.buffers);
        self.samplers.import(&other.samplers);
        self.descriptor_sets.import(&other.descriptor_sets);
        self.descriptor_pools.import(&other.descriptor_pools);
        self.update_templates.import(&other.update_templates);
        self.pipeline_layouts.import(&other.pipeline_layouts);
        self.pipelines.import(&other.pipelines);
        self.query_pools.import(&other.query_pools);
        self.acceleration_structures
            .import(&other.acceleration_structures);
        self.events.import(&other.events);
        self.render_passes.import(&other.render_passes);
        self.framebuffers.import(&other.framebuffers);
    }

    /// Whether any category holds the resource with this raw handle.
    pub fn contains(&self, raw: u64) -> bool {
        self.images.contains_key(&raw)
            || self.image_views.contains(raw)
            || self.buffers.contains(raw)
            || self.samplers.contains(raw)
            || self.descriptor_sets.contains(raw)
            || self.descriptor_pools.contains(raw)
            || self.update_templates.contains(raw)
            || self.pipeline_layouts.contains(raw)
            || self.pipelines.contains(raw)
            || self.query_pools.contains(raw)
            || self.acceleration_structures.contains(raw)
            || self.events.contains(raw)
            || self.render_passes.contains(raw)
            || self.framebuffers.contains(raw)
    }

    pub fn len(&self) -> usize {
        self.images.len()
            + self.image_views.len()
            + self.buffers.len()
            + self.samplers.len()
            + self.descriptor_sets.len()
            + self.descriptor_pools.len()
            + self.update_templates.len()
            + self.pipeline_layouts.len()
            + self.pipelines.len()
            + self.query_pools.len()
            + self.acceleration_structures.len()
            + self.events.len()
            + self.render_passes.len()
            + self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every strong reference held by this record.
    pub fn clear(&mut self) {
        self.images.clear();
        self.image_views.clear();
        self.buffers.clear();
        self.samplers.clear();
        self.descriptor_sets.clear();
        self.descriptor_pools.clear();
        self.update_templates.clear();
        self.pipeline_layouts.clear();
        self.pipelines.clear();
        self.query_pools.clear();
        self.acceleration_structures.clear();
        self.events.clear();
        self.render_passes.clear();
        self.framebuffers.clear();
    }

    /// Apply this record's layout transitions onto each image's pending
    /// layout. Called once the record is known to be submitted.
    pub fn propagate_pending_layouts(&self) {
        for used in self.images.values() {
            if used.layout_changes.is_empty() {
                continue;
            }
            let mut pending = used.used.handle.pending_layouts.write();
            for change in &used.layout_changes {
                pending.apply(change);
            }
        }
    }
}
