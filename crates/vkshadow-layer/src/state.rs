//! Copy-on-write binding-state snapshots, one lineage per bind point.
//!
//! Every state-mutating call produces a new snapshot cloned from the previous
//! one; snapshots already captured by recorded commands never change. An
//! inspector can therefore read "what was bound right before command N"
//! straight off the command.

use std::sync::Arc;

use ash::vk;

use crate::command::DynamicValue;
use crate::resource::{Buffer, DescriptorSet, Pipeline, PipelineLayout};

#[derive(Debug, Clone)]
pub struct BoundDescriptorSet {
    pub set: Arc<DescriptorSet>,
    /// Layout the set was bound with.
    pub layout: Arc<PipelineLayout>,
    pub dynamic_offsets: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorState {
    /// Bound set per set index. `None` for indices never bound (or cleared
    /// by disturbance invalidation).
    pub sets: Vec<Option<BoundDescriptorSet>>,
}

#[derive(Debug, Clone)]
pub struct BoundVertexBuffer {
    pub buffer: Arc<Buffer>,
    pub offset: vk::DeviceSize,
}

#[derive(Debug, Clone)]
pub struct BoundIndexBuffer {
    pub buffer: Arc<Buffer>,
    pub offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StencilFaceState {
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DynamicState {
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
    pub line_width: Option<f32>,
    /// (constant factor, clamp, slope factor)
    pub depth_bias: Option<(f32, f32, f32)>,
    pub blend_constants: Option<[f32; 4]>,
    pub depth_bounds: Option<(f32, f32)>,
    pub stencil_front: StencilFaceState,
    pub stencil_back: StencilFaceState,
    pub cull_mode: Option<vk::CullModeFlags>,
    pub front_face: Option<vk::FrontFace>,
    pub primitive_topology: Option<vk::PrimitiveTopology>,
    pub depth_test_enable: Option<bool>,
    pub depth_write_enable: Option<bool>,
    pub depth_compare_op: Option<vk::CompareOp>,
}

impl DynamicState {
    pub fn apply(&mut self, value: &DynamicValue) {
        match value {
            DynamicValue::Viewports { first, viewports } => {
                splice_at(&mut self.viewports, *first as usize, viewports);
            }
            DynamicValue::Scissors { first, scissors } => {
                splice_at(&mut self.scissors, *first as usize, scissors);
            }
            DynamicValue::LineWidth(w) => self.line_width = Some(*w),
            DynamicValue::DepthBias {
                constant,
                clamp,
                slope,
            } => self.depth_bias = Some((*constant, *clamp, *slope)),
            DynamicValue::BlendConstants(c) => self.blend_constants = Some(*c),
            DynamicValue::DepthBounds { min, max } => self.depth_bounds = Some((*min, *max)),
            DynamicValue::StencilCompareMask { faces, mask } => {
                self.for_faces(*faces, |s| s.compare_mask = *mask)
            }
            DynamicValue::StencilWriteMask { faces, mask } => {
                self.for_faces(*faces, |s| s.write_mask = *mask)
            }
            DynamicValue::StencilReference { faces, reference } => {
                self.for_faces(*faces, |s| s.reference = *reference)
            }
            DynamicValue::CullMode(m) => self.cull_mode = Some(*m),
            DynamicValue::FrontFace(f) => self.front_face = Some(*f),
            DynamicValue::PrimitiveTopology(t) => self.primitive_topology = Some(*t),
            DynamicValue::DepthTestEnable(e) => self.depth_test_enable = Some(*e),
            DynamicValue::DepthWriteEnable(e) => self.depth_write_enable = Some(*e),
            DynamicValue::DepthCompareOp(op) => self.depth_compare_op = Some(*op),
        }
    }

    fn for_faces(&mut self, faces: vk::StencilFaceFlags, mut f: impl FnMut(&mut StencilFaceState)) {
        if faces.contains(vk::StencilFaceFlags::FRONT) {
            f(&mut self.stencil_front);
        }
        if faces.contains(vk::StencilFaceFlags::BACK) {
            f(&mut self.stencil_back);
        }
    }
}

fn splice_at<T: Copy + Default>(dst: &mut Vec<T>, first: usize, values: &[T]) {
    if dst.len() < first + values.len() {
        dst.resize(first + values.len(), T::default());
    }
    dst[first..first + values.len()].copy_from_slice(values);
}

// ── Snapshots ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ComputeState {
    pub pipeline: Option<Arc<Pipeline>>,
    pub descriptors: DescriptorState,
}

#[derive(Debug, Clone, Default)]
pub struct GraphicsState {
    pub pipeline: Option<Arc<Pipeline>>,
    pub descriptors: DescriptorState,
    pub vertex_buffers: Vec<Option<BoundVertexBuffer>>,
    pub index_buffer: Option<BoundIndexBuffer>,
    pub dynamic: DynamicState,
}

#[derive(Debug, Clone, Default)]
pub struct RayTracingState {
    pub pipeline: Option<Arc<Pipeline>>,
    pub descriptors: DescriptorState,
}

/// Fields every bind point shares.
pub trait BindPointState: Clone + Default {
    fn pipeline_mut(&mut self) -> &mut Option<Arc<Pipeline>>;
    fn descriptors_mut(&mut self) -> &mut DescriptorState;
}

macro_rules! bind_point_state {
    ($ty:ty) => {
        impl BindPointState for $ty {
            fn pipeline_mut(&mut self) -> &mut Option<Arc<Pipeline>> {
                &mut self.pipeline
            }

            fn descriptors_mut(&mut self) -> &mut DescriptorState {
                &mut self.descriptors
            }
        }
    };
}

bind_point_state!(ComputeState);
bind_point_state!(GraphicsState);
bind_point_state!(RayTracingState);

/// Current snapshot of one bind point plus its version count.
#[derive(Debug)]
pub struct BindingTracker<S> {
    current: Option<Arc<S>>,
    versions: u32,
}

impl<S: BindPointState> BindingTracker<S> {
    pub fn new() -> Self {
        Self {
            current: None,
            versions: 0,
        }
    }

    /// Snapshot to attach to a command. Creates the empty initial snapshot
    /// on first use without counting it as a version.
    pub fn snapshot(&mut self) -> Arc<S> {
        Arc::clone(self.current.get_or_insert_with(|| Arc::new(S::default())))
    }

    pub fn current(&self) -> Option<&Arc<S>> {
        self.current.as_ref()
    }

    /// Clone the current snapshot, mutate the clone, publish it.
    pub fn mutate(&mut self, f: impl FnOnce(&mut S)) -> Arc<S> {
        let mut next = self
            .current
            .as_deref()
            .cloned()
            .unwrap_or_default();
        f(&mut next);
        let next = Arc::new(next);
        self.current = Some(Arc::clone(&next));
        self.versions += 1;
        next
    }

    /// Number of snapshots produced by mutations in this record.
    pub fn versions(&self) -> u32 {
        self.versions
    }
}

impl<S: BindPointState> Default for BindingTracker<S> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Descriptor binding rules ────────────────────────────────

fn dynamic_descriptor_count(set: &DescriptorSet) -> usize {
    set.layout
        .bindings
        .iter()
        .filter(|b| {
            b.descriptor_type == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                || b.descriptor_type == vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        })
        .map(|b| b.count as usize)
        .sum()
}

fn push_ranges_equal(a: &PipelineLayout, b: &PipelineLayout) -> bool {
    a.push_constant_ranges.len() == b.push_constant_ranges.len()
        && a
            .push_constant_ranges
            .iter()
            .zip(&b.push_constant_ranges)
            .all(|(x, y)| x.stage_flags == y.stage_flags && x.offset == y.offset && x.size == y.size)
}

/// Whether two pipeline layouts are compatible for set index `set`: same
/// push-constant ranges and identically defined set layouts `0..=set`.
pub fn layouts_compatible(a: &PipelineLayout, b: &PipelineLayout, set: usize) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    if !push_ranges_equal(a, b) || a.set_layouts.len() <= set || b.set_layouts.len() <= set {
        return false;
    }
    a.set_layouts[..=set]
        .iter()
        .zip(&b.set_layouts[..=set])
        .all(|(x, y)| Arc::ptr_eq(x, y) || x.bindings == y.bindings)
}

/// Bind `sets` starting at `first_set`. The set array grows to at least
/// `first_set + sets.len()`; indices outside the bound range keep their
/// previous value.
pub fn bind_descriptor_sets(
    state: &mut DescriptorState,
    layout: &Arc<PipelineLayout>,
    first_set: u32,
    sets: &[Arc<DescriptorSet>],
    dynamic_offsets: &[u32],
) {
    let first = first_set as usize;
    let end = first + sets.len();
    if state.sets.len() < end {
        state.sets.resize(end, None);
    }

    let mut offsets = dynamic_offsets;
    for (i, set) in sets.iter().enumerate() {
        let count = dynamic_descriptor_count(set).min(offsets.len());
        let (mine, rest) = offsets.split_at(count);
        offsets = rest;
        state.sets[first + i] = Some(BoundDescriptorSet {
            set: Arc::clone(set),
            layout: Arc::clone(layout),
            dynamic_offsets: mine.to_vec(),
        });
    }
}

/// Clear sets disturbed by binding `sets_bound` at `first_set` with `layout`:
/// lower sets whose layout is incompatible at their index, and every higher
/// set once one is incompatible.
pub fn disturb_incompatible_sets(
    state: &mut DescriptorState,
    layout: &PipelineLayout,
    first_set: u32,
    sets_bound: u32,
) {
    let first = first_set as usize;
    let end = first + sets_bound as usize;

    for i in 0..first.min(state.sets.len()) {
        let compatible = state.sets[i]
            .as_ref()
            .map_or(true, |b| layouts_compatible(&b.layout, layout, i));
        if !compatible {
            state.sets[i] = None;
        }
    }

    let mut disturbed = false;
    for i in end..state.sets.len() {
        disturbed = disturbed
            || state.sets[i]
                .as_ref()
                .is_some_and(|b| !layouts_compatible(&b.layout, layout, i));
        if disturbed {
            state.sets[i] = None;
        }
    }
}
