//! Shared test harness: a recording mock driver and resource helpers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use vkshadow_layer::arena::Arena;
use vkshadow_layer::command::{Command, CommandKind};
use vkshadow_layer::hook::{CommandHook, LocalCapture};
use vkshadow_layer::resource::{
    AttachmentDesc, Buffer, DescriptorBindingDesc, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    Framebuffer, Image, ImageDesc, ImageView, Pipeline, PipelineLayout, RenderPass,
};
use vkshadow_layer::submission::{normalize_legacy, SubmitInfo, SubmitInfo2};
use vkshadow_layer::{Device, Driver, LayerConfig, SemaphoreKind};

/// Effects of one forwarded submit, applied when the mock "executes" it.
#[derive(Debug, Default)]
struct PendingEffects {
    timeline_signals: Vec<(u64, u64)>,
    fence: Option<u64>,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub recorded: Vec<(vk::CommandBuffer, CommandKind)>,
    pub submits: Vec<(vk::Queue, Vec<SubmitInfo2>, vk::Fence)>,
    pub legacy_submits: Vec<(vk::Queue, Vec<SubmitInfo>, vk::Fence)>,
    pub fail_next_submit: Option<vk::Result>,
    pub semaphore_kinds: HashMap<u64, SemaphoreKind>,
    pub timeline_values: HashMap<u64, u64>,
    pub signaled_fences: HashSet<u64>,
    pub created_semaphores: usize,
    pub destroyed_semaphores: usize,
    pub created_fences: usize,
    pub destroyed_fences: usize,
    pending: Vec<PendingEffects>,
}

/// Driver stand-in. Submissions stay "in flight" until [`MockDriver::complete_all`]
/// or any wait entry point runs them.
pub struct MockDriver {
    pub timeline: bool,
    pub sync2: bool,
    next_handle: AtomicU64,
    pub state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new(timeline: bool, sync2: bool) -> Arc<Self> {
        Arc::new(Self {
            timeline,
            sync2,
            next_handle: AtomicU64::new(0x9000_0000),
            state: Mutex::new(MockState::default()),
        })
    }

    fn mint(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit = Some(result);
    }

    /// Execute every forwarded submission.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for effects in pending {
            for (sem, value) in effects.timeline_signals {
                let current = state.timeline_values.entry(sem).or_insert(0);
                *current = (*current).max(value);
            }
            if let Some(fence) = effects.fence {
                state.signaled_fences.insert(fence);
            }
        }
    }

    pub fn submit_count(&self) -> usize {
        let state = self.state.lock();
        state.submits.len() + state.legacy_submits.len()
    }

    /// Unified view of the most recent submit call, whichever entry point
    /// it came through.
    pub fn last_submit(&self) -> Vec<SubmitInfo2> {
        let state = self.state.lock();
        if self.sync2 {
            state.submits.last().map(|s| s.1.clone()).unwrap_or_default()
        } else {
            state
                .legacy_submits
                .last()
                .map(|s| s.1.iter().map(normalize_legacy).collect())
                .unwrap_or_default()
        }
    }

    pub fn recorded_kinds(&self, cb: vk::CommandBuffer) -> Vec<CommandKind> {
        let state = self.state.lock();
        state
            .recorded
            .iter()
            .filter(|(c, _)| *c == cb)
            .map(|(_, k)| *k)
            .collect()
    }

    fn track(&self, submits: &[SubmitInfo2], fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_submit.take() {
            return Err(err);
        }
        let mut effects = PendingEffects::default();
        for info in submits {
            for signal in &info.signals {
                if state.semaphore_kinds.get(&signal.semaphore.as_raw()) == Some(&SemaphoreKind::Timeline) {
                    effects.timeline_signals.push((signal.semaphore.as_raw(), signal.value));
                }
            }
        }
        if fence != vk::Fence::null() {
            effects.fence = Some(fence.as_raw());
        }
        state.pending.push(effects);
        Ok(())
    }
}

impl Driver for MockDriver {
    fn supports_timeline_semaphores(&self) -> bool {
        self.timeline
    }

    fn supports_synchronization2(&self) -> bool {
        self.sync2
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| vk::CommandBuffer::from_raw(self.mint())).collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, _command_buffers: &[vk::CommandBuffer]) {}

    fn begin_command_buffer(&self, _cb: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _cb: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn reset_command_buffer(&self, _cb: vk::CommandBuffer, _flags: vk::CommandBufferResetFlags) -> VkResult<()> {
        Ok(())
    }

    fn reset_command_pool(&self, _pool: vk::CommandPool, _flags: vk::CommandPoolResetFlags) -> VkResult<()> {
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command, _arena: &Arena) {
        self.state.lock().recorded.push((command_buffer, command.kind()));
    }

    fn queue_submit(&self, queue: vk::Queue, submits: &[SubmitInfo], fence: vk::Fence) -> VkResult<()> {
        let unified: Vec<SubmitInfo2> = submits.iter().map(normalize_legacy).collect();
        self.track(&unified, fence)?;
        self.state
            .lock()
            .legacy_submits
            .push((queue, submits.to_vec(), fence));
        Ok(())
    }

    fn queue_submit2(&self, queue: vk::Queue, submits: &[SubmitInfo2], fence: vk::Fence) -> VkResult<()> {
        self.track(submits, fence)?;
        self.state.lock().submits.push((queue, submits.to_vec(), fence));
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.complete_all();
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.complete_all();
        Ok(())
    }

    fn create_semaphore(&self, kind: SemaphoreKind, initial_value: u64) -> VkResult<vk::Semaphore> {
        let sem = vk::Semaphore::from_raw(self.mint());
        let mut state = self.state.lock();
        state.semaphore_kinds.insert(sem.as_raw(), kind);
        if kind == SemaphoreKind::Timeline {
            state.timeline_values.insert(sem.as_raw(), initial_value);
        }
        state.created_semaphores += 1;
        Ok(sem)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphore_kinds.remove(&semaphore.as_raw());
        state.destroyed_semaphores += 1;
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        Ok(self
            .state
            .lock()
            .timeline_values
            .get(&semaphore.as_raw())
            .copied()
            .unwrap_or(0))
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        self.state.lock().timeline_values.insert(semaphore.as_raw(), value);
        Ok(())
    }

    fn wait_semaphores(&self, _semaphores: &[vk::Semaphore], _values: &[u64], _timeout: u64) -> VkResult<()> {
        self.complete_all();
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence = vk::Fence::from_raw(self.mint());
        let mut state = self.state.lock();
        if signaled {
            state.signaled_fences.insert(fence.as_raw());
        }
        state.created_fences += 1;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.signaled_fences.remove(&fence.as_raw());
        state.destroyed_fences += 1;
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.state.lock().signaled_fences.contains(&fence.as_raw()))
    }

    fn wait_for_fences(&self, _fences: &[vk::Fence], _wait_all: bool, _timeout: u64) -> VkResult<()> {
        self.complete_all();
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            state.signaled_fences.remove(&fence.as_raw());
        }
        Ok(())
    }
}

// ── Device setup ────────────────────────────────────────────

static NEXT_RESOURCE: AtomicU64 = AtomicU64::new(0x10_0000);

fn next_raw() -> u64 {
    NEXT_RESOURCE.fetch_add(1, Ordering::Relaxed)
}

pub fn device_with(driver: &Arc<MockDriver>, config: LayerConfig) -> Device {
    vkshadow_common::logging::try_init_logging();
    let dyn_driver: Arc<dyn Driver> = Arc::clone(driver) as Arc<dyn Driver>;
    Device::new(dyn_driver, config)
}

/// Device on a mock driver with or without timeline semaphores, forwarding
/// through `queue_submit2`.
pub fn setup(timeline: bool) -> (Arc<MockDriver>, Device) {
    let driver = MockDriver::new(timeline, true);
    let device = device_with(&driver, LayerConfig::default());
    (driver, device)
}

pub fn add_queue(device: &Device) -> vk::Queue {
    let raw = next_raw();
    let queue = vk::Queue::from_raw(raw);
    device
        .register_queue(queue, vk::Queue::from_raw(raw | 0x8000_0000_0000), 0)
        .expect("register queue");
    queue
}

pub fn command_buffers(device: &Device, level: vk::CommandBufferLevel, count: u32) -> Vec<vk::CommandBuffer> {
    let raw = next_raw();
    let pool = vk::CommandPool::from_raw(raw);
    device.register_command_pool(pool, vk::CommandPool::from_raw(raw | 0x8000_0000_0000));
    device
        .allocate_command_buffers(pool, level, count)
        .expect("allocate command buffers")
}

pub fn primary(device: &Device) -> vk::CommandBuffer {
    command_buffers(device, vk::CommandBufferLevel::PRIMARY, 1)[0]
}

// ── Resources ───────────────────────────────────────────────

pub fn image(device: &Device, mip_levels: u32, array_layers: u32) -> vk::Image {
    let handle = vk::Image::from_raw(next_raw());
    let desc = ImageDesc {
        format: vk::Format::R8G8B8A8_UNORM,
        extent: vk::Extent3D {
            width: 64,
            height: 64,
            depth: 1,
        },
        mip_levels,
        array_layers,
        aspects: vk::ImageAspectFlags::COLOR,
        initial_layout: vk::ImageLayout::UNDEFINED,
    };
    device
        .resources
        .images
        .insert(handle.as_raw(), Arc::new(Image::new(handle, handle, desc)));
    handle
}

pub fn buffer(device: &Device) -> vk::Buffer {
    let handle = vk::Buffer::from_raw(next_raw());
    device.resources.buffers.insert(
        handle.as_raw(),
        Arc::new(Buffer {
            handle,
            native: handle,
            size: 4096,
        }),
    );
    handle
}

pub fn set_layout(device: &Device, bindings: &[(vk::DescriptorType, u32)]) -> Arc<DescriptorSetLayout> {
    let handle = vk::DescriptorSetLayout::from_raw(next_raw());
    let layout = Arc::new(DescriptorSetLayout {
        handle,
        native: handle,
        bindings: bindings
            .iter()
            .enumerate()
            .map(|(i, (ty, count))| DescriptorBindingDesc {
                binding: i as u32,
                descriptor_type: *ty,
                count: *count,
            })
            .collect(),
    });
    device
        .resources
        .descriptor_set_layouts
        .insert(handle.as_raw(), Arc::clone(&layout));
    layout
}

pub fn pipeline_layout(device: &Device, set_layouts: &[Arc<DescriptorSetLayout>]) -> vk::PipelineLayout {
    let handle = vk::PipelineLayout::from_raw(next_raw());
    device.resources.pipeline_layouts.insert(
        handle.as_raw(),
        Arc::new(PipelineLayout {
            handle,
            native: handle,
            set_layouts: set_layouts.to_vec(),
            push_constant_ranges: Vec::new(),
        }),
    );
    handle
}

pub fn descriptor_set(device: &Device, layout: &Arc<DescriptorSetLayout>) -> vk::DescriptorSet {
    let pool_handle = vk::DescriptorPool::from_raw(next_raw());
    let pool = Arc::new(DescriptorPool {
        handle: pool_handle,
        native: pool_handle,
    });
    device
        .resources
        .descriptor_pools
        .insert(pool_handle.as_raw(), Arc::clone(&pool));

    let handle = vk::DescriptorSet::from_raw(next_raw());
    device.resources.descriptor_sets.insert(
        handle.as_raw(),
        Arc::new(DescriptorSet {
            handle,
            native: handle,
            pool,
            layout: Arc::clone(layout),
        }),
    );
    handle
}

pub fn pipeline(device: &Device, bind_point: vk::PipelineBindPoint, layout: vk::PipelineLayout) -> vk::Pipeline {
    let handle = vk::Pipeline::from_raw(next_raw());
    let layout = device
        .resources
        .pipeline_layouts
        .get(layout.as_raw())
        .expect("pipeline layout registered");
    device.resources.pipelines.insert(
        handle.as_raw(),
        Arc::new(Pipeline {
            handle,
            native: handle,
            bind_point,
            layout,
        }),
    );
    handle
}

/// Single-attachment render pass whose attachment ends in `final_layout`.
/// Returns the render pass, its framebuffer and the attachment image.
pub fn render_target(device: &Device, final_layout: vk::ImageLayout) -> (vk::RenderPass, vk::Framebuffer, vk::Image) {
    let image_handle = image(device, 1, 1);
    let image = device.resources.images.get(image_handle.as_raw()).expect("image registered");

    let view_handle = vk::ImageView::from_raw(next_raw());
    let view = Arc::new(ImageView {
        handle: view_handle,
        native: view_handle,
        range: image.full_range(),
        image,
    });
    device
        .resources
        .image_views
        .insert(view_handle.as_raw(), Arc::clone(&view));

    let rp_handle = vk::RenderPass::from_raw(next_raw());
    device.resources.render_passes.insert(
        rp_handle.as_raw(),
        Arc::new(RenderPass {
            handle: rp_handle,
            native: rp_handle,
            attachments: vec![AttachmentDesc {
                format: vk::Format::R8G8B8A8_UNORM,
                final_layout,
            }],
            subpass_count: 2,
        }),
    );

    let fb_handle = vk::Framebuffer::from_raw(next_raw());
    device.resources.framebuffers.insert(
        fb_handle.as_raw(),
        Arc::new(Framebuffer {
            handle: fb_handle,
            native: fb_handle,
            attachments: vec![view],
        }),
    );
    (rp_handle, fb_handle, image_handle)
}

pub fn full_area() -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: 64,
            height: 64,
        },
    }
}

// ── Hooks ───────────────────────────────────────────────────

/// Hook that remembers local captures and optionally swaps every submitted
/// command buffer for `replacement`.
#[derive(Default)]
pub struct RecordingHook {
    pub captures: Mutex<Vec<(String, CommandKind)>>,
    pub replacement: Option<vk::CommandBuffer>,
}

impl CommandHook for RecordingHook {
    fn capture_local(&self, capture: LocalCapture<'_>) {
        self.captures
            .lock()
            .push((capture.request.name, capture.command.kind()));
    }

    fn rewrite_submission(
        &self,
        _command_buffer: vk::CommandBuffer,
        _record: &Arc<vkshadow_layer::CommandRecord>,
    ) -> Option<vk::CommandBuffer> {
        self.replacement
    }
}

/// Record a single dispatch into a fresh primary command buffer that may be
/// submitted again while still pending.
pub fn recorded_dispatch(device: &Device) -> vk::CommandBuffer {
    let cb = primary(device);
    device
        .begin_command_buffer(cb, vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)
        .expect("begin");
    device.recorder(cb).expect("recorder").dispatch(1, 1, 1).expect("dispatch");
    device.end_command_buffer(cb).expect("end");
    cb
}
