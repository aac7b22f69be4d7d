//! The device context.
//!
//! One [`Device`] owns everything the engine tracks for one logical device.
//! Shadow object lookups go through lock-free handle tables; the
//! command-buffer graph, the submission graph and the sync pools sit behind
//! a single device-wide mutex. Frozen records are never dropped while that
//! mutex is held: callers move them into a local release list and let it go
//! after the guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use vkshadow_core::{HandleTable, LayerConfig, LayerError};

use crate::command_buffer::{CommandBuffer, CommandBufferSlot, CommandBufferState, CommandPoolSlot};
use crate::driver::Driver;
use crate::hook::CommandHook;
use crate::queue::{AuxSignal, AuxWork, QueueState};
use crate::record::CommandRecord;
use crate::resource::ResourceTables;
use crate::submission::SubmissionBatch;
use crate::swapchain::FrameBucket;
use crate::sync::{Fence, Semaphore, SemaphoreDiagnostics, SemaphoreKind, SemaphoreState, SyncPool};

/// First application handle value the device hands out.
const FIRST_HANDLE: u64 = 0x1000;

/// State guarded by the device-wide lock.
pub(crate) struct DeviceState {
    pub command_buffers: HashMap<u64, CommandBufferSlot>,
    pub pools: HashMap<u64, CommandPoolSlot>,
    pub queues: HashMap<u64, QueueState>,
    pub semaphores: HashMap<u64, SemaphoreState>,
    pub sync_pool: SyncPool,
    /// Batches with at least one incomplete submission, oldest first.
    pub batches: Vec<SubmissionBatch>,
    pub next_batch_id: u64,
    /// Application fences currently attached to a batch.
    pub fence_batches: HashMap<u64, u64>,
    pub frame: Option<FrameBucket>,
    pub frame_counter: u64,
    pub aux: Option<AuxWork>,
    /// Per queue: own-timeline value of the latest submission whose
    /// command buffers the hook replaced.
    pub hooked_queues: HashMap<u64, u64>,
}

impl DeviceState {
    pub fn slot(&self, raw: u64) -> Result<&CommandBufferSlot, LayerError> {
        self.command_buffers.get(&raw).ok_or(LayerError::UnknownHandle {
            kind: CommandBuffer::KIND,
            raw,
        })
    }

    pub fn slot_mut(&mut self, raw: u64) -> Result<&mut CommandBufferSlot, LayerError> {
        self.command_buffers.get_mut(&raw).ok_or(LayerError::UnknownHandle {
            kind: CommandBuffer::KIND,
            raw,
        })
    }

    pub fn queue_mut(&mut self, raw: u64) -> Result<&mut QueueState, LayerError> {
        self.queues
            .get_mut(&raw)
            .ok_or(LayerError::UnknownHandle { kind: "queue", raw })
    }
}

pub struct Device {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) hook: Option<Arc<dyn CommandHook>>,
    pub(crate) config: LayerConfig,
    /// Own signals use timeline semaphores.
    pub(crate) timeline: bool,
    /// Forward through `queue_submit2`.
    pub(crate) sync2: bool,
    /// Shadow objects of the resources command buffers reference.
    pub resources: ResourceTables,
    pub(crate) command_buffers: HandleTable<CommandBuffer>,
    pub(crate) semaphores: HandleTable<Semaphore>,
    pub(crate) fences: HandleTable<Fence>,
    pub(crate) state: Mutex<DeviceState>,
    next_handle: AtomicU64,
}

impl Device {
    pub fn new(driver: Arc<dyn Driver>, config: LayerConfig) -> Self {
        let timeline = config.submission.use_timeline_semaphores && driver.supports_timeline_semaphores();
        let sync2 = driver.supports_synchronization2();
        info!(timeline, sync2, "shadow device created");

        let sync_pool = SyncPool::new(
            config.submission.semaphore_pool_limit,
            config.submission.fence_pool_limit,
        );
        Self {
            driver,
            hook: None,
            config,
            timeline,
            sync2,
            resources: ResourceTables::new(),
            command_buffers: HandleTable::new(CommandBuffer::KIND),
            semaphores: HandleTable::new("semaphore"),
            fences: HandleTable::new("fence"),
            state: Mutex::new(DeviceState {
                command_buffers: HashMap::new(),
                pools: HashMap::new(),
                queues: HashMap::new(),
                semaphores: HashMap::new(),
                sync_pool,
                batches: Vec::new(),
                next_batch_id: 1,
                fence_batches: HashMap::new(),
                frame: None,
                frame_counter: 0,
                aux: None,
                hooked_queues: HashMap::new(),
            }),
            next_handle: AtomicU64::new(FIRST_HANDLE),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CommandHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    /// Whether the layer's own signals use timeline semaphores.
    pub fn uses_timeline_semaphores(&self) -> bool {
        self.timeline
    }

    pub(crate) fn mint_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // ── Queues ──────────────────────────────────────────────

    /// Make a queue known to the engine. With timeline semaphores the queue
    /// gets its own timeline that tracks submission completion.
    pub fn register_queue(&self, handle: vk::Queue, native: vk::Queue, family: u32) -> Result<(), LayerError> {
        let timeline = if self.timeline {
            Some(self.driver.create_semaphore(SemaphoreKind::Timeline, 0)?)
        } else {
            None
        };
        let mut state = self.state.lock();
        state
            .queues
            .insert(handle.as_raw(), QueueState::new(handle, native, family, timeline));
        debug!(queue = format_args!("{:#x}", handle.as_raw()), family, "queue registered");
        Ok(())
    }

    /// Last submission id handed out on `queue`.
    pub fn queue_submission_count(&self, queue: vk::Queue) -> u64 {
        let state = self.state.lock();
        state.queues.get(&queue.as_raw()).map_or(0, |q| q.last_id)
    }

    /// Number of submissions on `queue` still waiting for a timeline
    /// dependency.
    pub fn blocked_submissions(&self, queue: vk::Queue) -> usize {
        let state = self.state.lock();
        state.queues.get(&queue.as_raw()).map_or(0, |q| q.blocked.len())
    }

    // ── Semaphores ──────────────────────────────────────────

    pub fn create_semaphore(&self, kind: SemaphoreKind, initial_value: u64) -> Result<vk::Semaphore, LayerError> {
        let native = self.driver.create_semaphore(kind, initial_value)?;
        let handle = vk::Semaphore::from_raw(self.mint_handle());
        self.semaphores.insert(
            handle.as_raw(),
            Arc::new(Semaphore {
                handle,
                native,
                kind,
            }),
        );
        self.state.lock().semaphores.insert(
            handle.as_raw(),
            SemaphoreState::new(kind, native, initial_value),
        );
        debug!(semaphore = format_args!("{:#x}", handle.as_raw()), ?kind, "semaphore created");
        Ok(handle)
    }

    pub fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let Some(sem) = self.semaphores.remove(semaphore.as_raw()) else {
            return;
        };
        let graph = self.state.lock().semaphores.remove(&semaphore.as_raw());
        if let Some(graph) = graph {
            if !graph.pending_signals.is_empty() || graph.signals.iter().any(|s| !s.completed) {
                warn!(
                    semaphore = format_args!("{:#x}", semaphore.as_raw()),
                    "semaphore destroyed while referenced by pending work"
                );
            }
        }
        self.driver.destroy_semaphore(sem.native);
    }

    pub fn semaphore_diagnostics(&self, semaphore: vk::Semaphore) -> Option<SemaphoreDiagnostics> {
        let state = self.state.lock();
        state.semaphores.get(&semaphore.as_raw()).map(|s| s.diagnostics())
    }

    pub fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> Result<u64, LayerError> {
        let sem = self.semaphores.try_get(semaphore.as_raw())?;
        let value = self.driver.semaphore_counter_value(sem.native)?;
        let mut state = self.state.lock();
        if let Some(graph) = state.semaphores.get_mut(&semaphore.as_raw()) {
            graph.note_value(value);
        }
        self.activate_blocked(&mut state);
        Ok(value)
    }

    /// Host-side timeline signal. May unblock submissions waiting on it.
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<(), LayerError> {
        let sem = self.semaphores.try_get(semaphore.as_raw())?;
        if sem.kind != SemaphoreKind::Timeline {
            return Err(vkshadow_core::contract_violation!(
                semaphore.as_raw(),
                "timeline semaphore",
                "binary semaphore"
            ));
        }
        self.driver.signal_semaphore(sem.native, value)?;
        let mut state = self.state.lock();
        if let Some(graph) = state.semaphores.get_mut(&semaphore.as_raw()) {
            graph.note_value(value);
        }
        self.activate_blocked(&mut state);
        Ok(())
    }

    // ── Fences ──────────────────────────────────────────────

    pub fn create_fence(&self, signaled: bool) -> Result<vk::Fence, LayerError> {
        let native = self.driver.create_fence(signaled)?;
        let handle = vk::Fence::from_raw(self.mint_handle());
        self.fences.insert(handle.as_raw(), Arc::new(Fence { handle, native }));
        Ok(handle)
    }

    pub fn destroy_fence(&self, fence: vk::Fence) {
        if let Some(f) = self.fences.remove(fence.as_raw()) {
            self.state.lock().fence_batches.remove(&fence.as_raw());
            self.driver.destroy_fence(f.native);
        }
    }

    // ── Frames ──────────────────────────────────────────────

    /// Start collecting submitted records for a new frame. An unfinished
    /// previous bucket is discarded.
    pub fn begin_frame(&self) -> u64 {
        let (frame, released) = {
            let mut state = self.state.lock();
            state.frame_counter += 1;
            let frame = state.frame_counter;
            (frame, state.frame.replace(FrameBucket::new(frame)))
        };
        if let Some(old) = &released {
            debug!(frame = old.frame, "frame bucket replaced before end_frame");
        }
        drop(released);
        frame
    }

    /// Close the active frame bucket and hand it to the present path.
    pub fn end_frame(&self) -> Option<FrameBucket> {
        self.state.lock().frame.take()
    }

    // ── Resource destruction ────────────────────────────────

    /// Move every executable or recording command buffer that references
    /// `raw` to the invalid state. Records with no pending submissions drop
    /// their resource references right away; an in-progress recording is
    /// abandoned.
    fn invalidate_users(&self, kind: &'static str, raw: u64) {
        let mut invalidated = 0;
        let recording: Vec<u64> = {
            let mut state = self.state.lock();
            let mut recording = Vec::new();
            for (cb_raw, slot) in state.command_buffers.iter_mut() {
                match slot.state {
                    CommandBufferState::Recording => {
                        recording.push(*cb_raw);
                        continue;
                    }
                    CommandBufferState::Executable => {}
                    CommandBufferState::Initial | CommandBufferState::Invalid => continue,
                }
                let Some(record) = slot.last.as_ref() else {
                    continue;
                };
                let referenced = record.used().contains(raw);
                if !referenced {
                    continue;
                }
                slot.state = CommandBufferState::Invalid;
                if slot.pending.is_empty() {
                    record.clear_used();
                }
                invalidated += 1;
                debug!(
                    command_buffer = format_args!("{:#x}", cb_raw),
                    "invalidated by destroyed {} {:#x}", kind, raw
                );
            }
            recording
        };

        // Builder slot before device lock.
        for cb_raw in recording {
            let Some(cb) = self.command_buffers.get(cb_raw) else {
                continue;
            };
            let mut builder = cb.builder.lock();
            let referenced = builder
                .as_ref()
                .is_some_and(|b| b.record().used().contains(raw));
            if !referenced {
                continue;
            }
            let abandoned = builder.take();
            if let Some(slot) = self.state.lock().command_buffers.get_mut(&cb_raw) {
                slot.state = CommandBufferState::Invalid;
            }
            drop(builder);
            drop(abandoned);
            invalidated += 1;
            debug!(
                command_buffer = format_args!("{:#x}", cb_raw),
                "recording invalidated by destroyed {} {:#x}", kind, raw
            );
        }

        if invalidated > 0 {
            info!(kind, raw = format_args!("{:#x}", raw), invalidated, "command buffers invalidated");
        }
    }

    /// Tear down the engine's own driver objects. Waits for the device to
    /// go idle first.
    pub fn shutdown(&self) -> Result<(), LayerError> {
        self.device_wait_idle()?;
        let mut state = self.state.lock();
        let driver = Arc::clone(&self.driver);
        state.sync_pool.destroy_all(driver.as_ref());
        for queue in state.queues.values_mut() {
            if let Some(sem) = queue.timeline.take() {
                driver.destroy_semaphore(sem);
            }
        }
        if let Some(aux) = state.aux.take() {
            if let AuxSignal::Binary {
                semaphore,
                consumed: false,
            } = aux.signal
            {
                driver.destroy_semaphore(semaphore);
            }
        }
        info!("shadow device shut down");
        Ok(())
    }

    /// Records still referenced by tracked submissions, for inspection.
    pub fn in_flight_records(&self) -> Vec<Arc<CommandRecord>> {
        let state = self.state.lock();
        state
            .batches
            .iter()
            .flat_map(|b| b.submissions.iter())
            .filter(|s| !s.completed)
            .flat_map(|s| s.records.iter().cloned())
            .collect()
    }
}

macro_rules! destroy_fns {
    ($($fn_name:ident => $table:ident : $vk:ty),* $(,)?) => {
        impl Device {
            $(
                /// Forget the shadow object and invalidate command buffers
                /// that reference it. Returns whether the handle was known.
                pub fn $fn_name(&self, handle: $vk) -> bool {
                    let raw = handle.as_raw();
                    let removed = self.resources.$table.remove(raw);
                    if removed.is_some() {
                        self.invalidate_users(self.resources.$table.kind(), raw);
                    }
                    removed.is_some()
                }
            )*
        }
    };
}

destroy_fns! {
    destroy_image => images: vk::Image,
    destroy_image_view => image_views: vk::ImageView,
    destroy_buffer => buffers: vk::Buffer,
    destroy_sampler => samplers: vk::Sampler,
    destroy_descriptor_set_layout => descriptor_set_layouts: vk::DescriptorSetLayout,
    destroy_descriptor_pool => descriptor_pools: vk::DescriptorPool,
    free_descriptor_set => descriptor_sets: vk::DescriptorSet,
    destroy_descriptor_update_template => update_templates: vk::DescriptorUpdateTemplate,
    destroy_pipeline_layout => pipeline_layouts: vk::PipelineLayout,
    destroy_pipeline => pipelines: vk::Pipeline,
    destroy_query_pool => query_pools: vk::QueryPool,
    destroy_acceleration_structure => acceleration_structures: vk::AccelerationStructureKHR,
    destroy_event => events: vk::Event,
    destroy_render_pass => render_passes: vk::RenderPass,
    destroy_framebuffer => framebuffers: vk::Framebuffer,
}
