//! Submission payload shapes and the tracked submission graph entities.
//!
//! Both submit entry points end up in [`SubmitInfo2`]. The legacy shape keeps
//! per-wait stage masks in a parallel array and timeline values in an
//! extension structure; [`normalize_legacy`] folds them into per-semaphore
//! entries and [`to_legacy`] goes back for drivers without
//! synchronization2.

use std::sync::Arc;

use ash::vk;
use tracing::warn;

use crate::record::CommandRecord;
use crate::sync::SemaphoreKind;

// ── Payload shapes ──────────────────────────────────────────

/// Extension structures a legacy submit may chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitExtension {
    TimelineSemaphore {
        wait_values: Vec<u64>,
        signal_values: Vec<u64>,
    },
    DeviceGroup {
        wait_device_indices: Vec<u32>,
        command_buffer_device_masks: Vec<u32>,
        signal_device_indices: Vec<u32>,
    },
    Protected,
    /// Structure type the layer does not understand. Skipped on forward.
    Unknown(vk::StructureType),
}

/// Legacy submit batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_dst_stage_masks: Vec<vk::PipelineStageFlags>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub extensions: Vec<SubmitExtension>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    /// Timeline value; ignored for binary semaphores.
    pub value: u64,
    pub stage_mask: vk::PipelineStageFlags2,
    pub device_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferSubmit {
    pub command_buffer: vk::CommandBuffer,
    pub device_mask: u32,
}

/// Unified submit batch, one wait/signal structure per semaphore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitInfo2 {
    pub flags: vk::SubmitFlags,
    pub waits: Vec<SemaphoreSubmit>,
    pub command_buffers: Vec<CommandBufferSubmit>,
    pub signals: Vec<SemaphoreSubmit>,
}

fn widen_stages(mask: vk::PipelineStageFlags) -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::from_raw(u64::from(mask.as_raw()))
}

fn narrow_stages(mask: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(mask.as_raw() as u32)
}

/// Fold a legacy batch into the unified shape.
pub fn normalize_legacy(info: &SubmitInfo) -> SubmitInfo2 {
    let mut wait_values: &[u64] = &[];
    let mut signal_values: &[u64] = &[];
    let mut wait_devices: &[u32] = &[];
    let mut cb_masks: &[u32] = &[];
    let mut signal_devices: &[u32] = &[];
    let mut flags = vk::SubmitFlags::empty();

    for ext in &info.extensions {
        match ext {
            SubmitExtension::TimelineSemaphore {
                wait_values: w,
                signal_values: s,
            } => {
                wait_values = w;
                signal_values = s;
            }
            SubmitExtension::DeviceGroup {
                wait_device_indices,
                command_buffer_device_masks,
                signal_device_indices,
            } => {
                wait_devices = wait_device_indices;
                cb_masks = command_buffer_device_masks;
                signal_devices = signal_device_indices;
            }
            SubmitExtension::Protected => flags |= vk::SubmitFlags::PROTECTED,
            SubmitExtension::Unknown(ty) => {
                warn!(structure = ?ty, "skipping unknown submit extension structure");
            }
        }
    }

    let waits = info
        .wait_semaphores
        .iter()
        .enumerate()
        .map(|(i, &semaphore)| SemaphoreSubmit {
            semaphore,
            value: wait_values.get(i).copied().unwrap_or(0),
            stage_mask: info
                .wait_dst_stage_masks
                .get(i)
                .copied()
                .map_or(vk::PipelineStageFlags2::ALL_COMMANDS, widen_stages),
            device_index: wait_devices.get(i).copied().unwrap_or(0),
        })
        .collect();

    let command_buffers = info
        .command_buffers
        .iter()
        .enumerate()
        .map(|(i, &command_buffer)| CommandBufferSubmit {
            command_buffer,
            device_mask: cb_masks.get(i).copied().unwrap_or(0),
        })
        .collect();

    let signals = info
        .signal_semaphores
        .iter()
        .enumerate()
        .map(|(i, &semaphore)| SemaphoreSubmit {
            semaphore,
            value: signal_values.get(i).copied().unwrap_or(0),
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            device_index: signal_devices.get(i).copied().unwrap_or(0),
        })
        .collect();

    SubmitInfo2 {
        flags,
        waits,
        command_buffers,
        signals,
    }
}

/// Turn a unified batch back into the legacy shape. Timeline values are
/// chained when `timeline` is set; device-group data only when some entry
/// carries a non-default index or mask.
pub fn to_legacy(info: &SubmitInfo2, timeline: bool) -> SubmitInfo {
    let mut extensions = Vec::new();
    if timeline {
        extensions.push(SubmitExtension::TimelineSemaphore {
            wait_values: info.waits.iter().map(|w| w.value).collect(),
            signal_values: info.signals.iter().map(|s| s.value).collect(),
        });
    }

    let grouped = info.waits.iter().any(|w| w.device_index != 0)
        || info.signals.iter().any(|s| s.device_index != 0)
        || info.command_buffers.iter().any(|c| c.device_mask != 0);
    if grouped {
        extensions.push(SubmitExtension::DeviceGroup {
            wait_device_indices: info.waits.iter().map(|w| w.device_index).collect(),
            command_buffer_device_masks: info.command_buffers.iter().map(|c| c.device_mask).collect(),
            signal_device_indices: info.signals.iter().map(|s| s.device_index).collect(),
        });
    }
    if info.flags.contains(vk::SubmitFlags::PROTECTED) {
        extensions.push(SubmitExtension::Protected);
    }

    SubmitInfo {
        wait_semaphores: info.waits.iter().map(|w| w.semaphore).collect(),
        wait_dst_stage_masks: info.waits.iter().map(|w| narrow_stages(w.stage_mask)).collect(),
        command_buffers: info.command_buffers.iter().map(|c| c.command_buffer).collect(),
        signal_semaphores: info.signals.iter().map(|s| s.semaphore).collect(),
        extensions,
    }
}

// ── Graph entities ──────────────────────────────────────────

/// Identifies one submission: its queue and per-queue sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionKey {
    pub queue: u64,
    pub seq: u64,
}

/// One wait or signal edge of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOp {
    /// Application handle of the semaphore.
    pub semaphore: vk::Semaphore,
    pub kind: SemaphoreKind,
    pub value: u64,
    pub stage_mask: vk::PipelineStageFlags2,
}

/// How the layer observes a submission's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnSignal {
    /// The queue's own timeline semaphore reaches `value`.
    Timeline { semaphore: vk::Semaphore, value: u64 },
    /// A pool binary semaphore, completion observed through the batch fence.
    Binary { semaphore: vk::Semaphore },
}

/// One logical sub-batch of an application submit.
#[derive(Debug)]
pub struct Submission {
    pub key: SubmissionKey,
    pub queue: vk::Queue,
    /// Application command buffer handles, in submit order.
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Records those command buffers held at submit time.
    pub records: Vec<Arc<CommandRecord>>,
    pub waits: Vec<SyncOp>,
    pub signals: Vec<SyncOp>,
    pub own_signal: OwnSignal,
    /// Whether any of the command buffers was replaced by the hook.
    pub hooked: bool,
    pub active: bool,
    pub completed: bool,
}

/// Native fence the layer polls to observe a batch in binary mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFence {
    pub native: vk::Fence,
    /// Borrowed from the fence pool, returned when the batch completes.
    pub pooled: bool,
}

/// Everything one driver submit call produced.
#[derive(Debug)]
pub struct SubmissionBatch {
    pub id: u64,
    pub queue: vk::Queue,
    pub submissions: Vec<Submission>,
    pub fence: Option<BatchFence>,
    /// Own-signal binary semaphores. Signaled, so they go to the reset
    /// backlog on completion.
    pub signaled_semaphores: Vec<vk::Semaphore>,
    /// Pool semaphores this batch waits on. Unsignaled again on completion
    /// and go straight back to the free pool.
    pub consumed_semaphores: Vec<vk::Semaphore>,
}

impl SubmissionBatch {
    pub fn is_complete(&self) -> bool {
        self.submissions.iter().all(|s| s.completed)
    }
}
