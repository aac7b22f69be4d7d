//! Per-frame bucket of submitted records, filled while a frame is active
//! and handed to the present path when it ends.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use tracing::trace;

use vkshadow_core::LayerError;

use crate::device::Device;
use crate::record::CommandRecord;
use crate::submission::SubmissionKey;

#[derive(Debug)]
pub struct FrameSubmission {
    pub queue: vk::Queue,
    pub submission: SubmissionKey,
    pub records: Vec<Arc<CommandRecord>>,
}

#[derive(Debug, Default)]
pub struct FrameBucket {
    /// Frame counter value the bucket was opened with.
    pub frame: u64,
    pub submissions: Vec<FrameSubmission>,
}

impl FrameBucket {
    pub fn new(frame: u64) -> Self {
        Self {
            frame,
            submissions: Vec::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.submissions.iter().map(|s| s.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }
}

impl Device {
    /// A present waited on these binary semaphores. Each wait consumes the
    /// oldest unconsumed signal.
    pub fn note_present_waits(&self, semaphores: &[vk::Semaphore]) -> Result<(), LayerError> {
        for sem in semaphores {
            self.semaphores.try_get(sem.as_raw())?;
        }
        let mut state = self.state.lock();
        for sem in semaphores {
            if let Some(graph) = state.semaphores.get_mut(&sem.as_raw()) {
                graph.add_external_wait(sem.as_raw());
            }
        }
        trace!(count = semaphores.len(), "present waits noted");
        Ok(())
    }

    /// A swapchain image acquire will signal `semaphore`.
    pub fn note_acquire_signal(&self, semaphore: vk::Semaphore) -> Result<(), LayerError> {
        self.semaphores.try_get(semaphore.as_raw())?;
        let mut state = self.state.lock();
        if let Some(graph) = state.semaphores.get_mut(&semaphore.as_raw()) {
            graph.add_external_signal(semaphore.as_raw());
        }
        trace!(semaphore = format_args!("{:#x}", semaphore.as_raw()), "acquire signal noted");
        Ok(())
    }
}
