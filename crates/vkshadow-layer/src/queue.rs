//! Queue bookkeeping: the per-queue submission counter, the layer's own
//! timeline semaphore and the FIFO of blocked submissions.

use std::collections::VecDeque;

use ash::vk;

use crate::submission::SubmissionKey;

#[derive(Debug)]
pub(crate) struct QueueState {
    pub handle: vk::Queue,
    pub native: vk::Queue,
    pub family: u32,
    /// Last submission id handed out. Ids start at 1 so a fresh timeline
    /// value of 0 means "nothing completed".
    pub last_id: u64,
    /// Own timeline semaphore (native), signaled with each submission id.
    pub timeline: Option<vk::Semaphore>,
    /// Submissions waiting for a timeline dependency, oldest first.
    pub blocked: VecDeque<SubmissionKey>,
}

impl QueueState {
    pub fn new(handle: vk::Queue, native: vk::Queue, family: u32, timeline: Option<vk::Semaphore>) -> Self {
        Self {
            handle,
            native,
            family,
            last_id: 0,
            timeline,
            blocked: VecDeque::new(),
        }
    }

    pub fn reserve_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }
}

/// Queue ids for one submit call, rolled back if the driver rejects it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdReservation {
    pub previous: u64,
    pub first: u64,
    pub count: u64,
}

impl IdReservation {
    pub fn reserve(queue: &mut QueueState, count: usize) -> Self {
        let previous = queue.last_id;
        queue.last_id += count as u64;
        Self {
            previous,
            first: previous + 1,
            count: count as u64,
        }
    }

    pub fn id(&self, index: usize) -> u64 {
        self.first + index as u64
    }

    pub fn rollback(&self, queue: &mut QueueState) {
        if queue.last_id == self.previous + self.count {
            queue.last_id = self.previous;
        }
    }
}

/// The layer's own most recent auxiliary submission.
#[derive(Debug)]
pub(crate) struct AuxWork {
    pub queue: u64,
    pub native_queue: vk::Queue,
    pub signal: AuxSignal,
    /// Queues already ordered after this work.
    pub synced: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuxSignal {
    Timeline { semaphore: vk::Semaphore, value: u64 },
    /// A pool semaphore. Can be waited on exactly once.
    Binary { semaphore: vk::Semaphore, consumed: bool },
}
