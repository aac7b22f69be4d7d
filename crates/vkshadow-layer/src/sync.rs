//! Shadow semaphores and fences, and the pools of driver sync objects the
//! layer borrows for its own signals.

use std::collections::VecDeque;

use ash::vk;
use ash::vk::Handle;
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::submission::SubmissionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreKind {
    Binary,
    Timeline,
}

#[derive(Debug)]
pub struct Semaphore {
    pub handle: vk::Semaphore,
    pub native: vk::Semaphore,
    pub kind: SemaphoreKind,
}

#[derive(Debug)]
pub struct Fence {
    pub handle: vk::Fence,
    pub native: vk::Fence,
}

/// Counters for synchronization the application got wrong. Reported, never
/// acted on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SemaphoreDiagnostics {
    /// Binary waits that found every outstanding signal already consumed.
    pub double_waits: u32,
    /// Binary waits with no outstanding signal at all.
    pub unmatched_waits: u32,
    /// Binary signals not (yet) consumed by any wait.
    pub unconsumed_signals: u32,
    /// Binary signals still tracked: unconsumed, or consumed by a wait
    /// that has not completed.
    pub outstanding_signals: u32,
}

/// A signal edge of a binary semaphore.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BinarySignal {
    /// Signaling submission. `None` for a swapchain acquire.
    pub submission: Option<SubmissionKey>,
    /// Wait that consumes this signal.
    pub waiter: Option<SubmissionKey>,
    pub completed: bool,
}

/// Graph-side state of one application semaphore.
#[derive(Debug)]
pub(crate) struct SemaphoreState {
    pub kind: SemaphoreKind,
    pub native: vk::Semaphore,
    /// Timeline: highest value known to be reached.
    pub known_value: u64,
    /// Timeline: values pending submissions will signal.
    pub pending_signals: Vec<(SubmissionKey, u64)>,
    /// Binary: signals in submission order, consumed front to back.
    pub signals: VecDeque<BinarySignal>,
    pub double_waits: u32,
    pub unmatched_waits: u32,
}

impl SemaphoreState {
    pub fn new(kind: SemaphoreKind, native: vk::Semaphore, initial: u64) -> Self {
        Self {
            kind,
            native,
            known_value: initial,
            pending_signals: Vec::new(),
            signals: VecDeque::new(),
            double_waits: 0,
            unmatched_waits: 0,
        }
    }

    /// Whether a wait for `value` can be satisfied by what is known or
    /// already queued.
    pub fn reachable(&self, value: u64) -> bool {
        self.known_value >= value || self.pending_signals.iter().any(|(_, v)| *v >= value)
    }

    pub fn note_value(&mut self, value: u64) {
        self.known_value = self.known_value.max(value);
    }

    pub fn add_signal(&mut self, raw: u64, key: SubmissionKey, value: u64) {
        match self.kind {
            SemaphoreKind::Timeline => self.pending_signals.push((key, value)),
            SemaphoreKind::Binary => self.push_binary_signal(raw, Some(key), false),
        }
    }

    /// Signal from outside any queue submission (swapchain acquire). The
    /// layer never sees it execute, so it counts as completed.
    pub fn add_external_signal(&mut self, raw: u64) {
        if self.kind == SemaphoreKind::Binary {
            self.push_binary_signal(raw, None, true);
        }
    }

    fn push_binary_signal(&mut self, raw: u64, submission: Option<SubmissionKey>, completed: bool) {
        // A new signal is only valid on an unsignaled semaphore, so completed
        // signals nobody waited on were consumed where the layer cannot see.
        let before = self.signals.len();
        self.signals.retain(|s| s.waiter.is_some() || !s.completed);
        let superseded = before - self.signals.len();
        if superseded > 0 {
            debug!(
                semaphore = format_args!("{:#x}", raw),
                superseded, "dropped completed binary signals without a tracked wait"
            );
        }
        self.signals.push_back(BinarySignal {
            submission,
            waiter: None,
            completed,
        });
    }

    /// Pair a binary wait with the oldest unconsumed signal.
    pub fn add_wait(&mut self, raw: u64, key: SubmissionKey) {
        if self.kind != SemaphoreKind::Binary {
            return;
        }
        match self.signals.iter_mut().find(|s| s.waiter.is_none()) {
            Some(signal) => signal.waiter = Some(key),
            None => self.missing_signal(raw),
        }
    }

    /// Wait from outside any queue submission (present). It consumes the
    /// oldest unconsumed signal, which is dropped right away since the
    /// layer never sees the wait complete.
    pub fn add_external_wait(&mut self, raw: u64) {
        if self.kind != SemaphoreKind::Binary {
            return;
        }
        match self.signals.iter().position(|s| s.waiter.is_none()) {
            Some(pos) => {
                self.signals.remove(pos);
            }
            None => self.missing_signal(raw),
        }
    }

    fn missing_signal(&mut self, raw: u64) {
        if self.signals.is_empty() {
            self.unmatched_waits += 1;
            warn!(
                semaphore = format_args!("{:#x}", raw),
                "binary semaphore waited on without a pending signal"
            );
        } else {
            self.double_waits += 1;
            warn!(semaphore = format_args!("{:#x}", raw), "binary semaphore waited on twice");
        }
    }

    pub fn complete_signal(&mut self, key: SubmissionKey) {
        match self.kind {
            SemaphoreKind::Timeline => {
                if let Some(pos) = self.pending_signals.iter().position(|(k, _)| *k == key) {
                    let (_, value) = self.pending_signals.swap_remove(pos);
                    self.note_value(value);
                }
            }
            SemaphoreKind::Binary => {
                for s in self.signals.iter_mut().filter(|s| s.submission == Some(key)) {
                    s.completed = true;
                }
            }
        }
    }

    /// The waiting submission finished, so the signal it consumed is gone.
    pub fn complete_wait(&mut self, key: SubmissionKey) {
        if self.kind == SemaphoreKind::Binary {
            self.signals.retain(|s| s.waiter != Some(key));
        }
    }

    pub fn diagnostics(&self) -> SemaphoreDiagnostics {
        SemaphoreDiagnostics {
            double_waits: self.double_waits,
            unmatched_waits: self.unmatched_waits,
            unconsumed_signals: self.signals.iter().filter(|s| s.waiter.is_none()).count() as u32,
            outstanding_signals: self.signals.len() as u32,
        }
    }
}

// ── Pools ───────────────────────────────────────────────────

/// Recyclable driver sync objects owned by the layer. All handles are
/// driver-native.
#[derive(Debug, Default)]
pub(crate) struct SyncPool {
    /// Unsignaled binary semaphores ready for reuse.
    pub free_semaphores: Vec<vk::Semaphore>,
    /// Signaled binary semaphores that need one wait before reuse.
    pub reset_backlog: VecDeque<vk::Semaphore>,
    /// Unsignaled fences ready for reuse.
    pub free_fences: Vec<vk::Fence>,
    pub semaphore_limit: usize,
    pub fence_limit: usize,
}

impl SyncPool {
    pub fn new(semaphore_limit: usize, fence_limit: usize) -> Self {
        Self {
            semaphore_limit,
            fence_limit,
            ..Default::default()
        }
    }

    pub fn borrow_semaphore(&mut self, driver: &dyn Driver) -> Result<vk::Semaphore, vk::Result> {
        match self.free_semaphores.pop() {
            Some(sem) => Ok(sem),
            None => {
                let sem = driver.create_semaphore(SemaphoreKind::Binary, 0)?;
                debug!(semaphore = format_args!("{:#x}", sem.as_raw()), "created pool semaphore");
                Ok(sem)
            }
        }
    }

    pub fn return_semaphore(&mut self, driver: &dyn Driver, sem: vk::Semaphore) {
        if self.free_semaphores.len() < self.semaphore_limit {
            self.free_semaphores.push(sem);
        } else {
            driver.destroy_semaphore(sem);
        }
    }

    pub fn borrow_fence(&mut self, driver: &dyn Driver) -> Result<vk::Fence, vk::Result> {
        match self.free_fences.pop() {
            Some(fence) => Ok(fence),
            None => driver.create_fence(false),
        }
    }

    pub fn return_fence(&mut self, driver: &dyn Driver, fence: vk::Fence) {
        if self.free_fences.len() < self.fence_limit && driver.reset_fences(&[fence]).is_ok() {
            self.free_fences.push(fence);
        } else {
            driver.destroy_fence(fence);
        }
    }

    /// Take up to `max` backlogged semaphores for a submission to wait on.
    pub fn take_backlog(&mut self, max: usize) -> Vec<vk::Semaphore> {
        let n = max.min(self.reset_backlog.len());
        self.reset_backlog.drain(..n).collect()
    }

    /// Put semaphores taken by [`SyncPool::take_backlog`] back in front.
    pub fn restore_backlog(&mut self, taken: Vec<vk::Semaphore>) {
        for sem in taken.into_iter().rev() {
            self.reset_backlog.push_front(sem);
        }
    }

    pub fn destroy_all(&mut self, driver: &dyn Driver) {
        for sem in self.free_semaphores.drain(..).chain(self.reset_backlog.drain(..)) {
            driver.destroy_semaphore(sem);
        }
        for fence in self.free_fences.drain(..) {
            driver.destroy_fence(fence);
        }
    }
}
