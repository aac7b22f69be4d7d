//! The submission pipeline.
//!
//! Per submit call:
//! 1. normalize to [`SubmitInfo2`],
//! 2. resolve semaphores and command buffers against the shadow tables,
//! 3. let the command hook swap command buffers,
//! 4. add the layer's own completion signal to every sub-batch,
//! 5. optionally prepend a sub-batch with extra waits (hook cross-queue sync,
//!    semaphore recycling, auxiliary work ordering),
//! 6. forward, rolling back every borrow if the driver fails,
//! 7. link the result into the graph under the device lock.
//!
//! Completion is observed by [`Device::reconcile`], by the wait entry points
//! and by freeing command buffers.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use tracing::{debug, info, trace, warn};

use vkshadow_core::{contract_violation, LayerError};

use crate::command_buffer::CommandBufferState;
use crate::device::{Device, DeviceState};
use crate::queue::{AuxSignal, AuxWork, IdReservation};
use crate::record::CommandRecord;
use crate::submission::{
    normalize_legacy, to_legacy, BatchFence, CommandBufferSubmit, OwnSignal, SemaphoreSubmit, SubmissionBatch,
    SubmissionKey, SubmitInfo, SubmitInfo2, Submission, SyncOp,
};
use crate::swapchain::FrameSubmission;
use crate::sync::SemaphoreKind;

/// One application sub-batch after handle resolution.
struct Prepared {
    forward: SubmitInfo2,
    command_buffers: Vec<vk::CommandBuffer>,
    records: Vec<Arc<CommandRecord>>,
    waits: Vec<SyncOp>,
    signals: Vec<SyncOp>,
    hooked: bool,
}

/// Everything steps 4 and 5 borrowed or changed, kept for rollback.
struct SubmitPlan {
    native_queue: vk::Queue,
    reservation: IdReservation,
    own_signals: Vec<OwnSignal>,
    lead_waits: Vec<SemaphoreSubmit>,
    /// Own-signal binary semaphores borrowed from the pool.
    borrowed: Vec<vk::Semaphore>,
    /// Backlogged semaphores the leading sub-batch waits on.
    backlog: Vec<vk::Semaphore>,
    fence: Option<BatchFence>,
    aux_consumed: Option<vk::Semaphore>,
    /// Extra semaphore-only submission on the auxiliary queue.
    aux_fallback: Option<(vk::Queue, vk::Semaphore)>,
    aux_synced: bool,
}

fn semaphore_submit(semaphore: vk::Semaphore, value: u64) -> SemaphoreSubmit {
    SemaphoreSubmit {
        semaphore,
        value,
        stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        device_index: 0,
    }
}

fn find_submission_mut(batches: &mut [SubmissionBatch], key: SubmissionKey) -> Option<&mut Submission> {
    batches
        .iter_mut()
        .flat_map(|b| b.submissions.iter_mut())
        .find(|s| s.key == key)
}

impl Device {
    // ── Entry points ────────────────────────────────────────

    pub fn queue_submit(&self, queue: vk::Queue, submits: &[SubmitInfo], fence: vk::Fence) -> Result<(), LayerError> {
        let unified: Vec<SubmitInfo2> = submits.iter().map(normalize_legacy).collect();
        self.submit(queue, &unified, fence)
    }

    pub fn queue_submit2(&self, queue: vk::Queue, submits: &[SubmitInfo2], fence: vk::Fence) -> Result<(), LayerError> {
        self.submit(queue, submits, fence)
    }

    fn forward(&self, queue: vk::Queue, submits: &[SubmitInfo2], fence: vk::Fence, timeline: bool) -> Result<(), vk::Result> {
        if self.sync2 {
            self.driver.queue_submit2(queue, submits, fence)
        } else {
            let legacy: Vec<SubmitInfo> = submits.iter().map(|s| to_legacy(s, timeline)).collect();
            self.driver.queue_submit(queue, &legacy, fence)
        }
    }

    fn submit(&self, queue: vk::Queue, submits: &[SubmitInfo2], fence: vk::Fence) -> Result<(), LayerError> {
        let queue_raw = queue.as_raw();
        let app_fence = if fence == vk::Fence::null() {
            None
        } else {
            Some(self.fences.try_get(fence.as_raw())?)
        };

        let mut prepared = self.prepare(submits)?;
        if prepared.is_empty() {
            let native_queue = self.state.lock().queue_mut(queue_raw)?.native;
            let native_fence = app_fence.as_ref().map_or(vk::Fence::null(), |f| f.native);
            self.forward(native_queue, &[], native_fence, self.timeline)?;
            return Ok(());
        }

        let plan = {
            let mut guard = self.state.lock();
            self.plan(&mut guard, queue_raw, &mut prepared, app_fence.as_ref().map(|f| f.native))?
        };

        if let Some((aux_queue, semaphore)) = plan.aux_fallback {
            let extra = SubmitInfo2 {
                signals: vec![semaphore_submit(semaphore, 0)],
                ..Default::default()
            };
            if let Err(err) = self.forward(aux_queue, &[extra], vk::Fence::null(), false) {
                self.rollback(queue_raw, plan, false);
                return Err(err.into());
            }
            debug!("ordered auxiliary work through an extra semaphore submission");
        }

        let mut forward = Vec::with_capacity(prepared.len() + 1);
        if !plan.lead_waits.is_empty() {
            forward.push(SubmitInfo2 {
                waits: plan.lead_waits.clone(),
                ..Default::default()
            });
        }
        forward.extend(prepared.iter().map(|p| p.forward.clone()));

        let timeline = self.timeline
            || prepared
                .iter()
                .flat_map(|p| p.waits.iter().chain(&p.signals))
                .any(|op| op.kind == SemaphoreKind::Timeline);
        let native_fence = match (&app_fence, plan.fence) {
            (Some(f), _) => f.native,
            (None, Some(f)) => f.native,
            (None, None) => vk::Fence::null(),
        };

        if let Err(err) = self.forward(plan.native_queue, &forward, native_fence, timeline) {
            warn!(queue = format_args!("{:#x}", queue_raw), ?err, "driver rejected submission, rolling back");
            self.rollback(queue_raw, plan, true);
            return Err(err.into());
        }

        self.commit(queue, prepared, plan, app_fence.map(|f| f.handle));
        Ok(())
    }

    /// Steps 2 and 3: resolve handles, pick up records, run the hook.
    fn prepare(&self, submits: &[SubmitInfo2]) -> Result<Vec<Prepared>, LayerError> {
        let mut out = Vec::with_capacity(submits.len());
        for info in submits {
            let mut forward = info.clone();
            let mut waits = Vec::with_capacity(info.waits.len());
            let mut signals = Vec::with_capacity(info.signals.len());

            for (fwd, wait) in forward.waits.iter_mut().zip(&info.waits) {
                let sem = self.semaphores.try_get(wait.semaphore.as_raw())?;
                fwd.semaphore = sem.native;
                waits.push(SyncOp {
                    semaphore: wait.semaphore,
                    kind: sem.kind,
                    value: wait.value,
                    stage_mask: wait.stage_mask,
                });
            }
            for (fwd, signal) in forward.signals.iter_mut().zip(&info.signals) {
                let sem = self.semaphores.try_get(signal.semaphore.as_raw())?;
                fwd.semaphore = sem.native;
                signals.push(SyncOp {
                    semaphore: signal.semaphore,
                    kind: sem.kind,
                    value: signal.value,
                    stage_mask: signal.stage_mask,
                });
            }

            let cbs = info
                .command_buffers
                .iter()
                .map(|c| self.command_buffers.try_get(c.command_buffer.as_raw()))
                .collect::<Result<Vec<_>, _>>()?;
            let busy = {
                let state = self.state.lock();
                cbs.iter()
                    .any(|cb| state.slot(cb.handle.as_raw()).is_ok_and(|slot| !slot.pending.is_empty()))
            };
            if busy {
                self.reconcile()?;
            }
            let records = {
                let state = self.state.lock();
                cbs.iter()
                    .map(|cb| {
                        let raw = cb.handle.as_raw();
                        let slot = state.slot(raw)?;
                        match (slot.state, &slot.last) {
                            (CommandBufferState::Executable, Some(record))
                                if !slot.pending.is_empty()
                                    && !record
                                        .usage_flags
                                        .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE) =>
                            {
                                Err(contract_violation!(raw, "simultaneous use", "pending"))
                            }
                            (CommandBufferState::Executable, Some(record)) => Ok(Arc::clone(record)),
                            (found, _) => Err(contract_violation!(raw, "executable", found.name())),
                        }
                    })
                    .collect::<Result<Vec<_>, LayerError>>()?
            };

            let mut hooked = false;
            for ((fwd, cb), record) in forward.command_buffers.iter_mut().zip(&cbs).zip(&records) {
                fwd.command_buffer = cb.native;
                if let Some(hook) = &self.hook {
                    if let Some(replacement) = hook.rewrite_submission(cb.native, record) {
                        trace!(
                            command_buffer = format_args!("{:#x}", cb.handle.as_raw()),
                            "command buffer replaced by hook"
                        );
                        fwd.command_buffer = replacement;
                        hooked = true;
                    }
                }
            }

            out.push(Prepared {
                forward,
                command_buffers: info.command_buffers.iter().map(|c: &CommandBufferSubmit| c.command_buffer).collect(),
                records,
                waits,
                signals,
                hooked,
            });
        }
        Ok(out)
    }

    /// Steps 4 and 5, under the device lock.
    fn plan(
        &self,
        state: &mut DeviceState,
        queue_raw: u64,
        prepared: &mut [Prepared],
        app_fence: Option<vk::Fence>,
    ) -> Result<SubmitPlan, LayerError> {
        let driver = self.driver.as_ref();
        let max_backlog = self.config.submission.max_reset_backlog_per_submit;
        let DeviceState {
            queues,
            sync_pool,
            aux,
            hooked_queues,
            ..
        } = state;

        let queue = queues
            .get_mut(&queue_raw)
            .ok_or(LayerError::UnknownHandle { kind: "queue", raw: queue_raw })?;
        let reservation = IdReservation::reserve(queue, prepared.len());
        let mut plan = SubmitPlan {
            native_queue: queue.native,
            reservation,
            own_signals: Vec::with_capacity(prepared.len()),
            lead_waits: Vec::new(),
            borrowed: Vec::new(),
            backlog: Vec::new(),
            fence: None,
            aux_consumed: None,
            aux_fallback: None,
            aux_synced: false,
        };

        // Own completion signal per sub-batch.
        let own_timeline = queue.timeline;
        for (i, p) in prepared.iter_mut().enumerate() {
            let own = match own_timeline {
                Some(semaphore) => OwnSignal::Timeline {
                    semaphore,
                    value: reservation.id(i),
                },
                None => match sync_pool.borrow_semaphore(driver) {
                    Ok(semaphore) => {
                        plan.borrowed.push(semaphore);
                        OwnSignal::Binary { semaphore }
                    }
                    Err(err) => {
                        reservation.rollback(queue);
                        for sem in plan.borrowed.drain(..) {
                            sync_pool.return_semaphore(driver, sem);
                        }
                        return Err(err.into());
                    }
                },
            };
            let (semaphore, value) = match own {
                OwnSignal::Timeline { semaphore, value } => (semaphore, value),
                OwnSignal::Binary { semaphore } => (semaphore, 0),
            };
            p.forward.signals.push(semaphore_submit(semaphore, value));
            plan.own_signals.push(own);
        }

        if own_timeline.is_none() {
            plan.fence = match app_fence {
                Some(native) => Some(BatchFence { native, pooled: false }),
                None => match sync_pool.borrow_fence(driver) {
                    Ok(native) => Some(BatchFence { native, pooled: true }),
                    Err(err) => {
                        reservation.rollback(queue);
                        for sem in plan.borrowed.drain(..) {
                            sync_pool.return_semaphore(driver, sem);
                        }
                        return Err(err.into());
                    }
                },
            };
        }

        // Cross-queue sync with queues the hook rewrote.
        if prepared.iter().any(|p| p.hooked) {
            let others: Vec<(u64, u64)> = hooked_queues
                .iter()
                .filter(|(q, _)| **q != queue_raw)
                .map(|(q, v)| (*q, *v))
                .collect();
            for (other, value) in others {
                match queues.get(&other).and_then(|q| q.timeline) {
                    Some(semaphore) => plan.lead_waits.push(semaphore_submit(semaphore, value)),
                    None => warn!(
                        queue = format_args!("{:#x}", other),
                        "cannot order hooked submissions across queues without timeline semaphores"
                    ),
                }
            }
        }

        // Recycle signaled pool semaphores by waiting on them.
        plan.backlog = sync_pool.take_backlog(max_backlog);
        plan.lead_waits
            .extend(plan.backlog.iter().map(|sem| semaphore_submit(*sem, 0)));

        // Order after the layer's own work on another queue.
        if let Some(work) = aux.as_mut() {
            if work.queue != queue_raw && !work.synced.contains(&queue_raw) {
                match &mut work.signal {
                    AuxSignal::Timeline { semaphore, value } => {
                        plan.lead_waits.push(semaphore_submit(*semaphore, *value));
                    }
                    AuxSignal::Binary { semaphore, consumed } if !*consumed => {
                        *consumed = true;
                        plan.aux_consumed = Some(*semaphore);
                        plan.lead_waits.push(semaphore_submit(*semaphore, 0));
                    }
                    AuxSignal::Binary { .. } => match sync_pool.borrow_semaphore(driver) {
                        Ok(fresh) => {
                            plan.aux_fallback = Some((work.native_queue, fresh));
                            plan.lead_waits.push(semaphore_submit(fresh, 0));
                        }
                        Err(err) => warn!(?err, "could not order after auxiliary work"),
                    },
                }
                work.synced.push(queue_raw);
                plan.aux_synced = true;
            }
        }

        Ok(plan)
    }

    /// Undo steps 4 and 5 after a failed forward. `fallback_sent` tells
    /// whether the extra auxiliary submission reached the driver, in which
    /// case its semaphore is signaled and needs a wait before reuse.
    fn rollback(&self, queue_raw: u64, plan: SubmitPlan, fallback_sent: bool) {
        let driver = self.driver.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(queue) = state.queues.get_mut(&queue_raw) {
            plan.reservation.rollback(queue);
        }
        for sem in plan.borrowed {
            state.sync_pool.return_semaphore(driver, sem);
        }
        state.sync_pool.restore_backlog(plan.backlog);
        if let Some(BatchFence { native, pooled: true }) = plan.fence {
            state.sync_pool.return_fence(driver, native);
        }
        if let Some((_, sem)) = plan.aux_fallback {
            if fallback_sent {
                state.sync_pool.reset_backlog.push_back(sem);
            } else {
                state.sync_pool.return_semaphore(driver, sem);
            }
        }
        if let Some(work) = state.aux.as_mut() {
            if let (Some(sem), AuxSignal::Binary { semaphore, consumed }) = (plan.aux_consumed, &mut work.signal) {
                if *semaphore == sem {
                    *consumed = false;
                }
            }
            if plan.aux_synced {
                work.synced.retain(|q| *q != queue_raw);
            }
        }
        info!(queue = format_args!("{:#x}", queue_raw), "submission rolled back");
    }

    /// Step 7: link the forwarded batch into the graph.
    fn commit(&self, queue: vk::Queue, prepared: Vec<Prepared>, plan: SubmitPlan, app_fence: Option<vk::Fence>) {
        let queue_raw = queue.as_raw();
        let track_layouts = self.config.recording.track_image_layouts;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let batch_id = state.next_batch_id;
        state.next_batch_id += 1;

        let mut submissions = Vec::with_capacity(prepared.len());
        for (i, p) in prepared.into_iter().enumerate() {
            let key = SubmissionKey {
                queue: queue_raw,
                seq: plan.reservation.id(i),
            };

            let reachable = p.waits.iter().all(|w| {
                w.kind != SemaphoreKind::Timeline
                    || state
                        .semaphores
                        .get(&w.semaphore.as_raw())
                        .map_or(true, |s| s.reachable(w.value))
            });
            for wait in &p.waits {
                if let Some(sem) = state.semaphores.get_mut(&wait.semaphore.as_raw()) {
                    sem.add_wait(wait.semaphore.as_raw(), key);
                }
            }
            for signal in &p.signals {
                if let Some(sem) = state.semaphores.get_mut(&signal.semaphore.as_raw()) {
                    sem.add_signal(signal.semaphore.as_raw(), key, signal.value);
                }
            }

            for cb in &p.command_buffers {
                if let Some(slot) = state.command_buffers.get_mut(&cb.as_raw()) {
                    slot.pending.push(key);
                }
            }
            if let Some(frame) = state.frame.as_mut() {
                frame.submissions.push(FrameSubmission {
                    queue,
                    submission: key,
                    records: p.records.clone(),
                });
            }
            if track_layouts {
                for record in &p.records {
                    record.used().propagate_pending_layouts();
                }
            }

            let mut active = true;
            if let Some(q) = state.queues.get_mut(&queue_raw) {
                if !reachable || !q.blocked.is_empty() {
                    q.blocked.push_back(key);
                    active = false;
                    debug!(queue = format_args!("{:#x}", queue_raw), seq = key.seq, "submission blocked");
                }
            }
            if p.hooked && self.timeline {
                state.hooked_queues.insert(queue_raw, key.seq);
            }

            submissions.push(Submission {
                key,
                queue,
                command_buffers: p.command_buffers,
                records: p.records,
                waits: p.waits,
                signals: p.signals,
                own_signal: plan.own_signals[i],
                hooked: p.hooked,
                active,
                completed: false,
            });
        }

        let mut consumed = plan.backlog;
        consumed.extend(plan.aux_consumed);
        consumed.extend(plan.aux_fallback.map(|(_, sem)| sem));

        if let Some(fence) = app_fence {
            state.fence_batches.insert(fence.as_raw(), batch_id);
        }
        debug!(
            queue = format_args!("{:#x}", queue_raw),
            batch = batch_id,
            submissions = submissions.len(),
            "submission forwarded"
        );
        state.batches.push(SubmissionBatch {
            id: batch_id,
            queue,
            submissions,
            fence: plan.fence,
            signaled_semaphores: plan.borrowed,
            consumed_semaphores: consumed,
        });

        self.activate_blocked(state);
    }

    // ── Activation ──────────────────────────────────────────

    /// Activate blocked submissions, head of each queue first, until no
    /// more timeline dependencies clear.
    pub(crate) fn activate_blocked(&self, state: &mut DeviceState) {
        let DeviceState {
            queues,
            semaphores,
            batches,
            ..
        } = state;
        loop {
            let mut progressed = false;
            for queue in queues.values_mut() {
                while let Some(&key) = queue.blocked.front() {
                    let Some(sub) = find_submission_mut(batches, key) else {
                        queue.blocked.pop_front();
                        continue;
                    };
                    let ready = sub.waits.iter().all(|w| {
                        w.kind != SemaphoreKind::Timeline
                            || semaphores
                                .get(&w.semaphore.as_raw())
                                .map_or(true, |s| s.reachable(w.value))
                    });
                    if !ready {
                        break;
                    }
                    sub.active = true;
                    queue.blocked.pop_front();
                    progressed = true;
                    debug!(queue = format_args!("{:#x}", key.queue), seq = key.seq, "submission activated");
                }
            }
            if !progressed {
                break;
            }
        }
    }

    // ── Completion ──────────────────────────────────────────

    fn complete_submission(state: &mut DeviceState, key: SubmissionKey, released: &mut Vec<Arc<CommandRecord>>) {
        let DeviceState {
            batches,
            command_buffers,
            semaphores,
            queues,
            ..
        } = state;
        let Some(sub) = find_submission_mut(batches, key) else {
            return;
        };
        if sub.completed {
            return;
        }
        sub.completed = true;
        sub.active = true;

        for wait in &sub.waits {
            if let Some(sem) = semaphores.get_mut(&wait.semaphore.as_raw()) {
                match wait.kind {
                    SemaphoreKind::Timeline => sem.note_value(wait.value),
                    SemaphoreKind::Binary => sem.complete_wait(key),
                }
            }
        }
        for signal in &sub.signals {
            if let Some(sem) = semaphores.get_mut(&signal.semaphore.as_raw()) {
                sem.complete_signal(key);
            }
        }

        for (cb, record) in sub.command_buffers.iter().zip(&sub.records) {
            let Some(slot) = command_buffers.get_mut(&cb.as_raw()) else {
                continue;
            };
            slot.pending.retain(|k| *k != key);
            let is_last = slot.last.as_ref().is_some_and(|l| Arc::ptr_eq(l, record));
            if is_last
                && slot.state == CommandBufferState::Executable
                && record.usage_flags.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            {
                slot.state = CommandBufferState::Invalid;
            }
            if slot.pending.is_empty() && slot.state == CommandBufferState::Invalid {
                if let Some(last) = &slot.last {
                    last.clear_used();
                }
            }
        }
        if let Some(queue) = queues.get_mut(&key.queue) {
            queue.blocked.retain(|k| *k != key);
        }
        released.append(&mut sub.records);
        trace!(queue = format_args!("{:#x}", key.queue), seq = key.seq, "submission completed");
    }

    /// Return the pool objects of finished batches.
    fn retire_batches(&self, state: &mut DeviceState) {
        let driver = self.driver.as_ref();
        let (done, pending): (Vec<_>, Vec<_>) = state.batches.drain(..).partition(|b| b.is_complete());
        state.batches = pending;

        for batch in done {
            for sem in batch.signaled_semaphores {
                if state.sync_pool.reset_backlog.len() < state.sync_pool.semaphore_limit {
                    state.sync_pool.reset_backlog.push_back(sem);
                } else {
                    driver.destroy_semaphore(sem);
                }
            }
            for sem in batch.consumed_semaphores {
                state.sync_pool.return_semaphore(driver, sem);
            }
            if let Some(BatchFence { native, pooled: true }) = batch.fence {
                state.sync_pool.return_fence(driver, native);
            }
            state.fence_batches.retain(|_, id| *id != batch.id);
            trace!(batch = batch.id, "batch retired");
        }
    }

    /// Complete the given submissions, retire and activate. Returns the
    /// records to release once the lock is gone.
    fn complete_keys(&self, state: &mut DeviceState, keys: &[SubmissionKey]) -> Vec<Arc<CommandRecord>> {
        let mut released = Vec::new();
        for key in keys {
            Self::complete_submission(state, *key, &mut released);
        }
        self.retire_batches(state);
        self.activate_blocked(state);
        released
    }

    fn incomplete_keys(state: &DeviceState, filter: impl Fn(&SubmissionBatch, &Submission) -> bool) -> Vec<SubmissionKey> {
        state
            .batches
            .iter()
            .flat_map(|b| b.submissions.iter().map(move |s| (b, s)))
            .filter(|(b, s)| !s.completed && filter(b, s))
            .map(|(_, s)| s.key)
            .collect()
    }

    /// Poll the driver for finished work and update the graph. Returns the
    /// number of submissions that completed.
    pub fn reconcile(&self) -> Result<usize, LayerError> {
        let (completed, released) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let mut counters: HashMap<u64, u64> = HashMap::new();
            for (raw, queue) in &state.queues {
                if let Some(sem) = queue.timeline {
                    counters.insert(*raw, self.driver.semaphore_counter_value(sem)?);
                }
            }
            let mut fences_done: HashMap<u64, bool> = HashMap::new();
            for batch in &state.batches {
                if let Some(fence) = batch.fence {
                    fences_done.insert(batch.id, self.driver.fence_status(fence.native)?);
                }
            }

            let keys = Self::incomplete_keys(state, |batch, sub| match sub.own_signal {
                OwnSignal::Timeline { value, .. } => counters.get(&sub.key.queue).is_some_and(|c| *c >= value),
                OwnSignal::Binary { .. } => fences_done.get(&batch.id).copied().unwrap_or(false),
            });
            (keys.len(), self.complete_keys(state, &keys))
        };
        drop(released);
        Ok(completed)
    }

    /// Block until the given submissions finished, then complete them.
    pub(crate) fn wait_for_submissions(&self, keys: &[SubmissionKey]) -> Result<(), LayerError> {
        let (semaphores, values, fences, batch_keys) = {
            let state = self.state.lock();
            let mut semaphores = Vec::new();
            let mut values = Vec::new();
            let mut fences = Vec::new();
            let mut batch_keys = Vec::new();
            for batch in &state.batches {
                for sub in batch.submissions.iter().filter(|s| keys.contains(&s.key) && !s.completed) {
                    match (sub.own_signal, batch.fence) {
                        (OwnSignal::Timeline { semaphore, value }, _) => {
                            semaphores.push(semaphore);
                            values.push(value);
                            batch_keys.push(sub.key);
                        }
                        (OwnSignal::Binary { .. }, Some(fence)) => {
                            if !fences.contains(&fence.native) {
                                fences.push(fence.native);
                                batch_keys.extend(batch.submissions.iter().map(|s| s.key));
                            }
                        }
                        (OwnSignal::Binary { .. }, None) => {}
                    }
                }
            }
            (semaphores, values, fences, batch_keys)
        };

        if !semaphores.is_empty() {
            self.driver.wait_semaphores(&semaphores, &values, u64::MAX)?;
        }
        if !fences.is_empty() {
            self.driver.wait_for_fences(&fences, true, u64::MAX)?;
        }

        let released = {
            let mut guard = self.state.lock();
            self.complete_keys(&mut guard, &batch_keys)
        };
        drop(released);
        Ok(())
    }

    pub fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> Result<(), LayerError> {
        let natives = fences
            .iter()
            .map(|f| self.fences.try_get(f.as_raw()).map(|f| f.native))
            .collect::<Result<Vec<_>, _>>()?;
        self.driver.wait_for_fences(&natives, wait_all, timeout)?;

        if wait_all || fences.len() == 1 {
            let released = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let batch_ids: Vec<u64> = fences
                    .iter()
                    .filter_map(|f| state.fence_batches.get(&f.as_raw()).copied())
                    .collect();
                let keys = Self::incomplete_keys(state, |batch, _| batch_ids.contains(&batch.id));
                self.complete_keys(state, &keys)
            };
            drop(released);
        }
        self.reconcile()?;
        Ok(())
    }

    /// Reset application fences. A fence still attached to a batch must
    /// have signaled; its batch completes before the reset so the signal is
    /// not lost to the graph.
    pub fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), LayerError> {
        let natives = fences
            .iter()
            .map(|f| self.fences.try_get(f.as_raw()).map(|f| f.native))
            .collect::<Result<Vec<_>, _>>()?;

        let released = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut batch_ids = Vec::new();
            for (fence, native) in fences.iter().zip(&natives) {
                let Some(&batch_id) = state.fence_batches.get(&fence.as_raw()) else {
                    continue;
                };
                if !self.driver.fence_status(*native)? {
                    return Err(contract_violation!(fence.as_raw(), "signaled fence", "fence of pending work"));
                }
                batch_ids.push(batch_id);
            }
            let keys = Self::incomplete_keys(state, |batch, _| batch_ids.contains(&batch.id));
            if !keys.is_empty() {
                debug!(completed = keys.len(), "fence reset completes its submissions");
            }
            self.complete_keys(state, &keys)
        };
        drop(released);

        self.driver.reset_fences(&natives)?;
        Ok(())
    }

    pub fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), LayerError> {
        let native = self.state.lock().queue_mut(queue.as_raw())?.native;
        self.driver.queue_wait_idle(native)?;
        let released = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let keys = Self::incomplete_keys(state, |_, sub| sub.key.queue == queue.as_raw());
            self.complete_keys(state, &keys)
        };
        debug!(queue = format_args!("{:#x}", queue.as_raw()), completed = released.len(), "queue idle");
        drop(released);
        Ok(())
    }

    pub fn device_wait_idle(&self) -> Result<(), LayerError> {
        self.driver.device_wait_idle()?;
        let released = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let keys = Self::incomplete_keys(state, |_, _| true);
            self.complete_keys(state, &keys)
        };
        debug!(completed = released.len(), "device idle");
        drop(released);
        Ok(())
    }

    // ── Auxiliary work ──────────────────────────────────────

    /// Submit the layer's own command buffers (driver-native) on `queue`.
    /// The next application submission on any other queue is ordered after
    /// this work.
    pub fn submit_aux_work(&self, queue: vk::Queue, command_buffers: &[vk::CommandBuffer]) -> Result<(), LayerError> {
        let queue_raw = queue.as_raw();
        let driver = self.driver.as_ref();

        let (native_queue, signal) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let q = state.queue_mut(queue_raw)?;
            let native_queue = q.native;
            let signal = match q.timeline {
                Some(semaphore) => AuxSignal::Timeline {
                    semaphore,
                    value: q.reserve_id(),
                },
                None => AuxSignal::Binary {
                    semaphore: state.sync_pool.borrow_semaphore(driver)?,
                    consumed: false,
                },
            };
            (native_queue, signal)
        };

        let (semaphore, value) = match signal {
            AuxSignal::Timeline { semaphore, value } => (semaphore, value),
            AuxSignal::Binary { semaphore, .. } => (semaphore, 0),
        };
        let info = SubmitInfo2 {
            command_buffers: command_buffers
                .iter()
                .map(|cb| CommandBufferSubmit {
                    command_buffer: *cb,
                    device_mask: 0,
                })
                .collect(),
            signals: vec![semaphore_submit(semaphore, value)],
            ..Default::default()
        };

        let result = self.forward(native_queue, &[info], vk::Fence::null(), self.timeline);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Err(err) = result {
            match signal {
                AuxSignal::Timeline { value, .. } => {
                    if let Some(q) = state.queues.get_mut(&queue_raw) {
                        if q.last_id == value {
                            q.last_id -= 1;
                        }
                    }
                }
                AuxSignal::Binary { semaphore, .. } => state.sync_pool.return_semaphore(driver, semaphore),
            }
            return Err(err.into());
        }

        let previous = state.aux.replace(AuxWork {
            queue: queue_raw,
            native_queue,
            signal,
            synced: vec![queue_raw],
        });
        if let Some(AuxWork {
            signal: AuxSignal::Binary {
                semaphore,
                consumed: false,
            },
            ..
        }) = previous
        {
            state.sync_pool.reset_backlog.push_back(semaphore);
        }
        debug!(queue = format_args!("{:#x}", queue_raw), count = command_buffers.len(), "auxiliary work submitted");
        Ok(())
    }

    /// Submissions of `queue` that are tracked and not yet complete.
    pub fn pending_submission_count(&self, queue: vk::Queue) -> usize {
        let state = self.state.lock();
        Self::incomplete_keys(&state, |_, sub| sub.key.queue == queue.as_raw()).len()
    }

    /// Whether a tracked submission is active. `None` once it completed
    /// and its batch was retired.
    pub fn submission_active(&self, key: SubmissionKey) -> Option<bool> {
        let state = self.state.lock();
        state
            .batches
            .iter()
            .flat_map(|b| b.submissions.iter())
            .find(|s| s.key == key)
            .map(|s| s.active)
    }
}
