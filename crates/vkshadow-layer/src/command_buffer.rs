//! Command buffers and their lifecycle.
//!
//! The graph-side state of a command buffer (lifecycle state, last record,
//! pending submissions) lives in the device state behind the device lock.
//! The in-progress [`RecordBuilder`] sits in the command buffer's own slot,
//! touched only by the thread that records into it.
//!
//! Lock order is builder slot, then device lock.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use tracing::{debug, info};

use vkshadow_core::{contract_violation, LayerError};

use crate::device::Device;
use crate::record::{CommandRecord, RecordBuilder};
use crate::recorder::Recorder;
use crate::submission::SubmissionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Invalid,
}

impl CommandBufferState {
    pub fn name(self) -> &'static str {
        match self {
            CommandBufferState::Initial => "initial",
            CommandBufferState::Recording => "recording",
            CommandBufferState::Executable => "executable",
            CommandBufferState::Invalid => "invalid",
        }
    }
}

pub struct CommandBuffer {
    pub handle: vk::CommandBuffer,
    pub native: vk::CommandBuffer,
    pub pool: vk::CommandPool,
    pub level: vk::CommandBufferLevel,
    pub(crate) builder: Mutex<Option<RecordBuilder>>,
}

impl CommandBuffer {
    pub const KIND: &'static str = "command buffer";
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("native", &self.native)
            .field("level", &self.level)
            .finish()
    }
}

/// Device-lock-side state of one command buffer.
#[derive(Debug)]
pub(crate) struct CommandBufferSlot {
    pub state: CommandBufferState,
    pub pool: u64,
    /// Most recently frozen record.
    pub last: Option<Arc<CommandRecord>>,
    /// Submissions executing this buffer that have not been reconciled.
    pub pending: Vec<SubmissionKey>,
    /// Number of recordings started on this buffer.
    pub record_count: u64,
}

#[derive(Debug)]
pub(crate) struct CommandPoolSlot {
    pub native: vk::CommandPool,
    pub buffers: Vec<u64>,
}

impl Device {
    // ── Pools ───────────────────────────────────────────────

    pub fn register_command_pool(&self, handle: vk::CommandPool, native: vk::CommandPool) {
        self.state.lock().pools.insert(
            handle.as_raw(),
            CommandPoolSlot {
                native,
                buffers: Vec::new(),
            },
        );
    }

    /// Free every buffer of the pool and forget it.
    pub fn destroy_command_pool(&self, pool: vk::CommandPool) -> Result<(), LayerError> {
        let buffers: Vec<vk::CommandBuffer> = {
            let state = self.state.lock();
            match state.pools.get(&pool.as_raw()) {
                Some(p) => p.buffers.iter().map(|raw| vk::CommandBuffer::from_raw(*raw)).collect(),
                None => return Ok(()),
            }
        };
        self.free_command_buffers(pool, &buffers)?;
        self.state.lock().pools.remove(&pool.as_raw());
        Ok(())
    }

    fn native_pool(&self, pool: vk::CommandPool) -> Result<vk::CommandPool, LayerError> {
        let state = self.state.lock();
        state
            .pools
            .get(&pool.as_raw())
            .map(|p| p.native)
            .ok_or(LayerError::UnknownHandle {
                kind: "command pool",
                raw: pool.as_raw(),
            })
    }

    // ── Lifecycle ───────────────────────────────────────────

    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>, LayerError> {
        let native_pool = self.native_pool(pool)?;
        let natives = self.driver.allocate_command_buffers(native_pool, level, count)?;

        let mut handles = Vec::with_capacity(natives.len());
        for native in natives {
            let handle = vk::CommandBuffer::from_raw(self.mint_handle());
            self.command_buffers.insert(
                handle.as_raw(),
                Arc::new(CommandBuffer {
                    handle,
                    native,
                    pool,
                    level,
                    builder: Mutex::new(None),
                }),
            );
            handles.push(handle);
        }

        let mut state = self.state.lock();
        for handle in &handles {
            state.command_buffers.insert(
                handle.as_raw(),
                CommandBufferSlot {
                    state: CommandBufferState::Initial,
                    pool: pool.as_raw(),
                    last: None,
                    pending: Vec::new(),
                    record_count: 0,
                },
            );
        }
        if let Some(p) = state.pools.get_mut(&pool.as_raw()) {
            p.buffers.extend(handles.iter().map(|h| h.as_raw()));
        }
        debug!(pool = format_args!("{:#x}", pool.as_raw()), count, ?level, "command buffers allocated");
        Ok(handles)
    }

    /// Start recording. Implicitly resets an executable or invalid buffer;
    /// its previous record is released once no submission references it.
    /// The buffer must not be pending.
    pub fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), LayerError> {
        let raw = command_buffer.as_raw();
        let cb = self.command_buffers.try_get(raw)?;
        let mut builder = cb.builder.lock();

        let (current, pending) = {
            let state = self.state.lock();
            let slot = state.slot(raw)?;
            (slot.state, !slot.pending.is_empty())
        };
        if current == CommandBufferState::Recording || builder.is_some() {
            return Err(contract_violation!(raw, "initial or executable", current.name()));
        }
        if pending {
            self.reconcile()?;
            if !self.state.lock().slot(raw)?.pending.is_empty() {
                return Err(contract_violation!(raw, "not pending", "pending"));
            }
        }

        self.driver.begin_command_buffer(cb.native, flags)?;

        let (record_id, released) = {
            let mut state = self.state.lock();
            let slot = state.slot_mut(raw)?;
            slot.record_count += 1;
            slot.state = CommandBufferState::Recording;
            (slot.record_count, slot.last.take())
        };
        drop(released);

        *builder = Some(RecordBuilder::new(record_id, cb.handle, cb.level, flags));
        debug!(command_buffer = format_args!("{:#x}", raw), record_id, "begin recording");
        Ok(())
    }

    /// Freeze the builder into the buffer's record.
    pub fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<Arc<CommandRecord>, LayerError> {
        let raw = command_buffer.as_raw();
        let cb = self.command_buffers.try_get(raw)?;
        let mut slot = cb.builder.lock();
        let Some(builder) = slot.take() else {
            let current = self.state.lock().slot(raw)?.state;
            return Err(contract_violation!(raw, "recording", current.name()));
        };
        let record = Arc::new(builder.finish());

        if let Err(err) = self.driver.end_command_buffer(cb.native) {
            self.state.lock().slot_mut(raw)?.state = CommandBufferState::Invalid;
            drop(record);
            return Err(err.into());
        }

        {
            let mut state = self.state.lock();
            let slot = state.slot_mut(raw)?;
            slot.state = CommandBufferState::Executable;
            slot.last = Some(Arc::clone(&record));
        }
        debug!(
            command_buffer = format_args!("{:#x}", raw),
            record_id = record.record_id,
            commands = record.len(),
            broken_labels = record.broken_labels(),
            "end recording"
        );
        Ok(record)
    }

    /// Back to the initial state. A record still referenced by pending
    /// submissions stays alive until they are reconciled.
    pub fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), LayerError> {
        let raw = command_buffer.as_raw();
        let cb = self.command_buffers.try_get(raw)?;
        let mut builder = cb.builder.lock();
        self.driver.reset_command_buffer(cb.native, flags)?;

        let abandoned = builder.take();
        let released = {
            let mut state = self.state.lock();
            let slot = state.slot_mut(raw)?;
            if !slot.pending.is_empty() {
                debug!(
                    command_buffer = format_args!("{:#x}", raw),
                    pending = slot.pending.len(),
                    "reset while submissions are pending"
                );
            }
            slot.state = CommandBufferState::Initial;
            slot.last.take()
        };
        drop(released);
        drop(abandoned);
        Ok(())
    }

    /// Reset every buffer allocated from `pool`.
    pub fn reset_command_pool(&self, pool: vk::CommandPool, flags: vk::CommandPoolResetFlags) -> Result<(), LayerError> {
        let native_pool = self.native_pool(pool)?;
        self.driver.reset_command_pool(native_pool, flags)?;

        let buffers: Vec<u64> = {
            let state = self.state.lock();
            state
                .pools
                .get(&pool.as_raw())
                .map(|p| p.buffers.clone())
                .unwrap_or_default()
        };

        let mut released = Vec::new();
        for raw in &buffers {
            let Some(cb) = self.command_buffers.get(*raw) else {
                continue;
            };
            let abandoned = cb.builder.lock().take();
            let mut state = self.state.lock();
            if let Some(slot) = state.command_buffers.get_mut(raw) {
                slot.state = CommandBufferState::Initial;
                released.extend(slot.last.take());
            }
            drop(state);
            drop(abandoned);
        }
        drop(released);
        debug!(pool = format_args!("{:#x}", pool.as_raw()), buffers = buffers.len(), "command pool reset");
        Ok(())
    }

    /// Wait for pending submissions of the buffers, then forget them.
    pub fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<(), LayerError> {
        let pending: Vec<SubmissionKey> = {
            let state = self.state.lock();
            command_buffers
                .iter()
                .filter_map(|cb| state.command_buffers.get(&cb.as_raw()))
                .flat_map(|slot| slot.pending.iter().copied())
                .collect()
        };
        if !pending.is_empty() {
            debug!(submissions = pending.len(), "waiting for pending work before free");
            self.wait_for_submissions(&pending)?;
        }

        let mut released = Vec::new();
        let mut abandoned = Vec::new();
        let mut natives = Vec::new();
        let native_pool = {
            let mut state = self.state.lock();
            for cb in command_buffers {
                let raw = cb.as_raw();
                if let Some(slot) = state.command_buffers.remove(&raw) {
                    released.extend(slot.last);
                }
                if let Some(p) = state.pools.get_mut(&pool.as_raw()) {
                    p.buffers.retain(|b| *b != raw);
                }
            }
            state.pools.get(&pool.as_raw()).map(|p| p.native)
        };
        for cb in command_buffers {
            if let Some(obj) = self.command_buffers.remove(cb.as_raw()) {
                natives.push(obj.native);
                abandoned.extend(obj.builder.lock().take());
            }
        }
        if let Some(native_pool) = native_pool {
            if !natives.is_empty() {
                self.driver.free_command_buffers(native_pool, &natives);
            }
        }
        drop(released);
        drop(abandoned);
        info!(count = natives.len(), "command buffers freed");
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn command_buffer_state(&self, command_buffer: vk::CommandBuffer) -> Option<CommandBufferState> {
        let state = self.state.lock();
        state.command_buffers.get(&command_buffer.as_raw()).map(|s| s.state)
    }

    /// Executable with at least one unreconciled submission.
    pub fn is_pending(&self, command_buffer: vk::CommandBuffer) -> bool {
        let state = self.state.lock();
        state
            .command_buffers
            .get(&command_buffer.as_raw())
            .is_some_and(|s| !s.pending.is_empty())
    }

    pub fn last_record(&self, command_buffer: vk::CommandBuffer) -> Option<Arc<CommandRecord>> {
        let state = self.state.lock();
        state
            .command_buffers
            .get(&command_buffer.as_raw())
            .and_then(|s| s.last.clone())
    }

    pub fn pending_submissions(&self, command_buffer: vk::CommandBuffer) -> Vec<SubmissionKey> {
        let state = self.state.lock();
        state
            .command_buffers
            .get(&command_buffer.as_raw())
            .map(|s| s.pending.clone())
            .unwrap_or_default()
    }

    pub fn record_count(&self, command_buffer: vk::CommandBuffer) -> u64 {
        let state = self.state.lock();
        state
            .command_buffers
            .get(&command_buffer.as_raw())
            .map_or(0, |s| s.record_count)
    }

    /// Recording interface for a buffer in the recording state.
    pub fn recorder(&self, command_buffer: vk::CommandBuffer) -> Result<Recorder<'_>, LayerError> {
        let cb = self.command_buffers.try_get(command_buffer.as_raw())?;
        Ok(Recorder::new(self, cb))
    }
}
