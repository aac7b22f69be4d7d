//! Downstream driver interface.
//!
//! Every handle crossing this trait is driver-native. The shim that embeds
//! the engine implements it on top of the real dispatch table.

use ash::prelude::VkResult;
use ash::vk;

use crate::arena::Arena;
use crate::command::Command;
use crate::submission::{SubmitInfo, SubmitInfo2};
use crate::sync::SemaphoreKind;

pub trait Driver: Send + Sync {
    fn supports_timeline_semaphores(&self) -> bool;
    fn supports_synchronization2(&self) -> bool;

    // ── Command buffers ─────────────────────────────────────
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> VkResult<()>;
    fn reset_command_pool(&self, pool: vk::CommandPool, flags: vk::CommandPoolResetFlags) -> VkResult<()>;

    /// Forward one recorded command. Object references inside `command`
    /// carry their native handles; copied payloads live in `arena`.
    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command, arena: &Arena);

    // ── Queues ──────────────────────────────────────────────
    fn queue_submit(&self, queue: vk::Queue, submits: &[SubmitInfo], fence: vk::Fence) -> VkResult<()>;
    fn queue_submit2(&self, queue: vk::Queue, submits: &[SubmitInfo2], fence: vk::Fence) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;

    // ── Semaphores ──────────────────────────────────────────
    fn create_semaphore(&self, kind: SemaphoreKind, initial_value: u64) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()>;
    fn wait_semaphores(&self, semaphores: &[vk::Semaphore], values: &[u64], timeout: u64) -> VkResult<()>;

    // ── Fences ──────────────────────────────────────────────
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `true` once the fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> VkResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;
}
