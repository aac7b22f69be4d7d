//! Command-hook collaborator.
//!
//! The hook subsystem (instrumented replay, per-command capture) lives
//! outside this crate. It sees every command right after it is added, and it
//! may swap the command buffer a submission forwards to the driver.

use std::sync::Arc;

use ash::vk;

use crate::command::{Command, CommandId};
use crate::record::CommandRecord;

/// Request to capture the next recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCaptureRequest {
    pub name: String,
}

/// What the hook gets handed for a local capture.
#[derive(Debug)]
pub struct LocalCapture<'a> {
    pub request: LocalCaptureRequest,
    pub command_buffer: vk::CommandBuffer,
    pub record_id: u64,
    pub id: CommandId,
    pub command: &'a Command,
}

pub trait CommandHook: Send + Sync {
    /// Called once for the command following a local-capture request.
    fn capture_local(&self, capture: LocalCapture<'_>);

    /// Called during submission for every submitted command buffer.
    /// Returning a handle replaces the driver-native command buffer in the
    /// forwarded batch; the record the application built stays the one
    /// tracked by the submission.
    fn rewrite_submission(
        &self,
        _command_buffer: vk::CommandBuffer,
        _record: &Arc<CommandRecord>,
    ) -> Option<vk::CommandBuffer> {
        None
    }
}
