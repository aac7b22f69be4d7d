//! vkshadow shadow-execution engine
//!
//! Tracks what a Vulkan application records and submits: every command with
//! its copied payload, the section tree built from render passes, debug
//! labels and other nesting commands, the objects each command buffer
//! references, binding state per bind point, and the graph of submissions
//! and semaphores across queues. The entry points mirror the API calls the
//! intercepting shim forwards; the downstream driver sits behind [`Driver`].

pub mod arena;
pub mod command;
pub mod command_buffer;
pub mod device;
pub mod driver;
pub mod hook;
pub mod queue;
pub mod record;
pub mod recorder;
pub mod resource;
pub mod section;
pub mod state;
pub mod submission;
pub mod submit;
pub mod swapchain;
pub mod sync;
pub mod usage;

pub use arena::{Arena, ArenaSlice, ArenaStr};
pub use command::{Command, CommandCategory, CommandId, CommandKind};
pub use command_buffer::{CommandBuffer, CommandBufferState};
pub use device::Device;
pub use driver::Driver;
pub use hook::{CommandHook, LocalCapture, LocalCaptureRequest};
pub use record::{CommandRecord, RecordBuilder};
pub use recorder::Recorder;
pub use section::{Section, SectionEnd, SectionId, SectionKind};
pub use submission::{SubmissionKey, SubmitInfo, SubmitInfo2};
pub use swapchain::FrameBucket;
pub use sync::{SemaphoreDiagnostics, SemaphoreKind};
pub use usage::UsedHandles;

pub use vkshadow_core::{LayerConfig, LayerError};
