//! Nesting structure of a record.
//!
//! A record is a tree of sections. The root section holds top-level
//! commands; render passes, subpasses, dynamic rendering, debug labels and
//! conditional rendering each open a nested section. Every command appears
//! exactly once in the tree: as the `begin` of the section it opens, or as a
//! child of the section it was recorded in. Closing commands are the last
//! child of the section they close.

use crate::command::{CommandCategory, CommandId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

impl SectionId {
    pub const ROOT: SectionId = SectionId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Root,
    RenderPass,
    Subpass,
    DynamicRendering,
    DebugLabel,
    ConditionalRendering,
}

/// How a section was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionEnd {
    Open,
    /// Closed by a recorded command.
    Command(CommandId),
    /// Closed by the layer to keep the tree well-formed, e.g. a debug label
    /// left open at end of recording.
    Synthesized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Command(CommandId),
    Section(SectionId),
}

/// Command counts aggregated over a section and everything nested in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionStats {
    pub draws: u32,
    pub dispatches: u32,
    pub ray_traces: u32,
    pub transfers: u32,
    pub sync: u32,
    pub total: u32,
}

impl SectionStats {
    pub(crate) fn count(&mut self, category: CommandCategory) {
        self.total += 1;
        match category {
            CommandCategory::Draw => self.draws += 1,
            CommandCategory::Dispatch => self.dispatches += 1,
            CommandCategory::TraceRays => self.ray_traces += 1,
            CommandCategory::Transfer => self.transfers += 1,
            CommandCategory::Sync => self.sync += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionKind,
    /// Command that opened the section. `None` for the root and for the
    /// first subpass, which is opened by its render pass's begin.
    pub begin: Option<CommandId>,
    pub end: SectionEnd,
    pub parent: Option<SectionId>,
    pub children: Vec<Child>,
    pub stats: SectionStats,
}

impl Section {
    pub(crate) fn new(kind: SectionKind, begin: Option<CommandId>, parent: Option<SectionId>) -> Self {
        Self {
            kind,
            begin,
            end: SectionEnd::Open,
            parent,
            children: Vec::new(),
            stats: SectionStats::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end == SectionEnd::Open
    }
}
