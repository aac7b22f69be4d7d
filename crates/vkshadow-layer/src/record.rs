//! Command records and the builder that fills them.
//!
//! A [`RecordBuilder`] is owned by its command buffer while recording and is
//! only touched by the thread that holds recording access. `end` freezes it
//! into an immutable [`CommandRecord`] shared via `Arc` between the command
//! buffer and every submission that executes it.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::arena::{Arena, ArenaStr};
use crate::command::{Command, CommandId, CommandKind};
use crate::hook::LocalCaptureRequest;
use crate::resource::{Framebuffer, RenderPass};
use crate::section::{Child, Section, SectionEnd, SectionId, SectionKind};
use crate::state::{BindingTracker, ComputeState, GraphicsState, RayTracingState};
use crate::usage::UsedHandles;

#[derive(Debug)]
pub struct CommandNode {
    pub command: Command,
    /// Section the command was recorded in.
    pub section: SectionId,
}

/// The frozen result of one begin/end recording.
pub struct CommandRecord {
    /// Per-command-buffer record counter value.
    pub record_id: u64,
    pub command_buffer: vk::CommandBuffer,
    pub level: vk::CommandBufferLevel,
    pub usage_flags: vk::CommandBufferUsageFlags,
    arena: Arena,
    commands: Vec<CommandNode>,
    sections: Vec<Section>,
    used: RwLock<UsedHandles>,
    pushed_labels: Vec<ArenaStr>,
    accel_build_flags: HashMap<u64, vk::BuildAccelerationStructureFlagsKHR>,
    secondaries: Vec<Arc<CommandRecord>>,
    broken_labels: bool,
}

impl CommandRecord {
    fn new(
        record_id: u64,
        command_buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
        usage_flags: vk::CommandBufferUsageFlags,
    ) -> Self {
        Self {
            record_id,
            command_buffer,
            level,
            usage_flags,
            arena: Arena::new(),
            commands: Vec::new(),
            sections: vec![Section::new(SectionKind::Root, None, None)],
            used: RwLock::new(UsedHandles::new()),
            pushed_labels: Vec::new(),
            accel_build_flags: HashMap::new(),
            secondaries: Vec::new(),
            broken_labels: false,
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn command(&self, id: CommandId) -> &Command {
        &self.commands[id.index()].command
    }

    pub fn node(&self, id: CommandId) -> &CommandNode {
        &self.commands[id.index()]
    }

    /// Commands in call order.
    pub fn commands(&self) -> impl Iterator<Item = (CommandId, &Command)> {
        self.commands
            .iter()
            .enumerate()
            .map(|(i, n)| (CommandId(i as u32), &n.command))
    }

    pub fn root(&self) -> &Section {
        &self.sections[SectionId::ROOT.index()]
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_of(&self, id: CommandId) -> SectionId {
        self.commands[id.index()].section
    }

    /// Walk the section tree depth-first, calling `visit` with the nesting
    /// depth of each command.
    pub fn walk(&self, mut visit: impl FnMut(usize, CommandId, &Command)) {
        self.walk_section(SectionId::ROOT, 0, &mut visit);
    }

    fn walk_section(
        &self,
        id: SectionId,
        depth: usize,
        visit: &mut impl FnMut(usize, CommandId, &Command),
    ) {
        for child in &self.sections[id.index()].children {
            match *child {
                Child::Command(cmd) => visit(depth, cmd, self.command(cmd)),
                Child::Section(sid) => {
                    if let Some(begin) = self.sections[sid.index()].begin {
                        visit(depth, begin, self.command(begin));
                    }
                    self.walk_section(sid, depth + 1, visit);
                }
            }
        }
    }

    /// Every command, reconstructed from the section tree.
    pub fn flatten(&self) -> Vec<CommandId> {
        let mut out = Vec::with_capacity(self.commands.len());
        self.walk(|_, id, _| out.push(id));
        out
    }

    /// Number of sections the layer had to close itself.
    pub fn synthesized_closes(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.end == SectionEnd::Synthesized)
            .count()
    }

    /// Whether debug-label begin/end pairs did not nest cleanly.
    pub fn broken_labels(&self) -> bool {
        self.broken_labels
    }

    /// Labels still open at end of recording, outermost first. These pop
    /// in whatever command buffer executes next on the queue.
    pub fn pushed_labels(&self) -> Vec<&str> {
        self.pushed_labels.iter().map(|s| self.arena.str(*s)).collect()
    }

    pub fn label_name(&self, name: ArenaStr) -> &str {
        self.arena.str(name)
    }

    pub fn accel_build_flags(&self, dst: vk::AccelerationStructureKHR) -> Option<vk::BuildAccelerationStructureFlagsKHR> {
        self.accel_build_flags.get(&dst.as_raw()).copied()
    }

    pub fn secondaries(&self) -> &[Arc<CommandRecord>] {
        &self.secondaries
    }

    pub fn used(&self) -> RwLockReadGuard<'_, UsedHandles> {
        self.used.read()
    }

    /// Drop the record's resource references ahead of its destruction,
    /// after the command buffer was invalidated.
    pub(crate) fn clear_used(&self) {
        self.used.write().clear();
    }
}

impl std::fmt::Debug for CommandRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecord")
            .field("record_id", &self.record_id)
            .field("command_buffer", &self.command_buffer)
            .field("commands", &self.commands.len())
            .field("sections", &self.sections.len())
            .field("broken_labels", &self.broken_labels)
            .finish()
    }
}

// ── Builder ─────────────────────────────────────────────────

fn structural_violation(msg: &str, kind: SectionKind) {
    tracing::error!(?kind, "{}", msg);
    if cfg!(debug_assertions) {
        panic!("{} ({:?})", msg, kind);
    }
}

pub struct RecordBuilder {
    record: CommandRecord,
    /// Open sections, root at the bottom.
    stack: Vec<SectionId>,
    /// Label sections whose end was recorded while a non-label section was
    /// nested inside them. They close once they are on top again.
    orphaned_label_ends: Vec<SectionId>,
    pub graphics: BindingTracker<GraphicsState>,
    pub compute: BindingTracker<ComputeState>,
    pub ray_tracing: BindingTracker<RayTracingState>,
    pending_capture: Option<LocalCaptureRequest>,
}

impl RecordBuilder {
    pub fn new(
        record_id: u64,
        command_buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
        usage_flags: vk::CommandBufferUsageFlags,
    ) -> Self {
        Self {
            record: CommandRecord::new(record_id, command_buffer, level, usage_flags),
            stack: vec![SectionId::ROOT],
            orphaned_label_ends: Vec::new(),
            graphics: BindingTracker::new(),
            compute: BindingTracker::new(),
            ray_tracing: BindingTracker::new(),
            pending_capture: None,
        }
    }

    pub fn record(&self) -> &CommandRecord {
        &self.record
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.record.arena
    }

    pub fn used_mut(&mut self) -> &mut UsedHandles {
        self.record.used.get_mut()
    }

    pub fn command_mut(&mut self, id: CommandId) -> &mut Command {
        &mut self.record.commands[id.index()].command
    }

    /// Id the next added command will get.
    pub fn next_id(&self) -> CommandId {
        CommandId(self.record.commands.len() as u32)
    }

    pub fn top(&self) -> SectionId {
        *self.stack.last().unwrap_or(&SectionId::ROOT)
    }

    pub fn top_kind(&self) -> SectionKind {
        self.record.sections[self.top().index()].kind
    }

    /// Depth of the open section stack, excluding the root.
    pub fn open_sections(&self) -> usize {
        self.stack.len() - 1
    }

    /// Render pass and framebuffer of the innermost open render pass.
    pub fn active_render_pass(&self) -> Option<(Arc<RenderPass>, Arc<Framebuffer>)> {
        self.stack.iter().rev().find_map(|sid| {
            let section = &self.record.sections[sid.index()];
            if section.kind != SectionKind::RenderPass {
                return None;
            }
            match section.begin.map(|b| &self.record.commands[b.index()].command) {
                Some(Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    ..
                }) => Some((Arc::clone(render_pass), Arc::clone(framebuffer))),
                _ => None,
            }
        })
    }

    pub fn request_local_capture(&mut self, request: LocalCaptureRequest) {
        self.pending_capture = Some(request);
    }

    /// Pending capture request, cleared by taking it.
    pub fn take_capture(&mut self) -> Option<LocalCaptureRequest> {
        self.pending_capture.take()
    }

    pub fn mark_broken_labels(&mut self) {
        if !self.record.broken_labels {
            debug!(record = self.record.record_id, "debug label hierarchy broken");
        }
        self.record.broken_labels = true;
    }

    pub fn note_secondary(&mut self, record: Arc<CommandRecord>) {
        self.record.secondaries.push(record);
    }

    pub fn note_accel_build(
        &mut self,
        dst: vk::AccelerationStructureKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) {
        self.record.accel_build_flags.insert(dst.as_raw(), flags);
    }

    // ── Tree construction ───────────────────────────────────

    fn push_node(&mut self, command: Command, section: SectionId) -> CommandId {
        let id = self.next_id();
        let category = command.category();
        self.record.commands.push(CommandNode { command, section });

        let mut cur = Some(section);
        while let Some(sid) = cur {
            let s = &mut self.record.sections[sid.index()];
            s.stats.count(category);
            cur = s.parent;
        }
        id
    }

    fn open_section(&mut self, kind: SectionKind, begin: Option<CommandId>) -> SectionId {
        let parent = self.top();
        let id = SectionId(self.record.sections.len() as u32);
        self.record.sections.push(Section::new(kind, begin, Some(parent)));
        self.record.sections[parent.index()]
            .children
            .push(Child::Section(id));
        self.stack.push(id);
        id
    }

    fn pop_section(&mut self, end: SectionEnd) {
        if self.stack.len() <= 1 {
            structural_violation("section close without open section", SectionKind::Root);
            return;
        }
        if let Some(id) = self.stack.pop() {
            self.record.sections[id.index()].end = end;
        }
        // A label whose end was recorded further in closes as soon as it is
        // the innermost section again.
        while let Some(pos) = self.orphaned_label_ends.iter().position(|s| *s == self.top()) {
            self.orphaned_label_ends.swap_remove(pos);
            if let Some(id) = self.stack.pop() {
                self.record.sections[id.index()].end = SectionEnd::Synthesized;
            }
        }
    }

    fn append_child(&mut self, command: Command) -> CommandId {
        let top = self.top();
        let id = self.push_node(command, top);
        self.record.sections[top.index()]
            .children
            .push(Child::Command(id));
        id
    }

    /// Close label sections sitting above the innermost section of kind
    /// `until`. Labels may not straddle render pass boundaries, so these are
    /// recovered rather than treated as fatal.
    fn unwind_labels_until(&mut self, until: SectionKind) {
        while self.top_kind() == SectionKind::DebugLabel && until != SectionKind::DebugLabel {
            warn!(
                record = self.record.record_id,
                "closing debug label left open inside {:?}", until
            );
            self.mark_broken_labels();
            self.pop_section(SectionEnd::Synthesized);
        }
    }

    fn close_expected(&mut self, kind: SectionKind, id: CommandId) {
        if self.top_kind() == kind {
            self.pop_section(SectionEnd::Command(id));
        } else {
            structural_violation("mismatched section close", self.top_kind());
        }
    }

    /// Add a command, opening or closing sections as its kind requires.
    pub fn add(&mut self, command: Command) -> CommandId {
        match command.kind() {
            CommandKind::BeginRenderPass => {
                let top = self.top();
                let id = self.push_node(command, top);
                self.open_section(SectionKind::RenderPass, Some(id));
                self.open_section(SectionKind::Subpass, None);
                id
            }
            CommandKind::NextSubpass => {
                self.unwind_labels_until(SectionKind::Subpass);
                if self.top_kind() != SectionKind::Subpass {
                    structural_violation("next subpass outside render pass", self.top_kind());
                    return self.append_child(command);
                }
                self.pop_section(SectionEnd::Synthesized);
                let rp = self.top();
                let id = self.push_node(command, rp);
                // The subpass that just ended is closed by this command.
                if let Some(Child::Section(prev)) = self.record.sections[rp.index()].children.last() {
                    let prev = *prev;
                    self.record.sections[prev.index()].end = SectionEnd::Command(id);
                }
                self.open_section(SectionKind::Subpass, Some(id));
                id
            }
            CommandKind::EndRenderPass => {
                self.unwind_labels_until(SectionKind::Subpass);
                if self.top_kind() != SectionKind::Subpass {
                    structural_violation("end render pass outside render pass", self.top_kind());
                    return self.append_child(command);
                }
                let subpass = self.top();
                self.stack.pop();
                let id = self.append_child(command);
                self.record.sections[subpass.index()].end = SectionEnd::Command(id);
                self.close_expected(SectionKind::RenderPass, id);
                id
            }
            CommandKind::BeginRendering => {
                let top = self.top();
                let id = self.push_node(command, top);
                self.open_section(SectionKind::DynamicRendering, Some(id));
                id
            }
            CommandKind::EndRendering => {
                self.unwind_labels_until(SectionKind::DynamicRendering);
                let id = self.append_child(command);
                self.close_expected(SectionKind::DynamicRendering, id);
                id
            }
            CommandKind::BeginConditionalRendering => {
                let top = self.top();
                let id = self.push_node(command, top);
                self.open_section(SectionKind::ConditionalRendering, Some(id));
                id
            }
            CommandKind::EndConditionalRendering => {
                self.unwind_labels_until(SectionKind::ConditionalRendering);
                let id = self.append_child(command);
                self.close_expected(SectionKind::ConditionalRendering, id);
                id
            }
            CommandKind::BeginDebugLabel => {
                let top = self.top();
                let id = self.push_node(command, top);
                self.open_section(SectionKind::DebugLabel, Some(id));
                id
            }
            CommandKind::EndDebugLabel => self.end_debug_label(command),
            _ => self.append_child(command),
        }
    }

    fn end_debug_label(&mut self, command: Command) -> CommandId {
        let id = self.append_child(command);
        if self.top_kind() == SectionKind::DebugLabel {
            self.pop_section(SectionEnd::Command(id));
            return id;
        }

        self.mark_broken_labels();
        // Nearest label below the top that is not already waiting to close.
        let orphan = self.stack.iter().rev().copied().find(|sid| {
            self.record.sections[sid.index()].kind == SectionKind::DebugLabel
                && !self.orphaned_label_ends.contains(sid)
        });
        match orphan {
            Some(sid) => {
                debug!(
                    record = self.record.record_id,
                    "debug label ended inside nested {:?}, deferring close",
                    self.top_kind()
                );
                self.orphaned_label_ends.push(sid);
            }
            None => {
                // Label begun in a previously executed command buffer.
                debug!(record = self.record.record_id, "debug label end without begin");
            }
        }
        id
    }

    /// Freeze the record. Debug labels still open are popped into the
    /// record's pushed-label table; any other open section is a contract
    /// violation and gets closed so the tree stays well-formed.
    pub fn finish(mut self) -> CommandRecord {
        let mut pushed = Vec::new();
        while self.stack.len() > 1 {
            let top = self.top();
            let section = &self.record.sections[top.index()];
            match section.kind {
                SectionKind::DebugLabel => {
                    if let Some(Command::BeginDebugLabel { name, .. }) =
                        section.begin.map(|b| &self.record.commands[b.index()].command)
                    {
                        pushed.push(*name);
                    }
                    self.mark_broken_labels();
                }
                kind => structural_violation("section still open at end of recording", kind),
            }
            self.stack.pop();
            self.record.sections[top.index()].end = SectionEnd::Synthesized;
        }
        pushed.reverse();
        self.record.pushed_labels = pushed;
        self.record
    }
}
