use crate::data::{Record, RecordKind, TaskReader};
use std::collections::VecDeque;

/// Flags attached to a frame by the filter engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Matched an include filter
    pub const FILTERED: FrameFlags = FrameFlags(1 << 0);
    /// Matched an exclude filter
    pub const NOTRACE: FrameFlags = FrameFlags(1 << 1);
    /// Rejected, must not be shown even when tracing is turned on again
    pub const NORECORD: FrameFlags = FrameFlags(1 << 2);
    pub const EXEC: FrameFlags = FrameFlags(1 << 3);
    pub const LONGJMP: FrameFlags = FrameFlags(1 << 4);
    /// Accepted by the filter engine, the call is shown
    pub const RECORDED: FrameFlags = FrameFlags(1 << 5);

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: FrameFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FrameFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Bookkeeping for one open call
#[derive(Debug, Clone, Copy, Default)]
pub struct Frame {
    pub addr: u64,
    pub start_time: u64,
    /// Elapsed time of the call once it returned
    pub self_time: u64,
    pub child_time: u64,
    /// False when the entry was lost or synthesized
    pub valid: bool,
    /// Filter depth budget to restore on exit
    pub saved_depth: i32,
    pub flags: FrameFlags,
}

/// Where the task's current record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    User,
    Kernel,
}

/// Per-task filter counters
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterState {
    pub in_count: i32,
    pub out_count: i32,
    /// Remaining depth budget
    pub depth: i32,
}

/// Replay state of one traced thread
pub struct TaskState {
    pub tid: u32,
    pub(super) reader: Option<TaskReader>,
    /// No more user records will come from this task's file
    pub done: bool,
    /// Records fetched from the file and not yet consumed; holds at most one
    /// record unless the time filter is buffering entries
    pub(super) pending: VecDeque<Record>,

    /// Most recently consumed record
    pub rstack: Record,
    /// Source of the most recent record, user or kernel
    pub origin: Origin,

    pub frames: Vec<Frame>,
    pub stack_count: i32,
    pub user_stack_count: i32,
    pub display_depth: i32,
    pub user_display_depth: i32,
    pub(super) display_depth_set: bool,
    pub(super) lost_seen: bool,
    /// A record of this task has been replayed
    pub(super) started: bool,
    pub filter: FilterState,
}

impl TaskState {
    pub fn new(tid: u32, reader: Option<TaskReader>, max_stack: usize, depth: i32) -> Self {
        let done = reader.is_none();
        let frame = Frame {
            saved_depth: depth,
            ..Default::default()
        };

        TaskState {
            tid,
            reader,
            done,
            pending: VecDeque::new(),
            rstack: Record::new(0, RecordKind::Lost, 0, 0),
            origin: Origin::User,
            frames: vec![frame; max_stack.max(1)],
            stack_count: 0,
            user_stack_count: 0,
            display_depth: 0,
            user_display_depth: 0,
            display_depth_set: false,
            lost_seen: false,
            started: false,
            filter: FilterState {
                depth,
                ..Default::default()
            },
        }
    }

    /// Stop replaying this task and release its file
    pub fn finish(&mut self) {
        self.done = true;
        self.reader = None;
    }

    /// Events were lost since the last regular record
    pub fn lost_seen(&self) -> bool {
        self.lost_seen
    }

    /// Frame of the innermost open call
    pub fn top_frame(&self) -> Option<&Frame> {
        let idx = usize::try_from(self.stack_count - 1).ok()?;
        self.frames.get(idx)
    }

    pub fn top_frame_mut(&mut self) -> Option<&mut Frame> {
        let idx = usize::try_from(self.stack_count - 1).ok()?;
        self.frames.get_mut(idx)
    }

    /// Frame of the call that just returned
    pub fn exited_frame(&self) -> Option<&Frame> {
        self.frames.get(usize::try_from(self.stack_count).ok()?)
    }

    pub fn exited_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.get_mut(usize::try_from(self.stack_count).ok()?)
    }

    pub fn frame_mut(&mut self, idx: i32) -> Option<&mut Frame> {
        self.frames.get_mut(usize::try_from(idx).ok()?)
    }

    /// Addresses of all open calls, outermost first
    pub fn call_chain(&self) -> Vec<u64> {
        let len = usize::try_from(self.stack_count)
            .unwrap_or(0)
            .min(self.frames.len());
        self.frames[..len].iter().map(|f| f.addr).collect()
    }

    /// Invalidate frames in `[from, to)`
    pub(super) fn invalidate_frames(&mut self, from: i32, to: i32) {
        let from = usize::try_from(from).unwrap_or(0);
        let to = usize::try_from(to).unwrap_or(0).min(self.frames.len());

        for frame in self.frames.iter_mut().take(to).skip(from) {
            frame.valid = false;
            frame.self_time = 0;
        }
    }
}
