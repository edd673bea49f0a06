//! Replay of recorded per-thread streams.
//!
//! [`Replay`] owns every [`TaskState`] and the kernel source. Records are
//! pulled in global time order through [`Replay::peek`] / [`Replay::read`];
//! reading a record updates the owning task's call stack, and the filter
//! engine (`entry`, `exit`, `skip`) decides which calls are shown.

mod filter;
mod fstack;
mod mux;
mod task;

pub use filter::FilterAction;
pub use mux::Head;
pub use task::{FilterState, Frame, FrameFlags, Origin, TaskState};

use crate::data::{KernelSource, TaskReader};
use crate::session::SessionTable;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_DEPTH: i32 = 1024;
pub const DEFAULT_MAX_STACK: usize = 1024;

/// Knobs of one replay run
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Default filter depth budget
    pub depth: i32,
    /// Size of each task's frame array
    pub max_stack: usize,
    /// Minimum call duration in nanoseconds, 0 disables the time filter
    pub time_filter: u64,
    /// Records may carry argument / return value payloads
    pub args_enabled: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        ReplayOptions {
            depth: DEFAULT_DEPTH,
            max_stack: DEFAULT_MAX_STACK,
            time_filter: 0,
            args_enabled: false,
        }
    }
}

/// Shared flag set when the operator asks to stop
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Depth remembered at a setjmp call, restored by longjmp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SetjmpPoint {
    display_depth: i32,
    stack_count: i32,
}

pub struct Replay<'s> {
    sessions: &'s SessionTable,
    opts: ReplayOptions,
    tasks: Vec<TaskState>,
    kernel: Option<Box<dyn KernelSource>>,
    /// "no more kernel data" has been reported
    kernel_warned: bool,
    /// Global trace on/off toggle driven by triggers
    fstack_enabled: bool,
    setjmp: Option<SetjmpPoint>,
    last_time: u64,
    /// First corrupt record seen (tid, offset)
    corrupt: Option<(u32, u64)>,
    stop: StopFlag,
}

impl<'s> Replay<'s> {
    pub fn new(sessions: &'s SessionTable, opts: ReplayOptions) -> Self {
        Replay {
            sessions,
            opts,
            tasks: Vec::new(),
            kernel: None,
            kernel_warned: false,
            fstack_enabled: true,
            setjmp: None,
            last_time: 0,
            corrupt: None,
            stop: StopFlag::new(),
        }
    }

    pub fn with_kernel(mut self, kernel: Box<dyn KernelSource>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn with_stop(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Register a traced thread; a missing reader marks it done
    pub fn add_task(&mut self, tid: u32, reader: Option<TaskReader>) -> usize {
        self.tasks
            .push(TaskState::new(tid, reader, self.opts.max_stack, self.opts.depth));
        self.tasks.len() - 1
    }

    pub fn sessions(&self) -> &'s SessionTable {
        self.sessions
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.opts
    }

    pub fn tasks(&self) -> &[TaskState] {
        &self.tasks
    }

    pub fn task(&self, idx: usize) -> &TaskState {
        &self.tasks[idx]
    }

    pub fn task_index(&self, tid: u32) -> Option<usize> {
        self.tasks.iter().position(|t| t.tid == tid)
    }

    pub fn fstack_enabled(&self) -> bool {
        self.fstack_enabled
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Task id and file offset of the first corrupt record, if any
    pub fn corrupt_record(&self) -> Option<(u32, u64)> {
        self.corrupt
    }
}
