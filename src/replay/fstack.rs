//! Stack reconstruction: frame timing and depth counters of a task.

use super::task::{Frame, FrameFlags, Origin, TaskState};
use super::{Replay, SetjmpPoint};
use crate::data::{KernelRecord, Record, RecordKind};

impl TaskState {
    /// Account a consumed record from the task's own file
    pub(super) fn apply_user(&mut self, record: Record, default_depth: i32) {
        if !self.display_depth_set {
            // inherit the depth after fork() or a lost record
            let depth = record.depth + i32::from(record.kind == RecordKind::Exit);
            self.derive_depth(depth, depth, default_depth);
            self.user_display_depth = depth;
            self.user_stack_count = depth;
        }

        if self.origin == Origin::Kernel {
            // kernel records may have been broken, trust the user counters
            self.display_depth = self.user_display_depth;
            self.stack_count = self.user_stack_count;
            self.filter.depth = default_depth - self.stack_count;
        }

        match record.kind {
            RecordKind::Entry => self.open_frame(record.addr, record.time),
            RecordKind::Exit => {
                self.close_frame(|frame| record.time.saturating_sub(frame.start_time), None)
            }
            RecordKind::Lost => self.lose_frames(record.depth),
        }

        match record.kind {
            RecordKind::Entry => {
                self.stack_count += 1;
                self.user_stack_count += 1;
            }
            RecordKind::Exit => {
                self.stack_count = (self.stack_count - 1).max(0);
                self.user_stack_count = (self.user_stack_count - 1).max(0);
            }
            RecordKind::Lost => {}
        }

        self.rstack = record;
        self.origin = Origin::User;
    }

    /// Account a consumed kernel record; `record` is its converted form
    pub(super) fn apply_kernel(&mut self, record: Record, krec: &KernelRecord, default_depth: i32) {
        if !self.display_depth_set {
            // kernel functions may start at a non-zero depth
            let exit = i32::from(record.kind == RecordKind::Exit);
            self.derive_depth(
                self.user_display_depth + krec.depth + exit,
                self.user_stack_count + krec.depth + exit,
                default_depth,
            );
        }

        match record.kind {
            RecordKind::Entry => self.open_frame(krec.child_addr, krec.start_time),
            RecordKind::Exit => self.close_frame(
                |_| krec.end_time.saturating_sub(krec.start_time),
                Some(krec.child_addr),
            ),
            RecordKind::Lost => self.lose_frames(self.user_stack_count + krec.depth),
        }

        match record.kind {
            RecordKind::Entry => self.stack_count += 1,
            RecordKind::Exit => self.stack_count = (self.stack_count - 1).max(0),
            RecordKind::Lost => {}
        }

        self.rstack = record;
        self.origin = Origin::Kernel;
    }

    fn derive_depth(&mut self, display_depth: i32, stack_count: i32, default_depth: i32) {
        self.display_depth = display_depth;
        self.stack_count = stack_count;
        self.filter.depth = default_depth - stack_count;
        self.display_depth_set = true;

        // the callers of the first record were never seen
        if !self.started {
            self.invalidate_frames(0, stack_count);
            self.started = true;
        }
    }

    fn open_frame(&mut self, addr: u64, time: u64) {
        self.lost_seen = false;

        let idx = self.stack_count;
        if let Some(frame) = self.frame_mut(idx) {
            frame.addr = addr;
            frame.start_time = time;
            frame.self_time = 0;
            frame.child_time = 0;
            frame.valid = true;
        }
    }

    /// Finish the innermost frame; an invalid frame gets zero duration and,
    /// when known, the address of the call that returned
    fn close_frame(&mut self, elapsed: impl FnOnce(&Frame) -> u64, addr: Option<u64>) {
        self.lost_seen = false;

        let idx = (self.stack_count - 1).max(0);
        let Some(frame) = self.frame_mut(idx) else {
            return;
        };

        let delta = if frame.valid {
            elapsed(&*frame)
        } else {
            if let Some(addr) = addr {
                frame.addr = addr;
            }
            0
        };

        frame.valid = false;
        frame.self_time = delta;
        frame.child_time = frame.child_time.min(delta);

        if self.stack_count > 1
            && let Some(parent) = self.frame_mut(idx - 1)
        {
            parent.child_time = parent.child_time.saturating_add(delta);
        }
    }

    fn lose_frames(&mut self, depth: i32) {
        self.invalidate_frames(depth, self.stack_count + 1);
        self.lost_seen = true;
        self.display_depth_set = false;
    }
}

impl<'s> Replay<'s> {
    /// Update the display depth of a task after an accepted entry or the
    /// exit of a shown call. `flags` are the frame flags set by the filter
    /// engine on entry. Returns the new display depth.
    pub fn update(&mut self, kind: RecordKind, idx: usize, flags: FrameFlags) -> i32 {
        let setjmp = self.setjmp;
        let task = &mut self.tasks[idx];

        match kind {
            RecordKind::Entry if flags.contains(FrameFlags::EXEC) => {
                // new address space, old frames are unreachable
                task.display_depth = 0;
                task.stack_count = 0;
                task.user_display_depth = 0;
                task.user_stack_count = 0;
            }
            RecordKind::Entry if flags.contains(FrameFlags::LONGJMP) => match setjmp {
                Some(SetjmpPoint {
                    display_depth,
                    stack_count,
                }) => {
                    // frames above the setjmp caller are gone and never exit
                    let from = usize::try_from(stack_count).unwrap_or(0);
                    let to = usize::try_from(task.stack_count).unwrap_or(0);
                    for frame in task.frames.iter_mut().take(to).skip(from) {
                        frame.flags = FrameFlags::empty();
                    }

                    task.display_depth = display_depth;
                    task.stack_count = stack_count;
                    task.user_display_depth = display_depth;
                    task.user_stack_count = stack_count;
                }
                None => log::debug!("task {}: longjmp without setjmp", task.tid),
            },
            RecordKind::Entry => {
                task.display_depth += 1;
                if task.origin == Origin::User {
                    task.user_display_depth += 1;
                }
            }
            RecordKind::Exit => {
                task.display_depth = (task.display_depth - 1).max(0);
                if task.origin == Origin::User {
                    task.user_display_depth = (task.user_display_depth - 1).max(0);
                }
            }
            RecordKind::Lost => {}
        }

        task.display_depth
    }
}
