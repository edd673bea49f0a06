//! Filter and trigger evaluation for each call, plus lookahead skipping of
//! filtered subtrees.

use super::task::FrameFlags;
use super::{Replay, SetjmpPoint};
use crate::data::{RecordKind, is_kernel_address, real_address};
use crate::error::Result;
use crate::session::{FilterMode, FixupKind, TriggerResult};

/// Outcome of evaluating a call entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Accept,
    Reject,
}

impl<'s> Replay<'s> {
    /// Evaluate the rules for the entry just read by task `idx`.
    ///
    /// Must be called after the entry record was consumed with
    /// [`Replay::read`]. Rejected calls keep their stack bookkeeping; only
    /// presentation is suppressed.
    pub fn entry(&mut self, idx: usize) -> (FilterAction, TriggerResult) {
        let mut tr = TriggerResult::default();
        let sessions = self.sessions;
        let default_depth = self.opts.depth;
        let mut enabled = self.fstack_enabled;
        let mut setjmp = None;

        let task = &mut self.tasks[idx];
        let record = task.rstack;
        let top = task.stack_count - 1;

        log::trace!(
            "entry: [{}] stack: {}, depth: {}, I: {}, O: {}, D: {}",
            task.tid,
            top,
            record.depth,
            task.filter.in_count,
            task.filter.out_count,
            task.filter.depth
        );

        // calls deeper than the frame array are never shown
        if task.frame_mut(top).is_none() {
            return (FilterAction::Reject, tr);
        }

        let saved_depth = task.filter.depth;
        let mut flags = FrameFlags::empty();

        let action = 'decide: {
            if task.filter.out_count > 0 {
                flags.insert(FrameFlags::NORECORD);
                break 'decide FilterAction::Reject;
            }

            let addr = real_address(record.addr);

            if let Some(sess) = sessions.find_session(task.tid, record.time) {
                if sess.fixups.match_addr(addr, &mut tr).is_some() {
                    match tr.fixup {
                        Some(FixupKind::Exec) => flags.insert(FrameFlags::EXEC),
                        Some(FixupKind::Setjmp) => {
                            setjmp = Some(SetjmpPoint {
                                display_depth: task.display_depth + 1,
                                stack_count: task.stack_count,
                            })
                        }
                        Some(FixupKind::Longjmp) => flags.insert(FrameFlags::LONGJMP),
                        None => {}
                    }
                }
                sess.filters.match_addr(addr, &mut tr);
            }

            match tr.filter {
                Some(FilterMode::In) => {
                    task.filter.in_count += 1;
                    flags.insert(FrameFlags::FILTERED);
                    task.filter.depth = default_depth;
                }
                Some(_) => {
                    task.filter.out_count += 1;
                    flags.insert(FrameFlags::NOTRACE | FrameFlags::NORECORD);
                    break 'decide FilterAction::Reject;
                }
                None => {
                    if sessions.filter_mode() == FilterMode::In && task.filter.in_count == 0 {
                        flags.insert(FrameFlags::NORECORD);
                        break 'decide FilterAction::Reject;
                    }
                }
            }

            if let Some(depth) = tr.depth {
                task.filter.depth = depth;
            }
            if tr.trace_on {
                enabled = true;
            }
            if tr.trace_off {
                enabled = false;
            }

            // no NORECORD, so the call can still show up once tracing is back on
            if !enabled {
                break 'decide FilterAction::Reject;
            }

            if task.filter.depth <= 0 {
                flags.insert(FrameFlags::NORECORD);
                break 'decide FilterAction::Reject;
            }

            task.filter.depth -= 1;
            flags.insert(FrameFlags::RECORDED);
            FilterAction::Accept
        };

        if let Some(frame) = task.frame_mut(top) {
            frame.saved_depth = saved_depth;
            frame.flags = flags;
        }

        self.fstack_enabled = enabled;
        if setjmp.is_some() {
            self.setjmp = setjmp;
        }

        (action, tr)
    }

    /// Undo the filter state of the call whose exit task `idx` just read
    pub fn exit(&mut self, idx: usize) {
        let task = &mut self.tasks[idx];
        let Some(frame) = task.exited_frame_mut() else {
            return;
        };

        let flags = frame.flags;
        let saved_depth = frame.saved_depth;
        frame.flags = FrameFlags::empty();

        log::trace!(
            "exit : [{}] stack: {}, I: {}, O: {}, D: {}",
            task.tid,
            task.stack_count,
            task.filter.in_count,
            task.filter.out_count,
            saved_depth
        );

        if flags.contains(FrameFlags::FILTERED) {
            task.filter.in_count = (task.filter.in_count - 1).max(0);
        } else if flags.contains(FrameFlags::NOTRACE) {
            task.filter.out_count = (task.filter.out_count - 1).max(0);
        }
        task.filter.depth = saved_depth;
    }

    /// Consume the records of task `idx` that would be filtered out anyway,
    /// right after it entered a call at `curr_depth`.
    ///
    /// Stops at the first record that would be shown, at the exit closing
    /// the call, or at a record of another task; returns the task holding
    /// the next record. Returns `None` when there is nothing left to read
    /// or tracing was turned off by a skipped call.
    pub fn skip(&mut self, idx: usize, curr_depth: i32) -> Result<Option<usize>> {
        let task = &self.tasks[idx];
        let origin = task.origin;

        if task
            .top_frame()
            .is_some_and(|f| f.flags.intersects(FrameFlags::EXEC | FrameFlags::LONGJMP))
        {
            return Ok(None);
        }

        let Some(mut next) = self.peek()? else {
            return Ok(None);
        };

        // a record from the other context continues the same call chain
        while next.task == idx && (next.origin != origin || next.record.depth > curr_depth) {
            match next.record.kind {
                RecordKind::Entry => {
                    if !self.can_skip(idx, next.record.time, next.record.addr) {
                        break;
                    }
                }
                RecordKind::Exit => {
                    let shown = self.tasks[idx]
                        .top_frame()
                        .is_some_and(|f| f.flags.contains(FrameFlags::RECORDED));
                    if shown {
                        break;
                    }
                }
                RecordKind::Lost => return Ok(None),
            }

            self.read()?;
            match next.record.kind {
                RecordKind::Entry => {
                    self.entry(idx);
                }
                _ => self.exit(idx),
            }

            if !self.fstack_enabled {
                return Ok(None);
            }

            match self.peek()? {
                Some(head) => next = head,
                None => return Ok(None),
            }
        }

        Ok(Some(next.task))
    }

    /// Whether an entry of task `idx` at `addr` would certainly be rejected
    fn can_skip(&self, idx: usize, time: u64, addr: u64) -> bool {
        let task = &self.tasks[idx];
        if task.filter.out_count > 0 {
            return true;
        }

        let session = match self.sessions.find_session(task.tid, time) {
            Some(sess) => sess,
            None if is_kernel_address(addr) => match self.sessions.first_session() {
                Some(sess) => sess,
                None => return true,
            },
            None => return true,
        };

        let mut tr = TriggerResult::default();
        session.filters.match_addr(real_address(addr), &mut tr);

        let mut depth = task.filter.depth;
        match tr.filter {
            Some(FilterMode::In) => depth = self.opts.depth,
            Some(_) => return true,
            None => {
                if self.sessions.filter_mode() == FilterMode::In && task.filter.in_count == 0 {
                    return true;
                }
            }
        }

        // these triggers change the state, let the caller see them
        if tr.depth.is_some() || tr.trace_on {
            return false;
        }

        tr.trace_off || depth <= 0
    }
}
