//! Kernel-side record stream.
//!
//! Decoding of the kernel trace buffers lives outside this crate; the
//! replay engine only sees already-decoded [`KernelRecord`]s through the
//! [`KernelSource`] trait.

use crate::error::Result;
use std::collections::VecDeque;

/// One decoded kernel function record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRecord {
    pub tid: u32,
    pub start_time: u64,
    /// Zero while the call is still open (an entry record)
    pub end_time: u64,
    pub child_addr: u64,
    pub depth: i32,
    /// Number of events the kernel dropped before this record
    pub missed: u64,
}

impl KernelRecord {
    /// Timestamp used to order this record against user records
    pub fn time(&self) -> u64 {
        if self.end_time != 0 {
            self.end_time
        } else {
            self.start_time
        }
    }

    pub fn is_exit(&self) -> bool {
        self.end_time != 0
    }
}

/// Source of kernel records, oldest first
pub trait KernelSource {
    /// Current head record without consuming it
    fn peek(&mut self) -> Result<Option<KernelRecord>>;

    /// Consume the head record
    fn consume(&mut self);

    /// Clear the missed-event count of the head record once the
    /// corresponding lost marker has been replayed
    fn clear_missed(&mut self);
}

/// Kernel source over pre-decoded records
#[derive(Debug, Default)]
pub struct BufferedKernel {
    records: VecDeque<KernelRecord>,
}

impl BufferedKernel {
    pub fn new(records: impl IntoIterator<Item = KernelRecord>) -> Self {
        BufferedKernel {
            records: records.into_iter().collect(),
        }
    }
}

impl KernelSource for BufferedKernel {
    fn peek(&mut self) -> Result<Option<KernelRecord>> {
        Ok(self.records.front().copied())
    }

    fn consume(&mut self) {
        self.records.pop_front();
    }

    fn clear_missed(&mut self) {
        if let Some(head) = self.records.front_mut() {
            head.missed = 0;
        }
    }
}
