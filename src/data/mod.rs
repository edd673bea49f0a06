//! Recorded trace data: the record codec, per-thread readers, the kernel
//! source and the data directory layout.

mod dir;
mod kernel;
mod reader;
mod record;

pub use dir::{DataDir, DataInfo, Features, INFO_FILE, TASK_FILE, TaskLine};
pub use kernel::{BufferedKernel, KernelRecord, KernelSource};
pub use reader::TaskReader;
pub use record::{
    DecodeError, RECORD_MAGIC, RECORD_SIZE, Record, RecordKind, is_kernel_address, real_address,
};
