use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Corrupt record in task {tid} at offset {offset}")]
    CorruptRecord { tid: u32, offset: u64 },

    #[error("Inverted time in task {tid}: {time} after {prev} (addr {addr:#x}), broken data?")]
    TimeInversion {
        tid: u32,
        prev: u64,
        time: u64,
        addr: u64,
    },

    #[error("Cannot find session for task {tid} at time {time}")]
    MissingSession { tid: u32, time: u64 },

    #[error("Cannot find task for kernel record (tid {tid})")]
    MissingTask { tid: u32 },

    #[error("Invalid data: more bit set without argument feature (task {tid}, time {time}, addr {addr:#x})")]
    UnexpectedMoreFlag { tid: u32, time: u64, addr: u64 },

    #[error("No argument spec for task {tid} at addr {addr:#x}")]
    MissingArgSpec { tid: u32, addr: u64 },

    #[error("Invalid data file {path}: {reason}")]
    InvalidData { path: String, reason: String },

    #[error("Symbol loading failed: {0}")]
    SymbolLoad(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const INVALID_DATA: i32 = 3;
    pub const MISSING_SESSION: i32 = 4;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::CorruptRecord { .. }
            | Error::TimeInversion { .. }
            | Error::UnexpectedMoreFlag { .. }
            | Error::MissingArgSpec { .. }
            | Error::InvalidData { .. } => exit_code::INVALID_DATA,
            Error::MissingSession { .. } | Error::MissingTask { .. } => {
                exit_code::MISSING_SESSION
            }
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
