/// Size of one on-disk record in bytes
pub const RECORD_SIZE: usize = 16;

/// Sentinel stored in every record, used to detect corruption
pub const RECORD_MAGIC: u64 = 0b101;

const KIND_MASK: u64 = 0b11;
const MORE_BIT: u64 = 1 << 2;
const MAGIC_SHIFT: u32 = 3;
const MAGIC_MASK: u64 = 0b111;
const DEPTH_SHIFT: u32 = 6;
const DEPTH_MASK: u64 = (1 << 10) - 1;
const ADDR_SHIFT: u32 = 16;
const ADDR_MASK: u64 = (1 << 48) - 1;

const KERNEL_ADDR_BIT: u64 = 1 << 47;
const KERNEL_ADDR_HIGH: u64 = !ADDR_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Entry,
    Exit,
    Lost,
}

/// One Entry/Exit/Lost event of a traced thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub time: u64,
    pub kind: RecordKind,
    pub addr: u64,
    pub depth: i32,
    pub more: bool,
}

/// Why a raw record could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    BadMagic(u64),
    BadKind(u64),
}

impl Record {
    pub fn new(time: u64, kind: RecordKind, addr: u64, depth: i32) -> Self {
        Record {
            time,
            kind,
            addr,
            depth,
            more: false,
        }
    }

    pub fn entry(time: u64, addr: u64, depth: i32) -> Self {
        Self::new(time, RecordKind::Entry, addr, depth)
    }

    pub fn exit(time: u64, addr: u64, depth: i32) -> Self {
        Self::new(time, RecordKind::Exit, addr, depth)
    }

    pub fn lost(time: u64, count: u64, depth: i32) -> Self {
        Self::new(time, RecordKind::Lost, count, depth)
    }

    /// Decode a record from its 16-byte little-endian representation
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Result<Self, DecodeError> {
        let mut time = [0u8; 8];
        let mut bits = [0u8; 8];
        time.copy_from_slice(&buf[..8]);
        bits.copy_from_slice(&buf[8..]);

        let time = u64::from_le_bytes(time);
        let bits = u64::from_le_bytes(bits);

        let magic = (bits >> MAGIC_SHIFT) & MAGIC_MASK;
        if magic != RECORD_MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }

        let kind = match bits & KIND_MASK {
            0 => RecordKind::Entry,
            1 => RecordKind::Exit,
            2 => RecordKind::Lost,
            other => return Err(DecodeError::BadKind(other)),
        };

        Ok(Record {
            time,
            kind,
            addr: (bits >> ADDR_SHIFT) & ADDR_MASK,
            depth: ((bits >> DEPTH_SHIFT) & DEPTH_MASK) as i32,
            more: bits & MORE_BIT != 0,
        })
    }

    /// Encode into the on-disk representation (used when writing test data)
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let kind = match self.kind {
            RecordKind::Entry => 0,
            RecordKind::Exit => 1,
            RecordKind::Lost => 2,
        };
        let mut bits = kind | (RECORD_MAGIC << MAGIC_SHIFT);
        if self.more {
            bits |= MORE_BIT;
        }
        bits |= (self.depth.max(0) as u64 & DEPTH_MASK) << DEPTH_SHIFT;
        bits |= (self.addr & ADDR_MASK) << ADDR_SHIFT;

        let mut buf = [0u8; RECORD_SIZE];
        buf[..8].copy_from_slice(&self.time.to_le_bytes());
        buf[8..].copy_from_slice(&bits.to_le_bytes());
        buf
    }
}

/// Kernel addresses are stored truncated to 48 bits with bit 47 set
pub fn is_kernel_address(addr: u64) -> bool {
    addr & KERNEL_ADDR_BIT != 0 && addr & KERNEL_ADDR_HIGH == 0
}

/// Restore the sign-extended form of a truncated kernel address
pub fn real_address(addr: u64) -> u64 {
    if is_kernel_address(addr) {
        addr | KERNEL_ADDR_HIGH
    } else {
        addr
    }
}
