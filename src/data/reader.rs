use super::record::{RECORD_SIZE, Record};
use crate::error::{Error, Result};
use crate::session::{ArgFormat, ArgSpec};
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::Path;

/// Sequential reader of one thread's record file
pub struct TaskReader {
    tid: u32,
    inner: Box<dyn Read>,
    offset: u64,
}

impl TaskReader {
    /// Map a `<tid>.dat` file for reading
    pub fn open(path: &Path, tid: u32) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;

        Ok(Self::new(tid, Box::new(Cursor::new(mmap))))
    }

    pub fn new(tid: u32, inner: Box<dyn Read>) -> Self {
        TaskReader {
            tid,
            inner,
            offset: 0,
        }
    }

    /// Reader over an in-memory byte buffer
    pub fn from_bytes(tid: u32, data: Vec<u8>) -> Self {
        Self::new(tid, Box::new(Cursor::new(data)))
    }

    /// Read the next record; `None` at a clean end of file
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        let mut buf = [0u8; RECORD_SIZE];
        let mut filled = 0;

        while filled < RECORD_SIZE {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < RECORD_SIZE {
            return Err(self.corrupt());
        }

        let record = Record::decode(&buf).map_err(|_| self.corrupt())?;
        self.offset += RECORD_SIZE as u64;
        Ok(Some(record))
    }

    /// Skip the argument payload following a record with the `more` bit set.
    ///
    /// Each argument is padded to 4 bytes and the whole payload to 8 bytes.
    /// Returns the number of bytes consumed.
    pub fn skip_args(&mut self, specs: &[ArgSpec]) -> Result<u64> {
        let mut len = 0u64;

        for spec in specs {
            let size = match spec.fmt {
                ArgFormat::Str => {
                    let mut raw = [0u8; 2];
                    self.read_exact(&mut raw)?;
                    len += 2;
                    u64::from(u16::from_le_bytes(raw))
                }
                _ => spec.size as u64,
            };

            self.discard(size)?;
            len += size;

            let rem = len % 4;
            if rem != 0 {
                self.discard(4 - rem)?;
                len += 4 - rem;
            }
        }

        let rem = len % 8;
        if rem != 0 {
            self.discard(8 - rem)?;
            len += 8 - rem;
        }

        Ok(len)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(self.corrupt()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn discard(&mut self, len: u64) -> Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())?;
        self.offset += copied;

        if copied < len {
            return Err(self.corrupt());
        }
        Ok(())
    }

    fn corrupt(&self) -> Error {
        Error::CorruptRecord {
            tid: self.tid,
            offset: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::record::RecordKind;

    fn bytes(records: &[Record]) -> Vec<u8> {
        records.iter().flat_map(|r| r.encode()).collect()
    }

    #[test]
    fn reads_until_end_of_file() {
        let data = bytes(&[Record::entry(100, 0x40000, 0), Record::exit(200, 0x40000, 0)]);
        let mut reader = TaskReader::from_bytes(1, data);

        assert_eq!(reader.read_record().unwrap().unwrap().kind, RecordKind::Entry);
        assert_eq!(reader.read_record().unwrap().unwrap().kind, RecordKind::Exit);
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let mut data = bytes(&[Record::entry(100, 0x40000, 0)]);
        data.extend_from_slice(&[1, 2, 3]);
        let mut reader = TaskReader::from_bytes(7, data);

        reader.read_record().unwrap();
        match reader.read_record() {
            Err(Error::CorruptRecord { tid, offset }) => {
                assert_eq!(tid, 7);
                assert_eq!(offset, 16);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn skips_padded_argument_payload() {
        let mut entry = Record::entry(100, 0x40000, 0);
        entry.more = true;

        let mut data = entry.encode().to_vec();
        // int (4 bytes), then a 3-byte string padded to 4, then pad to 8
        data.extend_from_slice(&42i32.to_le_bytes());
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(b"abc\0");
        data.extend_from_slice(&[0u8; 6]);
        data.extend_from_slice(&Record::exit(200, 0x40000, 0).encode());

        let specs = [
            ArgSpec {
                idx: 1,
                fmt: ArgFormat::Int,
                size: 4,
            },
            ArgSpec {
                idx: 2,
                fmt: ArgFormat::Str,
                size: 0,
            },
        ];

        let mut reader = TaskReader::from_bytes(1, data);
        assert!(reader.read_record().unwrap().unwrap().more);
        assert_eq!(reader.skip_args(&specs).unwrap(), 16);
        assert_eq!(reader.read_record().unwrap().unwrap().time, 200);
    }
}
