use super::Replay;
use super::task::Origin;
use crate::data::{KernelRecord, Record, RecordKind};
use crate::error::{Error, Result};

/// The globally oldest pending record and the task it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub task: usize,
    pub record: Record,
    pub origin: Origin,
}

impl<'s> Replay<'s> {
    /// Oldest pending record across all sources, without consuming it
    pub fn peek(&mut self) -> Result<Option<Head>> {
        self.next_record(false)
    }

    /// Consume the oldest pending record and update its task's stack
    pub fn read(&mut self) -> Result<Option<Head>> {
        self.next_record(true)
    }

    fn next_record(&mut self, consume: bool) -> Result<Option<Head>> {
        let user = self.oldest_user()?;
        let kernel = self.kernel_head();

        let from_user = match (&user, &kernel) {
            (None, None) => return Ok(None),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some((_, rec)), Some(k)) => rec.time < k.time(),
        };

        if from_user {
            let Some((idx, record)) = user else {
                return Ok(None);
            };

            if consume {
                self.tasks[idx].pending.pop_front();
                self.check_time(idx, &record)?;
                let depth = self.opts.depth;
                self.tasks[idx].apply_user(record, depth);
            }

            return Ok(Some(Head {
                task: idx,
                record,
                origin: Origin::User,
            }));
        }

        let Some(krec) = kernel else {
            return Ok(None);
        };
        let idx = self
            .task_index(krec.tid)
            .ok_or(Error::MissingTask { tid: krec.tid })?;

        let record = if krec.missed > 0 {
            Record::lost(krec.time(), krec.missed, krec.depth)
        } else if krec.is_exit() {
            Record::exit(krec.time(), krec.child_addr, krec.depth)
        } else {
            Record::entry(krec.time(), krec.child_addr, krec.depth)
        };

        if consume {
            self.check_time(idx, &record)?;
            if let Some(kernel) = self.kernel.as_mut() {
                // the lost marker is replayed first, the record itself next time
                if krec.missed > 0 {
                    kernel.clear_missed();
                } else {
                    kernel.consume();
                }
            }
            let depth = self.opts.depth;
            self.tasks[idx].apply_kernel(record, &krec, depth);
        }

        Ok(Some(Head {
            task: idx,
            record,
            origin: Origin::Kernel,
        }))
    }

    /// Task with the oldest head record; ties go to the earlier task
    fn oldest_user(&mut self) -> Result<Option<(usize, Record)>> {
        let mut oldest: Option<(usize, Record)> = None;

        for idx in 0..self.tasks.len() {
            let Some(record) = self.task_head(idx)? else {
                continue;
            };

            if oldest.is_none_or(|(_, best)| record.time < best.time) {
                oldest = Some((idx, record));
            }
        }

        Ok(oldest)
    }

    /// Current head of a task's user stream, reading ahead when needed
    fn task_head(&mut self, idx: usize) -> Result<Option<Record>> {
        if let Some(record) = self.tasks[idx].pending.front() {
            return Ok(Some(*record));
        }

        let threshold = self.opts.time_filter;
        if threshold == 0 {
            if let Some(record) = self.fetch(idx)? {
                self.tasks[idx].pending.push_back(record);
            }
            return Ok(self.tasks[idx].pending.front().copied());
        }

        // hold entries back until their exit shows the call is long enough
        while let Some(record) = self.fetch(idx)? {
            let pending = &mut self.tasks[idx].pending;

            match record.kind {
                RecordKind::Entry => pending.push_back(record),
                RecordKind::Exit => match pending.back() {
                    None => {
                        pending.push_back(record);
                        break;
                    }
                    Some(last) if record.time.saturating_sub(last.time) < threshold => {
                        pending.pop_back();
                    }
                    Some(_) => {
                        pending.push_back(record);
                        break;
                    }
                },
                RecordKind::Lost => {
                    pending.push_back(record);
                    break;
                }
            }
        }

        Ok(self.tasks[idx].pending.front().copied())
    }

    /// Read one record from a task's file, skipping any argument payload.
    ///
    /// A corrupt or unreadable file ends that task only.
    fn fetch(&mut self, idx: usize) -> Result<Option<Record>> {
        let sessions = self.sessions;
        let args_enabled = self.opts.args_enabled;
        let task = &mut self.tasks[idx];
        let tid = task.tid;

        let Some(reader) = task.reader.as_mut() else {
            task.done = true;
            return Ok(None);
        };

        let record = match reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("task {}: end of data", tid);
                task.finish();
                return Ok(None);
            }
            Err(e) => {
                self.abandon(idx, e);
                return Ok(None);
            }
        };

        if record.more {
            if !args_enabled {
                return Err(Error::UnexpectedMoreFlag {
                    tid,
                    time: record.time,
                    addr: record.addr,
                });
            }

            let retval = record.kind == RecordKind::Exit;
            let specs = sessions
                .find_session(tid, record.time)
                .and_then(|sess| sess.arg_specs(record.addr, retval))
                .ok_or(Error::MissingArgSpec {
                    tid,
                    addr: record.addr,
                })?;

            if let Err(e) = reader.skip_args(&specs) {
                self.abandon(idx, e);
                return Ok(None);
            }
        }

        Ok(Some(record))
    }

    fn abandon(&mut self, idx: usize, err: Error) {
        let task = &mut self.tasks[idx];
        log::warn!("task {}: {}, skipping the rest of its data", task.tid, err);

        if let Error::CorruptRecord { tid, offset } = err {
            self.corrupt.get_or_insert((tid, offset));
        }
        task.finish();
    }

    fn kernel_head(&mut self) -> Option<KernelRecord> {
        let kernel = self.kernel.as_mut()?;

        match kernel.peek() {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                if !self.kernel_warned {
                    log::debug!("no more kernel data");
                    self.kernel_warned = true;
                }
                None
            }
            Err(e) => {
                if !self.kernel_warned {
                    log::warn!("broken kernel data, ignoring the rest: {}", e);
                    self.kernel_warned = true;
                }
                self.kernel = None;
                None
            }
        }
    }

    fn check_time(&mut self, idx: usize, record: &Record) -> Result<()> {
        if record.time < self.last_time {
            return Err(Error::TimeInversion {
                tid: self.tasks[idx].tid,
                prev: self.last_time,
                time: record.time,
                addr: record.addr,
            });
        }
        self.last_time = record.time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BufferedKernel, TaskReader};
    use crate::replay::ReplayOptions;
    use crate::session::{Session, SessionTable, SymbolTable};

    const TIDS: [u32; 2] = [1234, 5678];

    fn bytes(records: &[Record]) -> Vec<u8> {
        records.iter().flat_map(|r| r.encode()).collect()
    }

    fn records(base: u64) -> Vec<Record> {
        vec![
            Record::entry(base, 0x40000, 0),
            Record::entry(base + 100, 0x41000, 1),
            Record::exit(base + 200, 0x41000, 1),
            Record::exit(base + 300, 0x40000, 0),
        ]
    }

    fn sessions() -> SessionTable {
        let mut table = SessionTable::new(vec![
            Session::new("1234", 1234, 0, SymbolTable::default()),
            Session::new("5678", 5678, 0, SymbolTable::default()),
        ]);
        table.add_task(1234, 1234);
        table.add_task(5678, 5678);
        table
    }

    fn replay(sessions: &SessionTable, opts: ReplayOptions) -> Replay<'_> {
        let mut replay = Replay::new(sessions, opts);
        replay.add_task(TIDS[0], Some(TaskReader::from_bytes(TIDS[0], bytes(&records(100)))));
        replay.add_task(TIDS[1], Some(TaskReader::from_bytes(TIDS[1], bytes(&records(150)))));
        replay
    }

    #[test]
    fn merges_two_tasks_in_time_order() {
        let sessions = sessions();
        let mut replay = replay(&sessions, ReplayOptions::default());
        let first = records(100);
        let second = records(150);

        for i in 0..4 {
            let head = replay.read().unwrap().unwrap();
            assert_eq!(replay.task(head.task).tid, TIDS[0]);
            assert_eq!(head.record, first[i]);

            let head = replay.peek().unwrap().unwrap();
            assert_eq!(replay.task(head.task).tid, TIDS[1]);
            assert_eq!(head.record, second[i]);

            let head = replay.read().unwrap().unwrap();
            assert_eq!(replay.task(head.task).tid, TIDS[1]);
            assert_eq!(head.record, second[i]);
        }

        assert!(replay.read().unwrap().is_none());
        assert!(replay.tasks().iter().all(|t| t.done));
    }

    #[test]
    fn equal_timestamps_go_to_first_task() {
        let sessions = sessions();
        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        replay.add_task(TIDS[0], Some(TaskReader::from_bytes(TIDS[0], bytes(&records(100)))));
        replay.add_task(TIDS[1], Some(TaskReader::from_bytes(TIDS[1], bytes(&records(100)))));

        let order: Vec<u32> = std::iter::from_fn(|| replay.read().unwrap())
            .map(|head| TIDS[head.task])
            .collect();
        assert_eq!(order, vec![1234, 5678, 1234, 5678, 1234, 5678, 1234, 5678]);
    }

    #[test]
    fn peek_does_not_consume() {
        let sessions = sessions();
        let mut replay = replay(&sessions, ReplayOptions::default());

        let a = replay.peek().unwrap().unwrap();
        let b = replay.peek().unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(replay.task(a.task).stack_count, 0);

        let c = replay.read().unwrap().unwrap();
        assert_eq!(a, c);
        assert_eq!(replay.task(c.task).stack_count, 1);
    }

    #[test]
    fn inverted_time_is_fatal() {
        let sessions = sessions();
        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        let data = bytes(&[Record::entry(300, 0x40000, 0), Record::exit(200, 0x40000, 0)]);
        replay.add_task(TIDS[0], Some(TaskReader::from_bytes(TIDS[0], data)));

        replay.read().unwrap();
        match replay.read() {
            Err(Error::TimeInversion { tid, prev, time, .. }) => {
                assert_eq!((tid, prev, time), (1234, 300, 200));
            }
            other => panic!("expected time inversion, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_task_is_dropped_and_others_continue() {
        let sessions = sessions();
        let mut replay = Replay::new(&sessions, ReplayOptions::default());

        let mut bad = bytes(&[Record::entry(100, 0x40000, 0)]);
        bad.extend_from_slice(&[0u8; 16]);
        replay.add_task(TIDS[0], Some(TaskReader::from_bytes(TIDS[0], bad)));
        replay.add_task(TIDS[1], Some(TaskReader::from_bytes(TIDS[1], bytes(&records(150)))));

        let times: Vec<u64> = std::iter::from_fn(|| replay.read().unwrap())
            .map(|head| head.record.time)
            .collect();

        assert_eq!(times, vec![100, 150, 250, 350, 450]);
        assert_eq!(replay.corrupt_record(), Some((1234, 16)));
    }

    #[test]
    fn more_flag_without_arguments_is_fatal() {
        let sessions = sessions();
        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        let mut entry = Record::entry(100, 0x40000, 0);
        entry.more = true;
        replay.add_task(TIDS[0], Some(TaskReader::from_bytes(TIDS[0], bytes(&[entry]))));

        assert!(matches!(
            replay.read(),
            Err(Error::UnexpectedMoreFlag { tid: 1234, .. })
        ));
    }

    #[test]
    fn time_filter_drops_short_calls() {
        let sessions = sessions();
        let opts = ReplayOptions {
            time_filter: 100,
            ..Default::default()
        };
        let mut replay = Replay::new(&sessions, opts);
        let data = bytes(&[
            Record::entry(0, 0x40000, 0),
            // 99ns: dropped
            Record::entry(10, 0x41000, 1),
            Record::exit(109, 0x41000, 1),
            // exactly 100ns: kept
            Record::entry(200, 0x42000, 1),
            Record::exit(300, 0x42000, 1),
            Record::exit(1000, 0x40000, 0),
        ]);
        replay.add_task(TIDS[0], Some(TaskReader::from_bytes(TIDS[0], data)));

        let seen: Vec<(u64, u64)> = std::iter::from_fn(|| replay.read().unwrap())
            .map(|head| (head.record.time, head.record.addr))
            .collect();

        assert_eq!(
            seen,
            vec![(0, 0x40000), (200, 0x42000), (300, 0x42000), (1000, 0x40000)]
        );
    }

    #[test]
    fn time_filter_keeps_global_order() {
        let sessions = sessions();
        let opts = ReplayOptions {
            time_filter: 50,
            ..Default::default()
        };
        let mut replay = replay(&sessions, opts);

        let times: Vec<u64> = std::iter::from_fn(|| replay.read().unwrap())
            .map(|head| head.record.time)
            .collect();
        assert_eq!(times, vec![100, 150, 200, 250, 300, 350, 400, 450]);
    }

    #[test]
    fn kernel_records_interleave_by_time() {
        let sessions = sessions();
        let kernel = BufferedKernel::new([
            KernelRecord {
                tid: 1234,
                start_time: 120,
                end_time: 0,
                child_addr: 0xffff_8100_0000,
                depth: 0,
                missed: 0,
            },
            KernelRecord {
                tid: 1234,
                start_time: 120,
                end_time: 180,
                child_addr: 0xffff_8100_0000,
                depth: 0,
                missed: 0,
            },
        ]);
        let mut replay = Replay::new(&sessions, ReplayOptions::default()).with_kernel(Box::new(kernel));
        let data = bytes(&[Record::entry(100, 0x40000, 0), Record::exit(200, 0x40000, 0)]);
        replay.add_task(TIDS[0], Some(TaskReader::from_bytes(TIDS[0], data)));

        let seen: Vec<(u64, Origin)> = std::iter::from_fn(|| replay.read().unwrap())
            .map(|head| (head.record.time, head.origin))
            .collect();

        assert_eq!(
            seen,
            vec![
                (100, Origin::User),
                (120, Origin::Kernel),
                (180, Origin::Kernel),
                (200, Origin::User),
            ]
        );
    }

    #[test]
    fn kernel_missed_events_become_lost_record() {
        let sessions = sessions();
        let kernel = BufferedKernel::new([KernelRecord {
            tid: 1234,
            start_time: 120,
            end_time: 0,
            child_addr: 0xffff_8100_0000,
            depth: 0,
            missed: 3,
        }]);
        let mut replay = Replay::new(&sessions, ReplayOptions::default()).with_kernel(Box::new(kernel));
        replay.add_task(TIDS[0], None);

        let lost = replay.read().unwrap().unwrap();
        assert_eq!(lost.record.kind, RecordKind::Lost);
        assert_eq!(lost.record.addr, 3);

        let entry = replay.read().unwrap().unwrap();
        assert_eq!(entry.record.kind, RecordKind::Entry);
        assert!(replay.read().unwrap().is_none());
    }

    #[test]
    fn kernel_record_for_unknown_task_is_fatal() {
        let sessions = sessions();
        let kernel = BufferedKernel::new([KernelRecord {
            tid: 42,
            start_time: 1,
            end_time: 0,
            child_addr: 0,
            depth: 0,
            missed: 0,
        }]);
        let mut replay = Replay::new(&sessions, ReplayOptions::default()).with_kernel(Box::new(kernel));

        assert!(matches!(replay.read(), Err(Error::MissingTask { tid: 42 })));
    }

    /// Kernel source whose buffer cannot be decoded
    struct BrokenKernel(std::rc::Rc<std::cell::Cell<u32>>);

    impl crate::data::KernelSource for BrokenKernel {
        fn peek(&mut self) -> Result<Option<KernelRecord>> {
            self.0.set(self.0.get() + 1);
            Err(Error::InvalidData {
                path: "kernel".into(),
                reason: "bad buffer".into(),
            })
        }

        fn consume(&mut self) {}

        fn clear_missed(&mut self) {}
    }

    #[test]
    fn broken_kernel_is_dropped_and_user_replay_continues() {
        let sessions = sessions();
        let peeks = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut replay = replay(&sessions, ReplayOptions::default())
            .with_kernel(Box::new(BrokenKernel(peeks.clone())));

        let count = std::iter::from_fn(|| replay.read().unwrap()).count();
        assert_eq!(count, 8);
        assert!(replay.kernel.is_none());
        assert!(replay.kernel_warned);
        assert_eq!(peeks.get(), 1);
    }
}
