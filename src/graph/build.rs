use super::Graph;
use crate::data::RecordKind;
use crate::error::{Error, Result};
use crate::replay::{FilterAction, FrameFlags, Replay};

/// Replay every record and build one graph of `func` per session.
///
/// Stops early, keeping what was built so far, when a stop is requested.
pub fn build_graphs(replay: &mut Replay<'_>, func: &str) -> Result<Vec<Graph>> {
    let sessions = replay.sessions();
    let mut graphs: Vec<Graph> = (0..sessions.len()).map(|i| Graph::new(i, func)).collect();

    // address ranges of `func` and its aliases, per session
    let targets: Vec<Vec<(u64, u64)>> = sessions
        .iter()
        .map(|sess| {
            sess.symbols
                .find_by_name(func)
                .map(|sym| (sym.addr, sym.addr.saturating_add(sym.size)))
                .collect()
        })
        .collect();

    while !replay.stop_requested() {
        let Some(head) = replay.read()? else {
            break;
        };

        let idx = head.task;
        let record = head.record;
        let tid = replay.task(idx).tid;

        let sid = sessions
            .find_task_session(tid, record.time)
            .ok_or(Error::MissingSession {
                tid,
                time: record.time,
            })?;
        let (Some(graph), Some(ranges)) = (graphs.get_mut(sid), targets.get(sid)) else {
            continue;
        };
        let is_target = ranges
            .iter()
            .any(|&(start, end)| (start..end).contains(&record.addr));

        match record.kind {
            RecordKind::Entry => {
                if replay.entry(idx).0 == FilterAction::Reject {
                    continue;
                }

                let task = replay.task(idx);
                let flags = task.top_frame().map(|f| f.flags).unwrap_or_default();
                graph.enter(tid, record.addr, &task.call_chain(), is_target);

                replay.skip(idx, record.depth)?;

                let depth = replay.task(idx).display_depth;
                let restored = replay.update(RecordKind::Entry, idx, flags);
                if flags.contains(FrameFlags::LONGJMP) {
                    // the longjmp call itself and everything down to setjmp
                    let levels = (depth + 1 - restored).max(0);
                    graph.unwind(tid, usize::try_from(levels).unwrap_or(0));
                }
            }
            RecordKind::Exit => {
                let frame = replay.task(idx).exited_frame().copied();
                replay.exit(idx);

                if let Some(frame) = frame.filter(|f| f.flags.contains(FrameFlags::RECORDED)) {
                    replay.update(RecordKind::Exit, idx, FrameFlags::empty());
                    graph.exit(tid, frame.self_time, frame.child_time, is_target);
                }
            }
            RecordKind::Lost => {
                log::debug!(
                    "task {}: {} records lost at depth {}",
                    tid,
                    record.addr,
                    record.depth
                );
            }
        }
    }

    Ok(graphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Record, TaskReader};
    use crate::replay::{ReplayOptions, StopFlag};
    use crate::session::{Session, SessionTable, SymbolTable};

    const MAIN: u64 = 0x40000;
    const FOO: u64 = 0x41000;
    const BAR: u64 = 0x42000;

    fn sessions(tids: &[u32]) -> SessionTable {
        let symbols = SymbolTable::parse_nm(
            "0000000000040000 T main\n\
             0000000000041000 T foo\n\
             0000000000042000 T bar\n\
             0000000000043000 T end\n",
        );
        let mut table = SessionTable::new(vec![Session::new("sess", 1, 0, symbols)]);
        for &tid in tids {
            table.add_task(tid, 1);
        }
        table
    }

    fn add(replay: &mut Replay<'_>, tid: u32, records: &[Record]) {
        let data = records.iter().flat_map(|r| r.encode()).collect();
        replay.add_task(tid, Some(TaskReader::from_bytes(tid, data)));
    }

    fn children(graph: &Graph) -> Vec<(u64, u64, u64)> {
        graph
            .root()
            .children
            .iter()
            .map(|&id| graph.node(id))
            .map(|n| (n.addr, n.call_count, n.self_time))
            .collect()
    }

    fn main_calls_foo_twice() -> Vec<Record> {
        vec![
            Record::entry(0, MAIN, 0),
            Record::entry(10, FOO, 1),
            Record::exit(60, FOO, 1),
            Record::entry(70, FOO, 1),
            Record::exit(120, FOO, 1),
            Record::exit(200, MAIN, 0),
        ]
    }

    #[test]
    fn target_with_repeated_callee() {
        let sessions = sessions(&[1]);
        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        add(&mut replay, 1, &main_calls_foo_twice());

        let graphs = build_graphs(&mut replay, "main").unwrap();
        assert_eq!(graphs.len(), 1);

        let graph = &graphs[0];
        let root = graph.root();
        assert_eq!((root.addr, root.call_count, root.self_time), (MAIN, 1, 200));
        assert_eq!(root.child_time, 100);
        assert_eq!(children(graph), vec![(FOO, 2, 100)]);
        assert_eq!(graph.backtraces()[0].addrs, vec![MAIN]);
    }

    #[test]
    fn threads_of_one_process_share_the_graph() {
        let sessions = sessions(&[1234, 5678]);
        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        for (tid, base) in [(1234, 100), (5678, 150)] {
            add(
                &mut replay,
                tid,
                &[
                    Record::entry(base, MAIN, 0),
                    Record::entry(base + 100, FOO, 1),
                    Record::exit(base + 200, FOO, 1),
                    Record::exit(base + 300, MAIN, 0),
                ],
            );
        }

        let graphs = build_graphs(&mut replay, "main").unwrap();
        let graph = &graphs[0];

        assert_eq!(graph.root().call_count, 2);
        assert_eq!(graph.root().self_time, 600);
        assert_eq!(children(graph), vec![(FOO, 2, 200)]);

        let bts = graph.backtraces();
        assert_eq!(bts.len(), 1);
        assert_eq!((bts[0].hit_count, bts[0].time), (2, 600));
    }

    #[test]
    fn task_without_session_is_fatal() {
        let sessions = SessionTable::new(vec![Session::new("other", 99, 0, SymbolTable::default())]);
        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        add(&mut replay, 1234, &main_calls_foo_twice());

        assert!(matches!(
            build_graphs(&mut replay, "main"),
            Err(Error::MissingSession { tid: 1234, time: 0 })
        ));
    }

    #[test]
    fn depth_limit_cuts_deeper_calls() {
        let sessions = sessions(&[1]);
        let opts = ReplayOptions {
            depth: 2,
            ..Default::default()
        };
        let mut replay = Replay::new(&sessions, opts);
        add(
            &mut replay,
            1,
            &[
                Record::entry(0, MAIN, 0),
                Record::entry(10, FOO, 1),
                Record::entry(20, BAR, 2),
                Record::exit(30, BAR, 2),
                Record::exit(40, FOO, 1),
                Record::exit(50, MAIN, 0),
            ],
        );

        let graphs = build_graphs(&mut replay, "main").unwrap();
        let graph = &graphs[0];

        assert_eq!(children(graph), vec![(FOO, 1, 30)]);
        let foo = graph.node(graph.root().children[0]);
        assert!(foo.children.is_empty());
        assert_eq!(replay.task(0).display_depth, 0);
    }

    #[test]
    fn short_calls_are_dropped_by_time_filter() {
        let sessions = sessions(&[1]);
        let opts = ReplayOptions {
            time_filter: 100,
            ..Default::default()
        };
        let mut replay = Replay::new(&sessions, opts);
        add(
            &mut replay,
            1,
            &[
                Record::entry(0, MAIN, 0),
                Record::entry(10, FOO, 1),
                Record::exit(20, FOO, 1),
                Record::entry(30, BAR, 1),
                Record::exit(230, BAR, 1),
                Record::exit(300, MAIN, 0),
            ],
        );

        let graphs = build_graphs(&mut replay, "main").unwrap();
        assert_eq!(children(&graphs[0]), vec![(BAR, 1, 200)]);
    }

    #[test]
    fn excluded_callee_is_left_out() {
        let mut sessions = sessions(&[1]);
        sessions.setup_filters("!foo").unwrap();
        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        add(
            &mut replay,
            1,
            &[
                Record::entry(0, MAIN, 0),
                Record::entry(10, FOO, 1),
                Record::entry(15, BAR, 2),
                Record::exit(20, BAR, 2),
                Record::exit(30, FOO, 1),
                Record::entry(40, BAR, 1),
                Record::exit(50, BAR, 1),
                Record::exit(60, MAIN, 0),
            ],
        );

        let graphs = build_graphs(&mut replay, "main").unwrap();
        assert_eq!(children(&graphs[0]), vec![(BAR, 1, 10)]);
    }

    #[test]
    fn longjmp_returns_to_setjmp_caller() {
        const SETJMP: u64 = 0x44000;
        const LONGJMP: u64 = 0x45000;
        const BAZ: u64 = 0x46000;

        let symbols = SymbolTable::parse_nm(
            "0000000000040000 T main\n\
             0000000000041000 T foo\n\
             0000000000042000 T bar\n\
             0000000000044000 T setjmp\n\
             0000000000045000 T longjmp\n\
             0000000000046000 T baz\n\
             0000000000047000 T end\n",
        );
        let mut sessions = SessionTable::new(vec![Session::new("sess", 1, 0, symbols)]);
        sessions.add_task(1, 1);
        sessions.prepare_fixups();

        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        add(
            &mut replay,
            1,
            &[
                Record::entry(0, MAIN, 0),
                Record::entry(10, SETJMP, 1),
                Record::exit(20, SETJMP, 1),
                Record::entry(30, FOO, 1),
                Record::entry(40, BAR, 2),
                Record::entry(50, LONGJMP, 3),
                // setjmp returns a second time
                Record::exit(60, SETJMP, 1),
                Record::entry(70, BAZ, 1),
                Record::exit(80, BAZ, 1),
                Record::exit(1_000, MAIN, 0),
            ],
        );

        let graphs = build_graphs(&mut replay, "main").unwrap();
        let graph = &graphs[0];

        let root = graph.root();
        assert_eq!((root.addr, root.call_count, root.self_time), (MAIN, 1, 1_000));
        assert_eq!(
            children(graph),
            vec![(SETJMP, 1, 10), (FOO, 1, 30), (BAZ, 1, 10)]
        );
        assert_eq!(graph.backtraces()[0].time, 1_000);
        assert!(!graph.is_active());
        assert_eq!(replay.task(0).display_depth, 0);
    }

    #[test]
    fn target_named_by_alias() {
        let symbols = SymbolTable::parse_nm(
            "0000000000040000 T main\n\
             0000000000041000 T __foo_impl\n\
             0000000000041000 W foo\n\
             0000000000042000 T bar\n\
             0000000000043000 T end\n",
        );
        let mut sessions = SessionTable::new(vec![Session::new("sess", 1, 0, symbols)]);
        sessions.add_task(1, 1);

        let mut replay = Replay::new(&sessions, ReplayOptions::default());
        add(&mut replay, 1, &main_calls_foo_twice());

        let graphs = build_graphs(&mut replay, "foo").unwrap();
        let root = graphs[0].root();
        assert_eq!((root.addr, root.call_count, root.self_time), (FOO, 2, 100));
    }

    #[test]
    fn stop_request_ends_replay() {
        let sessions = sessions(&[1]);
        let stop = StopFlag::new();
        let mut replay = Replay::new(&sessions, ReplayOptions::default()).with_stop(stop.clone());
        add(&mut replay, 1, &main_calls_foo_twice());

        stop.request();
        let graphs = build_graphs(&mut replay, "main").unwrap();
        assert_eq!(graphs[0].root().call_count, 0);
    }
}
