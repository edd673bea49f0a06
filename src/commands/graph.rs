use crate::cli::GraphArgs;
use crate::data::DataDir;
use crate::error::{Error, Result};
use crate::graph::{build_graphs, print_graph};
use crate::replay::{Replay, ReplayOptions, StopFlag};
use std::io::Write;

/// Run the graph command - replay a data directory and print the call
/// graph of the requested function for every session that reached it
pub fn run(args: &GraphArgs, stop: StopFlag, out: &mut impl Write) -> Result<()> {
    let dir = DataDir::open(&args.data)?;
    let info = dir.info();

    let mut sessions = dir.load_sessions()?;
    if let Some(filter) = &args.filter {
        sessions.setup_filters(filter)?;
    }
    if let Some(trigger) = &args.trigger {
        sessions.setup_triggers(trigger)?;
    }
    if info.features.kernel {
        log::info!("kernel records are not replayed from {}", dir.path().display());
    }

    let opts = ReplayOptions {
        depth: args.depth,
        max_stack: info.max_stack,
        time_filter: args.time_filter.unwrap_or(0),
        args_enabled: info.has_args(),
    };
    let mut replay = Replay::new(&sessions, opts).with_stop(stop.clone());

    let tids = dir.tids();
    let mut selected = 0;
    for &tid in &tids {
        if args.tid.is_empty() || args.tid.contains(&tid) {
            replay.add_task(tid, dir.open_task(tid));
            selected += 1;
        } else {
            replay.add_task(tid, None);
        }
    }
    if selected == 0 {
        return Err(Error::InvalidArgument(format!(
            "no traced thread matches {:?}",
            args.tid
        )));
    }

    eprintln!(
        "Replaying {} of {} threads from {}",
        selected,
        tids.len(),
        dir.path().display()
    );

    let graphs = build_graphs(&mut replay, &args.function)?;

    for graph in &graphs {
        if stop.is_requested() {
            break;
        }
        if graph.root().call_count == 0 {
            continue;
        }
        let Some(session) = sessions.get(graph.session) else {
            continue;
        };
        print_graph(out, graph, session, args.depth)?;
    }
    out.flush()?;

    if let Some((tid, offset)) = replay.corrupt_record() {
        return Err(Error::CorruptRecord { tid, offset });
    }

    Ok(())
}
