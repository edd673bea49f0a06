use super::{Graph, NodeId};
use crate::session::Session;
use std::io::{self, Write};

const UNITS: [&str; 5] = ["us", "ms", " s", " m", " h"];
const LIMITS: [u64; 6] = [1000, 1000, 1000, 60, 60, u64::MAX];

/// Width of the time column
const TIME_WIDTH: usize = 11;

/// Format a duration in nanoseconds as ` %3u.%03u <unit>`; zero is blank
pub fn time_unit(nsec: u64) -> String {
    if nsec == 0 {
        return " ".repeat(TIME_WIDTH);
    }

    let mut delta = nsec;
    let mut idx = 0;

    let small = loop {
        let small = delta % LIMITS[idx];
        delta /= LIMITS[idx];

        if delta < LIMITS[idx + 1] || idx + 1 == UNITS.len() {
            break small;
        }
        idx += 1;
    };

    format!(" {:3}.{:03} {}", delta, small, UNITS[idx])
}

/// Write the report for one session's graph
pub fn print_graph(
    out: &mut impl Write,
    graph: &Graph,
    session: &Session,
    max_depth: i32,
) -> io::Result<()> {
    writeln!(out, "#")?;
    writeln!(
        out,
        "# function graph for '{}' (session: {:.16})",
        graph.func, session.sid
    )?;
    writeln!(out, "#")?;
    writeln!(out)?;

    if !graph.backtraces().is_empty() {
        writeln!(out, "backtrace")?;
        writeln!(out, "================================")?;

        for (i, bt) in graph.backtraces().iter().enumerate() {
            writeln!(
                out,
                " backtrace #{}: hit {}, time{}",
                i,
                bt.hit_count,
                time_unit(bt.time)
            )?;
            for (k, &addr) in bt.addrs.iter().enumerate() {
                writeln!(out, "   [{}] {} ({:#x})", k, session.symbols.name(addr), addr)?;
            }
            writeln!(out)?;
        }
    }

    writeln!(out, "calling functions")?;
    writeln!(out, "================================")?;

    let depth = max_depth.max(1);
    let levels = height(graph).min(depth as usize);
    let mut printer = Printer {
        graph,
        session,
        indent_mask: vec![false; levels + 1],
    };
    printer.node(
        out,
        NodeId::ROOT,
        depth,
        0,
        graph.root().edge_count() > 1,
    )?;

    writeln!(out)
}

/// Number of levels below the root
fn height(graph: &Graph) -> usize {
    let mut max = 0;
    let mut stack = vec![(NodeId::ROOT, 0)];

    while let Some((id, level)) = stack.pop() {
        max = max.max(level);
        stack.extend(graph.node(id).children.iter().map(|&c| (c, level + 1)));
    }
    max
}

struct Printer<'a> {
    graph: &'a Graph,
    session: &'a Session,
    /// Columns that still have a sibling group open below
    indent_mask: Vec<bool>,
}

impl Printer<'_> {
    fn node(
        &mut self,
        out: &mut impl Write,
        id: NodeId,
        depth: i32,
        indent: usize,
        needs_line: bool,
    ) -> io::Result<()> {
        let graph = self.graph;
        let node = graph.node(id);
        let orig_indent = indent;
        let mut indent = indent;

        write!(out, "{} : ", time_unit(node.self_time))?;
        self.indent(out, indent, needs_line)?;
        writeln!(
            out,
            "({}) {}",
            node.call_count,
            self.session.symbols.name(node.addr)
        )?;

        if node.edge_count() > 1 {
            self.indent_mask[indent] = true;
            indent += 1;
        }

        // the last child closes its parent's column
        if let Some(parent) = node.parent.map(|p| graph.node(p))
            && parent.edge_count() > 1
            && orig_indent > 0
            && parent.children.last() == Some(&id)
        {
            self.indent_mask[orig_indent - 1] = false;
        }

        if depth > 1 {
            let needs_line = node.edge_count() > 1;

            for (i, &child) in node.children.iter().enumerate() {
                self.node(out, child, depth - 1, indent, needs_line)?;

                if i + 1 < node.children.len() {
                    write!(out, "{:width$}: ", "", width = TIME_WIDTH + 1)?;
                    self.indent(out, indent, false)?;
                    writeln!(out)?;
                }
            }
        }

        self.indent_mask[orig_indent] = false;
        Ok(())
    }

    /// Connector columns; with `line` the innermost open column turns into
    /// ` +-` and everything after it into `---`
    fn indent(&self, out: &mut impl Write, indent: usize, line: bool) -> io::Result<()> {
        let mask = &self.indent_mask[..indent];
        let last = if line {
            mask.iter().rposition(|&m| m)
        } else {
            None
        };

        for (i, &open) in mask.iter().enumerate() {
            let s = match last {
                Some(last) if i == last => " +-",
                Some(last) if i > last => "---",
                None if line => "---",
                _ if open => " | ",
                _ => "   ",
            };
            out.write_all(s.as_bytes())?;
        }
        Ok(())
    }
}
