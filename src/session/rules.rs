//! Filter, trigger, fixup and argument rules attached to symbols.

use super::symbols::SymbolTable;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Names of calls that need special handling during replay
pub const FIXUP_SYMS: &[&str] = &[
    "execl",
    "execlp",
    "execle",
    "execv",
    "execvp",
    "execvpe",
    "setjmp",
    "_setjmp",
    "sigsetjmp",
    "__sigsetjmp",
    "longjmp",
    "siglongjmp",
    "__longjmp_chk",
];

/// Argument index used for the return value
pub const RETVAL_IDX: u32 = 0;

const DEFAULT_ARG_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    None,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    Exec,
    Setjmp,
    Longjmp,
}

impl FixupKind {
    pub fn from_name(name: &str) -> Option<Self> {
        if name.starts_with("exec") {
            Some(FixupKind::Exec)
        } else if name.contains("setjmp") {
            Some(FixupKind::Setjmp)
        } else if name.contains("longjmp") {
            Some(FixupKind::Longjmp)
        } else {
            None
        }
    }
}

/// Combined outcome of every rule matching one call address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerResult {
    /// Set when a filter rule matched, with its mode
    pub filter: Option<FilterMode>,
    pub depth: Option<i32>,
    pub trace_on: bool,
    pub trace_off: bool,
    pub backtrace: bool,
    pub argument: bool,
    pub retval: bool,
    pub fixup: Option<FixupKind>,
}

impl TriggerResult {
    pub fn is_filter(&self) -> bool {
        self.filter.is_some()
    }

    fn merge(&mut self, other: &TriggerResult) {
        if other.filter.is_some() {
            self.filter = other.filter;
        }
        if other.depth.is_some() {
            self.depth = other.depth;
        }
        if other.fixup.is_some() {
            self.fixup = other.fixup;
        }
        self.trace_on |= other.trace_on;
        self.trace_off |= other.trace_off;
        self.backtrace |= other.backtrace;
        self.argument |= other.argument;
        self.retval |= other.retval;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgFormat {
    Int,
    Uint,
    Hex,
    Char,
    Str,
}

/// Layout of one recorded argument or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub idx: u32,
    pub fmt: ArgFormat,
    /// Size in bytes; unused for strings
    pub size: usize,
}

impl ArgSpec {
    pub fn is_retval(&self) -> bool {
        self.idx == RETVAL_IDX
    }

    /// Parse `argN[/fmt[bits]]` or `retval[/fmt[bits]]`
    fn parse(s: &str) -> Option<Self> {
        let (name, fmt) = match s.split_once('/') {
            Some((name, fmt)) => (name, Some(fmt)),
            None => (s, None),
        };

        let idx = if name == "retval" {
            RETVAL_IDX
        } else {
            name.strip_prefix("arg")?.parse::<u32>().ok().filter(|&n| n > 0)?
        };

        let Some(fmt) = fmt else {
            return Some(ArgSpec {
                idx,
                fmt: ArgFormat::Int,
                size: DEFAULT_ARG_SIZE,
            });
        };

        let mut chars = fmt.chars();
        let fmt = match chars.next()? {
            'i' | 'd' => ArgFormat::Int,
            'u' => ArgFormat::Uint,
            'x' => ArgFormat::Hex,
            'c' => ArgFormat::Char,
            's' => ArgFormat::Str,
            _ => return None,
        };

        let bits = chars.as_str();
        let size = match (fmt, bits) {
            (ArgFormat::Str, _) => 0,
            (ArgFormat::Char, "") => 1,
            (_, "") => DEFAULT_ARG_SIZE,
            (_, bits) => match bits.parse::<usize>().ok()? {
                n @ (8 | 16 | 32 | 64) => n / 8,
                _ => return None,
            },
        };

        Some(ArgSpec { idx, fmt, size })
    }
}

/// Rule attached to the address range of one symbol
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub trigger: TriggerResult,
    pub args: Vec<ArgSpec>,
}

/// Address-keyed rule collection
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<u64, Rule>,
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Add a rule, merging with an existing rule for the same symbol
    pub fn insert(&mut self, rule: Rule) {
        match self.rules.get_mut(&rule.start) {
            Some(existing) => {
                existing.trigger.merge(&rule.trigger);
                for arg in rule.args {
                    if !existing.args.iter().any(|a| a.idx == arg.idx) {
                        existing.args.push(arg);
                    }
                }
                existing.args.sort_by_key(|a| a.idx);
            }
            None => {
                self.rules.insert(rule.start, rule);
            }
        }
    }

    /// Find the rule covering `addr` and merge its trigger into `tr`
    pub fn match_addr(&self, addr: u64, tr: &mut TriggerResult) -> Option<&Rule> {
        let (_, rule) = self.rules.range(..=addr).next_back()?;
        if addr >= rule.end {
            return None;
        }

        tr.merge(&rule.trigger);
        Some(rule)
    }

    /// Attach `trigger` to every symbol called `name`
    fn add_named(
        &mut self,
        symbols: &SymbolTable,
        name: &str,
        trigger: TriggerResult,
        args: &[ArgSpec],
    ) -> usize {
        let mut count = 0;

        for sym in symbols.find_by_name(name) {
            self.insert(Rule {
                name: sym.name.clone(),
                start: sym.addr,
                end: sym.addr.saturating_add(sym.size),
                trigger,
                args: args.to_vec(),
            });
            count += 1;
        }

        if count == 0 {
            log::debug!("no symbol matches '{}'", name);
        }
        count
    }
}

/// Parse a filter list (`name;!name;...`) into `rules`.
///
/// Returns the number of rules added and whether an include filter was seen.
pub fn setup_filters(rules: &mut RuleSet, symbols: &SymbolTable, spec: &str) -> (usize, bool) {
    let mut count = 0;
    let mut has_in = false;

    for item in split_items(spec) {
        let (name, mode) = match item.strip_prefix('!') {
            Some(name) => (name, FilterMode::Out),
            None => (item, FilterMode::In),
        };

        let tr = TriggerResult {
            filter: Some(mode),
            ..Default::default()
        };

        let added = rules.add_named(symbols, name, tr, &[]);
        if added > 0 && mode == FilterMode::In {
            has_in = true;
        }
        count += added;
    }

    (count, has_in)
}

/// Parse a trigger list (`name@action,...;...`) into `rules`.
///
/// Returns the number of rules added and whether an include filter was seen.
pub fn setup_triggers(
    rules: &mut RuleSet,
    symbols: &SymbolTable,
    spec: &str,
) -> Result<(usize, bool)> {
    let mut count = 0;
    let mut has_in = false;

    for item in split_items(spec) {
        let Some((name, actions)) = item.split_once('@') else {
            return Err(Error::InvalidArgument(format!(
                "trigger '{}' has no action",
                item
            )));
        };

        let mut tr = TriggerResult::default();
        for action in actions.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            match action {
                "trace_on" | "trace-on" => tr.trace_on = true,
                "trace_off" | "trace-off" => tr.trace_off = true,
                "backtrace" => tr.backtrace = true,
                "filter" => tr.filter = Some(FilterMode::In),
                "notrace" => tr.filter = Some(FilterMode::Out),
                _ => {
                    let depth = action
                        .strip_prefix("depth=")
                        .and_then(|d| d.parse::<i32>().ok())
                        .filter(|&d| d > 0)
                        .ok_or_else(|| {
                            Error::InvalidArgument(format!(
                                "unknown trigger action '{}' for {}",
                                action, name
                            ))
                        })?;
                    tr.depth = Some(depth);
                }
            }
        }

        let added = rules.add_named(symbols, name, tr, &[]);
        if added > 0 && tr.filter == Some(FilterMode::In) {
            has_in = true;
        }
        count += added;
    }

    Ok((count, has_in))
}

/// Parse an argument spec list (`name@arg1,arg2/s,retval;...`) into `rules`
pub fn setup_arguments(rules: &mut RuleSet, symbols: &SymbolTable, spec: &str) -> Result<usize> {
    let mut count = 0;

    for item in split_items(spec) {
        let Some((name, list)) = item.split_once('@') else {
            return Err(Error::InvalidArgument(format!(
                "argument spec '{}' has no argument",
                item
            )));
        };

        let mut args = Vec::new();
        for arg in list.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let spec = ArgSpec::parse(arg).ok_or_else(|| {
                Error::InvalidArgument(format!("invalid argument '{}' for {}", arg, name))
            })?;
            args.push(spec);
        }
        args.sort_by_key(|a| a.idx);

        let tr = TriggerResult {
            argument: args.iter().any(|a| !a.is_retval()),
            retval: args.iter().any(ArgSpec::is_retval),
            ..Default::default()
        };
        count += rules.add_named(symbols, name, tr, &args);
    }

    Ok(count)
}

/// Build the fixup rules for exec/setjmp/longjmp family calls
pub fn setup_fixups(rules: &mut RuleSet, symbols: &SymbolTable) {
    for name in FIXUP_SYMS {
        let tr = TriggerResult {
            fixup: FixupKind::from_name(name),
            ..Default::default()
        };
        rules.add_named(symbols, name, tr, &[]);
    }
}

fn split_items(spec: &str) -> impl Iterator<Item = &str> {
    spec.split(';').map(str::trim).filter(|s| !s.is_empty())
}
