//! Per-process sessions: symbol tables and the rules attached to them.

mod rules;
mod symbols;

pub use rules::{
    ArgFormat, ArgSpec, FIXUP_SYMS, FilterMode, FixupKind, RETVAL_IDX, Rule, RuleSet,
    TriggerResult,
};
pub use symbols::{Symbol, SymbolTable};

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Symbol and rule set of one traced process image over a time range
#[derive(Debug, Clone)]
pub struct Session {
    pub sid: String,
    pub pid: u32,
    pub start_time: u64,
    pub exename: String,
    pub symbols: SymbolTable,
    pub filters: RuleSet,
    pub fixups: RuleSet,
}

impl Session {
    pub fn new(sid: impl Into<String>, pid: u32, start_time: u64, symbols: SymbolTable) -> Self {
        Session {
            sid: sid.into(),
            pid,
            start_time,
            exename: String::new(),
            symbols,
            filters: RuleSet::default(),
            fixups: RuleSet::default(),
        }
    }

    /// Argument specs recorded for `addr`, return value only when `retval`
    pub fn arg_specs(&self, addr: u64, retval: bool) -> Option<Vec<ArgSpec>> {
        let mut tr = TriggerResult::default();
        let rule = self.filters.match_addr(addr, &mut tr)?;

        if !(tr.argument || tr.retval) {
            return None;
        }

        Some(
            rule.args
                .iter()
                .filter(|a| a.is_retval() == retval)
                .copied()
                .collect(),
        )
    }
}

/// All sessions of a recording plus the tid to pid mapping
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Vec<Session>,
    task_pids: HashMap<u32, u32>,
    filter_mode: FilterMode,
}

impl SessionTable {
    pub fn new(mut sessions: Vec<Session>) -> Self {
        sessions.sort_by_key(|s| s.start_time);

        SessionTable {
            sessions,
            task_pids: HashMap::new(),
            filter_mode: FilterMode::None,
        }
    }

    /// Record that thread `tid` belongs to process `pid`
    pub fn add_task(&mut self, tid: u32, pid: u32) {
        self.task_pids.insert(tid, pid);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Session> {
        self.sessions.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn first_session(&self) -> Option<&Session> {
        self.sessions.first()
    }

    /// Global filter mode; `In` once any include filter exists
    pub fn filter_mode(&self) -> FilterMode {
        self.filter_mode
    }

    /// Index of the session active for `tid` at `time`.
    ///
    /// The latest session of the task's process that started at or before
    /// `time` wins; records older than every session use the earliest one.
    pub fn find_task_session(&self, tid: u32, time: u64) -> Option<usize> {
        let pid = self.task_pids.get(&tid).copied().unwrap_or(tid);

        let mut earliest = None;
        let mut found = None;

        for (idx, sess) in self.sessions.iter().enumerate() {
            if sess.pid != pid {
                continue;
            }
            earliest.get_or_insert(idx);
            if sess.start_time <= time {
                found = Some(idx);
            }
        }

        found.or(earliest)
    }

    pub fn find_session(&self, tid: u32, time: u64) -> Option<&Session> {
        self.find_task_session(tid, time)
            .and_then(|idx| self.sessions.get(idx))
    }

    /// Install filter rules in every session
    pub fn setup_filters(&mut self, spec: &str) -> Result<()> {
        let mut count = 0;

        for sess in &mut self.sessions {
            let (added, has_in) = rules::setup_filters(&mut sess.filters, &sess.symbols, spec);
            if has_in {
                self.filter_mode = FilterMode::In;
            }
            count += added;
        }

        if count == 0 {
            return Err(Error::InvalidArgument(format!(
                "filter '{}' matches no function",
                spec
            )));
        }
        Ok(())
    }

    /// Install trigger rules in every session
    pub fn setup_triggers(&mut self, spec: &str) -> Result<()> {
        let mut count = 0;

        for sess in &mut self.sessions {
            let (added, has_in) =
                rules::setup_triggers(&mut sess.filters, &sess.symbols, spec)?;
            if has_in {
                self.filter_mode = FilterMode::In;
            }
            count += added;
        }

        if count == 0 {
            return Err(Error::InvalidArgument(format!(
                "trigger '{}' matches no function",
                spec
            )));
        }
        Ok(())
    }

    /// Install argument specs in every session
    pub fn setup_arguments(&mut self, spec: &str) -> Result<()> {
        for sess in &mut self.sessions {
            rules::setup_arguments(&mut sess.filters, &sess.symbols, spec)?;
        }
        Ok(())
    }

    /// Build fixup rules for exec/setjmp/longjmp in every session
    pub fn prepare_fixups(&mut self) {
        for sess in &mut self.sessions {
            rules::setup_fixups(&mut sess.fixups, &sess.symbols);
        }
    }
}
