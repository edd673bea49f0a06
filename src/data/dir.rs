//! Recorded data directory: header, task list and per-thread files.

use super::reader::TaskReader;
use crate::error::{Error, Result};
use crate::replay::DEFAULT_MAX_STACK;
use crate::session::{Session, SessionTable, SymbolTable};
use std::fs;
use std::path::{Path, PathBuf};

pub const INFO_FILE: &str = "info";
pub const TASK_FILE: &str = "task.txt";

/// Optional data recorded along with the call records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub args: bool,
    pub retval: bool,
    pub kernel: bool,
}

/// Contents of the `info` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInfo {
    pub max_stack: usize,
    pub features: Features,
    pub tids: Vec<u32>,
    /// Argument spec used while recording
    pub argspec: Option<String>,
}

impl Default for DataInfo {
    fn default() -> Self {
        DataInfo {
            max_stack: DEFAULT_MAX_STACK,
            features: Features::default(),
            tids: Vec::new(),
            argspec: None,
        }
    }
}

impl DataInfo {
    /// Parse `key:value` lines; unknown keys are ignored
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut info = DataInfo::default();

        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                return Err(format!("malformed line '{}'", line));
            };
            let value = value.trim();

            match key.trim() {
                "max_stack" => {
                    info.max_stack = value
                        .parse()
                        .ok()
                        .filter(|&n: &usize| n > 0)
                        .ok_or_else(|| format!("invalid max_stack '{}'", value))?;
                }
                "features" => {
                    for feat in value.split(',').map(str::trim) {
                        match feat {
                            "args" => info.features.args = true,
                            "retval" => info.features.retval = true,
                            "kernel" => info.features.kernel = true,
                            "" => {}
                            other => log::debug!("ignoring unknown feature '{}'", other),
                        }
                    }
                }
                "tids" => {
                    info.tids = value
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(|t| t.parse().map_err(|_| format!("invalid tid '{}'", t)))
                        .collect::<std::result::Result<_, _>>()?;
                }
                "argspec" if !value.is_empty() => info.argspec = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(info)
    }

    /// Records may carry argument or return value payloads
    pub fn has_args(&self) -> bool {
        self.features.args || self.features.retval
    }
}

/// One line of `task.txt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskLine {
    Session {
        time: u64,
        pid: u32,
        sid: String,
        exename: String,
    },
    Task {
        time: u64,
        tid: u32,
        pid: u32,
    },
}

impl TaskLine {
    /// Parse a `SESS` or `TASK` line; other lines yield `None`
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let line = line.trim();
        let (tag, rest) = line.split_once(' ').unwrap_or((line, ""));

        // exename may contain spaces, cut it off before splitting the rest
        let (rest, exename) = match rest.find("exename=") {
            Some(pos) => {
                let value = rest[pos + "exename=".len()..].trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                (&rest[..pos], Some(value.to_string()))
            }
            None => (rest, None),
        };

        let value = |key: &str| field(rest, key);
        let missing = |key: &str| format!("{} line without {}: '{}'", tag, key, line);

        let time = || {
            value("timestamp")
                .and_then(parse_timestamp)
                .ok_or_else(|| missing("timestamp"))
        };
        let number = |key: &str| {
            value(key)
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| missing(key))
        };

        match tag {
            "SESS" => Ok(Some(TaskLine::Session {
                time: time()?,
                pid: number("pid")?,
                sid: value("sid").ok_or_else(|| missing("sid"))?.to_string(),
                exename: exename.ok_or_else(|| missing("exename"))?,
            })),
            "TASK" => Ok(Some(TaskLine::Task {
                time: time()?,
                tid: number("tid")?,
                pid: number("pid")?,
            })),
            _ => Ok(None),
        }
    }
}

/// Value of a `key=value` token
fn field<'a>(rest: &'a str, key: &str) -> Option<&'a str> {
    rest.split_whitespace()
        .find_map(|kv| kv.strip_prefix(key)?.strip_prefix('='))
}

/// `<sec>.<nsec>` to nanoseconds
fn parse_timestamp(s: &str) -> Option<u64> {
    let (sec, nsec) = s.split_once('.').unwrap_or((s, "0"));
    let sec: u64 = sec.parse().ok()?;
    let nsec: u64 = nsec.parse().ok()?;

    sec.checked_mul(1_000_000_000)?.checked_add(nsec)
}

/// A directory written by the recorder
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    info: DataInfo,
    lines: Vec<TaskLine>,
}

impl DataDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let info_path = path.join(INFO_FILE);
        let content = fs::read_to_string(&info_path).map_err(|e| invalid(&info_path, e))?;
        let info = DataInfo::parse(&content).map_err(|e| invalid(&info_path, e))?;

        let task_path = path.join(TASK_FILE);
        let content = fs::read_to_string(&task_path).map_err(|e| invalid(&task_path, e))?;
        let lines = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| TaskLine::parse(l).transpose())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| invalid(&task_path, e))?;

        log::info!(
            "opened {}: {} task lines, max_stack {}",
            path.display(),
            lines.len(),
            info.max_stack
        );

        Ok(DataDir { path, info, lines })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &DataInfo {
        &self.info
    }

    /// Traced threads, from the header or else from the task list
    pub fn tids(&self) -> Vec<u32> {
        if !self.info.tids.is_empty() {
            return self.info.tids.clone();
        }

        let mut tids: Vec<u32> = self
            .lines
            .iter()
            .filter_map(|line| match line {
                TaskLine::Task { tid, .. } => Some(*tid),
                TaskLine::Session { .. } => None,
            })
            .collect();
        tids.sort_unstable();
        tids.dedup();
        tids
    }

    /// Build the session table with symbols, fixups and argument specs
    pub fn load_sessions(&self) -> Result<SessionTable> {
        let mut sessions = Vec::new();

        for line in &self.lines {
            if let TaskLine::Session {
                time,
                pid,
                sid,
                exename,
            } = line
            {
                let symbols = self.load_symbols(exename);
                log::debug!(
                    "session {} (pid {}): {} symbols from {}",
                    sid,
                    pid,
                    symbols.len(),
                    exename
                );

                let mut sess = Session::new(sid.as_str(), *pid, *time, symbols);
                sess.exename = exename.clone();
                sessions.push(sess);
            }
        }

        if sessions.is_empty() {
            return Err(invalid(&self.path.join(TASK_FILE), "no session found"));
        }

        let mut table = SessionTable::new(sessions);
        for line in &self.lines {
            if let TaskLine::Task { tid, pid, .. } = line {
                table.add_task(*tid, *pid);
            }
        }

        table.prepare_fixups();
        if let Some(spec) = &self.info.argspec {
            table.setup_arguments(spec)?;
        }

        Ok(table)
    }

    /// `<dir>/<exe>.sym`, else the ELF symbol table, else nothing
    fn load_symbols(&self, exename: &str) -> SymbolTable {
        let exe = Path::new(exename);

        if let Some(base) = exe.file_name() {
            let mut sym_name = base.to_os_string();
            sym_name.push(".sym");
            let sym_path = self.path.join(sym_name);

            if sym_path.exists() {
                match SymbolTable::load_sym_file(&sym_path) {
                    Ok(table) => return table,
                    Err(e) => log::warn!("cannot read {}: {}", sym_path.display(), e),
                }
            }
        }

        match SymbolTable::load_elf(exe) {
            Ok(table) => table,
            Err(e) => {
                log::debug!("no symbols for {}: {}", exename, e);
                SymbolTable::default()
            }
        }
    }

    /// Open `<tid>.dat`; a task that cannot be opened is skipped
    pub fn open_task(&self, tid: u32) -> Option<TaskReader> {
        let path = self.path.join(format!("{}.dat", tid));

        match TaskReader::open(&path, tid) {
            Ok(reader) => Some(reader),
            Err(e) => {
                log::debug!("cannot open {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn invalid(path: &Path, reason: impl ToString) -> Error {
    Error::InvalidData {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}
