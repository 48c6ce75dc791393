//! Runtime measurement-list module.
//!
//! Mirrors the guest kernel's integrity measurement list into an in-memory
//! set. The initial list is read at install time; a watchpoint on the
//! list's tail pointer keeps the mirror current. Policy compares the mirror
//! against named trusted sets loaded from the hash-sets file; the all-zero
//! digest is the boot-time sentinel and is always trusted.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::config::{Config, Criteria};
use crate::debugger::{cmds, reply_value, DebuggerChannel};
use crate::error::{MonitorError, Result};
use crate::modules::{InitContext, IntrospectionModule, ModuleKind, Watchpoint};

const NAME: &str = "MeasurementList";
const TAIL_SYMBOL: &str = "ima_measurements->prev";
const LIST_LEN_MACRO: &str = "print_mlist";
const LAST_HASH_MACRO: &str = "last_hash";
const DEFAULT_SETS_PATH: &str = "cfg/hashes.cfg";

/// Boot-time sentinel entry of the measurement list.
const ZERO_DIGEST: &str = "0000000000000000000000000000000000000000";

pub(crate) fn ctor(cfg: &Config) -> Result<Box<dyn IntrospectionModule>> {
    Ok(Box::new(MeasurementList::from_config(cfg)?))
}

/// Dynamic module mirroring the guest's measurement list.
pub struct MeasurementList {
    mlist: HashSet<String>,
    sets: HashMap<String, HashSet<String>>,
}

impl MeasurementList {
    /// Build the module, loading the trusted sets named by the hash-sets
    /// file (module option `sets`, default `cfg/hashes.cfg`).
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let path = cfg
            .module_option(NAME, "sets")
            .unwrap_or(DEFAULT_SETS_PATH);
        Ok(MeasurementList {
            mlist: HashSet::new(),
            sets: load_hash_sets(Path::new(path))?,
        })
    }
}

/// Load the hash-sets file: a `[sets]` table mapping set name → path to a
/// file of one 40-hex digest per line (`#` comments and blanks ignored).
fn load_hash_sets(path: &Path) -> Result<HashMap<String, HashSet<String>>> {
    let text = fs::read_to_string(path).map_err(|e| {
        MonitorError::Config(format!("cannot read hash-sets file {}: {e}", path.display()))
    })?;
    let doc: toml::Table = toml::from_str(&text)?;
    let Some(table) = doc.get("sets").and_then(toml::Value::as_table) else {
        return Err(MonitorError::Config(format!(
            "hash-sets file {} has no [sets] table",
            path.display()
        )));
    };

    let mut sets = HashMap::with_capacity(table.len());
    for (name, value) in table {
        let set_path = value.as_str().ok_or_else(|| {
            MonitorError::Config(format!("hash set {name}: path must be a string"))
        })?;
        let body = fs::read_to_string(set_path).map_err(|e| {
            MonitorError::Config(format!("hash set {name}: cannot read {set_path}: {e}"))
        })?;
        let digests: HashSet<String> = body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        tracing::debug!(set = name, digests = digests.len(), "loaded trusted set");
        sets.insert(name.clone(), digests);
    }
    Ok(sets)
}

impl IntrospectionModule for MeasurementList {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Dynamic
    }

    fn initialize(&mut self, ctx: InitContext<'_>) -> Result<Vec<Watchpoint>> {
        let InitContext::Runtime(dbg) = ctx else {
            return Err(MonitorError::Config(format!("{NAME} is a runtime module")));
        };

        let reply = dbg.command(LIST_LEN_MACRO, cmds::MACRO_REPLY_LINES)?;
        let count: usize = reply_value(&reply[0])?
            .parse()
            .map_err(|_| MonitorError::Reply(reply[0].clone()))?;
        for line in dbg.drain(count)? {
            self.mlist.insert(line.trim().to_string());
        }
        tracing::debug!(entries = self.mlist.len(), "seeded measurement list");

        let reply = dbg.command(&format!("watch {TAIL_SYMBOL}"), cmds::WATCH_REPLY_LINES)?;
        Ok(vec![Watchpoint(reply[0].trim().to_string())])
    }

    fn on_event(&mut self, dbg: &mut DebuggerChannel) -> Result<bool> {
        dbg.drain(cmds::EVENT_PREAMBLE_LINES)?;
        let reply = dbg.command(LAST_HASH_MACRO, cmds::MACRO_REPLY_LINES)?;
        let digest = reply_value(&reply[0])?.to_string();
        let inserted = self.mlist.insert(digest.clone());
        tracing::info!(digest, new = inserted, "measurement recorded");
        Ok(inserted)
    }

    fn check(&self, criteria: &Criteria) -> bool {
        let Some(section) = criteria.section(NAME) else {
            return true;
        };

        let mut trusted: HashSet<&str> = HashSet::new();
        trusted.insert(ZERO_DIGEST);
        if let Some(name) = section.get("trusted").and_then(toml::Value::as_str) {
            match self.sets.get(name) {
                Some(set) => trusted.extend(set.iter().map(String::as_str)),
                None => {
                    tracing::warn!(set = name, "criteria names an unknown trusted set");
                    return false;
                }
            }
        }

        self.mlist.iter().all(|d| trusted.contains(d.as_str()))
    }
}
