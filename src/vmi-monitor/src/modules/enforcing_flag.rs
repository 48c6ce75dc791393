//! Runtime security-policy enforcing-flag module.
//!
//! Watches the kernel symbol holding the policy enforcing flag. The
//! debugger reports only that the watched word changed, so the module seeds
//! its cache at install time and toggles it on every hit.

use crate::config::{Config, Criteria};
use crate::debugger::{cmds, reply_value, DebuggerChannel};
use crate::error::{MonitorError, Result};
use crate::modules::{InitContext, IntrospectionModule, ModuleKind, Watchpoint};

const NAME: &str = "EnforcingFlag";
const SYMBOL: &str = "selinux_enforcing";
const STATE_MACRO: &str = "get_selinux_enforcing";

pub(crate) fn ctor(_cfg: &Config) -> Result<Box<dyn IntrospectionModule>> {
    Ok(Box::new(EnforcingFlag::new()))
}

/// Dynamic module tracking the guest's security-policy enforcing flag.
pub struct EnforcingFlag {
    enforcing: String,
}

impl EnforcingFlag {
    /// Module with no cached state yet; seeded at `initialize`.
    pub fn new() -> Self {
        EnforcingFlag {
            enforcing: String::new(),
        }
    }
}

impl Default for EnforcingFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrospectionModule for EnforcingFlag {
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

        let reply = dbg.command(STATE_MACRO, cmds::MACRO_REPLY_LINES)?;
        self.enforcing = reply_value(&reply[0])?.to_string();
        tracing::debug!(enforcing = self.enforcing, "seeded enforcing flag");

        let reply = dbg.command(&format!("watch {SYMBOL}"), cmds::WATCH_REPLY_LINES)?;
        Ok(vec![Watchpoint(reply[0].trim().to_string())])
    }

    fn on_event(&mut self, dbg: &mut DebuggerChannel) -> Result<bool> {
        dbg.drain(cmds::EVENT_PREAMBLE_LINES)?;
        self.enforcing = if self.enforcing == "0" { "1" } else { "0" }.to_string();
        tracing::info!(enforcing = self.enforcing, "enforcing flag changed");
        Ok(true)
    }

    fn check(&self, criteria: &Criteria) -> bool {
        let Some(section) = criteria.section(NAME) else {
            return true;
        };
        match section.get("enforcing").and_then(toml::Value::as_str) {
            Some(expected) => expected == self.enforcing,
            None => true,
        }
    }
}
