//! Heartbeat latency probe.
//!
//! Watches a kernel counter the guest updates on its own, so watchpoint
//! events arrive at a steady rate. Each event runs the full dispatch and
//! trigger path and lands in the event-latency histogram, while `check`
//! stays constant so no client criteria are ever affected.

use crate::config::{Config, Criteria};
use crate::debugger::{cmds, DebuggerChannel};
use crate::error::{MonitorError, Result};
use crate::modules::{InitContext, IntrospectionModule, ModuleKind, Watchpoint};

const NAME: &str = "Heartbeat";
const SYMBOL: &str = "printk_ratelimit_state.interval";

pub(crate) fn ctor(_cfg: &Config) -> Result<Box<dyn IntrospectionModule>> {
    Ok(Box::new(Heartbeat))
}

/// Dynamic module used to measure end-to-end event latency.
pub struct Heartbeat;

impl IntrospectionModule for Heartbeat {
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
        let reply = dbg.command(&format!("watch {SYMBOL}"), cmds::WATCH_REPLY_LINES)?;
        Ok(vec![Watchpoint(reply[0].trim().to_string())])
    }

    fn on_event(&mut self, dbg: &mut DebuggerChannel) -> Result<bool> {
        dbg.drain(cmds::EVENT_PREAMBLE_LINES)?;
        // Report a change so the event exercises the trigger path too.
        Ok(true)
    }

    fn check(&self, _criteria: &Criteria) -> bool {
        true
    }
}
