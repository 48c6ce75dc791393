//! The watcher: a background worker that owns the debugger conversation
//! for one guest.
//!
//! Lifecycle: attach (load kernel symbols, source the macro file, connect
//! to the guest's debugger stub — this halts the guest), install (each
//! dynamic module registers its watchpoints), run (resume the guest and
//! dispatch notifications). Event processing is serialized by construction:
//! a module's `on_event` and the monitor's trigger both complete before the
//! next notification is read.
//!
//! The watcher reaches the monitor only through a weak [`TriggerSink`]
//! reference, and notifies it on every exit path so a dead watcher is
//! visible on the next status query.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::GuestIdentity;
use crate::debugger::{cmds, DebuggerChannel};
use crate::error::{MonitorError, Result};
use crate::modules::SharedModule;
use crate::monitor::metrics::{
    METRIC_EVENT_SECONDS, METRIC_MODULE_LABEL, METRIC_STATE_CHANGES, METRIC_WATCH_EVENTS,
};
use crate::monitor::{lock, TriggerSink};

#[derive(PartialEq)]
enum Flow {
    Continue,
    Detach,
}

pub(crate) struct Watcher {
    dbg: DebuggerChannel,
    guest: GuestIdentity,
    kernel_symbols: String,
    macros: String,
    modules: Vec<(String, SharedModule)>,
    // descriptor → owning module, in install order
    watchpoints: Vec<(String, String)>,
    sink: Weak<dyn TriggerSink>,
}

impl Watcher {
    pub(crate) fn new(
        dbg: DebuggerChannel,
        guest: GuestIdentity,
        kernel_symbols: String,
        macros: String,
        modules: Vec<(String, SharedModule)>,
        sink: Weak<dyn TriggerSink>,
    ) -> Self {
        Watcher {
            dbg,
            guest,
            kernel_symbols,
            macros,
            modules,
            watchpoints: Vec::new(),
            sink,
        }
    }

    /// Run the watcher on its own thread. The thread notifies the sink on
    /// every exit path.
    pub(crate) fn spawn(mut self) -> Result<JoinHandle<()>> {
        let name = format!("vmi-watcher-{}", self.guest.name);
        Ok(thread::Builder::new().name(name).spawn(move || {
            match self.run() {
                Ok(()) => {
                    tracing::info!(guest = self.guest.name.as_str(), "watcher detached")
                }
                Err(e) => tracing::warn!(
                    guest = self.guest.name.as_str(),
                    error = %e,
                    "watcher terminated"
                ),
            }
            if let Some(sink) = self.sink.upgrade() {
                sink.on_watcher_exit();
            }
        })?)
    }

    fn run(&mut self) -> Result<()> {
        self.attach()?;
        self.install()?;

        self.dbg.command("continue", cmds::CONTINUE_REPLY_LINES)?;
        tracing::info!(
            guest = self.guest.name.as_str(),
            watchpoints = self.watchpoints.len(),
            "watcher running"
        );

        loop {
            let line = self.dbg.read_line()?;
            if self.handle(line.trim())? == Flow::Detach {
                return Ok(());
            }
        }
    }

    /// Connect to the guest's debugger stub. This halts the guest until
    /// the first `continue`.
    fn attach(&mut self) -> Result<()> {
        self.dbg
            .command(&format!("file {}", self.kernel_symbols), cmds::FILE_REPLY_LINES)?;
        self.dbg
            .command(&format!("source {}", self.macros), cmds::SOURCE_REPLY_LINES)?;
        self.dbg.command(
            &format!(
                "target extended-remote 127.0.0.1:{}",
                self.guest.debugger_port
            ),
            cmds::TARGET_REMOTE_REPLY_LINES,
        )?;
        Ok(())
    }

    /// Have each dynamic module install its watchpoints, mapping every
    /// returned descriptor to its owning module. Descriptors must be
    /// pairwise distinct across all modules.
    fn install(&mut self) -> Result<()> {
        for (name, module) in &self.modules {
            let descriptors = lock(module).initialize(crate::modules::InitContext::Runtime(
                &mut self.dbg,
            ))?;
            for wp in descriptors {
                if self.watchpoints.iter().any(|(existing, _)| *existing == wp.0) {
                    return Err(MonitorError::DuplicateWatchpoint(wp.0));
                }
                tracing::debug!(
                    module = name.as_str(),
                    watchpoint = wp.as_str(),
                    "watchpoint installed"
                );
                self.watchpoints.push((wp.0, name.clone()));
            }
        }
        Ok(())
    }

    /// Route one line of debugger output.
    fn handle(&mut self, line: &str) -> Result<Flow> {
        if line.contains(cmds::INTERRUPT_MARKER) {
            tracing::info!(
                guest = self.guest.name.as_str(),
                "interrupt marker observed, detaching"
            );
            self.dbg.command("detach", cmds::DETACH_REPLY_LINES)?;
            return Ok(Flow::Detach);
        }

        let owner = self
            .watchpoints
            .iter()
            .find(|(wp, _)| line.contains(wp.as_str()))
            .map(|(_, name)| name.clone());
        let Some(name) = owner else {
            // Diagnostic noise from the debugger.
            return Ok(Flow::Continue);
        };

        let started = Instant::now();
        metrics::counter!(METRIC_WATCH_EVENTS, METRIC_MODULE_LABEL => name.clone()).increment(1);

        let module = self
            .modules
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, m)| Arc::clone(m))
            .ok_or_else(|| MonitorError::Config(format!("watchpoint owner {name} vanished")))?;

        // One bad event must not kill the watcher.
        let changed = match lock(&module).on_event(&mut self.dbg) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(module = name.as_str(), error = %e, "module event handler failed");
                false
            }
        };

        if changed {
            metrics::counter!(METRIC_STATE_CHANGES, METRIC_MODULE_LABEL => name.clone())
                .increment(1);
            match self.sink.upgrade() {
                Some(sink) => sink.on_module_changed(&name),
                // Monitor is gone; nothing left to enforce for.
                None => return Ok(Flow::Detach),
            }
        }

        metrics::histogram!(METRIC_EVENT_SECONDS, METRIC_MODULE_LABEL => name)
            .record(started.elapsed().as_secs_f64());

        // Resume the guest.
        self.dbg.command("continue", cmds::CONTINUE_REPLY_LINES)?;
        Ok(Flow::Continue)
    }
}
