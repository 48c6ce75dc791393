//! Introspection modules: the measurement plugins of the integrity monitor.
//!
//! # Architecture — one trait, two lifecycles
//!
//! Every module implements [`IntrospectionModule`], but modules come in two
//! kinds with different lifecycles:
//!
//! - **Static** modules measure load-time artifacts. Their `initialize`
//!   runs before the guest is launched, receives the guest descriptor, and
//!   computes all measurements immediately. Their state never changes
//!   afterwards, so they never see events.
//! - **Dynamic** modules observe the running guest. Their `initialize` runs
//!   after the guest boots, receives the debugger channel, and installs one
//!   or more watchpoints; the returned descriptors are how the watcher
//!   routes later notifications back to the module's `on_event`.
//!
//! [`InitContext`] makes the two entry conditions explicit instead of
//! overloading one context struct with optional fields: a module is handed
//! exactly the capability its kind needs.
//!
//! `check` is the policy predicate shared by both kinds: it compares the
//! module's current measurement state against one client's criteria. It is
//! total — a criteria document with no section for the module passes
//! vacuously, and no failure inside `check` may surface as anything but a
//! rejected criteria.
//!
//! Modules must not hold the debugger channel between calls; they issue
//! their commands inside `initialize` / `on_event` and return.
//!
//! Configured module names are resolved through a static name→constructor
//! table at monitor startup; an unknown name is a fatal configuration
//! error.

pub(crate) mod enforcing_flag;
pub(crate) mod file_hash;
pub(crate) mod heartbeat;
pub(crate) mod measurement_list;

use std::fmt;

use crate::config::{Config, Criteria};
use crate::debugger::DebuggerChannel;
use crate::descriptor::GuestDescriptor;
use crate::error::{MonitorError, Result};

pub use enforcing_flag::EnforcingFlag;
pub use file_hash::FileHash;
pub use heartbeat::Heartbeat;
pub use measurement_list::MeasurementList;

/// Whether a module measures at load time or at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Evaluated once before guest launch; measurements are immutable.
    Static,
    /// Evaluated on every watchpoint hit; state is mutable.
    Dynamic,
}

/// An opaque descriptor the debugger printed for an installed watchpoint.
///
/// The descriptor reappears verbatim inside every notification for that
/// watchpoint, so the watcher matches notifications by substring. Across
/// all modules of one monitor, descriptors are pairwise distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Watchpoint(pub(crate) String);

impl Watchpoint {
    /// The descriptor text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Watchpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The capability a module receives at `initialize` time, matching its kind.
pub enum InitContext<'a> {
    /// Load-time measurement over the guest's configuration artifacts.
    LoadTime(&'a GuestDescriptor),
    /// Runtime watchpoint installation over the debugger channel.
    Runtime(&'a mut DebuggerChannel),
}

/// A measurement plugin of the integrity monitor.
pub trait IntrospectionModule: Send {
    /// Module name, as used in configuration and criteria documents.
    fn name(&self) -> &'static str;

    /// The module's lifecycle kind.
    fn kind(&self) -> ModuleKind;

    /// Perform initial measurement. Static modules compute all measurements
    /// now and return no watchpoints; dynamic modules install watchpoints
    /// and return their descriptors.
    fn initialize(&mut self, ctx: InitContext<'_>) -> Result<Vec<Watchpoint>>;

    /// React to a watchpoint notification. The module must drain the
    /// event preamble from the channel, update its state, and report
    /// whether its observable state changed. Static modules keep the
    /// default.
    fn on_event(&mut self, _dbg: &mut DebuggerChannel) -> Result<bool> {
        Ok(false)
    }

    /// Whether the module's current state satisfies the criteria. Total;
    /// criteria with no section for this module pass vacuously.
    fn check(&self, criteria: &Criteria) -> bool;
}

/// A dynamic module shared between the monitor (`check`) and its watcher
/// (`on_event`).
pub(crate) type SharedModule = std::sync::Arc<std::sync::Mutex<Box<dyn IntrospectionModule>>>;

/// Constructor signature in the module table.
pub(crate) type ModuleCtor = fn(&Config) -> Result<Box<dyn IntrospectionModule>>;

static MODULES: phf::Map<&'static str, ModuleCtor> = phf::phf_map! {
    "FileHash" => file_hash::ctor as ModuleCtor,
    "EnforcingFlag" => enforcing_flag::ctor as ModuleCtor,
    "MeasurementList" => measurement_list::ctor as ModuleCtor,
    "Heartbeat" => heartbeat::ctor as ModuleCtor,
};

/// Resolve a configured module name to its constructor.
pub(crate) fn lookup(name: &str) -> Result<ModuleCtor> {
    MODULES
        .get(name)
        .copied()
        .ok_or_else(|| MonitorError::UnknownModule(name.to_string()))
}
