//! This crate attests the runtime integrity of guest virtual machines on
//! behalf of remote clients. A client registers a set of integrity criteria
//! for a guest; the monitor accepts or rejects the registration based on
//! whether the guest currently satisfies them, and severs active client
//! sessions whenever a previously-satisfied guest later violates them.
//! Evidence comes from static load-time measurements of guest configuration
//! artifacts and from dynamic runtime measurements observed through a
//! kernel debugger attached to the running guest.
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod config;
mod controller;
/// The line-oriented channel to the external kernel debugger.
pub mod debugger;
mod descriptor;
mod error;
mod hypervisor;
/// Introspection modules: the measurement plugins of the monitor.
pub mod modules;
mod monitor;
mod proxy;
mod watcher;

/// The main monitor configuration document.
pub use config::Config;
/// The integrity conditions one client requires of a guest.
pub use config::Criteria;
/// A guest's name, IP, and debugger port.
pub use config::GuestIdentity;
/// Builder for a [`VmController`].
pub use controller::ControllerBuilder;
/// Reply to a `status` request: monitor status or an explanation.
pub use controller::StatusReply;
/// Process-wide registry of guest monitors and control entry points.
pub use controller::VmController;
/// Line-oriented request/response channel to a kernel debugger.
pub use debugger::DebuggerChannel;
/// Spawns debugger processes for new monitors.
pub use debugger::DebuggerSpawner;
/// Spawner for the external `gdb` binary.
pub use debugger::GdbSpawner;
/// A handle capable of interrupting the debugger out of band.
pub use debugger::InterruptHandle;
/// One end of a line-oriented debugger conversation.
pub use debugger::Transport;
/// A guest's XML descriptor and its element-path selectors.
pub use descriptor::GuestDescriptor;
/// The error type for monitor operations.
pub use error::MonitorError;
/// The result of a monitor operation.
pub use error::Result;
/// One guest under hypervisor management.
pub use hypervisor::GuestDomain;
/// Process-wide hypervisor connection.
pub use hypervisor::Hypervisor;
/// The capability a module receives at initialize time.
pub use modules::InitContext;
/// A measurement plugin of the integrity monitor.
pub use modules::IntrospectionModule;
/// Whether a module measures at load time or at run time.
pub use modules::ModuleKind;
/// An opaque watchpoint descriptor issued by the debugger.
pub use modules::Watchpoint;
/// Integrity monitor for one guest.
pub use monitor::Monitor;
/// Lifecycle state of a monitor.
pub use monitor::MonitorState;
/// Status snapshot of one monitor.
pub use monitor::MonitorStatus;
/// Severs client↔guest sessions on enforcement.
pub use proxy::SessionProxy;
