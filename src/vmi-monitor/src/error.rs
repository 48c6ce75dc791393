use std::io;

use thiserror::Error;

/// Errors produced by the integrity monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Missing section, malformed option, or an otherwise unusable
    /// configuration document. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configured module name has no registered constructor.
    #[error("unknown introspection module: {0}")]
    UnknownModule(String),

    /// Two modules of one monitor registered the same watchpoint descriptor.
    #[error("duplicate watchpoint descriptor: {0}")]
    DuplicateWatchpoint(String),

    /// The hypervisor rejected a lookup, create, or destroy. The message is
    /// surfaced to the control caller verbatim.
    #[error("{0}")]
    Hypervisor(String),

    /// I/O failure on the debugger channel. Terminates the watcher.
    #[error("debugger channel error: {0}")]
    Debugger(#[from] io::Error),

    /// The debugger printed something other than the expected reply shape.
    #[error("malformed debugger reply: {0:?}")]
    Reply(String),

    /// The guest descriptor could not be parsed or a selector did not resolve.
    #[error("guest descriptor error: {0}")]
    Descriptor(String),

    /// A criteria document could not be read or parsed.
    #[error("criteria error: {0}")]
    Criteria(String),

    /// The monitor has no attached debugger to interrupt.
    #[error("no debugger attached")]
    NotAttached,
}

impl From<toml::de::Error> for MonitorError {
    fn from(e: toml::de::Error) -> Self {
        MonitorError::Config(e.message().to_string())
    }
}

/// The result of a monitor operation.
pub type Result<T> = std::result::Result<T, MonitorError>;
