//! The debugger channel: a line-oriented request/response wrapper around an
//! external kernel debugger.
//!
//! The debugger's output is deterministic per command, so the channel frames
//! replies by count: each command in [`cmds`] is paired with the number of
//! lines the debugger prints in response, and `command` drains exactly that
//! many. Asynchronous watchpoint notifications arrive between commands and
//! are picked up by the watcher through [`DebuggerChannel::read_line`].
//!
//! The channel is single-reader and single-writer; the watcher serializes
//! all access. A best-effort marker is written to the kernel trace buffer on
//! every event wake-up so debugger latency can be correlated against kernel
//! traces; marker failures are swallowed.

pub(crate) mod transport;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use crate::error::{MonitorError, Result};

pub use transport::{GdbTransport, InterruptHandle, Transport};

/// Expected reply-line counts for the command vocabulary, kept with the
/// commands rather than scattered at call sites.
pub mod cmds {
    /// `file <path>` — load kernel symbols; one banner line.
    pub const FILE_REPLY_LINES: usize = 1;
    /// `source <path>` — load the macro file; silent.
    pub const SOURCE_REPLY_LINES: usize = 0;
    /// `target extended-remote 127.0.0.1:<port>` — attach and halt the
    /// guest; three lines of connection banner.
    pub const TARGET_REMOTE_REPLY_LINES: usize = 3;
    /// `watch <expression>` — one line naming the new watchpoint. The
    /// reply line is the watchpoint descriptor: it reappears verbatim in
    /// every notification for that watchpoint.
    pub const WATCH_REPLY_LINES: usize = 1;
    /// `continue` — one line, then the guest runs.
    pub const CONTINUE_REPLY_LINES: usize = 1;
    /// `detach` — silent.
    pub const DETACH_REPLY_LINES: usize = 0;
    /// Guest macros (`get_selinux_enforcing`, `print_mlist`, `last_hash`)
    /// print a single `$N = <value>` line.
    pub const MACRO_REPLY_LINES: usize = 1;
    /// Lines of context the debugger prints after a watchpoint notification
    /// (old/new value, frame, source line). Drained by module callbacks.
    pub const EVENT_PREAMBLE_LINES: usize = 5;
    /// Substring of the line the debugger prints when interrupted out of
    /// band; the watcher treats it as the detach request marker.
    pub const INTERRUPT_MARKER: &str = "SIGINT";
}

const TRACE_MARKER_PATH: &str = "/sys/kernel/debug/tracing/trace_marker";
const TRACE_MARKER_TAG: &str = "vmi-event";

/// Extract the value from a `$N = <value>` reply line.
pub fn reply_value(line: &str) -> Result<&str> {
    line.split_once('=')
        .map(|(_, v)| v.trim())
        .ok_or_else(|| MonitorError::Reply(line.to_string()))
}

/// Line-oriented request/response channel to a kernel debugger.
pub struct DebuggerChannel {
    transport: Box<dyn Transport>,
    marker: Option<File>,
}

impl DebuggerChannel {
    /// Wrap a transport. The kernel trace-marker sink is opened best-effort.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let marker = OpenOptions::new().write(true).open(TRACE_MARKER_PATH).ok();
        DebuggerChannel { transport, marker }
    }

    /// Send one command and drain exactly `reply_lines` response lines.
    pub fn command(&mut self, line: &str, reply_lines: usize) -> Result<Vec<String>> {
        tracing::trace!(command = line, reply_lines, "debugger command");
        self.transport.write_line(line)?;
        self.drain(reply_lines)
    }

    /// Block until one line arrives. Used by the watcher to receive
    /// asynchronous watchpoint notifications.
    pub fn read_line(&mut self) -> Result<String> {
        let line = self.transport.read_line()?;
        self.write_marker();
        Ok(line)
    }

    /// Clear `n` lines from the channel.
    pub fn drain(&mut self, n: usize) -> Result<Vec<String>> {
        let mut lines = Vec::with_capacity(n);
        for _ in 0..n {
            lines.push(self.transport.read_line()?);
        }
        Ok(lines)
    }

    /// A handle that can interrupt the debugger from another thread.
    pub fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        self.transport.interrupt_handle()
    }

    /// Interrupt the debugger on the calling thread.
    pub fn interrupt(&self) -> Result<()> {
        Ok(self.interrupt_handle().interrupt()?)
    }

    // Correlation point for kernel-trace timing; failures are swallowed.
    fn write_marker(&mut self) {
        if let Some(marker) = &mut self.marker {
            let _ = writeln!(marker, "{TRACE_MARKER_TAG}");
            let _ = marker.flush();
        }
    }
}

/// Spawns the debugger process behind a fresh [`DebuggerChannel`].
///
/// The watcher owns the channel it is given; one spawner serves every
/// monitor the controller starts.
pub trait DebuggerSpawner: Send + Sync {
    /// Spawn a new debugger and wrap it in a channel.
    fn spawn(&self) -> Result<DebuggerChannel>;
}

/// Spawner for the external `gdb` binary configured in `[watcher]`.
pub struct GdbSpawner {
    program: String,
}

impl GdbSpawner {
    /// Spawner for the given debugger binary.
    pub fn new(program: impl Into<String>) -> Self {
        GdbSpawner {
            program: program.into(),
        }
    }
}

impl DebuggerSpawner for GdbSpawner {
    fn spawn(&self) -> Result<DebuggerChannel> {
        let transport = GdbTransport::spawn(&self.program)?;
        Ok(DebuggerChannel::new(Box::new(transport)))
    }
}
