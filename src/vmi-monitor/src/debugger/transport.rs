//! Process transport for the debugger channel.
//!
//! [`Transport`] seals the process boundary: the channel logic (framing,
//! reply draining, marker writes) is independent of whether lines come from
//! a live debugger child or a scripted test double. [`GdbTransport`] is the
//! production implementation, wrapping a spawned debugger process with piped
//! stdin/stdout.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

/// A handle capable of interrupting the debugger out of band.
///
/// The watcher owns the channel and blocks in `read_line`; the monitor's
/// `detach` path delivers the interrupt through this handle instead. The
/// debugger reacts by stopping the target and printing its interrupt
/// marker, which the watcher observes as an ordinary input line.
pub trait InterruptHandle: Send + Sync {
    /// Deliver the interrupt.
    fn interrupt(&self) -> io::Result<()>;
}

/// One end of a line-oriented debugger conversation.
pub trait Transport: Send {
    /// Write one request line (the newline is appended here).
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Block until one response line arrives. Returns `Err` on EOF.
    fn read_line(&mut self) -> io::Result<String>;

    /// A handle that can interrupt the debugger while another thread owns
    /// this transport.
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;
}

/// Transport over a spawned `gdb` child process.
pub struct GdbTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl GdbTransport {
    /// Spawn the debugger binary with quiet startup and piped stdio.
    pub fn spawn(program: &str) -> io::Result<Self> {
        let mut child = Command::new(program)
            .arg("-q")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::other("debugger child has no stdin pipe")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::other("debugger child has no stdout pipe")
        })?;
        Ok(GdbTransport {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl Transport for GdbTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "debugger closed its output",
            ));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        Arc::new(ProcessInterrupt {
            pid: self.child.id(),
        })
    }
}

impl Drop for GdbTransport {
    fn drop(&mut self) {
        // Reap the child so a detached debugger does not linger as a zombie.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct ProcessInterrupt {
    pid: u32,
}

impl InterruptHandle for ProcessInterrupt {
    #[cfg(unix)]
    fn interrupt(&self) -> io::Result<()> {
        // SIGINT stops the target and returns the debugger to its prompt.
        match unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGINT) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> io::Result<()> {
        Err(io::Error::other(
            "debugger interrupt is only supported on unix hosts",
        ))
    }
}
