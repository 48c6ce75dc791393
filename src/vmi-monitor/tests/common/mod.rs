//! Test doubles shared by the integration tests: a scripted debugger, a
//! fake hypervisor, and a session proxy that records kills.

pub mod fixture;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vmi_monitor::{
    DebuggerChannel, DebuggerSpawner, GuestDomain, Hypervisor, InterruptHandle, MonitorError,
    Result, SessionProxy, Transport,
};

// ---------------------------------------------------------------------------
// Scripted debugger

struct DebuggerState {
    tx: Mutex<Option<Sender<String>>>,
    replies: Mutex<HashMap<String, VecDeque<Vec<String>>>>,
    commands: Mutex<Vec<String>>,
    watch_counter: AtomicUsize,
}

impl DebuggerState {
    fn new() -> Self {
        DebuggerState {
            tx: Mutex::new(None),
            replies: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            watch_counter: AtomicUsize::new(2),
        }
    }

    fn push(&self, line: &str) {
        if let Some(tx) = &*self.tx.lock().unwrap() {
            let _ = tx.send(line.to_string());
        }
    }

    /// Record a command and emit its reply lines: a scripted override if
    /// one is queued, otherwise a gdb-shaped default.
    fn dispatch(&self, cmd: &str) {
        self.commands.lock().unwrap().push(cmd.to_string());

        let scripted = self
            .replies
            .lock()
            .unwrap()
            .get_mut(cmd)
            .and_then(VecDeque::pop_front);
        if let Some(lines) = scripted {
            for line in lines {
                self.push(&line);
            }
            return;
        }

        if cmd.starts_with("file ") {
            self.push("Reading symbols from kernel...done.");
        } else if cmd.starts_with("target ") {
            self.push("Remote debugging using 127.0.0.1");
            self.push("0x0000000000000000 in ?? ()");
            self.push("warning: shared library handling");
        } else if let Some(expr) = cmd.strip_prefix("watch ") {
            let n = self.watch_counter.fetch_add(1, Ordering::SeqCst);
            self.push(&format!("Hardware watchpoint {n}: {expr}"));
        } else if cmd == "continue" {
            self.push("Continuing.");
        } else if cmd == "get_selinux_enforcing" {
            self.push("$1 = 1");
        } else if cmd == "print_mlist" {
            self.push("$1 = 0");
        } else if cmd == "last_hash" {
            self.push(&format!("$1 = {}", "0".repeat(40)));
        }
        // `source` and `detach` are silent.
    }
}

struct FakeTransport {
    state: Arc<DebuggerState>,
    rx: Receiver<String>,
}

impl Transport for FakeTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.state.dispatch(line);
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<String> {
        self.rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "debugger closed"))
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        Arc::new(FakeInterrupt {
            state: self.state.clone(),
        })
    }
}

struct FakeInterrupt {
    state: Arc<DebuggerState>,
}

impl InterruptHandle for FakeInterrupt {
    fn interrupt(&self) -> io::Result<()> {
        self.state.push("Program received signal SIGINT, Interrupt.");
        Ok(())
    }
}

/// Test-side handle to one scripted debugger.
#[derive(Clone)]
pub struct DebuggerHandle {
    state: Arc<DebuggerState>,
}

#[allow(dead_code)]
impl DebuggerHandle {
    /// Queue an override reply for one occurrence of `cmd`.
    pub fn set_reply(&self, cmd: &str, lines: &[&str]) {
        self.state
            .replies
            .lock()
            .unwrap()
            .entry(cmd.to_string())
            .or_default()
            .push_back(lines.iter().map(|s| s.to_string()).collect());
    }

    /// Deliver a watchpoint notification: the descriptor line followed by
    /// the five-line preamble the debugger prints after every hit.
    pub fn inject_event(&self, descriptor_line: &str) {
        self.state.push(descriptor_line);
        self.state.push("");
        self.state.push("Old value = 1");
        self.state.push("New value = 0");
        self.state.push("handler () at kernel/source.c:42");
        self.state.push("42\t\t/* updated */");
    }

    /// Everything the monitor has written to this debugger so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Simulate the debugger process dying: the watcher's next read fails.
    pub fn close(&self) {
        *self.state.tx.lock().unwrap() = None;
    }
}

/// Spawner handing out scripted debuggers.
pub struct FakeSpawner {
    pending: Mutex<VecDeque<Arc<DebuggerState>>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeSpawner {
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Pre-create the next debugger this spawner will produce, so tests can
    /// script replies before the monitor starts.
    pub fn next_handle(&self) -> DebuggerHandle {
        let state = Arc::new(DebuggerState::new());
        self.pending.lock().unwrap().push_back(state.clone());
        DebuggerHandle { state }
    }
}

impl DebuggerSpawner for FakeSpawner {
    fn spawn(&self) -> Result<DebuggerChannel> {
        let state = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Arc::new(DebuggerState::new()));
        let (tx, rx) = channel();
        *state.tx.lock().unwrap() = Some(tx);
        Ok(DebuggerChannel::new(Box::new(FakeTransport { state, rx })))
    }
}

// ---------------------------------------------------------------------------
// Fake hypervisor

pub struct FakeDomain {
    xml: String,
    active: AtomicBool,
    destroys: AtomicUsize,
}

#[allow(dead_code)]
impl FakeDomain {
    pub fn new(xml: String) -> Arc<Self> {
        Arc::new(FakeDomain {
            xml,
            active: AtomicBool::new(false),
            destroys: AtomicUsize::new(0),
        })
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

impl GuestDomain for FakeDomain {
    fn is_active(&self) -> Result<bool> {
        Ok(self.active())
    }

    fn create(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(MonitorError::Hypervisor(
                "Requested operation is not valid: domain is not running".to_string(),
            ));
        }
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn xml_desc(&self) -> Result<String> {
        Ok(self.xml.clone())
    }
}

pub struct FakeHypervisor {
    domains: Mutex<HashMap<String, Arc<FakeDomain>>>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeHypervisor {
            domains: Mutex::new(HashMap::new()),
        })
    }

    pub fn define(&self, name: &str, domain: Arc<FakeDomain>) {
        self.domains.lock().unwrap().insert(name.to_string(), domain);
    }
}

impl Hypervisor for FakeHypervisor {
    fn lookup_by_name(&self, name: &str) -> Result<Arc<dyn GuestDomain>> {
        let domain = self
            .domains
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                MonitorError::Hypervisor(format!("Domain not found: no domain with matching name '{name}'"))
            })?;
        Ok(domain)
    }
}

// ---------------------------------------------------------------------------
// Recording session proxy

pub struct RecordingProxy {
    kills: Mutex<Vec<(IpAddr, IpAddr)>>,
}

impl RecordingProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingProxy {
            kills: Mutex::new(Vec::new()),
        })
    }

    pub fn kills(&self) -> Vec<(IpAddr, IpAddr)> {
        self.kills.lock().unwrap().clone()
    }
}

impl SessionProxy for RecordingProxy {
    fn kill(&self, client: IpAddr, guest: IpAddr) {
        self.kills.lock().unwrap().push((client, guest));
    }
}

// ---------------------------------------------------------------------------
// Helpers

/// Poll `pred` until it holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[allow(dead_code)]
pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}
