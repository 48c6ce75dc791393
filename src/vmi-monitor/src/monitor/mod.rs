//! The per-guest integrity monitor.
//!
//! One monitor coordinates everything the system knows about one guest: it
//! drives load-time measurement, launches the guest, starts the watcher,
//! and owns the client/criteria registry that ties watchpoint events back
//! to enforcement. Startup runs on a fire-and-forget worker thread so the
//! control facade's request returns promptly; the watcher reaches back into
//! the monitor only through the narrow [`TriggerSink`] interface, held as a
//! weak reference so the monitor's destruction never races a final event
//! dispatch.

pub(crate) mod metrics;
pub(crate) mod registry;

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{instrument, Level};

use crate::config::{Config, Criteria, GuestIdentity};
use crate::debugger::{DebuggerSpawner, InterruptHandle};
use crate::descriptor::GuestDescriptor;
use crate::error::{MonitorError, Result};
use crate::hypervisor::GuestDomain;
use crate::modules::{self, InitContext, ModuleKind, SharedModule};
use crate::monitor::metrics::{MonitorMetricsGuard, METRIC_KILLS, METRIC_REGISTRATIONS};
use crate::monitor::registry::ClientRegistry;
use crate::proxy::SessionProxy;
use crate::watcher::Watcher;

/// Lifecycle state of a monitor. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MonitorState {
    /// Constructed, startup not yet begun.
    Initializing,
    /// Static modules are measuring load-time artifacts.
    RegisteringStatic,
    /// Guest created; waiting for its kernel to reach stable addresses.
    GuestCreatedPausing,
    /// Watcher attached; the guest is under observation.
    Running,
    /// Guest destroyed, debugger detached, or startup failed.
    Destroyed,
}

impl MonitorState {
    /// Whether client registrations are currently accepted.
    pub fn is_running(self) -> bool {
        self == MonitorState::Running
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MonitorState::Initializing => "initializing",
            MonitorState::RegisteringStatic => "registering-static",
            MonitorState::GuestCreatedPausing => "guest-created-pausing",
            MonitorState::Running => "running",
            MonitorState::Destroyed => "destroyed",
        })
    }
}

/// Forward-only state cell: attempts to move backwards are ignored, so a
/// late `Running` can never resurrect a monitor the watcher already marked
/// `Destroyed`.
struct StateCell(Mutex<MonitorState>);

impl StateCell {
    fn new() -> Self {
        StateCell(Mutex::new(MonitorState::Initializing))
    }

    fn get(&self) -> MonitorState {
        *lock(&self.0)
    }

    fn advance(&self, to: MonitorState) -> bool {
        let mut state = lock(&self.0);
        let from = *state;
        if to > from {
            tracing::debug!(from = %from, to = %to, "monitor state advanced");
            *state = to;
            true
        } else {
            false
        }
    }
}

/// Lock a mutex, treating a poisoned lock as still usable: every critical
/// section here leaves the data consistent even if a panic unwinds it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The monitor-facing interface the watcher dispatches into.
///
/// Held by the watcher as a weak reference: the monitor owns its watcher's
/// lifetime, never the other way around.
pub(crate) trait TriggerSink: Send + Sync {
    /// A dynamic module reported a state change.
    fn on_module_changed(&self, module: &str);

    /// The watcher terminated (detach, channel failure, or guest death).
    fn on_watcher_exit(&self);
}

/// Status snapshot of one monitor, as reported to the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    /// Current lifecycle state.
    pub state: String,
    /// Accepted criteria keys and the client IPs registered under each.
    pub registrations: Vec<(String, Vec<String>)>,
    /// Names of the static modules.
    pub static_modules: Vec<String>,
    /// Names of the dynamic modules.
    pub dynamic_modules: Vec<String>,
}

/// Integrity monitor for one guest.
pub struct Monitor {
    identity: GuestIdentity,
    cfg: Arc<Config>,
    domain: Arc<dyn GuestDomain>,
    proxy: Arc<dyn SessionProxy>,
    spawner: Arc<dyn DebuggerSpawner>,
    state: StateCell,
    registry: Mutex<ClientRegistry>,
    statics: Mutex<Vec<Box<dyn modules::IntrospectionModule>>>,
    dynamics: Mutex<Vec<(String, SharedModule)>>,
    interrupt: Mutex<Option<Arc<dyn InterruptHandle>>>,
    startup_thread: Mutex<Option<JoinHandle<()>>>,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
    _metrics: MonitorMetricsGuard,
}

impl Monitor {
    /// Create the monitor and kick off its startup sequence on a worker
    /// thread. The returned monitor is `Initializing`; callers observe
    /// progress through [`Monitor::state`].
    pub(crate) fn launch(
        cfg: Arc<Config>,
        identity: GuestIdentity,
        domain: Arc<dyn GuestDomain>,
        proxy: Arc<dyn SessionProxy>,
        spawner: Arc<dyn DebuggerSpawner>,
    ) -> Arc<Monitor> {
        let monitor = Arc::new(Monitor {
            identity,
            cfg,
            domain,
            proxy,
            spawner,
            state: StateCell::new(),
            registry: Mutex::new(ClientRegistry::new()),
            statics: Mutex::new(Vec::new()),
            dynamics: Mutex::new(Vec::new()),
            interrupt: Mutex::new(None),
            startup_thread: Mutex::new(None),
            watcher_thread: Mutex::new(None),
            _metrics: MonitorMetricsGuard::new(),
        });

        let worker = Arc::clone(&monitor);
        let spawned = thread::Builder::new()
            .name(format!("vmi-startup-{}", monitor.identity.name))
            .spawn(move || {
                if let Err(e) = worker.startup() {
                    tracing::error!(
                        guest = worker.identity.name.as_str(),
                        error = %e,
                        "monitor startup failed"
                    );
                    worker.state.advance(MonitorState::Destroyed);
                }
            });
        match spawned {
            Ok(handle) => *lock(&monitor.startup_thread) = Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "cannot spawn monitor startup thread");
                monitor.state.advance(MonitorState::Destroyed);
            }
        }
        monitor
    }

    /// Startup sequence: static measurement, guest creation, symbol-
    /// stability pause, dynamic module construction, watcher launch.
    fn startup(self: &Arc<Self>) -> Result<()> {
        self.state.advance(MonitorState::RegisteringStatic);
        let descriptor = GuestDescriptor::parse(self.domain.xml_desc()?)?;

        let mut statics = Vec::with_capacity(self.cfg.monitor.static_modules.len());
        for name in &self.cfg.monitor.static_modules {
            let mut module = modules::lookup(name)?(&self.cfg)?;
            if module.kind() != ModuleKind::Static {
                return Err(MonitorError::Config(format!(
                    "module {name} cannot be registered as static"
                )));
            }
            module.initialize(InitContext::LoadTime(&descriptor))?;
            tracing::info!(guest = self.identity.name.as_str(), module = name.as_str(), "static module measured");
            statics.push(module);
        }
        *lock(&self.statics) = statics;

        self.domain.create()?;
        self.state.advance(MonitorState::GuestCreatedPausing);

        // Give the guest kernel time to load symbols at stable addresses
        // before the debugger attaches (and halts) it.
        thread::sleep(Duration::from_secs(self.cfg.monitor.pause));

        let mut dynamics: Vec<(String, SharedModule)> =
            Vec::with_capacity(self.cfg.monitor.dynamic_modules.len());
        for name in &self.cfg.monitor.dynamic_modules {
            let module = modules::lookup(name)?(&self.cfg)?;
            if module.kind() != ModuleKind::Dynamic {
                return Err(MonitorError::Config(format!(
                    "module {name} cannot be registered as dynamic"
                )));
            }
            dynamics.push((name.clone(), Arc::new(Mutex::new(module))));
        }
        *lock(&self.dynamics) = dynamics.clone();

        let dbg = self.spawner.spawn()?;
        *lock(&self.interrupt) = Some(dbg.interrupt_handle());

        let kernel_symbols = format!("{}.gdb", descriptor.kernel()?);
        let sink: Weak<dyn TriggerSink> = Arc::downgrade(self) as Weak<dyn TriggerSink>;
        let watcher = Watcher::new(
            dbg,
            self.identity.clone(),
            kernel_symbols,
            self.cfg.watcher.macros.display().to_string(),
            dynamics,
            sink,
        );
        *lock(&self.watcher_thread) = Some(watcher.spawn()?);

        self.state.advance(MonitorState::Running);
        tracing::info!(guest = self.identity.name.as_str(), "monitor running");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        self.state.get()
    }

    /// Status snapshot for the control surface.
    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            state: self.state.get().to_string(),
            registrations: lock(&self.registry).snapshot(),
            static_modules: lock(&self.statics)
                .iter()
                .map(|m| m.name().to_string())
                .collect(),
            dynamic_modules: lock(&self.dynamics)
                .iter()
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }

    /// Register a client: resolve its criteria file, evaluate the criteria
    /// against every module, and record the registration on success.
    ///
    /// Criteria already in force are not re-evaluated; the client is simply
    /// appended (idempotent on duplicates). A failed check returns
    /// `Ok(false)` and leaves no side effects.
    #[instrument(err(Debug), skip(self), level = Level::INFO, fields(guest = self.identity.name.as_str()))]
    pub fn register(&self, client: IpAddr) -> Result<bool> {
        let path = self.cfg.criteria_path(client).ok_or_else(|| {
            MonitorError::Config(format!("no criteria file configured for client {client}"))
        })?;
        let key = path.display().to_string();
        let path = path.to_path_buf();

        let mut reg = lock(&self.registry);
        if reg.has_key(&key) {
            // Previously accepted and still in force.
            reg.add_client(&key, client);
            tracing::info!(criteria = key.as_str(), "client joined accepted criteria");
            return Ok(true);
        }

        let criteria = Criteria::from_path(&path)?;
        if self.check(&criteria) {
            reg.insert(key.clone(), criteria, client);
            ::metrics::counter!(METRIC_REGISTRATIONS).increment(1);
            tracing::info!(criteria = key.as_str(), "client registered");
            Ok(true)
        } else {
            tracing::info!(criteria = key.as_str(), "client criteria rejected");
            Ok(false)
        }
    }

    /// Unregister a client. Returns `Ok(false)` if the client's key is
    /// unknown or the client is not listed under it.
    #[instrument(err(Debug), skip(self), level = Level::INFO, fields(guest = self.identity.name.as_str()))]
    pub fn unregister(&self, client: IpAddr) -> Result<bool> {
        let Some(path) = self.cfg.criteria_path(client) else {
            return Ok(false);
        };
        let key = path.display().to_string();
        Ok(lock(&self.registry).remove_client(&key, client))
    }

    /// Evaluate criteria against every static and dynamic module.
    fn check(&self, criteria: &Criteria) -> bool {
        for module in lock(&self.statics).iter() {
            if !module.check(criteria) {
                tracing::debug!(module = module.name(), "criteria rejected");
                return false;
            }
        }
        for (name, module) in lock(&self.dynamics).iter() {
            if !lock(module).check(criteria) {
                tracing::debug!(module = name.as_str(), "criteria rejected");
                return false;
            }
        }
        true
    }

    /// Re-evaluate every accepted criteria against the named dynamic
    /// module; criteria that no longer hold are retired and every client
    /// registered under them is severed.
    #[instrument(skip(self), level = Level::INFO, fields(guest = self.identity.name.as_str()))]
    pub(crate) fn trigger(&self, module: &str) {
        let found = {
            let dynamics = lock(&self.dynamics);
            dynamics
                .iter()
                .find(|(name, _)| name == module)
                .map(|(_, m)| Arc::clone(m))
        };
        let Some(changed) = found else {
            tracing::warn!(module, "trigger for unknown dynamic module");
            return;
        };

        let mut reg = lock(&self.registry);
        let failed: Vec<String> = reg
            .criteria_entries()
            .filter(|(_, criteria)| !lock(&changed).check(criteria))
            .map(|(key, _)| key.clone())
            .collect();

        for key in failed {
            tracing::warn!(
                criteria = key.as_str(),
                module,
                "integrity regression, severing registered clients"
            );
            for client in reg.remove_key(&key) {
                self.proxy.kill(client, self.identity.ip);
                ::metrics::counter!(METRIC_KILLS).increment(1);
            }
        }
    }

    /// Destroy the guest, then sever every remaining registration.
    #[instrument(err(Debug), skip(self), level = Level::INFO, fields(guest = self.identity.name.as_str()))]
    pub fn destroy(&self) -> Result<()> {
        self.domain.destroy()?;

        for (key, clients) in lock(&self.registry).drain() {
            for client in clients {
                tracing::info!(criteria = key.as_str(), client = %client, "severing client of destroyed guest");
                self.proxy.kill(client, self.identity.ip);
                ::metrics::counter!(METRIC_KILLS).increment(1);
            }
        }

        self.state.advance(MonitorState::Destroyed);
        Ok(())
    }

    /// Interrupt the debugger so the watcher detaches cleanly. The watcher
    /// observes the interrupt marker, issues the debugger's `detach`, and
    /// exits; this monitor then reads `destroyed`.
    #[instrument(err(Debug), skip(self), level = Level::INFO, fields(guest = self.identity.name.as_str()))]
    pub fn detach(&self) -> Result<()> {
        let guard = lock(&self.interrupt);
        let handle = guard.as_ref().ok_or(MonitorError::NotAttached)?;
        handle.interrupt()?;
        Ok(())
    }
}

impl TriggerSink for Monitor {
    fn on_module_changed(&self, module: &str) {
        self.trigger(module);
    }

    fn on_watcher_exit(&self) {
        if self.state.advance(MonitorState::Destroyed) {
            tracing::info!(guest = self.identity.name.as_str(), "watcher exited, monitor destroyed");
        }
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("guest", &self.identity.name)
            .field("state", &self.state.get())
            .field("startup_spawned", &lock(&self.startup_thread).is_some())
            .field("watcher_spawned", &lock(&self.watcher_thread).is_some())
            .finish()
    }
}
