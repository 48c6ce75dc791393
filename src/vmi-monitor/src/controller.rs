//! The process-wide control facade: one monitor per managed guest, plus the
//! entry points the control surface calls.
//!
//! All operations are synchronous except `start`, whose heavy work runs on
//! the monitor's own startup thread. Guests running outside the facade's
//! management are detected by asking the hypervisor and reported, never
//! touched — with the single exception of `force_stop`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{instrument, Level};

use crate::config::Config;
use crate::debugger::{DebuggerSpawner, GdbSpawner};
use crate::error::{MonitorError, Result};
use crate::hypervisor::Hypervisor;
use crate::monitor::{lock, Monitor, MonitorState, MonitorStatus};
use crate::proxy::SessionProxy;

/// Reply to a `status` request.
#[derive(Debug, Clone, Serialize)]
pub enum StatusReply {
    /// The guest is managed; full monitor status.
    Monitor(MonitorStatus),
    /// The guest is not managed; a human-readable explanation.
    Message(String),
}

#[derive(Default)]
struct MonitorTable {
    by_name: HashMap<String, Arc<Monitor>>,
    by_ip: HashMap<IpAddr, Arc<Monitor>>,
}

impl MonitorTable {
    fn insert(&mut self, name: String, ip: IpAddr, monitor: Arc<Monitor>) {
        self.by_name.insert(name, Arc::clone(&monitor));
        self.by_ip.insert(ip, monitor);
    }

    fn remove(&mut self, name: &str) {
        if self.by_name.remove(name).is_some() {
            self.by_ip.retain(|_, m| {
                self.by_name
                    .values()
                    .any(|kept| Arc::ptr_eq(kept, m))
            });
        }
    }
}

/// Builder for a [`VmController`].
///
/// The hypervisor and session-proxy collaborators must be supplied; the
/// debugger spawner defaults to the `gdb` binary named in `[watcher]`.
pub struct ControllerBuilder {
    config: Option<Config>,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    proxy: Option<Arc<dyn SessionProxy>>,
    spawner: Option<Arc<dyn DebuggerSpawner>>,
}

impl ControllerBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        ControllerBuilder {
            config: None,
            hypervisor: None,
            proxy: None,
            spawner: None,
        }
    }

    /// Set the parsed configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the hypervisor collaborator.
    pub fn with_hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    /// Set the network-proxy collaborator.
    pub fn with_session_proxy(mut self, proxy: Arc<dyn SessionProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Override the debugger spawner (tests substitute a scripted one).
    pub fn with_debugger_spawner(mut self, spawner: Arc<dyn DebuggerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Build the controller.
    pub fn build(self) -> Result<VmController> {
        let config = self
            .config
            .ok_or_else(|| MonitorError::Config("controller needs a configuration".into()))?;
        let hypervisor = self
            .hypervisor
            .ok_or_else(|| MonitorError::Config("controller needs a hypervisor".into()))?;
        let proxy = self
            .proxy
            .ok_or_else(|| MonitorError::Config("controller needs a session proxy".into()))?;
        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(GdbSpawner::new(config.watcher.gdb.clone())));

        Ok(VmController {
            cfg: Arc::new(config),
            hypervisor,
            proxy,
            spawner,
            table: Mutex::new(MonitorTable::default()),
        })
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry of guest monitors and control entry points.
pub struct VmController {
    cfg: Arc<Config>,
    hypervisor: Arc<dyn Hypervisor>,
    proxy: Arc<dyn SessionProxy>,
    spawner: Arc<dyn DebuggerSpawner>,
    table: Mutex<MonitorTable>,
}

impl VmController {
    /// Start a monitor for a guest. Returns promptly; the monitor's startup
    /// sequence (static measurement, guest creation, watcher attach) runs
    /// on its own thread.
    ///
    /// Duplicate starts are rejected, as are guests already running outside
    /// this facade's management. A monitor whose watcher has died is reaped
    /// here and the start proceeds.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn start(&self, name: &str) -> Result<String> {
        let mut table = lock(&self.table);
        let stale = match table.by_name.get(name) {
            Some(existing) if existing.state() != MonitorState::Destroyed => {
                return Ok(format!("{name} is already active."));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            // Dead monitor left behind by a watcher failure; reap it.
            table.remove(name);
        }

        let domain = self.hypervisor.lookup_by_name(name)?;
        if domain.is_active()? {
            return Ok(format!("{name} is running unmanaged."));
        }

        let identity = self.cfg.domain(name)?.clone();
        let ip = identity.ip;
        let monitor = Monitor::launch(
            Arc::clone(&self.cfg),
            identity,
            domain,
            Arc::clone(&self.proxy),
            Arc::clone(&self.spawner),
        );
        table.insert(name.to_string(), ip, monitor);
        Ok(format!("{name} is starting."))
    }

    /// Stop a managed guest: destroy it, sever its remaining registrations,
    /// and forget its monitor. For unmanaged guests, reports their state
    /// without touching them.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn stop(&self, name: &str) -> Result<String> {
        let mut table = lock(&self.table);
        match table.by_name.get(name).cloned() {
            Some(monitor) => {
                monitor.destroy()?;
                table.remove(name);
                Ok(format!("{name} destroyed."))
            }
            None => self.unmanaged_message(name),
        }
    }

    /// Like [`stop`](Self::stop), but an unmanaged active guest is
    /// destroyed as well.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn force_stop(&self, name: &str) -> Result<String> {
        let mut table = lock(&self.table);
        match table.by_name.get(name).cloned() {
            Some(monitor) => {
                monitor.destroy()?;
                table.remove(name);
                Ok(format!("{name} destroyed."))
            }
            None => {
                let domain = self.hypervisor.lookup_by_name(name)?;
                if domain.is_active()? {
                    domain.destroy()?;
                    Ok(format!("{name} destroyed."))
                } else {
                    Ok(format!("{name} is not running."))
                }
            }
        }
    }

    /// Sever the debugger from a managed guest and forget its monitor. The
    /// guest keeps running unobserved.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn detach(&self, name: &str) -> Result<String> {
        let mut table = lock(&self.table);
        match table.by_name.get(name).cloned() {
            Some(monitor) => {
                monitor.detach()?;
                table.remove(name);
                Ok(format!("debugger detached from {name}."))
            }
            None => self.unmanaged_message(name),
        }
    }

    /// Status of a guest: full monitor status when managed, a message
    /// otherwise.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn status(&self, name: &str) -> Result<StatusReply> {
        let monitor = lock(&self.table).by_name.get(name).cloned();
        match monitor {
            Some(monitor) => Ok(StatusReply::Monitor(monitor.status())),
            None => self.unmanaged_message(name).map(StatusReply::Message),
        }
    }

    /// Register a client's criteria for a connection to a guest. Returns
    /// whether the criteria are satisfied; any error rejects.
    #[instrument(skip(self), level = Level::INFO)]
    pub fn connect(&self, client: IpAddr, guest: IpAddr) -> bool {
        let Some(monitor) = lock(&self.table).by_ip.get(&guest).cloned() else {
            return false;
        };
        if !monitor.state().is_running() {
            return false;
        }
        monitor.register(client).unwrap_or_else(|e| {
            tracing::warn!(client = %client, guest = %guest, error = %e, "registration failed");
            false
        })
    }

    /// Unregister a client's criteria for a connection to a guest.
    #[instrument(skip(self), level = Level::INFO)]
    pub fn disconnect(&self, client: IpAddr, guest: IpAddr) -> bool {
        let Some(monitor) = lock(&self.table).by_ip.get(&guest).cloned() else {
            return false;
        };
        if !monitor.state().is_running() {
            return false;
        }
        monitor.unregister(client).unwrap_or_else(|e| {
            tracing::warn!(client = %client, guest = %guest, error = %e, "unregistration failed");
            false
        })
    }

    fn unmanaged_message(&self, name: &str) -> Result<String> {
        let domain = self.hypervisor.lookup_by_name(name)?;
        if domain.is_active()? {
            Ok(format!("{name} is running unmanaged."))
        } else {
            Ok(format!("{name} is not running."))
        }
    }
}
