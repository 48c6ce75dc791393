//! Configuration documents: the main monitor configuration and per-client
//! criteria files.
//!
//! Both use the same TOML shape — a table per concern, string options inside.
//! The main configuration carries the process-wide sections (`[vmserver]`,
//! `[monitor]`, `[domains]`, `[clients]`, `[watcher]`) plus one table per
//! introspection module whose options configure that module. A criteria file
//! carries one table per module naming the conditions a client requires; a
//! module with no table passes vacuously.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{MonitorError, Result};

/// A guest under monitor management: its name, IP, and debugger port.
///
/// Parsed from the `[domains]` table, one option per guest name with the
/// value `"<ip> <debugger-port>"`. The name↔IP mapping is fixed
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIdentity {
    /// Guest name as known to the hypervisor.
    pub name: String,
    /// Guest IP, the key clients connect to.
    pub ip: IpAddr,
    /// Local port the guest's debugger stub listens on.
    pub debugger_port: u16,
}

impl GuestIdentity {
    fn parse(name: &str, value: &str) -> Result<Self> {
        let mut words = value.split_whitespace();
        let (Some(ip), Some(port), None) = (words.next(), words.next(), words.next()) else {
            return Err(MonitorError::Config(format!(
                "domain {name}: expected \"<ip> <debugger-port>\", got {value:?}"
            )));
        };
        Ok(GuestIdentity {
            name: name.to_string(),
            ip: ip
                .parse()
                .map_err(|e| MonitorError::Config(format!("domain {name}: bad ip {ip:?}: {e}")))?,
            debugger_port: port.parse().map_err(|e| {
                MonitorError::Config(format!("domain {name}: bad debugger port {port:?}: {e}"))
            })?,
        })
    }
}

/// The `[vmserver]` section: control endpoint and network-proxy address.
#[derive(Debug, Clone, Deserialize)]
pub struct VmServerConfig {
    /// Host the control surface binds to.
    pub host: String,
    /// Port the control surface binds to.
    pub port: u16,
    /// Endpoint of the network-proxy collaborator that severs client
    /// sessions on enforcement.
    pub netproxy: String,
}

/// The `[monitor]` section: which modules to run and the startup pause.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    /// Static (load-time) module names, in registration order.
    #[serde(rename = "static")]
    pub static_modules: Vec<String>,
    /// Dynamic (watchpoint-driven) module names, in registration order.
    #[serde(rename = "dynamic")]
    pub dynamic_modules: Vec<String>,
    /// Seconds to wait between guest creation and debugger attach, giving
    /// the guest kernel time to load symbols at stable addresses.
    pub pause: u64,
}

/// The `[watcher]` section: debugger binary and macro file.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSection {
    /// Debugger binary to spawn.
    #[serde(default = "default_gdb")]
    pub gdb: String,
    /// Path to the debugger macro file sourced at attach time.
    pub macros: PathBuf,
}

fn default_gdb() -> String {
    "gdb".to_string()
}

#[derive(Deserialize)]
struct RawConfig {
    vmserver: VmServerConfig,
    monitor: MonitorSection,
    domains: HashMap<String, String>,
    clients: HashMap<String, String>,
    watcher: WatcherSection,
    #[serde(flatten)]
    modules: toml::Table,
}

/// The main monitor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control surface and network-proxy endpoints.
    pub vmserver: VmServerConfig,
    /// Module selection and startup pause.
    pub monitor: MonitorSection,
    /// Debugger spawn settings.
    pub watcher: WatcherSection,
    domains: HashMap<String, GuestIdentity>,
    clients: HashMap<IpAddr, PathBuf>,
    modules: toml::Table,
}

impl Config {
    /// Parse a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)?;

        let mut domains = HashMap::new();
        for (name, value) in &raw.domains {
            domains.insert(name.clone(), GuestIdentity::parse(name, value)?);
        }

        let mut clients = HashMap::new();
        for (ip, path) in &raw.clients {
            let ip: IpAddr = ip
                .parse()
                .map_err(|e| MonitorError::Config(format!("client {ip:?}: bad ip: {e}")))?;
            clients.insert(ip, PathBuf::from(path));
        }

        Ok(Config {
            vmserver: raw.vmserver,
            monitor: raw.monitor,
            watcher: raw.watcher,
            domains,
            clients,
            modules: raw.modules,
        })
    }

    /// Load and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            MonitorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Identity of a configured guest.
    pub fn domain(&self, name: &str) -> Result<&GuestIdentity> {
        self.domains
            .get(name)
            .ok_or_else(|| MonitorError::Config(format!("domain {name} is not configured")))
    }

    /// The criteria-file key configured for a client IP, if any.
    pub fn criteria_path(&self, client: IpAddr) -> Option<&Path> {
        self.clients.get(&client).map(PathBuf::as_path)
    }

    /// The configuration table for one module, if present.
    pub fn module_section(&self, module: &str) -> Option<&toml::Table> {
        self.modules.get(module).and_then(toml::Value::as_table)
    }

    /// A single string option from a module's configuration table.
    pub fn module_option(&self, module: &str, option: &str) -> Option<&str> {
        self.module_section(module)?
            .get(option)
            .and_then(toml::Value::as_str)
    }
}

/// The integrity conditions one client requires, keyed by module name and
/// then option name.
///
/// Criteria documents use the same table/option shape as the main
/// configuration. A module with no table in the document passes vacuously.
#[derive(Debug, Clone)]
pub struct Criteria {
    sections: toml::Table,
}

impl Criteria {
    /// Parse a criteria document.
    pub fn parse(text: &str) -> Result<Self> {
        let sections: toml::Table = toml::from_str(text)
            .map_err(|e| MonitorError::Criteria(e.message().to_string()))?;
        Ok(Criteria { sections })
    }

    /// Load and parse a criteria file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            MonitorError::Criteria(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Whether the document names the given module at all.
    pub fn has_section(&self, module: &str) -> bool {
        self.section(module).is_some()
    }

    /// The conditions named for one module, if any.
    pub fn section(&self, module: &str) -> Option<&toml::Table> {
        self.sections.get(module).and_then(toml::Value::as_table)
    }

    /// A single expected value for a module option.
    pub fn option(&self, module: &str, option: &str) -> Option<&str> {
        self.section(module)?.get(option).and_then(toml::Value::as_str)
    }
}
