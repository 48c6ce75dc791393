//! A ready-wired controller over the test doubles, with the configuration
//! and fixture files laid out in a temp directory.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use vmi_monitor::{Config, ControllerBuilder, StatusReply, VmController};

use super::{
    wait_until, DebuggerHandle, FakeDomain, FakeHypervisor, FakeSpawner, RecordingProxy,
};

pub const GUEST: &str = "g1";
pub const GUEST_IP: &str = "10.0.0.5";
pub const CLIENT_IP: &str = "10.0.1.2";

pub const TRUSTED_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const TRUSTED_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

pub struct FixtureOptions {
    pub static_modules: Vec<&'static str>,
    pub dynamic_modules: Vec<&'static str>,
    pub guest_file: Vec<u8>,
    pub criteria: String,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        FixtureOptions {
            static_modules: vec![],
            dynamic_modules: vec![],
            guest_file: b"abcd".to_vec(),
            criteria: String::new(),
        }
    }
}

#[allow(dead_code)]
pub struct Fixture {
    // Keeps the fixture files alive for the test's duration.
    _dir: tempfile::TempDir,
    pub controller: VmController,
    pub hypervisor: Arc<FakeHypervisor>,
    pub domain: Arc<FakeDomain>,
    pub proxy: Arc<RecordingProxy>,
    pub dbg: DebuggerHandle,
}

impl Fixture {
    pub fn new(opts: FixtureOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let guest_file = dir.path().join("guest.img");
        fs::write(&guest_file, &opts.guest_file).unwrap();

        let macros = dir.path().join("macros.gdb");
        fs::write(&macros, "define get_selinux_enforcing\n  print selinux_enforcing\nend\n")
            .unwrap();

        let criteria = dir.path().join("web.toml");
        fs::write(&criteria, &opts.criteria).unwrap();

        let trusted = dir.path().join("trusted.txt");
        fs::write(&trusted, format!("{TRUSTED_A}\n{TRUSTED_B}\n")).unwrap();

        let hashes = dir.path().join("hashes.cfg");
        fs::write(&hashes, format!("[sets]\nweb = \"{}\"\n", trusted.display())).unwrap();

        let quoted = |names: &[&str]| {
            names
                .iter()
                .map(|n| format!("\"{n}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let config_text = format!(
            r#"
            [vmserver]
            host = "127.0.0.1"
            port = 9001
            netproxy = "http://127.0.0.1:9002"

            [monitor]
            static = [{static_modules}]
            dynamic = [{dynamic_modules}]
            pause = 0

            [domains]
            {GUEST} = "{GUEST_IP} 4444"

            [clients]
            "{CLIENT_IP}" = "{criteria}"

            [watcher]
            macros = "{macros}"

            [FileHash]
            kernel = "/domain/os/kernel"

            [MeasurementList]
            sets = "{hashes}"
            "#,
            static_modules = quoted(&opts.static_modules),
            dynamic_modules = quoted(&opts.dynamic_modules),
            criteria = criteria.display(),
            macros = macros.display(),
            hashes = hashes.display(),
        );
        let config = Config::parse(&config_text).unwrap();

        let domain = FakeDomain::new(format!(
            "<domain><name>{GUEST}</name><os><kernel>{}</kernel></os></domain>",
            guest_file.display()
        ));
        let hypervisor = FakeHypervisor::new();
        hypervisor.define(GUEST, domain.clone());

        let proxy = RecordingProxy::new();
        let spawner = FakeSpawner::new();
        let dbg = spawner.next_handle();

        let controller = ControllerBuilder::new()
            .with_config(config)
            .with_hypervisor(hypervisor.clone())
            .with_session_proxy(proxy.clone())
            .with_debugger_spawner(spawner)
            .build()
            .unwrap();

        Fixture {
            _dir: dir,
            controller,
            hypervisor,
            domain,
            proxy,
            dbg,
        }
    }

    /// The monitor's state string, if the guest is managed.
    pub fn monitor_state(&self) -> Option<String> {
        match self.controller.status(GUEST).unwrap() {
            StatusReply::Monitor(status) => Some(status.state),
            StatusReply::Message(_) => None,
        }
    }

    /// Start the guest and wait until its monitor is `running` and the
    /// watcher has finished installing watchpoints (observable as the first
    /// `continue` on the debugger).
    pub fn start_and_run(&self) {
        let reply = self.controller.start(GUEST).unwrap();
        assert!(reply.contains("starting"), "unexpected start reply: {reply}");
        assert!(
            wait_until(Duration::from_secs(5), || {
                self.monitor_state().as_deref() == Some("running")
                    && self.dbg.commands().iter().any(|c| c == "continue")
            }),
            "monitor never reached running; state: {:?}",
            self.monitor_state()
        );
    }
}
