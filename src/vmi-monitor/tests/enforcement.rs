//! Registration and enforcement: criteria evaluation at connect time, and
//! session severing when a running guest regresses.

mod common;

use std::time::Duration;

use common::fixture::{Fixture, FixtureOptions, CLIENT_IP, GUEST, GUEST_IP, TRUSTED_A};
use common::{ip, wait_until};
use vmi_monitor::StatusReply;

// SHA-1 of the 4-byte guest file "abcd".
const ABCD_SHA1: &str = "81fe8bfe87576c3ecb22426f8e57847382917acf";

fn happy_options() -> FixtureOptions {
    FixtureOptions {
        static_modules: vec!["FileHash"],
        dynamic_modules: vec!["EnforcingFlag"],
        guest_file: b"abcd".to_vec(),
        criteria: format!(
            "[FileHash]\nkernel = \"{ABCD_SHA1}\"\n\n[EnforcingFlag]\nenforcing = \"1\"\n"
        ),
    }
}

fn registrations(fx: &Fixture) -> Vec<(String, Vec<String>)> {
    match fx.controller.status(GUEST).unwrap() {
        StatusReply::Monitor(status) => status.registrations,
        StatusReply::Message(msg) => panic!("expected a managed guest, got: {msg}"),
    }
}

#[test]
fn test_connect_accepts_satisfied_criteria() {
    let fx = Fixture::new(happy_options());
    fx.start_and_run();

    assert!(fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));

    let StatusReply::Monitor(status) = fx.controller.status(GUEST).unwrap() else {
        panic!("expected monitor status");
    };
    assert_eq!(status.state, "running");
    assert_eq!(status.static_modules, vec!["FileHash"]);
    assert_eq!(status.dynamic_modules, vec!["EnforcingFlag"]);
    assert_eq!(status.registrations.len(), 1);
    assert_eq!(status.registrations[0].1, vec![CLIENT_IP.to_string()]);
}

#[test]
fn test_connect_rejects_static_mismatch() {
    let mut opts = happy_options();
    opts.guest_file = b"abce".to_vec();
    let fx = Fixture::new(opts);
    fx.start_and_run();

    assert!(!fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));
    assert!(registrations(&fx).is_empty(), "rejection must leave no state");
    assert!(fx.proxy.kills().is_empty());
}

#[test]
fn test_connect_rejects_unknown_client() {
    let fx = Fixture::new(happy_options());
    fx.start_and_run();

    assert!(!fx.controller.connect(ip("10.0.9.9"), ip(GUEST_IP)));
    assert!(registrations(&fx).is_empty());
}

#[test]
fn test_connect_rejects_unknown_guest() {
    let fx = Fixture::new(happy_options());
    fx.start_and_run();

    assert!(!fx.controller.connect(ip(CLIENT_IP), ip("10.0.0.99")));
}

#[test]
fn test_connect_rejected_before_running() {
    let fx = Fixture::new(happy_options());
    // No start: the guest has no monitor.
    assert!(!fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));
}

#[test]
fn test_repeat_connect_is_idempotent() {
    let fx = Fixture::new(happy_options());
    fx.start_and_run();

    assert!(fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));
    assert!(fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));

    let regs = registrations(&fx);
    assert_eq!(regs.len(), 1);
    assert_eq!(
        regs[0].1,
        vec![CLIENT_IP.to_string()],
        "client must be listed exactly once"
    );
}

#[test]
fn test_connect_then_disconnect_restores_registry() {
    let fx = Fixture::new(happy_options());
    fx.start_and_run();

    assert!(fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));
    assert!(fx.controller.disconnect(ip(CLIENT_IP), ip(GUEST_IP)));
    assert!(registrations(&fx).is_empty());

    // A second disconnect has nothing left to remove.
    assert!(!fx.controller.disconnect(ip(CLIENT_IP), ip(GUEST_IP)));
}

#[test]
fn test_dynamic_regression_severs_client() {
    let fx = Fixture::new(happy_options());
    fx.start_and_run();
    assert!(fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));

    // The enforcing flag flips; the module toggles its cache to "0" and the
    // criteria requiring "1" no longer hold.
    fx.dbg
        .inject_event("Hardware watchpoint 2: selinux_enforcing");

    assert!(
        wait_until(Duration::from_secs(5), || fx.proxy.kills().len() == 1),
        "regression should sever the registered client"
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        fx.proxy.kills(),
        vec![(ip(CLIENT_IP), ip(GUEST_IP))],
        "exactly one kill per registered client"
    );
    assert!(registrations(&fx).is_empty());
}

#[test]
fn test_measurement_list_acceptance_and_regression() {
    let opts = FixtureOptions {
        static_modules: vec![],
        dynamic_modules: vec!["MeasurementList"],
        guest_file: b"abcd".to_vec(),
        criteria: "[MeasurementList]\ntrusted = \"web\"\n".to_string(),
    };
    let fx = Fixture::new(opts);

    // Initial guest list: one trusted digest plus the boot-time sentinel.
    let zero = "0".repeat(40);
    fx.dbg
        .set_reply("print_mlist", &["$1 = 2", TRUSTED_A, zero.as_str()]);
    fx.start_and_run();

    assert!(fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));

    // The guest measures something outside the trusted set.
    let rogue = "c".repeat(40);
    fx.dbg.set_reply("last_hash", &[&format!("$2 = {rogue}")]);
    fx.dbg
        .inject_event("Hardware watchpoint 2: ima_measurements->prev");

    assert!(
        wait_until(Duration::from_secs(5), || fx.proxy.kills().len() == 1),
        "untrusted measurement should sever the registered client"
    );
    assert_eq!(fx.proxy.kills(), vec![(ip(CLIENT_IP), ip(GUEST_IP))]);
    assert!(registrations(&fx).is_empty());
}

#[test]
fn test_heartbeat_events_do_not_enforce() {
    let mut opts = happy_options();
    opts.dynamic_modules = vec!["EnforcingFlag", "Heartbeat"];
    let fx = Fixture::new(opts);
    fx.start_and_run();
    assert!(fx.controller.connect(ip(CLIENT_IP), ip(GUEST_IP)));

    // Heartbeat fires; its check stays true, so nothing is severed.
    fx.dbg
        .inject_event("Hardware watchpoint 3: printk_ratelimit_state.interval");

    assert!(
        wait_until(Duration::from_secs(5), || {
            fx.dbg.commands().iter().filter(|c| *c == "continue").count() >= 2
        }),
        "the heartbeat event should be processed and the guest resumed"
    );
    assert!(fx.proxy.kills().is_empty());
    assert_eq!(registrations(&fx).len(), 1);
}
