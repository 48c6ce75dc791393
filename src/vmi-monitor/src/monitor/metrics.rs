/*!
This module contains the definitions of the metrics emitted by the monitor
and its watcher.
*/

// Gauge, monitors currently alive
pub(crate) static METRIC_ACTIVE_MONITORS: &str = "active_vm_monitors";

// Counter, total monitors created during the lifetime of the process
pub(crate) static METRIC_TOTAL_MONITORS: &str = "vm_monitors_total";

// Counters, watcher event loop
pub(crate) static METRIC_WATCH_EVENTS: &str = "watchpoint_events_total";
pub(crate) static METRIC_STATE_CHANGES: &str = "module_state_changes_total";

// Counters, registration and enforcement
pub(crate) static METRIC_REGISTRATIONS: &str = "client_registrations_total";
pub(crate) static METRIC_KILLS: &str = "enforcement_kills_total";

// Histogram, end-to-end watchpoint handling latency in seconds
pub(crate) static METRIC_EVENT_SECONDS: &str = "watchpoint_event_seconds";

pub(crate) static METRIC_MODULE_LABEL: &str = "module";

/// RAII guard tying the active-monitor gauge to the monitor's lifetime.
pub(crate) struct MonitorMetricsGuard(());

impl MonitorMetricsGuard {
    pub(crate) fn new() -> Self {
        metrics::gauge!(METRIC_ACTIVE_MONITORS).increment(1);
        metrics::counter!(METRIC_TOTAL_MONITORS).increment(1);
        Self(())
    }
}

impl Drop for MonitorMetricsGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_MONITORS).decrement(1);
    }
}
